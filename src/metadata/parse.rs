//! Recursive-descent parser for the TSDL subset [`crate::metadata::emit`]
//! produces.
//!
//! Hand-written recursive-descent, the same way [`super::lexer`] hand-rolls
//! its tokenizer, since this brace-delimited text grammar doesn't match
//! what a binary-header parser-combinator crate targets. It consumes
//! [`super::lexer::Token`] and builds
//! the same [`crate::decl::Declaration`] DAG the builder API in
//! [`crate::decl`] would, then assembles it into a [`TraceClass`] exactly as
//! a caller driving that API directly would (stream/event ids honored
//! verbatim via [`StreamClass::set_id`]/[`EventClass::set_id`] rather than
//! auto-assigned, since the text already fixes them).

use crate::clock::ClockClass;
use crate::decl::{ByteOrder, DeclKind, Declaration, Encoding, PreferredDisplayBase};
use crate::error::Error;
use crate::ir::{EnvValue, EventClass, LogLevel, StreamClass, StreamId, TraceClass};
use crate::metadata::emit::METADATA_MAGIC;
use crate::metadata::lexer::{tokenize, Token};
use fxhash::FxHashMap;
use internment::Intern;
use uuid::Uuid;

/// Parses a `metadata` file's raw bytes, packetized or not, into
/// a fully assembled [`TraceClass`].
pub fn parse_trace(bytes: &[u8]) -> Result<TraceClass, Error> {
    let text = strip_packetization(bytes)?;
    let tokens = tokenize(&text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        aliases: FxHashMap::default(),
    };
    parser.parse_document()
}

/// Strips the packetized metadata preamble, if present, leaving
/// the raw TSDL text. The preamble layout mirrors [`crate::metadata::emit::packetize`]:
/// magic(4) uuid(16) checksum(4) content_size(4) packet_size(4)
/// compression(1) encryption(1) checksum_scheme(1) major(1) minor(1), all
/// big-endian, followed by `content_size` bits worth of TSDL text.
fn strip_packetization(bytes: &[u8]) -> Result<String, Error> {
    const PREAMBLE_LEN: usize = 37;
    if bytes.len() >= 4 && u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == METADATA_MAGIC {
        if bytes.len() < PREAMBLE_LEN {
            return Err(Error::format_mismatch("packetized metadata preamble is truncated"));
        }
        let content_bits = u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]) as usize;
        let content_bytes = content_bits.div_ceil(8);
        let body = &bytes[PREAMBLE_LEN..];
        if body.len() < content_bytes {
            return Err(Error::format_mismatch("packetized metadata is shorter than its declared content size"));
        }
        Ok(String::from_utf8_lossy(&body[..content_bytes]).into_owned())
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    aliases: FxHashMap<String, Declaration>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn at_rbrace(&self) -> bool {
        matches!(self.peek(), Some(Token::RBrace))
    }

    fn expect(&mut self, expected: Token) -> Result<(), Error> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            other => Err(Error::format_mismatch(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn expect_ident(&mut self) -> Result<String, Error> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(Error::format_mismatch(format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect_int(&mut self) -> Result<i64, Error> {
        match self.next() {
            Some(Token::Int(v)) => Ok(v),
            other => Err(Error::format_mismatch(format!("expected integer literal, found {other:?}"))),
        }
    }

    fn expect_str(&mut self) -> Result<String, Error> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(Error::format_mismatch(format!("expected string literal, found {other:?}"))),
        }
    }

    fn expect_bool(&mut self) -> Result<bool, Error> {
        match self.next() {
            Some(Token::Ident(s)) if s == "true" => Ok(true),
            Some(Token::Ident(s)) if s == "false" => Ok(false),
            other => Err(Error::format_mismatch(format!("expected boolean literal, found {other:?}"))),
        }
    }

    /// `{ key (= | :=) value ; ... }`, without consuming whatever comes
    /// after the closing brace — used both for top-level blocks (where the
    /// caller wants the trailing `;` too) and inline type bodies like
    /// `integer { ... }` (where the `}` is immediately followed by a member
    /// name, not a `;`).
    fn parse_field_list(&mut self, mut handler: impl FnMut(&mut Parser, &str) -> Result<(), Error>) -> Result<(), Error> {
        self.expect(Token::LBrace)?;
        loop {
            if self.at_rbrace() {
                break;
            }
            let key = self.expect_ident()?;
            match self.next() {
                Some(Token::Eq) | Some(Token::ColonEq) => {}
                other => return Err(Error::format_mismatch(format!("expected '=' or ':=' after '{key}', found {other:?}"))),
            }
            handler(self, &key)?;
            self.expect(Token::Semi)?;
        }
        self.expect(Token::RBrace)?;
        Ok(())
    }

    /// Like [`Self::parse_field_list`] but also consumes the statement-level
    /// `;` after the closing brace, for `trace {...};`/`stream {...};`/etc.
    fn parse_top_level_block(&mut self, handler: impl FnMut(&mut Parser, &str) -> Result<(), Error>) -> Result<(), Error> {
        self.parse_field_list(handler)?;
        self.expect(Token::Semi)
    }

    fn parse_byte_order(&mut self) -> Result<ByteOrder, Error> {
        match self.expect_ident()?.as_str() {
            "le" => Ok(ByteOrder::Little),
            "be" => Ok(ByteOrder::Big),
            "native" => Ok(ByteOrder::Native),
            "network" => Ok(ByteOrder::Network),
            other => Err(Error::format_mismatch(format!("unknown byte order '{other}'"))),
        }
    }

    fn parse_base(&mut self) -> Result<PreferredDisplayBase, Error> {
        match self.expect_ident()?.as_str() {
            "bin" => Ok(PreferredDisplayBase::Binary),
            "oct" => Ok(PreferredDisplayBase::Octal),
            "dec" => Ok(PreferredDisplayBase::Decimal),
            "hex" => Ok(PreferredDisplayBase::Hexadecimal),
            other => Err(Error::format_mismatch(format!("unknown display base '{other}'"))),
        }
    }

    fn parse_encoding(&mut self) -> Result<Encoding, Error> {
        match self.expect_ident()?.as_str() {
            "none" => Ok(Encoding::None),
            "ascii" => Ok(Encoding::Ascii),
            "utf8" => Ok(Encoding::Utf8),
            other => Err(Error::format_mismatch(format!("unknown encoding '{other}'"))),
        }
    }

    /// `clock.NAME.value`, lexed as a single dotted identifier.
    fn parse_clock_map(&mut self) -> Result<String, Error> {
        let ident = self.expect_ident()?;
        ident
            .strip_prefix("clock.")
            .and_then(|rest| rest.strip_suffix(".value"))
            .map(str::to_owned)
            .ok_or_else(|| Error::format_mismatch(format!("malformed clock map expression '{ident}'")))
    }

    fn parse_type(&mut self) -> Result<Declaration, Error> {
        let kind = self.expect_ident()?;
        match kind.as_str() {
            "integer" => self.parse_integer_type(),
            "floating_point" => self.parse_float_type(),
            "string" => self.parse_string_type(),
            "enum" => self.parse_enum_type(),
            "struct" => self.parse_struct_type(),
            "variant" => self.parse_variant_type(),
            other => self
                .aliases
                .get(other)
                .cloned()
                .ok_or_else(|| Error::format_mismatch(format!("unknown type name or undefined alias '{other}'"))),
        }
    }

    fn parse_integer_type(&mut self) -> Result<Declaration, Error> {
        let mut size: Option<u32> = None;
        let mut align: Option<usize> = None;
        let mut signed = false;
        let mut byte_order = ByteOrder::Native;
        let mut base = PreferredDisplayBase::Decimal;
        let mut encoding = Encoding::None;
        let mut mapped_clock: Option<String> = None;

        self.parse_field_list(|p, key| {
            match key {
                "size" => size = Some(p.expect_int()? as u32),
                "align" => align = Some(p.expect_int()? as usize),
                "signed" => signed = p.expect_bool()?,
                "byte_order" => byte_order = p.parse_byte_order()?,
                "base" => base = p.parse_base()?,
                "encoding" => encoding = p.parse_encoding()?,
                "map" => mapped_clock = Some(p.parse_clock_map()?),
                other => return Err(Error::format_mismatch(format!("unknown integer field '{other}'"))),
            }
            Ok(())
        })?;

        let size = size.ok_or_else(|| Error::format_mismatch("integer type is missing 'size'"))?;
        let align = align.unwrap_or(1);
        let decl = if signed {
            Declaration::new_sint(size, byte_order, base, align)?
        } else {
            Declaration::new_uint(size, byte_order, base, align)?
        };
        decl.set_encoding(encoding)?;
        if let Some(name) = mapped_clock {
            decl.set_mapped_clock(Intern::new(name))?;
        }
        Ok(decl)
    }

    fn parse_float_type(&mut self) -> Result<Declaration, Error> {
        let mut exp_dig: Option<u32> = None;
        let mut mant_dig: Option<u32> = None;
        let mut align: Option<usize> = None;
        let mut byte_order = ByteOrder::Native;

        self.parse_field_list(|p, key| {
            match key {
                "exp_dig" => exp_dig = Some(p.expect_int()? as u32),
                "mant_dig" => mant_dig = Some(p.expect_int()? as u32),
                "align" => align = Some(p.expect_int()? as usize),
                "byte_order" => byte_order = p.parse_byte_order()?,
                other => return Err(Error::format_mismatch(format!("unknown floating_point field '{other}'"))),
            }
            Ok(())
        })?;

        let exp_dig = exp_dig.ok_or_else(|| Error::format_mismatch("floating_point type is missing 'exp_dig'"))?;
        let mant_dig = mant_dig.ok_or_else(|| Error::format_mismatch("floating_point type is missing 'mant_dig'"))?;
        Declaration::new_float(mant_dig, exp_dig, byte_order, align.unwrap_or(1))
    }

    fn parse_string_type(&mut self) -> Result<Declaration, Error> {
        let mut encoding = Encoding::Utf8;
        self.parse_field_list(|p, key| {
            match key {
                "encoding" => encoding = p.parse_encoding()?,
                other => return Err(Error::format_mismatch(format!("unknown string field '{other}'"))),
            }
            Ok(())
        })?;
        Ok(Declaration::new_string(encoding))
    }

    fn parse_enum_type(&mut self) -> Result<Declaration, Error> {
        self.expect(Token::Colon)?;
        let container = self.parse_type()?;
        let alignment_bits = container.alignment_bits();
        let decl = if container.is_signed_integer() {
            Declaration::new_enum_signed(container, alignment_bits)?
        } else {
            Declaration::new_enum_unsigned(container, alignment_bits)?
        };

        self.expect(Token::LBrace)?;
        loop {
            if self.at_rbrace() {
                break;
            }
            let label = self.expect_ident()?;
            self.expect(Token::Eq)?;
            let lo = self.expect_int()?;
            let hi = if matches!(self.peek(), Some(Token::Ellipsis)) {
                self.next();
                self.expect_int()?
            } else {
                lo
            };
            decl.map_range(label, lo, hi)?;
            if matches!(self.peek(), Some(Token::Comma)) {
                self.next();
            }
        }
        self.expect(Token::RBrace)?;
        Ok(decl)
    }

    fn parse_struct_type(&mut self) -> Result<Declaration, Error> {
        self.expect(Token::LBrace)?;
        let decl = Declaration::new_struct();
        loop {
            if self.at_rbrace() {
                break;
            }
            let (name, field_decl) = self.parse_field()?;
            decl.append_member(name, field_decl)?;
            self.expect(Token::Semi)?;
        }
        self.expect(Token::RBrace)?;
        Ok(decl)
    }

    fn parse_variant_type(&mut self) -> Result<Declaration, Error> {
        let selector = match self.peek() {
            Some(Token::Ident(_)) => Some(self.expect_ident()?),
            _ => None,
        };
        let decl = Declaration::new_variant(selector);

        self.expect(Token::LBrace)?;
        loop {
            if self.at_rbrace() {
                break;
            }
            let label = self.expect_ident()?;
            self.expect(Token::Colon)?;
            let option_decl = self.parse_type()?;
            decl.append_option(label, option_decl)?;
            self.expect(Token::Semi)?;
        }
        self.expect(Token::RBrace)?;
        Ok(decl)
    }

    /// `TYPE name;`, `TYPE name[N];`, or `TYPE name[length_field];`.
    fn parse_field(&mut self) -> Result<(String, Declaration), Error> {
        let element_decl = self.parse_type()?;
        let name = self.expect_ident()?;
        if matches!(self.peek(), Some(Token::LBracket)) {
            self.next();
            let decl = match self.next() {
                Some(Token::Int(n)) => {
                    self.expect(Token::RBracket)?;
                    Declaration::new_static_array(element_decl, n as usize)
                }
                Some(Token::Ident(field_name)) => {
                    self.expect(Token::RBracket)?;
                    Declaration::new_dyn_array(element_decl, field_name)
                }
                other => return Err(Error::format_mismatch(format!("expected array length or field name, found {other:?}"))),
            };
            Ok((name, decl))
        } else {
            Ok((name, element_decl))
        }
    }

    fn parse_env_block(&mut self) -> Result<FxHashMap<String, EnvValue>, Error> {
        let mut env = FxHashMap::default();
        self.parse_top_level_block(|p, key| {
            match p.peek() {
                Some(Token::Int(_)) => {
                    env.insert(key.to_owned(), EnvValue::Int(p.expect_int()?));
                }
                Some(Token::Str(_)) => {
                    env.insert(key.to_owned(), EnvValue::Str(p.expect_str()?));
                }
                other => return Err(Error::format_mismatch(format!("env value must be an int or string literal, found {other:?}"))),
            }
            Ok(())
        })?;
        Ok(env)
    }

    fn parse_clock_block(&mut self) -> Result<ClockClass, Error> {
        let mut name: Option<String> = None;
        let mut uuid: Option<Uuid> = None;
        let mut description: Option<String> = None;
        let mut freq: Option<u64> = None;
        let mut precision: Option<u64> = None;
        let mut offset_s: Option<i64> = None;
        let mut offset_cycles: Option<u64> = None;
        let mut absolute = false;

        self.parse_top_level_block(|p, key| {
            match key {
                "name" => name = Some(p.expect_ident()?),
                "uuid" => {
                    let s = p.expect_str()?;
                    uuid = Some(Uuid::parse_str(&s).map_err(|e| Error::format_mismatch(format!("bad clock uuid '{s}': {e}")))?);
                }
                "description" => description = Some(p.expect_str()?),
                "freq" => freq = Some(p.expect_int()? as u64),
                "precision" => precision = Some(p.expect_int()? as u64),
                "offset_s" => offset_s = Some(p.expect_int()?),
                "offset" => offset_cycles = Some(p.expect_int()? as u64),
                "absolute" => absolute = p.expect_bool()?,
                other => return Err(Error::format_mismatch(format!("unknown clock field '{other}'"))),
            }
            Ok(())
        })?;

        let name = name.ok_or_else(|| Error::format_mismatch("clock block is missing 'name'"))?;
        let clock = ClockClass::new(name);
        if let Some(u) = uuid {
            clock.set_uuid(u)?;
        }
        if let Some(d) = description {
            clock.set_description(d)?;
        }
        if let Some(f) = freq {
            clock.set_frequency(f)?;
        }
        if let Some(p) = precision {
            clock.set_precision(p)?;
        }
        clock.set_offset(offset_s.unwrap_or(0), offset_cycles.unwrap_or(0))?;
        clock.set_origin_is_unix_epoch(absolute)?;
        Ok(clock)
    }

    fn parse_stream_block(&mut self) -> Result<(StreamId, StreamClass), Error> {
        let mut id: Option<u32> = None;
        let mut packet_context: Option<Declaration> = None;
        let mut event_header: Option<Declaration> = None;
        let mut event_context: Option<Declaration> = None;

        self.parse_top_level_block(|p, key| {
            match key {
                "id" => id = Some(p.expect_int()? as u32),
                "packet.context" => packet_context = Some(p.parse_type()?),
                "event.header" => event_header = Some(p.parse_type()?),
                "event.context" => event_context = Some(p.parse_type()?),
                other => return Err(Error::format_mismatch(format!("unknown stream field '{other}'"))),
            }
            Ok(())
        })?;

        let id = id.ok_or_else(|| Error::format_mismatch("stream block is missing 'id'"))?;
        let mut stream = StreamClass::new(format!("stream_{id}"));
        stream.set_id(id)?;
        if let Some(d) = packet_context {
            stream.set_packet_context_decl(d)?;
        }
        if let Some(d) = event_header {
            stream.set_event_header_decl(d)?;
        }
        if let Some(d) = event_context {
            stream.set_event_context_decl(d)?;
        }
        Ok((id, stream))
    }

    fn parse_event_block(&mut self) -> Result<(StreamId, EventClass), Error> {
        let mut id: Option<u64> = None;
        let mut stream_id: Option<StreamId> = None;
        let mut name: Option<String> = None;
        let mut log_level: Option<i32> = None;
        let mut model_emf_uri: Option<String> = None;
        let mut context: Option<Declaration> = None;
        let mut fields: Option<Declaration> = None;

        self.parse_top_level_block(|p, key| {
            match key {
                "id" => id = Some(p.expect_int()? as u64),
                "stream_id" => stream_id = Some(p.expect_int()? as StreamId),
                "name" => name = Some(p.expect_str()?),
                "loglevel" => log_level = Some(p.expect_int()? as i32),
                "model.emf.uri" => model_emf_uri = Some(p.expect_str()?),
                "context" => context = Some(p.parse_type()?),
                "fields" => fields = Some(p.parse_type()?),
                other => return Err(Error::format_mismatch(format!("unknown event field '{other}'"))),
            }
            Ok(())
        })?;

        let name = name.ok_or_else(|| Error::format_mismatch("event block is missing 'name'"))?;
        let stream_id = stream_id.ok_or_else(|| Error::format_mismatch("event block is missing 'stream_id'"))?;

        let mut event = EventClass::new(name);
        if let Some(id) = id {
            event.set_id(id)?;
        }
        if let Some(level) = log_level {
            event.set_log_level(LogLevel::from(level))?;
        }
        if let Some(uri) = model_emf_uri {
            event.set_model_emf_uri(uri)?;
        }
        if let Some(d) = context {
            event.set_context_decl(d)?;
        }
        if let Some(d) = fields {
            event.set_payload_decl(d)?;
        }
        Ok((stream_id, event))
    }

    fn parse_typealias(&mut self) -> Result<(), Error> {
        let decl = self.parse_type()?;
        self.expect(Token::ColonEq)?;
        let name = self.expect_ident()?;
        self.expect(Token::Semi)?;
        self.aliases.insert(name, decl);
        Ok(())
    }

    fn parse_typedef(&mut self) -> Result<(), Error> {
        let decl = self.parse_type()?;
        let name = self.expect_ident()?;
        self.expect(Token::Semi)?;
        self.aliases.insert(name, decl);
        Ok(())
    }

    fn parse_document(&mut self) -> Result<TraceClass, Error> {
        let mut trace = TraceClass::new();
        let mut clocks: FxHashMap<String, ClockClass> = FxHashMap::default();
        let mut streams: FxHashMap<StreamId, StreamClass> = FxHashMap::default();
        let mut stream_order: Vec<StreamId> = Vec::new();
        let mut pending_events: Vec<(StreamId, EventClass)> = Vec::new();

        while self.peek().is_some() {
            let keyword = self.expect_ident()?;
            match keyword.as_str() {
                "trace" => self.parse_trace_block(&mut trace)?,
                "env" => {
                    for (k, v) in self.parse_env_block()? {
                        trace.set_env(k, v);
                    }
                }
                "clock" => {
                    let clock = self.parse_clock_block()?;
                    clocks.insert(clock.name().as_str().to_owned(), clock);
                }
                "stream" => {
                    let (id, stream) = self.parse_stream_block()?;
                    stream_order.push(id);
                    streams.insert(id, stream);
                }
                "event" => {
                    let (stream_id, event) = self.parse_event_block()?;
                    pending_events.push((stream_id, event));
                }
                "typealias" => self.parse_typealias()?,
                "typedef" => self.parse_typedef()?,
                other => return Err(Error::format_mismatch(format!("unknown top-level block '{other}'"))),
            }
        }

        for (stream_id, event) in pending_events {
            let stream = streams
                .get_mut(&stream_id)
                .ok_or_else(|| Error::format_mismatch(format!("event references unknown stream_id {stream_id}")))?;
            stream.add_event_class(event)?;
        }

        for stream in streams.values_mut() {
            let mut clock_names = Vec::new();
            if let Some(header) = stream.event_header_decl() {
                collect_mapped_clocks(header, &mut clock_names);
            }
            for clock_name in clock_names {
                if let Some(clock) = clocks.get(clock_name.as_str()) {
                    stream.add_clock(clock.clone())?;
                }
            }
        }

        stream_order.sort_unstable();
        stream_order.dedup();
        for id in stream_order {
            let stream = streams.remove(&id).expect("every id in stream_order was inserted into streams");
            trace.add_stream_class(stream)?;
        }

        Ok(trace)
    }

    fn parse_trace_block(&mut self, trace: &mut TraceClass) -> Result<(), Error> {
        self.parse_top_level_block(|p, key| {
            match key {
                "major" | "minor" => {
                    p.expect_int()?;
                }
                "uuid" => {
                    let s = p.expect_str()?;
                    let uuid = Uuid::parse_str(&s).map_err(|e| Error::format_mismatch(format!("bad trace uuid '{s}': {e}")))?;
                    trace.set_uuid(uuid);
                }
                "byte_order" => trace.set_native_byte_order(p.parse_byte_order()?),
                "packet.header" => trace.set_packet_header_decl(p.parse_type()?)?,
                other => return Err(Error::format_mismatch(format!("unknown trace field '{other}'"))),
            }
            Ok(())
        })
    }
}

/// Walks `decl` for any integer member that `map`s to a clock, recursing
/// through structs, variant options, arrays, and enum containers — the
/// inverse of `emit_type`'s `map = clock.{name}.value;` (see
/// `crate::metadata::emit`), since the text format never declares a stream's
/// clocks directly.
fn collect_mapped_clocks(decl: &Declaration, out: &mut Vec<Intern<String>>) {
    match decl.kind() {
        DeclKind::UInt | DeclKind::SInt => {
            if let Some(clock) = decl.mapped_clock() {
                out.push(clock);
            }
        }
        DeclKind::Enum => {
            if let Some(container) = decl.enum_container() {
                collect_mapped_clocks(&container, out);
            }
        }
        DeclKind::Struct => {
            if let Some(members) = decl.members() {
                for (_, member) in members {
                    collect_mapped_clocks(&member, out);
                }
            }
        }
        DeclKind::Variant => {
            if let Some(options) = decl.options() {
                for (_, option) in options {
                    collect_mapped_clocks(&option, out);
                }
            }
        }
        DeclKind::StaticArray | DeclKind::DynArray => {
            if let Some(element) = decl.element() {
                collect_mapped_clocks(&element, out);
            }
        }
        DeclKind::Float | DeclKind::Str => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{Declaration as Decl, PreferredDisplayBase as Base};
    use crate::ir::{StreamClass as Stream, TraceClass as Trace};

    fn u32_decl() -> Decl {
        Decl::new_uint(32, ByteOrder::Big, Base::Decimal, 32).unwrap()
    }

    #[test]
    fn round_trips_a_minimal_trace() {
        let mut trace = Trace::new_with_defaults();
        let clock = ClockClass::new("mono");
        clock.set_uuid(Uuid::new_v4()).unwrap();
        let mut stream = Stream::new_with_defaults("s0", Some(clock));
        let mut event = EventClass::new("tick");
        let payload = Decl::new_struct();
        payload.append_member("count", u32_decl()).unwrap();
        event.set_payload_decl(payload).unwrap();
        stream.add_event_class(event).unwrap();
        trace.add_stream_class(stream).unwrap();

        let tsdl = crate::metadata::emit::emit_trace(&trace).unwrap();
        let parsed = parse_trace(tsdl.as_bytes()).unwrap();

        assert_eq!(parsed.uuid(), trace.uuid());
        assert_eq!(parsed.native_byte_order(), trace.native_byte_order());
        let parsed_stream = parsed.stream_class(0).expect("stream 0");
        assert_eq!(parsed_stream.name().as_str(), "s0");
        let parsed_event = parsed_stream.event_class(0).expect("event 0");
        assert_eq!(parsed_event.name().as_str(), "tick");
        assert_eq!(parsed_stream.default_clock().map(|c| c.name()), Some(Intern::new("mono".to_owned())));
    }

    #[test]
    fn round_trips_packetized_metadata() {
        let trace = Trace::new_with_defaults();
        let tsdl = crate::metadata::emit::emit_trace(&trace).unwrap();
        let packetized = crate::metadata::emit::packetize(&tsdl);
        let parsed = parse_trace(&packetized).unwrap();
        assert_eq!(parsed.uuid(), trace.uuid());
    }

    #[test]
    fn round_trips_a_dynamic_array_and_enum_payload() {
        let mut trace = Trace::new_with_defaults();
        let mut stream = Stream::new_with_defaults("s0", None);
        let mut event = EventClass::new("e");
        let payload = Decl::new_struct();
        payload.append_member("len", Decl::new_uint(8, ByteOrder::Big, Base::Decimal, 8).unwrap()).unwrap();
        let element = Decl::new_uint(8, ByteOrder::Big, Base::Decimal, 8).unwrap();
        payload.append_member("data", Decl::new_dyn_array(element, "len")).unwrap();
        let container = Decl::new_uint(8, ByteOrder::Big, Base::Decimal, 8).unwrap();
        let state = Decl::new_enum_unsigned(container, 8).unwrap();
        state.map_range("idle", 0, 0).unwrap();
        state.map_range("busy", 1, 3).unwrap();
        payload.append_member("state", state).unwrap();
        event.set_payload_decl(payload).unwrap();
        stream.add_event_class(event).unwrap();
        trace.add_stream_class(stream).unwrap();

        let tsdl = crate::metadata::emit::emit_trace(&trace).unwrap();
        let parsed = parse_trace(tsdl.as_bytes()).unwrap();
        let payload = parsed.stream_class(0).unwrap().event_class(0).unwrap().payload_decl().unwrap();
        let members = payload.members().unwrap();
        assert_eq!(members.len(), 3);
        let state_decl = payload.member("state").unwrap();
        assert_eq!(state_decl.value_for_label("busy"), Some((1, 3)));
        let data_decl = payload.member("data").unwrap();
        assert!(matches!(data_decl.kind(), DeclKind::DynArray));
    }

    #[test]
    fn unknown_top_level_block_is_a_format_mismatch() {
        let err = parse_trace(b"bogus { x = 1; };").unwrap_err();
        assert!(matches!(err, Error::FormatMismatch(_)));
    }
}
