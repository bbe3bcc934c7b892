//! Serializes a [`TraceClass`] to a TSDL metadata document.
//!
//! Field-by-field `write!` calls build up one text block per declaration
//! kind.

use crate::decl::{ByteOrder, DeclKind, Declaration, Encoding, PreferredDisplayBase};
use crate::error::Error;
use crate::ir::{EnvValue, TraceClass};
use std::fmt::Write as _;

/// Packetized metadata magic; `emit_trace` never writes this
/// preamble itself — see [`packetize`].
pub const METADATA_MAGIC: u32 = 0x75D1_1D57;

fn byte_order_str(order: ByteOrder) -> &'static str {
    match order {
        ByteOrder::Little => "le",
        ByteOrder::Big => "be",
        ByteOrder::Native => "native",
        ByteOrder::Network => "network",
    }
}

fn base_str(base: PreferredDisplayBase) -> &'static str {
    match base {
        PreferredDisplayBase::Binary => "bin",
        PreferredDisplayBase::Octal => "oct",
        PreferredDisplayBase::Decimal => "dec",
        PreferredDisplayBase::Hexadecimal => "hex",
    }
}

fn encoding_str(encoding: Encoding) -> &'static str {
    match encoding {
        Encoding::None => "none",
        Encoding::Ascii => "ascii",
        Encoding::Utf8 => "utf8",
    }
}

fn pad(indent: usize) -> String {
    "    ".repeat(indent)
}

/// Emits `decl`'s TSDL type expression (no trailing member name), fully
/// inlined rather than through a `typealias` — `metadata::parse` supports
/// aliases on read, but nothing in this crate's write path needs one since
/// every declaration is walked directly from the owning trace/stream/event
/// class (see `DESIGN.md`).
fn emit_type(decl: &Declaration, out: &mut String, indent: usize) -> Result<(), Error> {
    match decl.kind() {
        DeclKind::UInt | DeclKind::SInt => {
            let (width, byte_order, signed) = decl.integer_snapshot().expect("integer snapshot");
            let base = decl.integer_base().expect("integer base");
            let encoding = decl.integer_encoding().unwrap_or_default();
            write!(out, "integer {{ size = {width}; align = {align}; signed = {signed}; byte_order = {bo}; base = {base}; encoding = {enc};", align = decl.alignment_bits(), bo = byte_order_str(byte_order), base = base_str(base), enc = encoding_str(encoding))
                .map_err(emit_err)?;
            if let Some(clock) = decl.mapped_clock() {
                write!(out, " map = clock.{clock}.value;").map_err(emit_err)?;
            }
            write!(out, " }}").map_err(emit_err)?;
        }
        DeclKind::Float => {
            let (exp, mant, byte_order) = decl.float_snapshot().expect("float snapshot");
            write!(
                out,
                "floating_point {{ exp_dig = {exp}; mant_dig = {mant}; align = {align}; byte_order = {bo}; }}",
                align = decl.alignment_bits(),
                bo = byte_order_str(byte_order)
            )
            .map_err(emit_err)?;
        }
        DeclKind::Str => {
            let encoding = decl.string_encoding().unwrap_or_default();
            write!(out, "string {{ encoding = {}; }}", encoding_str(encoding)).map_err(emit_err)?;
        }
        DeclKind::Enum => {
            let container = decl.enum_container().expect("enum container");
            write!(out, "enum : ").map_err(emit_err)?;
            emit_type(&container, out, indent)?;
            writeln!(out, " {{").map_err(emit_err)?;
            let labels = decl.label_set();
            for (idx, label) in labels.iter().enumerate() {
                let (lo, hi) = decl.value_for_label(label.as_str()).expect("label in label_set has a range");
                let sep = if idx + 1 == labels.len() { "" } else { "," };
                if lo == hi {
                    writeln!(out, "{}{label} = {lo}{sep}", pad(indent + 1)).map_err(emit_err)?;
                } else {
                    writeln!(out, "{}{label} = {lo} ... {hi}{sep}", pad(indent + 1)).map_err(emit_err)?;
                }
            }
            write!(out, "{}}}", pad(indent)).map_err(emit_err)?;
        }
        DeclKind::Struct => {
            writeln!(out, "struct {{").map_err(emit_err)?;
            for (name, member) in decl.members().expect("struct members") {
                emit_field(&member, name.as_str(), out, indent + 1)?;
            }
            write!(out, "{}}}", pad(indent)).map_err(emit_err)?;
        }
        DeclKind::Variant => {
            write!(out, "variant").map_err(emit_err)?;
            if let Some(selector) = decl.variant_selector_name() {
                write!(out, " {selector}").map_err(emit_err)?;
            }
            writeln!(out, " {{").map_err(emit_err)?;
            for (label, option) in decl.options().expect("variant options") {
                write!(out, "{}{label} : ", pad(indent + 1)).map_err(emit_err)?;
                emit_type(&option, out, indent + 1)?;
                writeln!(out, ";").map_err(emit_err)?;
            }
            write!(out, "{}}}", pad(indent)).map_err(emit_err)?;
        }
        DeclKind::StaticArray | DeclKind::DynArray => {
            // Arrays only ever appear as a struct member or variant option,
            // where the `[N]`/`[field]` suffix is attached to the member
            // name (see `emit_field`); a bare array type_spec is unreachable.
            unreachable!("array declarations are only emitted via emit_field")
        }
    }
    Ok(())
}

fn emit_field(decl: &Declaration, name: &str, out: &mut String, indent: usize) -> Result<(), Error> {
    write!(out, "{}", pad(indent)).map_err(emit_err)?;
    match decl.kind() {
        DeclKind::StaticArray => {
            let element = decl.element().expect("array element");
            emit_type(&element, out, indent)?;
            let len = decl.static_array_length().expect("static array length");
            writeln!(out, " {name}[{len}];").map_err(emit_err)?;
        }
        DeclKind::DynArray => {
            let element = decl.element().expect("array element");
            emit_type(&element, out, indent)?;
            let length_field = decl.dyn_array_length_field_name().expect("dyn array length field");
            writeln!(out, " {name}[{length_field}];").map_err(emit_err)?;
        }
        _ => {
            emit_type(decl, out, indent)?;
            writeln!(out, " {name};").map_err(emit_err)?;
        }
    }
    Ok(())
}

fn emit_err(_: std::fmt::Error) -> Error {
    Error::invalid("formatting failure while emitting metadata")
}

/// Writes a trace's `trace`, `env`, `clock`, `stream`, and `event` blocks, in
/// that order.
pub fn emit_trace(trace: &TraceClass) -> Result<String, Error> {
    let mut out = String::new();

    writeln!(out, "trace {{").map_err(emit_err)?;
    writeln!(out, "    major = 1;").map_err(emit_err)?;
    writeln!(out, "    minor = 8;").map_err(emit_err)?;
    if let Some(uuid) = trace.uuid() {
        writeln!(out, "    uuid = \"{uuid}\";").map_err(emit_err)?;
    }
    writeln!(out, "    byte_order = {};", byte_order_str(trace.native_byte_order())).map_err(emit_err)?;
    if let Some(header) = trace.packet_header_decl() {
        write!(out, "    packet.header := ").map_err(emit_err)?;
        emit_type(header, &mut out, 1)?;
        writeln!(out, ";").map_err(emit_err)?;
    }
    writeln!(out, "}};\n").map_err(emit_err)?;

    if !trace.env().is_empty() {
        writeln!(out, "env {{").map_err(emit_err)?;
        let mut keys: Vec<&String> = trace.env().keys().collect();
        keys.sort();
        for key in keys {
            match &trace.env()[key] {
                EnvValue::Int(v) => writeln!(out, "    {key} = {v};").map_err(emit_err)?,
                EnvValue::Str(v) => writeln!(out, "    {key} = \"{v}\";").map_err(emit_err)?,
            }
        }
        writeln!(out, "}};\n").map_err(emit_err)?;
    }

    let mut emitted_clocks = std::collections::HashSet::new();
    for stream in trace.stream_classes() {
        for clock in stream.clocks() {
            if emitted_clocks.insert(clock.name()) {
                emit_clock(clock, &mut out)?;
            }
        }
    }

    for stream in trace.stream_classes() {
        writeln!(out, "stream {{").map_err(emit_err)?;
        writeln!(out, "    id = {};", stream.id().expect("attached stream has an id")).map_err(emit_err)?;
        if let Some(d) = stream.packet_context_decl() {
            write!(out, "    packet.context := ").map_err(emit_err)?;
            emit_type(d, &mut out, 1)?;
            writeln!(out, ";").map_err(emit_err)?;
        }
        if let Some(d) = stream.event_header_decl() {
            write!(out, "    event.header := ").map_err(emit_err)?;
            emit_type(d, &mut out, 1)?;
            writeln!(out, ";").map_err(emit_err)?;
        }
        if let Some(d) = stream.event_context_decl() {
            write!(out, "    event.context := ").map_err(emit_err)?;
            emit_type(d, &mut out, 1)?;
            writeln!(out, ";").map_err(emit_err)?;
        }
        writeln!(out, "}};\n").map_err(emit_err)?;

        for event in stream.event_classes() {
            writeln!(out, "event {{").map_err(emit_err)?;
            writeln!(out, "    id = {};", event.id().expect("attached event has an id")).map_err(emit_err)?;
            writeln!(out, "    stream_id = {};", stream.id().expect("attached stream has an id")).map_err(emit_err)?;
            writeln!(out, "    name = \"{}\";", event.name()).map_err(emit_err)?;
            if let Some(level) = event.log_level() {
                writeln!(out, "    loglevel = {};", i32::from(level)).map_err(emit_err)?;
            }
            if let Some(uri) = event.model_emf_uri() {
                writeln!(out, "    model.emf.uri = \"{uri}\";").map_err(emit_err)?;
            }
            if let Some(d) = event.context_decl() {
                write!(out, "    context := ").map_err(emit_err)?;
                emit_type(d, &mut out, 1)?;
                writeln!(out, ";").map_err(emit_err)?;
            }
            if let Some(d) = event.payload_decl() {
                write!(out, "    fields := ").map_err(emit_err)?;
                emit_type(d, &mut out, 1)?;
                writeln!(out, ";").map_err(emit_err)?;
            }
            writeln!(out, "}};\n").map_err(emit_err)?;
        }
    }

    Ok(out)
}

fn emit_clock(clock: &crate::clock::ClockClass, out: &mut String) -> Result<(), Error> {
    writeln!(out, "clock {{").map_err(emit_err)?;
    writeln!(out, "    name = {};", clock.name()).map_err(emit_err)?;
    if let Some(uuid) = clock.uuid() {
        writeln!(out, "    uuid = \"{uuid}\";").map_err(emit_err)?;
    }
    if let Some(description) = clock.description() {
        writeln!(out, "    description = \"{description}\";").map_err(emit_err)?;
    }
    writeln!(out, "    freq = {};", clock.frequency()).map_err(emit_err)?;
    writeln!(out, "    precision = {};", clock.precision()).map_err(emit_err)?;
    let (offset_s, offset_cycles) = clock.offset();
    writeln!(out, "    offset_s = {offset_s};").map_err(emit_err)?;
    writeln!(out, "    offset = {offset_cycles};").map_err(emit_err)?;
    writeln!(out, "    absolute = {};", clock.origin_is_unix_epoch()).map_err(emit_err)?;
    writeln!(out, "}};\n").map_err(emit_err)?;
    Ok(())
}

/// Prefixes `tsdl` with the packetized metadata magic header, for writers
/// configured with `packetize_metadata`. `content_size`/
/// `packet_size` cover exactly the text that follows, with no further
/// padding — the on-disk form is simply the preamble followed by raw TSDL
/// bytes.
pub fn packetize(tsdl: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(37 + tsdl.len());
    buf.extend_from_slice(&METADATA_MAGIC.to_be_bytes());
    buf.extend_from_slice(uuid::Uuid::nil().as_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes()); // checksum (unused)
    let content_bits = (tsdl.len() as u32) * 8;
    buf.extend_from_slice(&content_bits.to_be_bytes());
    buf.extend_from_slice(&content_bits.to_be_bytes());
    buf.push(0); // compression_scheme: none
    buf.push(0); // encryption_scheme: none
    buf.push(0); // checksum_scheme: none
    buf.push(1); // major
    buf.push(8); // minor
    buf.extend_from_slice(tsdl.as_bytes());
    buf
}
