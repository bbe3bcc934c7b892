//! The streaming reader: decodes a trace directory's `metadata` and
//! `stream_<n>` files back into declaration/definition trees.
//!
//! Driven by the [`crate::decl::Declaration`]/[`crate::def::Definition`]
//! trees rather than a flat, fixed-layout struct, with per-packet phases
//! (header, packet context, events) as the shape of [`decode_packet`], and
//! a `tokio_util::codec::Decoder`-based [`PacketDecoder`] below for
//! async/streaming use.

use crate::bitpos::StreamPos;
use crate::def::{Definition, ScopeSet};
use crate::error::Error;
use crate::io::{Event, Interrupter};
use crate::ir::{self, StreamClass, StreamId, TraceClass};
use bytes::BytesMut;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// One stream file's events, in the program order they were written, each
/// paired with its nanoseconds-from-origin timestamp (`None` if the
/// stream's event header has no mapped clock).
pub struct StreamEvents {
    pub stream_id: StreamId,
    pub events: Vec<(Option<i128>, Event)>,
}

/// A position a [`Reader::create_iterator`] range can be bounded by.
#[derive(Copy, Clone, Debug)]
pub enum Position {
    Begin,
    End,
    /// An absolute nanoseconds-from-origin timestamp.
    Timestamp(i128),
}

/// Opens a trace directory for reading. Decoding is eager (every packet in
/// every stream file is read up front into [`StreamEvents`]) rather than
/// `mmap`-windowed, the same portability-over-parity tradeoff `StreamPos`
/// makes for its writer-side buffer (see `DESIGN.md`).
pub struct Reader {
    dir: PathBuf,
    trace: TraceClass,
}

impl Reader {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        let raw = fs::read(dir.join("metadata"))?;
        let trace = crate::metadata::parse::parse_trace(&raw)?;
        Ok(Reader { dir, trace })
    }

    pub fn trace(&self) -> &TraceClass {
        &self.trace
    }

    /// Consumes this reader, returning a [`PacketDecoder`] that decodes one
    /// packet at a time from an arbitrary byte stream (e.g. a
    /// `tokio_util::codec::FramedRead` over a `stream_<n>` file, or a live
    /// socket), rather than requiring the whole file up front the way
    /// [`Reader::read_all`] does.
    pub fn into_packet_decoder(self) -> PacketDecoder {
        PacketDecoder { trace: self.trace }
    }

    /// `stream_<n>` files present in the trace directory, in numeric id
    /// order.
    fn stream_files(&self) -> Result<Vec<(StreamId, PathBuf)>, Error> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("stream_") {
                if let Ok(id) = rest.parse::<StreamId>() {
                    files.push((id, entry.path()));
                }
            }
        }
        files.sort_by_key(|(id, _)| *id);
        Ok(files)
    }

    /// Decodes every packet of every stream file.
    pub fn read_all(&self) -> Result<Vec<StreamEvents>, Error> {
        self.stream_files()?
            .into_iter()
            .map(|(stream_id, path)| self.read_stream(stream_id, &path))
            .collect()
    }

    fn read_stream(&self, stream_id: StreamId, path: &Path) -> Result<StreamEvents, Error> {
        let stream_class = self
            .trace
            .stream_class(stream_id)
            .ok_or_else(|| Error::format_mismatch(format!("no stream class with id {stream_id} for '{}'", path.display())))?;
        let bytes = fs::read(path)?;
        let mut cursor = 0usize;
        let mut events = Vec::new();
        while cursor < bytes.len() {
            let decoded = decode_packet(&self.trace, stream_class, stream_id, &bytes[cursor..])?;
            if decoded.packet_size_bytes == 0 {
                break;
            }
            events.extend(decoded.events);
            cursor += decoded.packet_size_bytes;
        }
        Ok(StreamEvents { stream_id, events })
    }

    /// Decodes every stream and flattens them into one sequence ordered by
    /// `(timestamp, stream id)`, trimmed to `[begin, end]`. For merging
    /// multiple trace directories, prefer
    /// [`crate::io::collection::TraceCollection`], which keeps each
    /// stream's decode lazy behind a heap instead of flattening eagerly.
    pub fn create_iterator(&self, begin: Position, end: Position) -> Result<EventIterator, Error> {
        let mut merged: Vec<(StreamId, Option<i128>, Event)> = Vec::new();
        for stream_events in self.read_all()? {
            let stream_id = stream_events.stream_id;
            for (ts, event) in stream_events.events {
                merged.push((stream_id, ts, event));
            }
        }
        merged.sort_by_key(|(stream_id, ts, _)| (ts.unwrap_or(0), *stream_id));

        let lo = match begin {
            Position::Begin => i128::MIN,
            Position::End => i128::MAX,
            Position::Timestamp(t) => t,
        };
        let hi = match end {
            Position::End => i128::MAX,
            Position::Begin => i128::MIN,
            Position::Timestamp(t) => t,
        };
        merged.retain(|(_, ts, _)| {
            let ts = ts.unwrap_or(0);
            ts >= lo && ts <= hi
        });

        Ok(EventIterator {
            remaining: merged.into_iter(),
            interrupter: Interrupter::default(),
        })
    }
}

fn require_unsigned(def: &Definition, name: &str) -> Result<u64, Error> {
    def.with_member(name, |m| m.as_value().as_unsigned())
        .flatten()
        .ok_or_else(|| Error::format_mismatch(format!("missing or non-integer required member '{name}'")))
}

struct DecodedPacket {
    header: Option<Definition>,
    context: Definition,
    packet_size_bytes: usize,
    events: Vec<(Option<i128>, Event)>,
}

/// Decodes one packet starting at `buf[0]` against `stream_class`'s
/// declarations, checking the header's magic/stream id (if the trace has a
/// packet header) against `expected_stream_id`.
fn decode_packet(trace: &TraceClass, stream_class: &StreamClass, expected_stream_id: StreamId, buf: &[u8]) -> Result<DecodedPacket, Error> {
    let mut pos = StreamPos::for_read(buf.to_vec(), buf.len() * 8);

    let header = trace.packet_header_decl().map(|d| Definition::create_from(d, "header", 0, ""));
    if let Some(h) = &header {
        h.read(&mut pos, &ScopeSet::default())?;
        let magic = h.with_member(ir::MAGIC_MEMBER, |m| m.as_value().as_unsigned()).flatten();
        let found_stream_id = h.with_member(ir::STREAM_ID_MEMBER, |m| m.as_value().as_unsigned()).flatten();
        debug!(stream_id = expected_stream_id, ?magic, ?found_stream_id, "Parsed packet header");
        if let Some(magic) = magic {
            if magic != ir::CTF_MAGIC as u64 {
                warn!(stream_id = expected_stream_id, found = format!("0x{magic:x}"), "Invalid packet header magic number");
                return Err(Error::format_mismatch(format!("bad packet magic 0x{magic:x}")));
            }
        }
        if let Some(found) = found_stream_id {
            if found as StreamId != expected_stream_id {
                warn!(expected = expected_stream_id, found, "Packet header stream id doesn't match file's stream");
                return Err(Error::format_mismatch(format!(
                    "packet header stream id {found} does not match file's stream {expected_stream_id}"
                )));
            }
        }
    }

    let context_decl = stream_class
        .packet_context_decl()
        .ok_or_else(|| Error::invalid(format!("stream {expected_stream_id} has no packet context declaration")))?;
    let context = Definition::create_from(context_decl, "context", 0, "");
    let scopes = ScopeSet {
        trace_header: header.as_ref(),
        packet_context: Some(&context),
        ..Default::default()
    };
    context.read(&mut pos, &scopes)?;

    let content_size = require_unsigned(&context, ir::CONTENT_SIZE_MEMBER)? as usize;
    let packet_size = require_unsigned(&context, ir::PACKET_SIZE_MEMBER)? as usize;
    debug!(stream_id = expected_stream_id, packet_size, content_size, "Parsed packet context");
    pos.set_limit_bits(content_size);

    let clock = stream_class.default_clock();
    let mut events = Vec::new();
    while pos.offset_bits() < content_size {
        let event = decode_event(stream_class, &mut pos, header.as_ref(), &context)?;
        let ns = event.timestamp.map(|raw| match clock {
            Some(c) => c.to_ns_from_origin(raw),
            None => raw as i128,
        });
        events.push((ns, event));
    }

    Ok(DecodedPacket {
        header,
        context,
        packet_size_bytes: packet_size.div_ceil(8),
        events,
    })
}

fn decode_event(stream_class: &StreamClass, pos: &mut StreamPos, trace_header: Option<&Definition>, packet_context: &Definition) -> Result<Event, Error> {
    let header_decl = stream_class
        .event_header_decl()
        .ok_or_else(|| Error::invalid("stream has no event header declaration"))?;
    let header = Definition::create_from(header_decl, "header", 0, "");
    let header_scopes = ScopeSet {
        trace_header,
        packet_context: Some(packet_context),
        event_header: Some(&header),
        ..Default::default()
    };
    header.read(pos, &header_scopes)?;

    let class_id = require_unsigned(&header, ir::EVENT_ID_MEMBER)?;
    let timestamp = header.with_member(ir::EVENT_TIMESTAMP_MEMBER, |m| m.as_value().as_unsigned()).flatten();
    debug!(event_id = class_id, ?timestamp, "Parsed event header");

    let event_class = stream_class
        .event_class(class_id)
        .ok_or_else(|| Error::format_mismatch(format!("unknown event class id {class_id}")))?;

    let common_context = stream_class.event_context_decl().map(|d| Definition::create_from(d, "context", 0, ""));
    if let Some(cc) = &common_context {
        let scopes = ScopeSet {
            trace_header,
            packet_context: Some(packet_context),
            event_header: Some(&header),
            event_context: Some(cc),
            ..Default::default()
        };
        cc.read(pos, &scopes)?;
    }

    let specific_context = event_class.context_decl().map(|d| Definition::create_from(d, "context", 0, ""));
    if let Some(sc) = &specific_context {
        let scopes = ScopeSet {
            trace_header,
            packet_context: Some(packet_context),
            event_header: Some(&header),
            event_context: common_context.as_ref(),
            event_payload: Some(sc),
        };
        sc.read(pos, &scopes)?;
    }

    let payload = event_class.payload_decl().map(|d| Definition::create_from(d, "payload", 0, ""));
    if let Some(p) = &payload {
        let scopes = ScopeSet {
            trace_header,
            packet_context: Some(packet_context),
            event_header: Some(&header),
            event_context: common_context.as_ref(),
            event_payload: Some(p),
        };
        p.read(pos, &scopes)?;
    }

    Ok(Event {
        class_id,
        class_name: event_class.name(),
        timestamp,
        common_context: common_context.map(|d| d.as_value()),
        specific_context: specific_context.map(|d| d.as_value()),
        payload: payload.map(|d| d.as_value()),
    })
}

/// A pull-style cursor over one [`Reader::create_iterator`] range.
pub struct EventIterator {
    remaining: std::vec::IntoIter<(StreamId, Option<i128>, Event)>,
    interrupter: Interrupter,
}

impl EventIterator {
    /// Arms `interrupter` for this cursor: a later call to
    /// [`Self::next_checked`] returns `Err(Error::Interrupted)` once it's
    /// set, without consuming the pending event (calling `next_checked`
    /// again after clearing the flag resumes exactly there).
    pub fn set_interrupter(&mut self, interrupter: Interrupter) {
        self.interrupter = interrupter;
    }

    pub fn next(&mut self) -> Option<(StreamId, Event)> {
        self.remaining.next().map(|(id, _, ev)| (id, ev))
    }

    /// Like [`Self::next`], but cooperatively cancellable: checks the
    /// interrupter before pulling the next event.
    pub fn next_checked(&mut self) -> Result<Option<(StreamId, Event)>, Error> {
        self.interrupter.check()?;
        Ok(self.next())
    }
}

impl Iterator for EventIterator {
    type Item = (StreamId, Event);

    fn next(&mut self) -> Option<Self::Item> {
        EventIterator::next(self)
    }
}

/// One packet decoded incrementally by [`PacketDecoder`]: the packet header
/// (if the trace has one), the packet context, and its events.
pub struct Packet {
    pub header: Option<crate::value::Value>,
    pub context: crate::value::Value,
    pub events: Vec<(Option<i128>, Event)>,
}

/// A `tokio_util::codec::Decoder` that decodes one packet at a time from a
/// byte stream, for trace directories too large (or too live) to read up
/// front with [`Reader::read_all`].
///
/// A fixed-width header/context would offer a cheap static byte-size hint;
/// declaration-driven fields don't, so this instead makes a cheap trial
/// parse over the buffer so far: an [`Error::Overrun`] from that trial
/// means "not enough data yet" (return `Ok(None)` per `Decoder`'s contract)
/// rather than a real decode failure. Only the header's declared stream id
/// determines which stream class's packet context/event declarations
/// apply — unambiguous even when a single byte stream interleaves more
/// than one stream id.
pub struct PacketDecoder {
    trace: TraceClass,
}

impl PacketDecoder {
    pub fn trace(&self) -> &TraceClass {
        &self.trace
    }

    fn resolve_stream_class(&self, header: Option<&Definition>) -> Result<&StreamClass, Error> {
        if let Some(id) = header.and_then(|h| h.with_member(ir::STREAM_ID_MEMBER, |m| m.as_value().as_unsigned()).flatten()) {
            return self
                .trace
                .stream_class(id as StreamId)
                .ok_or_else(|| Error::format_mismatch(format!("unknown stream id {id} in packet header")));
        }
        let streams = self.trace.stream_classes();
        match streams.len() {
            1 => Ok(&streams[0]),
            _ => Err(Error::format_mismatch(
                "packet header carries no stream id and trace has more than one stream class",
            )),
        }
    }
}

impl Decoder for PacketDecoder {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let trial_overrun = |e: &Error| matches!(e, Error::Overrun { .. });

        let mut trial = StreamPos::for_read(src.to_vec(), src.len() * 8);
        let header_decl = self.trace.packet_header_decl().cloned();
        let header = match &header_decl {
            Some(decl) => {
                let h = Definition::create_from(decl, "header", 0, "");
                match h.read(&mut trial, &ScopeSet::default()) {
                    Ok(()) => Some(h),
                    Err(e) if trial_overrun(&e) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };

        let stream_class = self.resolve_stream_class(header.as_ref())?;
        let stream_id = stream_class.id().expect("resolved stream class is attached");

        let context_decl = stream_class
            .packet_context_decl()
            .cloned()
            .ok_or_else(|| Error::invalid(format!("stream {stream_id} has no packet context declaration")))?;
        let context = Definition::create_from(&context_decl, "context", 0, "");
        let ctx_scopes = ScopeSet {
            trace_header: header.as_ref(),
            packet_context: Some(&context),
            ..Default::default()
        };
        match context.read(&mut trial, &ctx_scopes) {
            Ok(()) => {}
            Err(e) if trial_overrun(&e) => return Ok(None),
            Err(e) => return Err(e),
        }

        let packet_size_bits = require_unsigned(&context, ir::PACKET_SIZE_MEMBER)? as usize;
        let packet_size_bytes = packet_size_bits.div_ceil(8);
        if src.len() < packet_size_bytes {
            return Ok(None);
        }

        let packet_bytes = src.split_to(packet_size_bytes);
        let decoded = decode_packet(&self.trace, stream_class, stream_id, &packet_bytes[..])?;
        Ok(Some(Packet {
            header: decoded.header.map(|h| h.as_value()),
            context: decoded.context.as_value(),
            events: decoded.events,
        }))
    }
}
