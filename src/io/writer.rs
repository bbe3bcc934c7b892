//! The streaming writer: orchestrates packet/event serialization across one
//! trace's stream files.
//!
//! Drives the packet-open/append-event/packet-close sequence, including a
//! dummy-mode size pre-pass for each event before it's committed to the
//! real buffer.

use crate::bitpos::StreamPos;
use crate::clock::MonotonicClock;
use crate::def::{Definition, ScopeSet};
use crate::error::Error;
use crate::ir::{self, EventId, StreamClass, StreamId, TraceClass};
use crate::io::EventFields;
use fxhash::FxHashMap;
use std::fs::{self, File};
use std::io::{Error as IoError, ErrorKind, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Bits a freshly-opened packet targets before an oversized event forces
/// [`StreamPos::packet_seek`] to grow past it. Matches
/// [`crate::bitpos::PACKET_LEN_INCREMENT_BITS`]; override per-writer with
/// [`Writer::set_packet_size_bits`] (tests use a much smaller value to force
/// a split deterministically).
pub const DEFAULT_PACKET_SIZE_BITS: usize = crate::bitpos::PACKET_LEN_INCREMENT_BITS;

/// A field's bit offset within an already-serialized packet context, paired
/// with the width/byte order it was declared with, so a later patch writes
/// back exactly as many bits as were originally reserved for it.
#[derive(Copy, Clone)]
struct PatchSlot {
    offset: usize,
    width: usize,
    endianness: crate::bitpos::Endianness,
}

struct OpenPacket {
    pos: StreamPos,
    header: Option<Definition>,
    context: Definition,
    content_size: PatchSlot,
    packet_size: PatchSlot,
    timestamp_begin: Option<PatchSlot>,
    timestamp_end: Option<PatchSlot>,
    events_discarded: Option<PatchSlot>,
    begin_ts: Option<u64>,
    end_ts: Option<u64>,
}

struct StreamState {
    file: File,
    open: Option<OpenPacket>,
    clock: MonotonicClock,
    events_discarded: u64,
}

/// Serializes a trace's events to a directory of `stream_<n>` files plus a
/// `metadata` document, following the packet lifecycle:
/// dummy-pass size precomputation, grow-then-write via
/// [`StreamPos::packet_seek`], and a deferred patch of `content_size`/
/// `packet_size`/the timestamp and discard-count fields once a packet's
/// true extent is known.
///
/// Unrecoverable I/O poisons the whole writer: every method
/// after that returns [`Error::Io`] immediately rather than attempting
/// further writes against a stream file that may be left in a partial
/// state.
pub struct Writer {
    dir: PathBuf,
    trace: TraceClass,
    streams: FxHashMap<StreamId, StreamState>,
    packet_size_bits: usize,
    packetize_metadata: bool,
    metadata_written: bool,
    poisoned: AtomicBool,
}

impl Writer {
    /// Creates `path` (and any missing parent directories) as the trace
    /// directory.
    pub fn new(path: impl Into<PathBuf>, trace: TraceClass) -> Result<Self, Error> {
        let dir = path.into();
        fs::create_dir_all(&dir)?;
        Ok(Writer {
            dir,
            trace,
            streams: FxHashMap::default(),
            packet_size_bits: DEFAULT_PACKET_SIZE_BITS,
            packetize_metadata: false,
            metadata_written: false,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Overrides the per-packet size target new packets are opened with.
    pub fn set_packet_size_bits(&mut self, bits: usize) {
        self.packet_size_bits = bits;
    }

    /// When set, [`Self::flush_metadata`] wraps the emitted TSDL in a
    /// packetized magic-number header instead of writing raw
    /// text. Must be called before the first event is appended (metadata is
    /// flushed lazily, on `close` or on an explicit `flush_metadata` call).
    pub fn set_packetize_metadata(&mut self, packetize: bool) {
        self.packetize_metadata = packetize;
    }

    pub fn trace(&self) -> &TraceClass {
        &self.trace
    }

    fn poison_err() -> Error {
        Error::Io(IoError::new(ErrorKind::Other, "writer is poisoned by a prior I/O failure"))
    }

    fn check_poisoned(&self) -> Result<(), Error> {
        if self.poisoned.load(Ordering::Acquire) {
            Err(Self::poison_err())
        } else {
            Ok(())
        }
    }

    /// Writes the trace's TSDL metadata document. A no-op on later calls.
    pub fn flush_metadata(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        if self.metadata_written {
            return Ok(());
        }
        let tsdl = crate::metadata::emit::emit_trace(&self.trace)?;
        let bytes = if self.packetize_metadata {
            crate::metadata::emit::packetize(&tsdl)
        } else {
            tsdl.into_bytes()
        };
        if fs::write(self.dir.join("metadata"), bytes).is_err() {
            warn!("I/O failure writing metadata, poisoning writer");
            self.poisoned.store(true, Ordering::Release);
            return Err(Self::poison_err());
        }
        self.metadata_written = true;
        Ok(())
    }

    fn stream_class(&self, stream_id: StreamId) -> Result<&StreamClass, Error> {
        self.trace
            .stream_class(stream_id)
            .ok_or_else(|| Error::invalid(format!("no stream class with id {stream_id}")))
    }

    /// Opens (creating if needed) `stream_<n>` under the trace directory.
    fn stream_state(&mut self, stream_id: StreamId) -> Result<&mut StreamState, Error> {
        if !self.streams.contains_key(&stream_id) {
            self.stream_class(stream_id)?;
            let file = File::create(self.dir.join(format!("stream_{stream_id}")))?;
            self.streams.insert(
                stream_id,
                StreamState {
                    file,
                    open: None,
                    clock: MonotonicClock::default(),
                    events_discarded: 0,
                },
            );
        }
        Ok(self.streams.get_mut(&stream_id).unwrap())
    }

    /// Opens a fresh packet for `stream_id`: writes the packet header (if
    /// the trace has one) and an initial packet context with
    /// `events_discarded` already set to the stream's running total, so a
    /// mid-stream packet split keeps the count cumulative.
    fn open_packet(&mut self, stream_id: StreamId) -> Result<(), Error> {
        let header_decl = self.trace.packet_header_decl().cloned();
        let trace_uuid = self.trace.uuid();
        let context_decl = self
            .stream_class(stream_id)?
            .packet_context_decl()
            .cloned()
            .ok_or_else(|| Error::invalid(format!("stream {stream_id} has no packet context declaration")))?;

        let state = self.stream_state(stream_id)?;
        let discarded_so_far = state.events_discarded;

        let mut pos = StreamPos::for_write(self.packet_size_bits);

        let header = header_decl.map(|d| Definition::create_from(&d, "header", 0, ""));
        if let Some(h) = &header {
            if let Some(uuid) = trace_uuid {
                optional_member(h, ir::UUID_MEMBER, |uuid_def| {
                    for (i, b) in uuid.as_bytes().iter().enumerate() {
                        uuid_def.set_array_element(i, *b)?;
                    }
                    Ok(())
                })?;
            }
            optional_member(h, ir::MAGIC_MEMBER, |m| m.set_uint(ir::CTF_MAGIC as u64))?;
            optional_member(h, ir::STREAM_ID_MEMBER, |m| m.set_uint(stream_id as u64))?;
            h.write(&mut pos, &ScopeSet::default())?;
        }

        let context = Definition::create_from(&context_decl, "context", 0, "");
        optional_member(&context, ir::EVENTS_DISCARDED_MEMBER, |m| m.set_uint(discarded_so_far))?;

        let scopes = ScopeSet {
            trace_header: header.as_ref(),
            ..Default::default()
        };
        let offsets = context.write_struct_with_offsets(&mut pos, &scopes)?;
        let slot_of = |name: &str| -> Option<PatchSlot> {
            let offset = offsets.iter().find(|(n, _)| n.as_str() == name).map(|(_, o)| *o)?;
            let (width, byte_order, _) = context_decl.member(name)?.integer_snapshot()?;
            Some(PatchSlot {
                offset,
                width: width as usize,
                endianness: byte_order.resolve(),
            })
        };

        let content_size = slot_of(ir::CONTENT_SIZE_MEMBER)
            .ok_or_else(|| Error::invalid("packet context has no unsigned-integer 'content_size' member"))?;
        let packet_size = slot_of(ir::PACKET_SIZE_MEMBER)
            .ok_or_else(|| Error::invalid("packet context has no unsigned-integer 'packet_size' member"))?;

        state.open = Some(OpenPacket {
            pos,
            header,
            context,
            content_size,
            packet_size,
            timestamp_begin: slot_of(ir::TIMESTAMP_BEGIN_MEMBER),
            timestamp_end: slot_of(ir::TIMESTAMP_END_MEMBER),
            events_discarded: slot_of(ir::EVENTS_DISCARDED_MEMBER),
            begin_ts: None,
            end_ts: None,
        });
        debug!(stream_id, discarded_so_far, "Opened packet");
        Ok(())
    }

    /// Patches `content_size`/`packet_size` and the timestamp/discard
    /// fields, then appends the packet's full (already zero-padded)
    /// backing buffer to the stream file.
    fn close_packet(&mut self, stream_id: StreamId) -> Result<(), Error> {
        let state = self.streams.get_mut(&stream_id).expect("close_packet on an unopened stream");
        let Some(mut open) = state.open.take() else {
            return Ok(());
        };

        let content_size = open.pos.offset_bits() as u64;
        let packet_size = open.pos.limit_bits() as u64;
        let patch = |pos: &mut StreamPos, slot: PatchSlot, value: u64| pos.patch_uint(slot.offset, value, slot.width, slot.endianness);
        patch(&mut open.pos, open.content_size, content_size)?;
        patch(&mut open.pos, open.packet_size, packet_size)?;
        if let (Some(slot), Some(ts)) = (open.timestamp_begin, open.begin_ts) {
            patch(&mut open.pos, slot, ts)?;
        }
        if let (Some(slot), Some(ts)) = (open.timestamp_end, open.end_ts) {
            patch(&mut open.pos, slot, ts)?;
        }
        if let Some(slot) = open.events_discarded {
            patch(&mut open.pos, slot, state.events_discarded)?;
        }
        open.pos.close_content();
        debug!(stream_id, content_size, packet_size, "Closed packet");

        if state.file.write_all(open.pos.buffer()).is_err() {
            warn!(stream_id, "I/O failure writing packet, poisoning writer");
            self.poisoned.store(true, Ordering::Release);
            return Err(Self::poison_err());
        }
        Ok(())
    }

    /// Serializes one event onto `stream_id`'s currently open packet
    /// (opening one if none is open, or closing and reopening one if the
    /// event would overflow `packet_size_bits`).
    ///
    /// `clock_value` is the stream's clock's raw tick count for this event,
    /// required iff the stream's event header declares a mapped timestamp
    /// field; monotonicity is enforced before anything is
    /// written.
    pub fn append_event(
        &mut self,
        stream_id: StreamId,
        class_id: EventId,
        fields: EventFields,
        clock_value: Option<u64>,
    ) -> Result<(), Error> {
        self.check_poisoned()?;

        let stream_class = self.stream_class(stream_id)?;
        stream_class
            .event_class(class_id)
            .ok_or_else(|| Error::invalid(format!("stream {stream_id} has no event class {class_id}")))?;
        let header_decl = stream_class
            .event_header_decl()
            .cloned()
            .ok_or_else(|| Error::invalid(format!("stream {stream_id} has no event header declaration")))?;
        let clock_name = stream_class
            .default_clock()
            .map(|c| c.name().as_str().to_owned())
            .unwrap_or_else(|| "clock".to_owned());

        if self.stream_state(stream_id)?.open.is_none() {
            self.open_packet(stream_id)?;
        }

        if let Some(value) = clock_value {
            if let Err(e) = self.streams.get_mut(&stream_id).unwrap().clock.set_value(&clock_name, value) {
                warn!(stream_id, class_id, %e, "Clock went backwards");
                return Err(e);
            }
        }

        let header = Definition::create_from(&header_decl, "header", 0, "");
        require_member(&header, ir::EVENT_ID_MEMBER, |m| m.set_uint(class_id))?;
        let has_timestamp_member = header.member_index(ir::EVENT_TIMESTAMP_MEMBER).is_some();
        if has_timestamp_member {
            let ts = clock_value.ok_or_else(|| Error::invalid("event header declares a timestamp but no clock value was given"))?;
            require_member(&header, ir::EVENT_TIMESTAMP_MEMBER, |m| m.set_uint(ts))?;
        }

        let state = self.streams.get_mut(&stream_id).unwrap();
        let open = state.open.as_ref().expect("packet opened above");
        let needed = {
            let mut dummy = StreamPos::for_dummy_write();
            write_event_fields(
                &mut dummy,
                open.header.as_ref(),
                &open.context,
                &header,
                fields.common_context.as_ref(),
                fields.specific_context.as_ref(),
                fields.payload.as_ref(),
            )?;
            dummy.offset_bits()
        };

        let open_offset = state.open.as_ref().unwrap().pos.offset_bits();
        if open_offset + needed > self.packet_size_bits {
            self.close_packet(stream_id)?;
            self.open_packet(stream_id)?;
        }

        let state = self.streams.get_mut(&stream_id).unwrap();
        let open = state.open.as_mut().expect("packet opened above");
        open.pos.packet_seek(needed);
        write_event_fields(
            &mut open.pos,
            open.header.as_ref(),
            &open.context,
            &header,
            fields.common_context.as_ref(),
            fields.specific_context.as_ref(),
            fields.payload.as_ref(),
        )?;
        if let Some(ts) = clock_value {
            if open.begin_ts.is_none() {
                open.begin_ts = Some(ts);
            }
            open.end_ts = Some(ts);
        }
        Ok(())
    }

    /// Marks `count` more events as discarded by `stream_id` without
    /// serializing them (e.g. a caller-side ring buffer overrun); reflected
    /// in the next packet's (or the currently open packet's, once patched
    /// at close) `events_discarded` field.
    pub fn discard_events(&mut self, stream_id: StreamId, count: u64) -> Result<(), Error> {
        self.check_poisoned()?;
        self.stream_state(stream_id)?.events_discarded += count;
        Ok(())
    }

    /// Closes every open packet across all streams and flushes the
    /// metadata document if it hasn't been written yet.
    pub fn close(&mut self) -> Result<(), Error> {
        self.check_poisoned()?;
        let stream_ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for stream_id in stream_ids {
            self.close_packet(stream_id)?;
        }
        self.flush_metadata()
    }
}

/// Writes an event's header, stream-common context, event-specific
/// context, and payload in on-disk order, each resolved against the scope
/// set's layout implies: specific context and payload each see
/// themselves as the `EventPayload` scope (so a sequence in one can't
/// reference a field in the other; see `DESIGN.md`).
fn write_event_fields(
    pos: &mut StreamPos,
    trace_header: Option<&Definition>,
    packet_context: &Definition,
    header: &Definition,
    common_context: Option<&Definition>,
    specific_context: Option<&Definition>,
    payload: Option<&Definition>,
) -> Result<(), Error> {
    let scopes = |event_payload: Option<&Definition>| ScopeSet {
        trace_header,
        packet_context: Some(packet_context),
        event_header: Some(header),
        event_context: common_context,
        event_payload,
    };
    header.write(pos, &scopes(None))?;
    if let Some(cc) = common_context {
        cc.write(pos, &scopes(None))?;
    }
    if let Some(sc) = specific_context {
        sc.write(pos, &scopes(Some(sc)))?;
    }
    if let Some(p) = payload {
        p.write(pos, &scopes(Some(p)))?;
    }
    Ok(())
}

fn require_member<R>(def: &Definition, name: &str, f: impl FnOnce(&Definition) -> Result<R, Error>) -> Result<R, Error> {
    def.with_member(name, f)
        .ok_or_else(|| Error::invalid(format!("missing required member '{name}'")))?
}

/// Like `require_member` but a missing member is simply skipped, for
/// caller-supplied packet headers that may omit the canonical
/// magic/uuid/stream-id fields.
fn optional_member(def: &Definition, name: &str, f: impl FnOnce(&Definition) -> Result<(), Error>) -> Result<(), Error> {
    def.with_member(name, f).unwrap_or(Ok(()))
}
