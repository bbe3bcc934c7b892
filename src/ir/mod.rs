//! Trace class / stream class / event class / clock containers: the
//! objects component D ([`crate::io`]) drives and component E
//! ([`crate::metadata`]) serializes.
//!
//! Not one of the five named components directly, but required to
//! assemble them. Builder shape follows the same "fallible setter, rejects
//! after attachment" pattern as [`crate::decl::Declaration`], but these
//! containers are owned outright by their creator rather than
//! reference-counted: a stream class or event class is never shared across
//! more than one parent, unlike declarations, which a variant's options and
//! a structure's members can both reference.

use crate::clock::{self, ClockClass};
use crate::decl::{CanonicalScopes, Declaration, PreferredDisplayBase, ScopeKind};
use crate::error::Error;
use derive_more::Display;
use fxhash::FxHashMap;
use internment::Intern;
use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::{debug, warn};
use uuid::Uuid;

pub use crate::decl::ByteOrder;

/// 32-bit stream id, carried in the on-disk packet header.
pub type StreamId = u32;
pub type EventId = u64;
/// Raw clock ticks, as held in a clock snapshot.
pub type Timestamp = u64;

/// Packet header magic number.
pub const CTF_MAGIC: u32 = 0xC1FC_1FC1;

/// Canonical member names the default header/context declarations below
/// use, and that [`crate::io::writer::Writer`] looks for when a caller
/// supplies its own declarations instead (it needs `content_size` and
/// `packet_size` to patch in the final packet size at close time).
pub const MAGIC_MEMBER: &str = "magic";
pub const UUID_MEMBER: &str = "uuid";
pub const STREAM_ID_MEMBER: &str = "stream_id";
pub const CONTENT_SIZE_MEMBER: &str = "content_size";
pub const PACKET_SIZE_MEMBER: &str = "packet_size";
pub const TIMESTAMP_BEGIN_MEMBER: &str = "timestamp_begin";
pub const TIMESTAMP_END_MEMBER: &str = "timestamp_end";
pub const EVENTS_DISCARDED_MEMBER: &str = "events_discarded";
pub const EVENT_ID_MEMBER: &str = "id";
pub const EVENT_TIMESTAMP_MEMBER: &str = "timestamp";

/// A packet header with the minimum fields a trace needs: the magic
/// number, the trace's UUID (16 raw bytes), and the stream class id.
pub fn default_packet_header_decl() -> Result<Declaration, Error> {
    let header = Declaration::new_struct();
    header.append_member(MAGIC_MEMBER, Declaration::new_uint(32, ByteOrder::Big, PreferredDisplayBase::Hexadecimal, 32)?)?;
    let byte = Declaration::new_uint(8, ByteOrder::Big, PreferredDisplayBase::Hexadecimal, 8)?;
    header.append_member(UUID_MEMBER, Declaration::new_static_array(byte, 16))?;
    header.append_member(STREAM_ID_MEMBER, Declaration::new_uint(32, ByteOrder::Big, PreferredDisplayBase::Decimal, 32)?)?;
    Ok(header)
}

/// A packet context with the minimum fields a trace needs, in the
/// order the writer expects to find `content_size`/`packet_size` in (their
/// exact bit offsets are recorded by [`crate::def::Definition::write_struct_with_offsets`]
/// so the writer can patch them in once the packet is closed).
pub fn default_packet_context_decl() -> Result<Declaration, Error> {
    let ctx = Declaration::new_struct();
    let u64_decl = || Declaration::new_uint(64, ByteOrder::Native, PreferredDisplayBase::Decimal, 64);
    ctx.append_member(CONTENT_SIZE_MEMBER, u64_decl()?)?;
    ctx.append_member(PACKET_SIZE_MEMBER, u64_decl()?)?;
    ctx.append_member(TIMESTAMP_BEGIN_MEMBER, u64_decl()?)?;
    ctx.append_member(TIMESTAMP_END_MEMBER, u64_decl()?)?;
    ctx.append_member(EVENTS_DISCARDED_MEMBER, u64_decl()?)?;
    Ok(ctx)
}

/// An event header with the minimum fields needed: the event
/// class id and, when `clock` is given, a timestamp mapped to it.
pub fn default_event_header_decl(clock: Option<&ClockClass>) -> Result<Declaration, Error> {
    let hdr = Declaration::new_struct();
    hdr.append_member(EVENT_ID_MEMBER, Declaration::new_uint(64, ByteOrder::Native, PreferredDisplayBase::Decimal, 64)?)?;
    let ts = Declaration::new_uint(64, ByteOrder::Native, PreferredDisplayBase::Decimal, 64)?;
    if let Some(c) = clock {
        ts.set_mapped_clock(c.name())?;
    }
    hdr.append_member(EVENT_TIMESTAMP_MEMBER, ts)?;
    Ok(hdr)
}

/// Standard CTF event log levels, with a catch-all for vendor-defined
/// levels outside the standard range.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, IntoPrimitive, FromPrimitive)]
#[repr(i32)]
pub enum LogLevel {
    #[display("EMERG")]
    Emergency = 0,
    #[display("ALERT")]
    Alert = 1,
    #[display("CRIT")]
    Critical = 2,
    #[display("ERR")]
    Error = 3,
    #[display("WARNING")]
    Warning = 4,
    #[display("NOTICE")]
    Notice = 5,
    #[display("INFO")]
    Info = 6,
    #[display("DEBUG_SYSTEM")]
    DebugSystem = 7,
    #[display("DEBUG_PROGRAM")]
    DebugProgram = 8,
    #[display("DEBUG_PROCESS")]
    DebugProcess = 9,
    #[display("DEBUG_MODULE")]
    DebugModule = 10,
    #[display("DEBUG_UNIT")]
    DebugUnit = 11,
    #[display("DEBUG_FUNCTION")]
    DebugFunction = 12,
    #[display("DEBUG_LINE")]
    DebugLine = 13,
    #[display("DEBUG")]
    Debug = 14,
    #[display("{_0}")]
    #[num_enum(catch_all)]
    Other(i32),
}

/// A value storable under `TraceClass::set_env` (CTF's `env` section holds
/// only integers and strings).
#[derive(Clone, Debug, PartialEq)]
pub enum EnvValue {
    Int(i64),
    Str(String),
}

impl From<i64> for EnvValue {
    fn from(v: i64) -> Self {
        EnvValue::Int(v)
    }
}

impl From<&str> for EnvValue {
    fn from(v: &str) -> Self {
        EnvValue::Str(v.to_owned())
    }
}

impl From<String> for EnvValue {
    fn from(v: String) -> Self {
        EnvValue::Str(v)
    }
}

/// The schema of one kind of event: header, contexts, payload.
///
/// `context_decl` is the event-specific context; it is distinct from the
/// stream's common context (`StreamClass::event_context_decl`), which every
/// event in the stream shares. See `DESIGN.md` for how the two are resolved
/// against different canonical scopes.
pub struct EventClass {
    name: Intern<String>,
    id: Option<EventId>,
    context_decl: Option<Declaration>,
    payload_decl: Option<Declaration>,
    log_level: Option<LogLevel>,
    model_emf_uri: Option<String>,
    frozen: bool,
}

impl EventClass {
    pub fn new(name: impl Into<String>) -> Self {
        EventClass {
            name: Intern::new(name.into()),
            id: None,
            context_decl: None,
            payload_decl: None,
            log_level: None,
            model_emf_uri: None,
            frozen: false,
        }
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn name(&self) -> Intern<String> {
        self.name
    }

    pub fn id(&self) -> Option<EventId> {
        self.id
    }

    pub fn set_id(&mut self, id: EventId) -> Result<(), Error> {
        self.check_mutable()?;
        self.id = Some(id);
        Ok(())
    }

    pub fn set_context_decl(&mut self, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        self.context_decl = Some(decl);
        Ok(())
    }

    pub fn set_payload_decl(&mut self, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        self.payload_decl = Some(decl);
        Ok(())
    }

    pub fn set_log_level(&mut self, level: LogLevel) -> Result<(), Error> {
        self.check_mutable()?;
        self.log_level = Some(level);
        Ok(())
    }

    pub fn set_model_emf_uri(&mut self, uri: impl Into<String>) -> Result<(), Error> {
        self.check_mutable()?;
        self.model_emf_uri = Some(uri.into());
        Ok(())
    }

    pub fn context_decl(&self) -> Option<&Declaration> {
        self.context_decl.as_ref()
    }

    pub fn payload_decl(&self) -> Option<&Declaration> {
        self.payload_decl.as_ref()
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    pub fn model_emf_uri(&self) -> Option<&str> {
        self.model_emf_uri.as_deref()
    }

    fn freeze(&mut self) {
        self.frozen = true;
        if let Some(d) = &self.context_decl {
            d.freeze();
        }
        if let Some(d) = &self.payload_decl {
            d.freeze();
        }
    }
}

/// A stream class: packet context/event header/event context declarations,
/// its event classes, and the clock classes its events may map values to.
pub struct StreamClass {
    name: Intern<String>,
    id: Option<StreamId>,
    packet_context_decl: Option<Declaration>,
    event_header_decl: Option<Declaration>,
    /// Event common (stream-wide) context, shared by every event class.
    event_context_decl: Option<Declaration>,
    event_classes: Vec<EventClass>,
    clocks: Vec<ClockClass>,
    next_event_id: EventId,
    frozen: bool,
}

impl StreamClass {
    pub fn new(name: impl Into<String>) -> Self {
        StreamClass {
            name: Intern::new(name.into()),
            id: None,
            packet_context_decl: None,
            event_header_decl: None,
            event_context_decl: None,
            event_classes: Vec::new(),
            clocks: Vec::new(),
            next_event_id: 0,
            frozen: false,
        }
    }

    /// A stream class pre-populated with [`default_packet_context_decl`] and
    /// [`default_event_header_decl`], for callers that don't need a custom
    /// packet context or event header shape. `clock`, if given, is both
    /// mapped into the event header's timestamp field and registered with
    /// [`StreamClass::add_clock`].
    pub fn new_with_defaults(name: impl Into<String>, clock: Option<ClockClass>) -> Self {
        let mut stream = Self::new(name);
        stream
            .set_packet_context_decl(default_packet_context_decl().expect("default packet context decl is well-formed"))
            .unwrap();
        stream
            .set_event_header_decl(default_event_header_decl(clock.as_ref()).expect("default event header decl is well-formed"))
            .unwrap();
        if let Some(c) = clock {
            stream.add_clock(c).unwrap();
        }
        stream
    }

    fn check_mutable(&self) -> Result<(), Error> {
        if self.frozen {
            Err(Error::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn name(&self) -> Intern<String> {
        self.name
    }

    pub fn id(&self) -> Option<StreamId> {
        self.id
    }

    /// Fixes this stream class's id rather than letting
    /// [`TraceClass::add_stream_class`] assign the first unused one; used by
    /// [`crate::metadata::parse`] to honor an explicit `id` field from text.
    pub fn set_id(&mut self, id: StreamId) -> Result<(), Error> {
        self.check_mutable()?;
        self.id = Some(id);
        Ok(())
    }

    pub fn set_packet_context_decl(&mut self, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        self.packet_context_decl = Some(decl);
        Ok(())
    }

    pub fn set_event_header_decl(&mut self, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        self.event_header_decl = Some(decl);
        Ok(())
    }

    pub fn set_event_context_decl(&mut self, decl: Declaration) -> Result<(), Error> {
        self.check_mutable()?;
        self.event_context_decl = Some(decl);
        Ok(())
    }

    /// Assigns `e` an id (first unused, if it didn't already set one) and
    /// appends it. Once appended, `e`'s declarations are frozen when this
    /// stream class itself is attached to a trace class.
    pub fn add_event_class(&mut self, mut e: EventClass) -> Result<EventId, Error> {
        self.check_mutable()?;
        let id = match e.id {
            Some(id) => {
                if self.event_classes.iter().any(|ec| ec.id == Some(id)) {
                    return Err(Error::invalid(format!("event class id {id} already in use on stream '{}'", self.name)));
                }
                id
            }
            None => {
                while self.event_classes.iter().any(|ec| ec.id == Some(self.next_event_id)) {
                    self.next_event_id += 1;
                }
                self.next_event_id
            }
        };
        e.id = Some(id);
        self.next_event_id = self.next_event_id.max(id + 1);
        self.event_classes.push(e);
        Ok(id)
    }

    pub fn add_clock(&mut self, clock: ClockClass) -> Result<(), Error> {
        self.check_mutable()?;
        self.clocks.push(clock);
        Ok(())
    }

    pub fn packet_context_decl(&self) -> Option<&Declaration> {
        self.packet_context_decl.as_ref()
    }

    pub fn event_header_decl(&self) -> Option<&Declaration> {
        self.event_header_decl.as_ref()
    }

    pub fn event_context_decl(&self) -> Option<&Declaration> {
        self.event_context_decl.as_ref()
    }

    pub fn event_classes(&self) -> &[EventClass] {
        &self.event_classes
    }

    pub fn event_class(&self, id: EventId) -> Option<&EventClass> {
        self.event_classes.iter().find(|e| e.id == Some(id))
    }

    pub fn clocks(&self) -> &[ClockClass] {
        &self.clocks
    }

    pub fn default_clock(&self) -> Option<&ClockClass> {
        self.clocks.first()
    }

    /// Resolves every declaration reachable from this stream class against
    /// `trace_header`/`packet_context` (already-resolved ancestor scopes),
    /// then freezes the whole subtree. Idempotent-safe to call only once,
    /// from [`TraceClass::add_stream_class`].
    fn attach(&mut self, trace_header: Option<&Declaration>) -> Result<(), Error> {
        let mut scopes = CanonicalScopes {
            trace_header: trace_header.cloned(),
            ..Default::default()
        };

        if let Some(d) = &self.packet_context_decl {
            d.resolve(ScopeKind::PacketContext, &scopes)?;
            scopes.packet_context = Some(d.clone());
        }
        if let Some(d) = &self.event_header_decl {
            d.resolve(ScopeKind::EventHeader, &scopes)?;
            scopes.event_header = Some(d.clone());
        }
        if let Some(d) = &self.event_context_decl {
            d.resolve(ScopeKind::EventContext, &scopes)?;
            scopes.event_context = Some(d.clone());
        }

        for event in &mut self.event_classes {
            if let Some(d) = &event.context_decl {
                d.resolve(ScopeKind::EventPayload, &scopes)?;
            }
            if let Some(d) = &event.payload_decl {
                d.resolve(ScopeKind::EventPayload, &scopes)?;
            }
            event.freeze();
        }

        if let Some(d) = &self.packet_context_decl {
            d.freeze();
        }
        if let Some(d) = &self.event_header_decl {
            d.freeze();
        }
        if let Some(d) = &self.event_context_decl {
            d.freeze();
        }
        for clock in &self.clocks {
            clock.freeze();
            if let Some(uuid) = clock.uuid() {
                if let Err(e) = clock::register(clock.clone()) {
                    warn!(stream = %self.name, clock = %clock.name(), %uuid, %e, "Failed to register clock class");
                    return Err(e);
                }
                debug!(stream = %self.name, clock = %clock.name(), %uuid, "Registered clock class");
            }
        }
        self.frozen = true;
        Ok(())
    }
}

/// A trace class: the packet header declaration shared by every stream,
/// the `env` key/value table, and the stream classes it owns.
pub struct TraceClass {
    uuid: Option<Uuid>,
    native_byte_order: ByteOrder,
    env: FxHashMap<String, EnvValue>,
    packet_header_decl: Option<Declaration>,
    header_frozen: bool,
    stream_classes: Vec<StreamClass>,
    next_stream_id: StreamId,
}

impl Default for TraceClass {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceClass {
    pub fn new() -> Self {
        TraceClass {
            uuid: None,
            native_byte_order: ByteOrder::Little,
            env: FxHashMap::default(),
            packet_header_decl: None,
            header_frozen: false,
            stream_classes: Vec::new(),
            next_stream_id: 0,
        }
    }

    /// A trace class pre-populated with [`default_packet_header_decl`] and a
    /// fresh v4 UUID, for callers that don't need a custom packet header
    /// shape.
    pub fn new_with_defaults() -> Self {
        let mut trace = Self::new();
        trace
            .set_packet_header_decl(default_packet_header_decl().expect("default packet header decl is well-formed"))
            .unwrap();
        trace.set_uuid(Uuid::new_v4());
        trace
    }

    pub fn set_packet_header_decl(&mut self, decl: Declaration) -> Result<(), Error> {
        if self.header_frozen {
            return Err(Error::Frozen);
        }
        self.packet_header_decl = Some(decl);
        Ok(())
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<EnvValue>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn env(&self) -> &FxHashMap<String, EnvValue> {
        &self.env
    }

    pub fn set_native_byte_order(&mut self, order: ByteOrder) {
        self.native_byte_order = order;
    }

    pub fn native_byte_order(&self) -> ByteOrder {
        self.native_byte_order
    }

    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = Some(uuid);
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn packet_header_decl(&self) -> Option<&Declaration> {
        self.packet_header_decl.as_ref()
    }

    /// Assigns `stream` an id (first unused, if unset), resolves and
    /// freezes its declaration subtree, and freezes the trace's packet
    /// header declaration (first call only — once a stream class is
    /// added, the header declaration is frozen for the life of the trace).
    pub fn add_stream_class(&mut self, mut stream: StreamClass) -> Result<StreamId, Error> {
        let id = match stream.id {
            Some(id) => {
                if self.stream_classes.iter().any(|s| s.id == Some(id)) {
                    return Err(Error::invalid(format!("stream class id {id} already in use")));
                }
                id
            }
            None => {
                while self.stream_classes.iter().any(|s| s.id == Some(self.next_stream_id)) {
                    self.next_stream_id += 1;
                }
                self.next_stream_id
            }
        };
        stream.id = Some(id);
        self.next_stream_id = self.next_stream_id.max(id + 1);

        stream.attach(self.packet_header_decl.as_ref())?;

        if !self.header_frozen {
            if let Some(d) = &self.packet_header_decl {
                d.freeze();
            }
            self.header_frozen = true;
        }

        self.stream_classes.push(stream);
        Ok(id)
    }

    pub fn stream_classes(&self) -> &[StreamClass] {
        &self.stream_classes
    }

    pub fn stream_class(&self, id: StreamId) -> Option<&StreamClass> {
        self.stream_classes.iter().find(|s| s.id == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::PreferredDisplayBase;

    fn u8_decl() -> Declaration {
        Declaration::new_uint(8, ByteOrder::Little, PreferredDisplayBase::Decimal, 8).unwrap()
    }

    fn u32_decl() -> Declaration {
        Declaration::new_uint(32, ByteOrder::Little, PreferredDisplayBase::Decimal, 32).unwrap()
    }

    #[test]
    fn header_freezes_once_first_stream_added() {
        let mut trace = TraceClass::new();
        let header = Declaration::new_struct();
        header.append_member("magic", u32_decl()).unwrap();
        trace.set_packet_header_decl(header.clone()).unwrap();

        let stream = StreamClass::new("s");
        trace.add_stream_class(stream).unwrap();

        assert!(header.is_frozen());
        let other = Declaration::new_struct();
        assert!(matches!(trace.set_packet_header_decl(other), Err(Error::Frozen)));
    }

    #[test]
    fn event_class_ids_assigned_first_unused() {
        let mut stream = StreamClass::new("s");
        let id0 = stream.add_event_class(EventClass::new("a")).unwrap();
        let mut explicit = EventClass::new("b");
        explicit.set_id(5).unwrap();
        let id1 = stream.add_event_class(explicit).unwrap();
        let id2 = stream.add_event_class(EventClass::new("c")).unwrap();
        assert_eq!(id0, 0);
        assert_eq!(id1, 5);
        assert_eq!(id2, 1);
    }

    #[test]
    fn dyn_array_in_payload_resolves_against_packet_context() {
        let mut trace = TraceClass::new();
        let mut stream = StreamClass::new("s");
        let pc = Declaration::new_struct();
        pc.append_member("len", u8_decl()).unwrap();
        stream.set_packet_context_decl(pc).unwrap();

        let mut event = EventClass::new("e");
        let payload = Declaration::new_struct();
        payload.append_member("data", Declaration::new_dyn_array(u8_decl(), "len")).unwrap();
        event.set_payload_decl(payload).unwrap();
        stream.add_event_class(event).unwrap();

        trace.add_stream_class(stream).unwrap();
        assert!(trace.stream_class(0).unwrap().packet_context_decl().unwrap().is_frozen());
    }
}
