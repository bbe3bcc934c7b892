//! Reader, writer, and multi-trace collection: orchestrates the bit engine
//! ([`crate::bitpos`]), declaration tree ([`crate::decl`]), and definition
//! tree ([`crate::def`]) across packet and stream boundaries
//! §4.D.

pub mod collection;
pub mod reader;
pub mod writer;

use crate::def::Definition;
use crate::error::Error;
use crate::ir::{EventClass, EventId, StreamClass, Timestamp};
use crate::value::Value;
use internment::Intern;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation flag: polled at event and packet
/// boundaries by [`reader::EventIterator::next_checked`] and
/// [`collection::TraceCollection::next_checked`], never by the infallible
/// `Iterator` impls those types also provide. Cloning shares the same flag
/// (an `Arc` bump), so a caller can hold one end and set it from another
/// thread while a consumer polls the other.
#[derive(Clone, Default)]
pub struct Interrupter(Arc<AtomicBool>);

impl Interrupter {
    pub fn new() -> Self {
        Interrupter(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_set() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// The definition trees backing one event's writable fields, built fresh
/// for each [`writer::Writer::append_event`] call against the event and
/// stream class's declarations. A field is `None` when the corresponding
/// declaration was never set (stream-common context, event-specific
/// context, and payload are all independently optional).
pub struct EventFields {
    pub common_context: Option<Definition>,
    pub specific_context: Option<Definition>,
    pub payload: Option<Definition>,
}

impl EventFields {
    /// Builds an (unpopulated) instance tree for each declaration `class`
    /// and its owning `stream` have set, ready for the caller to fill in
    /// before handing it to `append_event`.
    pub fn new(stream: &StreamClass, class: &EventClass) -> Self {
        EventFields {
            common_context: stream.event_context_decl().map(|d| Definition::create_from(d, "context", 0, "")),
            specific_context: class.context_decl().map(|d| Definition::create_from(d, "context", 0, "")),
            payload: class.payload_decl().map(|d| Definition::create_from(d, "payload", 0, "")),
        }
    }
}

/// A fully-decoded event, as handed back by [`reader::Reader`].
pub struct Event {
    pub class_id: EventId,
    pub class_name: Intern<String>,
    /// Raw clock ticks from the event header, if the stream's header
    /// declares a timestamp field.
    pub timestamp: Option<Timestamp>,
    pub common_context: Option<Value>,
    pub specific_context: Option<Value>,
    pub payload: Option<Value>,
}
