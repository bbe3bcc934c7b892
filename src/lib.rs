//! CTF intermediate representation, packed-bit engine, and streaming trace
//! codec.
//!
//! - [`bitpos`] — the bit-packed stream cursor (component A).
//! - [`decl`] — the immutable, shared declaration tree / schema DAG (component B).
//! - [`def`] — the owned definition tree / runtime value instances (component C).
//! - [`io`] — the packet reader, writer, and multi-trace collection (component D).
//! - [`metadata`] — the TSDL metadata emitter/parser (component E).
//! - [`ir`] — trace/stream/event class containers tying B-E together.
//! - [`clock`] — clock classes, snapshots, and the per-process clock registry.
//! - [`value`] — the decoded-value type handed back by [`def::Definition::as_value`].

pub mod bitpos;
pub mod clock;
pub mod decl;
pub mod def;
pub mod error;
pub mod io;
pub mod ir;
pub mod metadata;
pub mod value;

pub use crate::clock::{ClockClass, ClockSnapshot};
pub use crate::decl::Declaration;
pub use crate::def::Definition;
pub use crate::error::Error;
pub use crate::io::collection::TraceCollection;
pub use crate::io::reader::{Position, Reader};
pub use crate::io::writer::Writer;
pub use crate::io::{Event, EventFields};
pub use crate::ir::{EventClass, StreamClass, TraceClass};
pub use crate::value::Value;
