//! TSDL metadata: the textual encoding for a [`crate::ir::TraceClass`]
//! (component E).
//!
//! [`emit`] and [`parse`] are each other's inverse: `parse::parse_trace(&emit::emit_trace(trace)?)`
//! round-trips every field either side knows how to write, modulo detail
//! `emit_trace` never serializes in the first place (`major`/`minor` version
//! numbers, `typealias`/`typedef` — `parse` accepts the latter but `emit`
//! never needs to produce one, since every declaration is written inline
//! from the tree that owns it).

pub mod emit;
pub mod lexer;
pub mod parse;
