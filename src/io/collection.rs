//! Merges multiple trace directories (e.g. one per process in a capture) into
//! a single timestamp-ordered sequence without eagerly flattening every
//! stream into one `Vec`.
//!
//! Each stream's already-decoded events are walked behind a min-heap keyed on
//! the next undelivered event's timestamp; since a heap only ever needs its
//! current minimum replaced, popping then re-pushing the advanced cursor's
//! new head realizes a decrease-key without a true indexed heap (see
//! `DESIGN.md`).

use crate::error::Error;
use crate::io::reader::Reader;
use crate::io::{Event, Interrupter};
use crate::ir::StreamId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

/// One event pulled out of a [`TraceCollection`], tagged with which source
/// trace directory and stream it came from.
pub struct CollectedEvent {
    pub source: usize,
    pub stream_id: StreamId,
    pub timestamp_ns: Option<i128>,
    pub event: Event,
}

struct StreamCursor {
    source: usize,
    stream_id: StreamId,
    events: std::vec::IntoIter<(Option<i128>, Event)>,
}

/// A timestamp-merged view over every stream of every trace directory opened
/// into it.
pub struct TraceCollection {
    heap: BinaryHeap<Reverse<(i128, StreamId, usize)>>,
    cursors: Vec<StreamCursor>,
    interrupter: Interrupter,
}

impl TraceCollection {
    /// Opens every immediate subdirectory of `root` that contains a
    /// `metadata` file as a separate trace source.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref();
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join("metadata").is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Self::open_dirs(&dirs)
    }

    /// Opens each of `dirs` as a separate trace source, in the given order.
    pub fn open_dirs(dirs: &[PathBuf]) -> Result<Self, Error> {
        let mut heap = BinaryHeap::new();
        let mut cursors = Vec::new();

        for (source, dir) in dirs.iter().enumerate() {
            let reader = Reader::open(dir)?;
            for stream_events in reader.read_all()? {
                let stream_id = stream_events.stream_id;
                let mut events = stream_events.events.into_iter();
                if let Some((ts, _)) = events.as_slice().first() {
                    heap.push(Reverse((ts.unwrap_or(0), stream_id, cursors.len())));
                }
                cursors.push(StreamCursor {
                    source,
                    stream_id,
                    events,
                });
            }
        }

        Ok(TraceCollection {
            heap,
            cursors,
            interrupter: Interrupter::default(),
        })
    }

    /// Arms `interrupter` for this collection: a later call to
    /// [`Self::next_checked`] returns `Err(Error::Interrupted)` once it's
    /// set, without popping the pending event off the heap.
    pub fn set_interrupter(&mut self, interrupter: Interrupter) {
        self.interrupter = interrupter;
    }

    /// Like the `Iterator` impl below, but cooperatively cancellable
    /// checks the interrupter before pulling the next event.
    pub fn next_checked(&mut self) -> Result<Option<CollectedEvent>, Error> {
        self.interrupter.check()?;
        Ok(Iterator::next(self))
    }
}

impl Iterator for TraceCollection {
    type Item = CollectedEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((_, stream_id, idx)) = self.heap.pop()?;
        let cursor = &mut self.cursors[idx];
        debug_assert_eq!(cursor.stream_id, stream_id);
        let (ts, event) = cursor.events.next().expect("heap entry implies a pending event");

        if let Some((next_ts, _)) = cursor.events.as_slice().first() {
            self.heap.push(Reverse((next_ts.unwrap_or(0), stream_id, idx)));
        }

        Some(CollectedEvent {
            source: cursor.source,
            stream_id,
            timestamp_ns: ts,
            event,
        })
    }
}
