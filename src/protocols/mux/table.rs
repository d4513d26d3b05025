//! Per-connection stream table.
//!
//! Maps stream identifiers to stream state for one multiplexed connection.
//! Identifiers may be opened in any order. Retired identifiers are kept as a
//! set of merged ranges, so a peer that opens identifiers densely costs a
//! handful of entries no matter how many streams it has run.

use crate::error::ProtocolError;
use std::collections::{BTreeMap, HashMap};

/// Most disjoint ranges of retired identifiers kept per connection.
///
/// Past this, the two lowest ranges are joined, and the never-opened
/// identifiers between them count as retired.
pub const MAX_RETIRED_RANGES: usize = 1024;

/// What the table knows about a stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The stream has at least one open direction.
    Live,
    /// The stream was opened and has since been retired.
    Retired,
    /// The peer never opened this identifier.
    Unknown,
}

/// Live streams of one connection, keyed by identifier.
#[derive(Debug)]
pub struct StreamTable<S> {
    streams: HashMap<u32, S>,
    /// Retired identifiers as inclusive `start -> end` ranges.
    retired: BTreeMap<u32, u32>,
}

impl<S> Default for StreamTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> StreamTable<S> {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            retired: BTreeMap::new(),
        }
    }

    /// Validate an open for `id`.
    ///
    /// A duplicate open of a live stream is a connection-scope error; reuse
    /// of a retired identifier is a stream-scope error.
    pub fn claim(&self, id: u32) -> Result<(), ProtocolError> {
        if self.streams.contains_key(&id) {
            return Err(ProtocolError::DuplicateOpen(id));
        }
        if self.is_retired(id) {
            return Err(ProtocolError::IdentifierReuse(id));
        }
        Ok(())
    }

    /// Register state for a claimed identifier.
    pub fn insert(&mut self, id: u32, stream: S) -> &mut S {
        debug_assert!(!self.is_retired(id), "insert of a retired identifier");
        self.streams.entry(id).or_insert(stream)
    }

    pub fn get(&self, id: u32) -> Option<&S> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut S> {
        self.streams.get_mut(&id)
    }

    /// Remove a stream, returning its state. The identifier is retired.
    ///
    /// Removing an identifier that is not live is a no-op.
    pub fn remove(&mut self, id: u32) -> Option<S> {
        let stream = self.streams.remove(&id)?;
        self.retire(id);
        Some(stream)
    }

    /// Mark `id` retired without it ever holding state, as for an open
    /// that was refused.
    pub fn retire(&mut self, id: u32) {
        if self.is_retired(id) {
            return;
        }
        let mut start = id;
        let mut end = id;
        if let Some(prev) = id.checked_sub(1) {
            let adjacent = self
                .retired
                .range(..=prev)
                .next_back()
                .filter(|&(_, &last)| last == prev)
                .map(|(&first, _)| first);
            if let Some(first) = adjacent {
                self.retired.remove(&first);
                start = first;
            }
        }
        if let Some(next) = id.checked_add(1) {
            if let Some(last) = self.retired.remove(&next) {
                end = last;
            }
        }
        self.retired.insert(start, end);

        if self.retired.len() > MAX_RETIRED_RANGES {
            self.join_lowest_ranges();
        }
    }

    fn join_lowest_ranges(&mut self) {
        let mut ranges = self.retired.iter();
        let (Some((&first, _)), Some((&second, &last))) = (ranges.next(), ranges.next()) else {
            return;
        };
        self.retired.remove(&second);
        self.retired.insert(first, last);
    }

    fn is_retired(&self, id: u32) -> bool {
        self.retired
            .range(..=id)
            .next_back()
            .is_some_and(|(_, &last)| id <= last)
    }

    pub fn lookup(&self, id: u32) -> Slot {
        if self.streams.contains_key(&id) {
            Slot::Live
        } else if self.is_retired(id) {
            Slot::Retired
        } else {
            Slot::Unknown
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Identifiers of all live streams.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.streams.keys().copied()
    }

    /// Remove every live stream.
    pub fn drain(&mut self) -> impl Iterator<Item = (u32, S)> + '_ {
        self.streams.drain()
    }
}
