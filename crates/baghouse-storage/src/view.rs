//! Query Views
//!
//! A [`View`] merges the per-connection indexes of a bag into one
//! time-ordered iterator, optionally filtered by topic and time. Iteration
//! yields lightweight [`MessageInstance`] handles; payloads are not touched
//! until a handle is materialized.
//!
//! Merge order is `(time, chunk_pos, offset)` with ties broken by connection
//! id, so a full-range view replays the bag deterministically and messages
//! from the same chunk are visited together (which keeps the engine's
//! single-slot chunk cache hot).

use std::collections::HashSet;

use baghouse_core::record::VERSION_200;
use baghouse_core::{ConnectionInfo, Error, IndexEntry, Result, Time};

use crate::bag::Bag;
use crate::message_instance::MessageInstance;

/// One predicate: a topic set (empty = all topics) plus a time range.
#[derive(Debug, Clone, Default)]
pub struct Query {
    topics: Option<HashSet<String>>,
    start_time: Option<Time>,
    end_time: Option<Time>,
}

impl Query {
    /// Match every topic over all time.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given topics.
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: Some(topics.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Restrict the query to `[start, end]` (inclusive).
    pub fn with_time_range(mut self, start: Time, end: Time) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    fn matches_topic(&self, topic: &str) -> bool {
        match &self.topics {
            None => true,
            Some(set) => set.contains(topic),
        }
    }

    fn range(&self) -> (Time, Time) {
        (
            self.start_time.unwrap_or(Time::MIN),
            self.end_time.unwrap_or(Time::MAX),
        )
    }
}

/// Per-connection cursor over an index slice, restricted to a set of
/// accepted time ranges.
struct Cursor<'a> {
    connection: &'a ConnectionInfo,
    entries: &'a [IndexEntry],
    pos: usize,
    /// Accepted `[start, end]` ranges, already clipped to the view window.
    ranges: Vec<(Time, Time)>,
    /// Latest end across `ranges`; past it the cursor is exhausted.
    max_end: Time,
}

impl<'a> Cursor<'a> {
    fn new(
        connection: &'a ConnectionInfo,
        entries: &'a [IndexEntry],
        ranges: Vec<(Time, Time)>,
    ) -> Self {
        let min_start = ranges.iter().map(|r| r.0).min().unwrap_or(Time::MAX);
        let max_end = ranges.iter().map(|r| r.1).max().unwrap_or(Time::MIN);
        let pos = entries.partition_point(|e| e.time < min_start);
        let mut cursor = Self {
            connection,
            entries,
            pos,
            ranges,
            max_end,
        };
        cursor.skip_to_accepted();
        cursor
    }

    fn head(&self) -> Option<&IndexEntry> {
        self.entries.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
        self.skip_to_accepted();
    }

    fn skip_to_accepted(&mut self) {
        while let Some(entry) = self.entries.get(self.pos) {
            if entry.time > self.max_end {
                self.pos = self.entries.len();
                return;
            }
            if self
                .ranges
                .iter()
                .any(|&(start, end)| entry.time >= start && entry.time <= end)
            {
                return;
            }
            self.pos += 1;
        }
    }

    fn count_accepted(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                self.ranges
                    .iter()
                    .any(|&(start, end)| e.time >= start && e.time <= end)
            })
            .count()
    }
}

/// A merged, filtered iterator surface over one bag.
pub struct View<'a> {
    bag: &'a Bag,
    queries: Vec<Query>,
    start_time: Time,
    end_time: Time,
}

impl<'a> View<'a> {
    /// View every message in the bag.
    pub fn new(bag: &'a Bag) -> Result<View<'a>> {
        Self::with_range(bag, Time::MIN, Time::MAX)
    }

    /// View every topic within `[start, end]` (inclusive).
    pub fn with_range(bag: &'a Bag, start: Time, end: Time) -> Result<View<'a>> {
        if !bag.is_open() {
            return Err(Error::InvalidArgument(
                "cannot build a view over a closed bag".to_string(),
            ));
        }
        Ok(View {
            bag,
            queries: Vec::new(),
            start_time: start,
            end_time: end,
        })
    }

    /// View only what `query` selects.
    pub fn with_query(bag: &'a Bag, query: Query) -> Result<View<'a>> {
        let mut view = Self::new(bag)?;
        view.add_query(query);
        Ok(view)
    }

    /// Add a predicate. A view with no queries matches every topic;
    /// adding queries narrows it to their union.
    pub fn add_query(&mut self, query: Query) {
        self.queries.push(query);
    }

    fn cursors(&self) -> Vec<Cursor<'a>> {
        let mut cursors = Vec::new();
        for (conn_id, entries) in self.bag.connection_indexes() {
            let Some(connection) = self.bag.connection(*conn_id) else {
                continue;
            };
            let ranges = self.ranges_for_topic(&connection.topic);
            if ranges.is_empty() || entries.is_empty() {
                continue;
            }
            cursors.push(Cursor::new(connection, entries, ranges));
        }
        cursors
    }

    /// Accepted time ranges for a topic, clipped to the view window.
    /// Empty means the topic is filtered out entirely.
    fn ranges_for_topic(&self, topic: &str) -> Vec<(Time, Time)> {
        let clip = |(start, end): (Time, Time)| -> Option<(Time, Time)> {
            let start = start.max(self.start_time);
            let end = end.min(self.end_time);
            (start <= end).then_some((start, end))
        };
        if self.queries.is_empty() {
            return clip((Time::MIN, Time::MAX)).into_iter().collect();
        }
        self.queries
            .iter()
            .filter(|q| q.matches_topic(topic))
            .filter_map(|q| clip(q.range()))
            .collect()
    }

    /// Iterate the matching messages in time order.
    pub fn iter(&self) -> ViewIter<'a> {
        ViewIter {
            bag: self.bag,
            cursors: self.cursors(),
        }
    }

    /// Number of messages the view selects.
    pub fn size(&self) -> usize {
        self.cursors().iter().map(Cursor::count_accepted).sum()
    }

    /// The connections participating in this view, in id order.
    pub fn connections(&self) -> Vec<&'a ConnectionInfo> {
        let mut ids: Vec<u32> = self.eligible_connection_ids().into_iter().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.bag.connection(id))
            .collect()
    }

    /// Earliest start time across participating chunks, or across index
    /// entries for a legacy bag. `None` when the view selects nothing.
    pub fn begin_time(&self) -> Option<Time> {
        let eligible = self.eligible_connection_ids();
        if eligible.is_empty() {
            return None;
        }
        if self.bag.bag_version() == VERSION_200 {
            self.bag
                .chunk_infos()
                .iter()
                .filter(|c| c.connection_counts.keys().any(|id| eligible.contains(id)))
                .map(|c| c.start_time)
                .min()
        } else {
            self.eligible_entry_times(&eligible)
                .map(|(first, _)| first)
                .min()
        }
    }

    /// Latest end time, mirroring [`View::begin_time`].
    pub fn end_time(&self) -> Option<Time> {
        let eligible = self.eligible_connection_ids();
        if eligible.is_empty() {
            return None;
        }
        if self.bag.bag_version() == VERSION_200 {
            self.bag
                .chunk_infos()
                .iter()
                .filter(|c| c.connection_counts.keys().any(|id| eligible.contains(id)))
                .map(|c| c.end_time)
                .max()
        } else {
            self.eligible_entry_times(&eligible)
                .map(|(_, last)| last)
                .max()
        }
    }

    fn eligible_connection_ids(&self) -> HashSet<u32> {
        self.bag
            .connection_indexes()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .filter_map(|(id, _)| {
                let connection = self.bag.connection(*id)?;
                (!self.ranges_for_topic(&connection.topic).is_empty()).then_some(*id)
            })
            .collect()
    }

    /// `(first, last)` entry times per eligible connection. The per-connection
    /// indexes are sorted, so these bracket each connection's span.
    fn eligible_entry_times<'s>(
        &'s self,
        eligible: &'s HashSet<u32>,
    ) -> impl Iterator<Item = (Time, Time)> + 's {
        self.bag
            .connection_indexes()
            .iter()
            .filter(|(id, _)| eligible.contains(id))
            .filter_map(|(_, entries)| {
                Some((entries.first()?.time, entries.last()?.time))
            })
    }
}

impl<'a> IntoIterator for &View<'a> {
    type Item = MessageInstance<'a>;
    type IntoIter = ViewIter<'a>;

    fn into_iter(self) -> ViewIter<'a> {
        self.iter()
    }
}

/// Multi-way merge over the per-connection cursors.
pub struct ViewIter<'a> {
    bag: &'a Bag,
    cursors: Vec<Cursor<'a>>,
}

impl<'a> Iterator for ViewIter<'a> {
    type Item = MessageInstance<'a>;

    fn next(&mut self) -> Option<MessageInstance<'a>> {
        let mut best: Option<(usize, (Time, u64, u32, u32))> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            let Some(head) = cursor.head() else { continue };
            let key = (head.time, head.chunk_pos, head.offset, cursor.connection.id);
            if best.as_ref().map_or(true, |(_, best_key)| key < *best_key) {
                best = Some((i, key));
            }
        }

        let (i, _) = best?;
        let cursor = &mut self.cursors[i];
        let entry = *cursor.head()?;
        let connection = cursor.connection;
        cursor.advance();
        Some(MessageInstance::new(self.bag, connection, entry))
    }
}
