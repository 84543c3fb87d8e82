//! Connection state and in-order delivery of transitions.

use std::collections::BTreeMap;

use synclane_protocol::{Transition, Version};
use tracing::debug;

/// Tracks the connection and orders incoming transitions by version.
#[derive(Debug)]
pub(crate) struct NetworkState {
    pub(crate) connected: bool,
    /// End version of the last applied transition on this connection.
    pub(crate) last_applied: Version,
    /// Highest version ever applied, across connections.
    pub(crate) max_observed: Version,
    pub(crate) query_set_version: u32,
    buffered: BTreeMap<Version, Transition>,
    max_buffered: usize,
}

impl NetworkState {
    pub(crate) fn new(max_buffered: usize) -> Self {
        Self {
            connected: false,
            last_applied: Version::ZERO,
            max_observed: Version::ZERO,
            query_set_version: 0,
            buffered: BTreeMap::new(),
            max_buffered,
        }
    }

    /// Starts a fresh connection: the server holds no state for us yet.
    pub(crate) fn connect(&mut self) {
        self.connected = true;
        self.last_applied = Version::ZERO;
        self.query_set_version = 0;
        self.buffered.clear();
    }

    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
        self.buffered.clear();
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Accepts a transition and returns every transition that can now be
    /// applied, in version order. Early transitions wait in a bounded
    /// buffer; duplicates of applied ranges are dropped. An overlap, a
    /// backwards transition or a full buffer breaks the stream.
    pub(crate) fn accept(&mut self, transition: Transition) -> Result<Vec<Transition>, String> {
        if transition.end_version < transition.start_version {
            return Err(format!(
                "transition runs backwards: {} -> {}",
                transition.start_version, transition.end_version
            ));
        }
        if transition.start_version < self.last_applied {
            if transition.end_version <= self.last_applied {
                debug!(start = %transition.start_version, "dropping stale transition");
                return Ok(Vec::new());
            }
            return Err(format!(
                "transition {} -> {} overlaps applied version {}",
                transition.start_version, transition.end_version, self.last_applied
            ));
        }
        if transition.start_version > self.last_applied {
            if self.buffered.len() >= self.max_buffered {
                return Err(format!(
                    "gap after {} not closed within {} transitions",
                    self.last_applied, self.max_buffered
                ));
            }
            debug!(start = %transition.start_version, "buffering early transition");
            self.buffered.insert(transition.start_version, transition);
            return Ok(Vec::new());
        }

        let mut cursor = transition.end_version;
        let mut ready = vec![transition];
        while let Some(next) = self.buffered.remove(&cursor) {
            cursor = next.end_version;
            ready.push(next);
        }
        let stale: Vec<Version> = self.buffered.range(..cursor).map(|(v, _)| *v).collect();
        for start in stale {
            if let Some(t) = self.buffered.remove(&start) {
                if t.end_version > cursor {
                    return Err(format!(
                        "buffered transition {} -> {} overlaps applied version {cursor}",
                        t.start_version, t.end_version
                    ));
                }
            }
        }

        self.last_applied = cursor;
        self.max_observed = self.max_observed.max(cursor);
        Ok(ready)
    }
}
