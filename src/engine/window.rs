//! Authoritative trailing window of admitted signals.
//!
//! Only the reconciler holds a `WindowState`. Everyone else sees it through the
//! immutable `Delta` and `WindowSnapshot` values produced after each pass.

use crate::models::{Cursor, Signal, SignalEvent};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What happened to a fetched signal on admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First time this id is seen in the window.
    Inserted,
    /// The id was present with different content; the old entry was retracted.
    Updated,
    /// Identical content already admitted.
    Unchanged,
    /// Older state than the one already admitted.
    Stale,
    /// Outside the trailing window.
    Expired,
}

/// Newly admitted or changed signals of one pass, ascending by cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub events: Vec<SignalEvent>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Highest cursor in the delta.
    pub fn cursor(&self) -> Option<Cursor> {
        self.events.last().map(SignalEvent::cursor)
    }

    /// Events strictly after `watermark`, in order.
    pub fn after(&self, watermark: Option<Cursor>) -> impl Iterator<Item = &SignalEvent> {
        self.events.iter().filter(move |e| e.cursor().is_after(watermark))
    }
}

/// Immutable copy of the window published after a pass, used for catch-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSnapshot {
    /// Ascending by cursor.
    pub signals: Vec<Arc<Signal>>,
    /// Window cursor at the time of the snapshot. May be ahead of the last
    /// entry when the newest signals were already evicted.
    pub cursor: Option<Cursor>,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Entries strictly after `watermark`; the whole window when there is none.
    pub fn after(&self, watermark: Option<Cursor>) -> Vec<Arc<Signal>> {
        let start = match watermark {
            Some(w) => self.signals.partition_point(|s| s.cursor() <= w),
            None => 0,
        };
        self.signals[start..].to_vec()
    }
}

pub struct WindowState {
    duration: chrono::Duration,
    entries: BTreeMap<Cursor, Arc<Signal>>,
    ids: HashMap<i64, Cursor>,
    cursor: Option<Cursor>,
}

impl WindowState {
    pub fn new(duration: std::time::Duration) -> Self {
        Self {
            duration: chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX),
            entries: BTreeMap::new(),
            ids: HashMap::new(),
            cursor: None,
        }
    }

    /// Oldest admissible signal time at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&Arc<Signal>> {
        self.ids.get(&id).and_then(|c| self.entries.get(c))
    }

    /// Admits one fetched signal. Returns the resulting event when the window changed.
    ///
    /// An id that reappears with different content and a cursor not older than
    /// the admitted one is retracted and reinserted at its new position.
    pub fn admit(&mut self, signal: Signal, cutoff: DateTime<Utc>) -> (Admission, Option<SignalEvent>) {
        if signal.timestamp < cutoff {
            return (Admission::Expired, None);
        }

        let cursor = signal.cursor();
        let admission = match self.ids.get(&signal.id).copied() {
            None => Admission::Inserted,
            Some(existing_cursor) => {
                let unchanged = self
                    .entries
                    .get(&existing_cursor)
                    .is_some_and(|existing| **existing == signal);
                if unchanged {
                    return (Admission::Unchanged, None);
                }
                if cursor < existing_cursor {
                    return (Admission::Stale, None);
                }
                self.entries.remove(&existing_cursor);
                Admission::Updated
            }
        };

        let signal = Arc::new(signal);
        self.entries.insert(cursor, signal.clone());
        self.ids.insert(signal.id, cursor);
        if cursor.is_after(self.cursor) {
            self.cursor = Some(cursor);
        }

        let event = match admission {
            Admission::Updated => SignalEvent::update(signal),
            _ => SignalEvent::insert(signal),
        };
        (admission, Some(event))
    }

    /// Drops entries older than `cutoff`. The window cursor never moves back.
    pub fn evict(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().timestamp >= cutoff {
                break;
            }
            let signal = entry.remove();
            self.ids.remove(&signal.id);
            evicted += 1;
        }
        evicted
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            signals: self.entries.values().cloned().collect(),
            cursor: self.cursor,
        }
    }
}
