//! Aggregation engine: folds inference results into view state
//!
//! Pure and synchronous: a per-label tally for the whole session plus a
//! fixed-capacity window of the most recent results for trend charts.
//! Malformed messages never reach this module; they are dropped at the
//! protocol boundary.

use std::collections::VecDeque;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{EmotionLabel, InferenceResult};

// ============================================================================
// EmotionTally
// ============================================================================

/// Label → count, kept in first-seen order so ties resolve deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmotionTally {
    entries: Vec<(EmotionLabel, u64)>,
}

impl EmotionTally {
    pub fn increment(&mut self, label: &EmotionLabel) {
        self.add(label, 1);
    }

    fn add(&mut self, label: &EmotionLabel, count: u64) {
        match self.entries.iter_mut().find(|(l, _)| l == label) {
            Some((_, n)) => *n += count,
            None => self.entries.push((label.clone(), count)),
        }
    }

    pub fn merge(&mut self, other: &EmotionTally) {
        for (label, count) in &other.entries {
            self.add(label, *count);
        }
    }

    pub fn get(&self, label: &EmotionLabel) -> u64 {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    /// Argmax over counts; the label seen first wins a tie.
    pub fn dominant(&self) -> Option<&EmotionLabel> {
        let mut best: Option<&(EmotionLabel, u64)> = None;
        for entry in &self.entries {
            if best.map_or(true, |b| entry.1 > b.1) {
                best = Some(entry);
            }
        }
        best.map(|(label, _)| label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EmotionLabel, u64)> {
        self.entries.iter().map(|(l, n)| (l, *n))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Serialize for EmotionTally {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, count) in &self.entries {
            map.serialize_entry(label.as_str(), count)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EmotionTally {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TallyVisitor;

        impl<'de> Visitor<'de> for TallyVisitor {
            type Value = EmotionTally;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of emotion label to count")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut tally = EmotionTally::default();
                while let Some((label, count)) = access.next_entry::<String, u64>()? {
                    tally.add(&EmotionLabel::from(label), count);
                }
                Ok(tally)
            }
        }

        deserializer.deserialize_map(TallyVisitor)
    }
}

// ============================================================================
// HistoryWindow
// ============================================================================

/// Bounded FIFO of recent results. Pushing past capacity evicts the oldest.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    capacity: usize,
    entries: VecDeque<InferenceResult>,
}

impl HistoryWindow {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, result: InferenceResult) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InferenceResult> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<InferenceResult> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// AggregationEngine
// ============================================================================

/// Read-only copy of the engine state handed to presenters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationSnapshot {
    pub tally: EmotionTally,
    pub history: Vec<InferenceResult>,
    pub dominant: Option<EmotionLabel>,
    pub total: u64,
    pub latest: Option<InferenceResult>,
}

#[derive(Debug, Clone)]
pub struct AggregationEngine {
    tally: EmotionTally,
    history: HistoryWindow,
    dominant: Option<EmotionLabel>,
    ingested: u64,
}

impl AggregationEngine {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            tally: EmotionTally::default(),
            history: HistoryWindow::new(history_capacity),
            dominant: None,
            ingested: 0,
        }
    }

    pub fn reset(&mut self) {
        self.tally.clear();
        self.history.clear();
        self.dominant = None;
        self.ingested = 0;
    }

    pub fn ingest(&mut self, result: InferenceResult) {
        self.tally.increment(&result.emotion);
        self.history.push(result);
        self.ingested += 1;
        self.dominant = self.tally.dominant().cloned();
    }

    pub fn tally(&self) -> &EmotionTally {
        &self.tally
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    pub fn dominant(&self) -> Option<&EmotionLabel> {
        self.dominant.as_ref()
    }

    /// Results ingested since the last reset.
    pub fn total(&self) -> u64 {
        self.ingested
    }

    pub fn snapshot(&self) -> AggregationSnapshot {
        AggregationSnapshot {
            tally: self.tally.clone(),
            history: self.history.to_vec(),
            dominant: self.dominant.clone(),
            total: self.ingested,
            latest: self.history.iter().last().cloned(),
        }
    }
}
