//! Rolling training buffer

use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

use crate::utils::types::OutcomeRecord;

/// Bounded FIFO of outcome records, de-duplicated by forecast id
#[derive(Debug)]
pub struct TrainingBuffer {
    records: VecDeque<OutcomeRecord>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl TrainingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(4096)),
            ids: HashSet::new(),
            capacity,
        }
    }

    /// Append a record; returns false if its forecast id is already buffered
    pub fn push(&mut self, record: OutcomeRecord) -> bool {
        if !self.ids.insert(record.forecast_id) {
            return false;
        }
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                self.ids.remove(&evicted.forecast_id);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, forecast_id: &Uuid) -> bool {
        self.ids.contains(forecast_id)
    }

    pub fn snapshot(&self) -> Vec<OutcomeRecord> {
        self.records.iter().cloned().collect()
    }

    /// Mean |normalized error| of the newest `window` records, once that many exist
    pub fn rolling_abs_error(&self, window: usize) -> Option<f64> {
        if window == 0 || self.records.len() < window {
            return None;
        }
        let sum: f64 = self
            .records
            .iter()
            .rev()
            .take(window)
            .map(|r| r.normalized_error.abs())
            .sum();
        Some(sum / window as f64)
    }
}
