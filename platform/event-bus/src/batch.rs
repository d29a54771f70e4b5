//! Batch accumulator for publisher lanes

use crate::publisher::QueuedRecord;
use crate::AckMode;

/// Records waiting to be flushed, with count and byte triggers
pub(crate) struct Batch {
    records: Vec<QueuedRecord>,
    bytes: usize,
    max_records: usize,
    max_bytes: usize,
}

impl Batch {
    pub(crate) fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            records: Vec::with_capacity(max_records),
            bytes: 0,
            max_records,
            max_bytes,
        }
    }

    pub(crate) fn push(&mut self, record: QueuedRecord) {
        self.bytes += record.payload_len();
        self.records.push(record);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.records.len() >= self.max_records || self.bytes >= self.max_bytes
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Take the queued records, leaving the batch empty
    pub(crate) fn drain(&mut self) -> Vec<QueuedRecord> {
        self.bytes = 0;
        std::mem::replace(&mut self.records, Vec::with_capacity(self.max_records))
    }
}

/// Split records into consecutive runs sharing an ack mode, keeping order
pub(crate) fn runs_by_ack_mode(records: Vec<QueuedRecord>) -> Vec<(AckMode, Vec<QueuedRecord>)> {
    let mut runs: Vec<(AckMode, Vec<QueuedRecord>)> = Vec::new();
    for record in records {
        match runs.last_mut() {
            Some((mode, run)) if *mode == record.ack_mode() => run.push(record),
            _ => runs.push((record.ack_mode(), vec![record])),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeliveryRecord, RetryConfig};

    fn queued(key: &str, bytes: usize, ack_mode: AckMode) -> QueuedRecord {
        let delivery = DeliveryRecord::new("t", key, vec![0; bytes], ack_mode);
        let (record, _handle) = QueuedRecord::new(delivery, RetryConfig::once());
        record
    }

    #[test]
    fn test_full_on_record_count() {
        let mut batch = Batch::new(2, 1024);
        batch.push(queued("a", 1, AckMode::All));
        assert!(!batch.is_full());
        batch.push(queued("b", 1, AckMode::All));
        assert!(batch.is_full());
    }

    #[test]
    fn test_full_on_bytes() {
        let mut batch = Batch::new(100, 10);
        batch.push(queued("a", 6, AckMode::All));
        assert!(!batch.is_full());
        batch.push(queued("b", 4, AckMode::All));
        assert!(batch.is_full());
    }

    #[test]
    fn test_drain_resets() {
        let mut batch = Batch::new(2, 10);
        batch.push(queued("a", 10, AckMode::All));
        assert!(batch.is_full());

        let drained = batch.drain();
        assert_eq!(drained.len(), 1);
        assert!(batch.is_empty());
        assert!(!batch.is_full());
        assert_eq!(batch.len(), 0);
    }

    #[test]
    fn test_runs_keep_order_and_split_on_mode_change() {
        let records = vec![
            queued("1", 1, AckMode::All),
            queued("2", 1, AckMode::All),
            queued("3", 1, AckMode::None),
            queued("4", 1, AckMode::All),
        ];

        let runs = runs_by_ack_mode(records);
        let shape: Vec<(AckMode, Vec<String>)> = runs
            .into_iter()
            .map(|(mode, run)| (mode, run.iter().map(|r| r.key().to_string()).collect()))
            .collect();

        assert_eq!(
            shape,
            vec![
                (AckMode::All, vec!["1".to_string(), "2".to_string()]),
                (AckMode::None, vec!["3".to_string()]),
                (AckMode::All, vec!["4".to_string()]),
            ]
        );
    }
}
