use std::collections::BTreeSet;

use tokio::time::Instant;

/// Descriptive data of a transfer, taken from the first chunk that is received for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub total_chunks: u32,
    pub chunk_size_hint: u32,
    pub filename: String,
    pub total_size: u64,
}

/// The receipt ledger of a single transfer: which sequence numbers were received, and how far the
///  gap-free prefix reaches.
///
/// NB: There is an invariant that `highest_contiguous` is the highest `n` so that all sequence
///      numbers `0..=n` are in `received`, or -1 if sequence number 0 was not received yet.
///      For a known total, the prefix stops at the last chunk `total_chunks - 1`: sequence
///      numbers beyond the end are recorded but never extend it, so a complete transfer stays
///      complete.
#[derive(Debug, Clone)]
pub struct TransferState {
    /// this set only ever grows
    received: BTreeSet<u32>,
    highest_contiguous: i64,
    /// written once on creation
    meta: TransferMeta,
    last_touched: Instant,
}

impl TransferState {
    pub fn new(meta: TransferMeta, now: Instant) -> TransferState {
        TransferState {
            received: BTreeSet::default(),
            highest_contiguous: -1,
            meta,
            last_touched: now,
        }
    }

    pub fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    pub fn received(&self) -> &BTreeSet<u32> {
        &self.received
    }

    pub fn highest_contiguous(&self) -> i64 {
        self.highest_contiguous
    }

    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_touched = now;
    }

    /// Records a sequence number as received, returning `false` if it was received before.
    ///
    /// The contiguous prefix is advanced incrementally from its previous value, which is
    ///  sufficient because sequence numbers are never removed.
    pub fn record(&mut self, sequence: u32) -> bool {
        if !self.received.insert(sequence) {
            return false;
        }

        while let Ok(next) = u32::try_from(self.highest_contiguous + 1) {
            if self.meta.total_chunks != 0 && next >= self.meta.total_chunks {
                break;
            }
            if !self.received.contains(&next) {
                break;
            }
            self.highest_contiguous += 1;
        }
        true
    }

    /// A transfer is complete when all chunks up to the declared total were received. A transfer
    ///  with an unknown (i.e. zero) total is never complete.
    pub fn is_complete(&self) -> bool {
        self.meta.total_chunks != 0 && self.highest_contiguous == i64::from(self.meta.total_chunks) - 1
    }

    /// the sequence numbers below the declared total that were not received yet, in ascending order
    pub fn missing(&self) -> Vec<u32> {
        (0..self.meta.total_chunks)
            .filter(|sequence| !self.received.contains(sequence))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn meta(total_chunks: u32) -> TransferMeta {
        TransferMeta {
            total_chunks,
            chunk_size_hint: 8,
            filename: "blob.bin".to_string(),
            total_size: u64::from(total_chunks) * 8,
        }
    }

    #[rstest]
    #[case::nothing(vec![], -1)]
    #[case::in_order(vec![0, 1, 2, 3], 3)]
    #[case::reversed(vec![3, 2, 1, 0], 3)]
    #[case::gap_at_start(vec![1, 2, 3], -1)]
    #[case::gap_in_between(vec![0, 2, 3], 0)]
    #[case::gap_filled(vec![0, 2, 3, 1], 3)]
    #[case::out_of_order(vec![0, 2, 1], 2)]
    #[case::duplicates(vec![0, 0, 1, 1, 0], 1)]
    #[case::beyond_total(vec![0, 1, 2, 3, 4, 5], 3)]
    #[case::beyond_total_first(vec![5, 4, 3, 2, 1, 0], 3)]
    fn test_highest_contiguous(#[case] sequences: Vec<u32>, #[case] expected: i64) {
        let mut state = TransferState::new(meta(4), Instant::now());
        for sequence in sequences {
            state.record(sequence);
        }
        assert_eq!(state.highest_contiguous(), expected);
    }

    #[test]
    fn test_highest_contiguous_independent_of_arrival_order() {
        const N: u32 = 7;

        let mut orders: Vec<Vec<u32>> = Vec::new();
        for rotation in 0..N {
            let rotated = (0..N).map(|i| (i + rotation) % N).collect::<Vec<_>>();
            orders.push(rotated.iter().rev().cloned().collect());
            orders.push(rotated);
        }
        // interleaved: even numbers first, then odd numbers
        orders.push((0..N).filter(|i| i % 2 == 0).chain((0..N).filter(|i| i % 2 == 1)).collect());

        for order in orders {
            let mut state = TransferState::new(meta(N), Instant::now());
            for &sequence in &order {
                state.record(sequence);
            }
            assert_eq!(state.highest_contiguous(), i64::from(N) - 1, "order {:?}", order);
            assert!(state.is_complete(), "order {:?}", order);
            assert!(state.missing().is_empty());
        }
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut state = TransferState::new(meta(4), Instant::now());
        assert!(state.record(2));
        assert!(!state.record(2));
        assert_eq!(state.received().len(), 1);
        assert_eq!(state.highest_contiguous(), -1);
    }

    #[test]
    fn test_unknown_total_is_unbounded() {
        let mut state = TransferState::new(meta(0), Instant::now());
        for sequence in [2, 0, 1, 3] {
            state.record(sequence);
        }
        assert_eq!(state.highest_contiguous(), 3);
    }

    #[test]
    fn test_record_max_sequence() {
        let mut state = TransferState::new(meta(0), Instant::now());
        assert!(state.record(u32::MAX));
        assert_eq!(state.highest_contiguous(), -1);
    }

    #[rstest]
    #[case::all_missing(4, vec![], vec![0, 1, 2, 3])]
    #[case::last_missing(4, vec![0, 2, 1], vec![3])]
    #[case::middle_missing(5, vec![0, 1, 3, 4], vec![2])]
    #[case::none_missing(2, vec![1, 0], vec![])]
    #[case::unknown_total(0, vec![0, 1], vec![])]
    #[case::ignores_beyond_total(2, vec![0, 7], vec![1])]
    fn test_missing(#[case] total_chunks: u32, #[case] sequences: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut state = TransferState::new(meta(total_chunks), Instant::now());
        for sequence in sequences {
            state.record(sequence);
        }
        assert_eq!(state.missing(), expected);
    }

    #[rstest]
    #[case::empty(4, vec![], false)]
    #[case::partial(4, vec![0, 1, 3], false)]
    #[case::complete(4, vec![3, 1, 0, 2], true)]
    #[case::unknown_total(0, vec![0], false)]
    #[case::extra_chunk_after_completion(4, vec![0, 1, 2, 3, 4], true)]
    #[case::extra_chunks_before_completion(4, vec![5, 4, 0, 1, 2, 3], true)]
    fn test_is_complete(#[case] total_chunks: u32, #[case] sequences: Vec<u32>, #[case] expected: bool) {
        let mut state = TransferState::new(meta(total_chunks), Instant::now());
        for sequence in sequences {
            state.record(sequence);
        }
        assert_eq!(state.is_complete(), expected);
    }
}
