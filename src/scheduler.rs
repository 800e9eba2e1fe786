/// Weights are scaled into this range; the largest positive input weight maps
/// to the top of it.
const MAX_WEIGHT: u64 = u16::MAX as u64;
/// Staggers acceptance phases across indexes so equal weights do not fire on
/// the same generations.
const OFFSET: u64 = MAX_WEIGHT / 2;

/// Immutable weighted pick over a fixed weight vector, driven by a shared
/// sequence counter. Built once per rebuild and replaced wholesale.
///
/// Each index is accepted with frequency `weight / MAX_WEIGHT` per
/// generation, so long-run pick counts are proportional to the input weights.
/// Zero-weight entries are never returned.
pub(crate) struct StaticStrideScheduler {
    weights: Vec<u16>,
    next_sequence: Box<dyn Fn() -> u32 + Send + Sync>,
}

impl StaticStrideScheduler {
    /// Returns `None` unless at least two entries have positive weight;
    /// callers fall back to plain round-robin in that case.
    pub fn make(
        weights: &[f32],
        next_sequence: impl Fn() -> u32 + Send + Sync + 'static,
    ) -> Option<Self> {
        if weights.len() < 2 {
            return None;
        }
        if weights.iter().filter(|w| **w > 0.0).count() < 2 {
            return None;
        }
        let max = weights.iter().copied().fold(0.0f32, f32::max);
        let scale = MAX_WEIGHT as f64 / max as f64;
        let weights = weights
            .iter()
            .map(|&w| {
                if w > 0.0 {
                    ((w as f64 * scale).round() as u64).clamp(1, MAX_WEIGHT) as u16
                } else {
                    0
                }
            })
            .collect();
        Some(Self {
            weights,
            next_sequence: Box::new(next_sequence),
        })
    }

    pub fn pick(&self) -> usize {
        let n = self.weights.len() as u64;
        loop {
            let sequence = (self.next_sequence)() as u64;
            let index = (sequence % n) as usize;
            let generation = sequence / n;
            let weight = self.weights[index] as u64;
            let stride = (weight * generation + index as u64 * OFFSET) % MAX_WEIGHT;
            // The max-weight index always passes, so the walk terminates.
            if stride < MAX_WEIGHT - weight {
                continue;
            }
            return index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn sequence_from(start: u32) -> impl Fn() -> u32 + Send + Sync {
        let counter = Arc::new(AtomicU32::new(start));
        move || counter.fetch_add(1, Ordering::Relaxed)
    }

    fn pick_counts(scheduler: &StaticStrideScheduler, n: usize, picks: usize) -> Vec<usize> {
        let mut counts = vec![0usize; n];
        for _ in 0..picks {
            counts[scheduler.pick()] += 1;
        }
        counts
    }

    #[test]
    fn test_make_rejects_too_few_usable_weights() {
        assert!(StaticStrideScheduler::make(&[], sequence_from(0)).is_none());
        assert!(StaticStrideScheduler::make(&[1.0], sequence_from(0)).is_none());
        assert!(StaticStrideScheduler::make(&[0.0, 0.0, 0.0], sequence_from(0)).is_none());
        assert!(StaticStrideScheduler::make(&[0.0, 5.0, 0.0], sequence_from(0)).is_none());
    }

    #[test]
    fn test_make_accepts_two_usable_weights() {
        assert!(StaticStrideScheduler::make(&[1.0, 1.0], sequence_from(0)).is_some());
        assert!(StaticStrideScheduler::make(&[0.0, 5.0, 3.0], sequence_from(0)).is_some());
    }

    #[test]
    fn test_picks_proportional_to_weights() {
        let scheduler = StaticStrideScheduler::make(&[200.0, 400.0, 100.0], sequence_from(0)).unwrap();
        let counts = pick_counts(&scheduler, 3, 7000);
        let expected = [2000.0, 4000.0, 1000.0];
        for (i, &count) in counts.iter().enumerate() {
            let delta = (count as f64 - expected[i]).abs();
            assert!(
                delta <= expected[i] * 0.05,
                "index {i}: got {count}, expected ~{}",
                expected[i]
            );
        }
    }

    #[test]
    fn test_proportionality_holds_for_any_sequence_start() {
        let scheduler =
            StaticStrideScheduler::make(&[200.0, 400.0, 100.0], sequence_from(0xdead_beef)).unwrap();
        let counts = pick_counts(&scheduler, 3, 7000);
        let expected = [2000.0, 4000.0, 1000.0];
        for (i, &count) in counts.iter().enumerate() {
            let delta = (count as f64 - expected[i]).abs();
            assert!(delta <= expected[i] * 0.05, "index {i}: got {count}");
        }
    }

    #[test]
    fn test_zero_weight_never_picked() {
        let scheduler = StaticStrideScheduler::make(&[100.0, 0.0, 50.0], sequence_from(7)).unwrap();
        for _ in 0..5000 {
            assert_ne!(scheduler.pick(), 1);
        }
    }

    #[test]
    fn test_equal_weights_balance_evenly() {
        let scheduler = StaticStrideScheduler::make(&[10.0, 10.0], sequence_from(0)).unwrap();
        let counts = pick_counts(&scheduler, 2, 2000);
        assert!((counts[0] as i64 - counts[1] as i64).unsigned_abs() <= 100);
    }

    #[test]
    fn test_deterministic_given_sequence() {
        let a = StaticStrideScheduler::make(&[3.0, 1.0, 2.0], sequence_from(42)).unwrap();
        let b = StaticStrideScheduler::make(&[3.0, 1.0, 2.0], sequence_from(42)).unwrap();
        for _ in 0..500 {
            assert_eq!(a.pick(), b.pick());
        }
    }

    #[test]
    fn test_tiny_weight_clamped_to_nonzero() {
        // A positive weight far below the max still gets picked occasionally.
        let scheduler = StaticStrideScheduler::make(&[1.0e6, 0.001], sequence_from(0)).unwrap();
        let counts = pick_counts(&scheduler, 2, 200_000);
        assert!(counts[1] >= 1);
    }
}
