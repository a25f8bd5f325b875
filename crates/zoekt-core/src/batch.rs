//! Self-paginating batch primitive.
//!
//! Every bulk worker selects its candidates, processes at most `limit` of
//! them, and asks to be re-triggered when more candidates remain. Since the
//! processed rows leave the eligibility scope, repeated invocations converge
//! after `ceil(N / limit)` rounds.

/// Result of one batch invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    /// More eligible rows exist beyond this batch.
    pub remaining: bool,
}

impl BatchOutcome {
    pub fn new(processed: usize, remaining: bool) -> Self {
        Self {
            processed,
            remaining,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn should_republish(&self) -> bool {
        self.remaining
    }
}

/// Truncate `candidates` to `limit`, reporting whether anything was cut off.
pub fn split_batch<T>(mut candidates: Vec<T>, limit: usize) -> (Vec<T>, bool) {
    let remaining = candidates.len() > limit;
    candidates.truncate(limit);
    (candidates, remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rounds needed to drain `total` rows in batches of `limit`.
    fn invocations_needed(total: usize, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        total.div_ceil(limit)
    }

    #[test]
    fn split_under_limit() {
        let (batch, remaining) = split_batch(vec![1, 2, 3], 5);
        assert_eq!(batch, vec![1, 2, 3]);
        assert!(!remaining);
    }

    #[test]
    fn split_exactly_limit() {
        let (batch, remaining) = split_batch(vec![1, 2, 3], 3);
        assert_eq!(batch.len(), 3);
        assert!(!remaining);
    }

    #[test]
    fn split_over_limit() {
        let (batch, remaining) = split_batch(vec![1, 2, 3, 4], 3);
        assert_eq!(batch, vec![1, 2, 3]);
        assert!(remaining);
    }

    #[test]
    fn draining_matches_invocation_count() {
        // Simulate the scope shrinking by the processed rows each round.
        let mut scope: Vec<u32> = (0..10).collect();
        let mut rounds = 0;
        let mut republished = 0;
        loop {
            rounds += 1;
            let (batch, remaining) = split_batch(scope.clone(), 3);
            scope.retain(|id| !batch.contains(id));
            if !remaining {
                break;
            }
            republished += 1;
        }
        assert_eq!(rounds, invocations_needed(10, 3));
        assert_eq!(republished, rounds - 1);
        assert!(scope.is_empty());
    }

    #[test]
    fn invocation_count_rounds_up() {
        assert_eq!(invocations_needed(0, 10), 0);
        assert_eq!(invocations_needed(10, 10), 1);
        assert_eq!(invocations_needed(11, 10), 2);
        assert_eq!(invocations_needed(5, 0), 0);
    }
}
