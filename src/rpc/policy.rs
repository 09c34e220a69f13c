//! How many peers a quorum request needs, tolerates losing, and contacts at once.

/// Default minimum number of successful peer responses.
pub const DEFAULT_MINIMUM_RESULTS: usize = 3;
/// Default number of failed peer requests tolerated before giving up.
pub const DEFAULT_MAX_FAILURES: usize = 5;
/// Default number of extra peers contacted in parallel on top of the minimum.
pub const DEFAULT_PARALLEL_DIFF: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Immutable quorum parameters of a request.
///
/// Narrowing the policy derives a new value, see [RequestPolicy::adjust_to].
pub struct RequestPolicy {
    minimum_results: usize,
    max_failures: usize,
    parallel_diff: usize,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MINIMUM_RESULTS,
            DEFAULT_MAX_FAILURES,
            DEFAULT_PARALLEL_DIFF,
        )
    }
}

impl RequestPolicy {
    pub const fn new(minimum_results: usize, max_failures: usize, parallel_diff: usize) -> Self {
        Self {
            minimum_results,
            max_failures,
            parallel_diff,
        }
    }

    // === Getters ===

    pub fn minimum_results(&self) -> usize {
        self.minimum_results
    }

    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    pub fn parallel_diff(&self) -> usize {
        self.parallel_diff
    }

    /// Number of requests in flight at once.
    pub fn parallel(&self) -> usize {
        self.minimum_results.saturating_add(self.parallel_diff)
    }

    // === Derived policies ===

    /// Cap the minimum results at the number of `available` candidates, so a
    /// request for more peers than exist finishes instead of waiting forever.
    pub fn adjust_to(&self, available: usize) -> Self {
        self.with_minimum_results(self.minimum_results.min(available))
    }

    pub fn with_minimum_results(&self, minimum_results: usize) -> Self {
        Self {
            minimum_results,
            ..*self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn adjust_never_raises_minimum() {
        let policy = RequestPolicy::new(5, 2, 1);

        let adjusted = policy.adjust_to(2);
        assert_eq!(adjusted.minimum_results(), 2);
        assert_eq!(adjusted.parallel(), 3);
        assert_eq!(adjusted.max_failures(), 2);

        assert_eq!(policy.adjust_to(10), policy);
        assert_eq!(policy.minimum_results(), 5);
    }
}
