use std::fmt;
use std::time::Duration;

/// Lifecycle of a work item within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Discovered, output artifact absent.
    Pending,
    /// Held by a worker.
    InFlight,
    /// Output artifact committed.
    Done,
    /// Attempts exhausted or a non-retryable error; no artifact written.
    Failed,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ItemState::Pending => "pending",
            ItemState::InFlight => "in_flight",
            ItemState::Done => "done",
            ItemState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What a completion produced for one image.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentResult {
    /// Raw model text, if a completion came back at all.
    pub raw: Option<String>,
    /// Validated payload ready to commit.
    pub payload: Option<String>,
    pub error: Option<String>,
}

impl EnrichmentResult {
    pub fn is_success(&self) -> bool {
        self.payload.is_some() && self.error.is_none()
    }
}

/// Final state of one item after a run.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: u64,
    pub state: ItemState,
    /// Completion calls made for this item.
    pub attempts: u32,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Totals for a whole run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Items passed over because they were already done (or marked failed).
    pub skipped: usize,
    pub completion_calls: u64,
    /// The run was interrupted before the queue drained.
    pub cancelled: bool,
    pub failures: Vec<(u64, String)>,
}

impl BatchSummary {
    pub fn record(&mut self, outcome: ItemOutcome) {
        self.completion_calls += u64::from(outcome.attempts);
        match outcome.state {
            ItemState::Done => self.succeeded += 1,
            _ => {
                self.failed += 1;
                self.failures.push((
                    outcome.id,
                    outcome.error.unwrap_or_else(|| "unknown error".to_string()),
                ));
            }
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: u64, state: ItemState, attempts: u32) -> ItemOutcome {
        ItemOutcome {
            id,
            state,
            attempts,
            error: (state == ItemState::Failed).then(|| "boom".to_string()),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = BatchSummary::default();
        summary.record(outcome(1, ItemState::Done, 1));
        summary.record(outcome(2, ItemState::Failed, 3));
        summary.record(outcome(3, ItemState::Done, 2));

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed(), 3);
        assert_eq!(summary.completion_calls, 6);
        assert_eq!(summary.failures, vec![(2, "boom".to_string())]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ItemState::InFlight.to_string(), "in_flight");
        assert_eq!(ItemState::Done.to_string(), "done");
    }
}
