use serde::{Deserialize, Serialize};

/// Effect classification for a unit of work in a durable sequence.
/// Ordered by increasing severity of side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    /// No side effects. Safe to retry, reorder, cache.
    Pure,
    /// Reads external state (or asks an external model). Results may differ per call.
    Observe,
    /// Writes state. Must be checked against the durable log before re-running.
    Mutate,
    /// Cannot be undone or repeated. Commitment point.
    Irreversible,
}

impl Effect {
    /// Derive recovery strategy from effect type.
    pub fn recovery(&self) -> Recovery {
        match self {
            Effect::Pure | Effect::Observe => Recovery::Retry,
            Effect::Mutate => Recovery::CheckAndRetry,
            Effect::Irreversible => Recovery::ManualReview,
        }
    }

    /// Can the work be executed again after a crash without consulting the log?
    pub fn replay_safe(&self) -> bool {
        matches!(self, Effect::Pure | Effect::Observe)
    }
}

/// Recovery strategy after failure, derived from Effect type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recovery {
    /// Safe to re-execute.
    Retry,
    /// Must verify recorded state before retrying.
    CheckAndRetry,
    /// Requires human review.
    ManualReview,
}

impl Recovery {
    /// Whether an automatic retry loop may attempt the work again.
    pub fn allows_retry(&self) -> bool {
        !matches!(self, Recovery::ManualReview)
    }
}

/// Any operation that has a classified effect.
pub trait Effectful {
    fn effect(&self) -> Effect;

    fn recovery(&self) -> Recovery {
        self.effect().recovery()
    }
}
