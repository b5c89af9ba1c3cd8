use crate::record::{EventKind, IncidentStatus};

/// Derives a next status from assistant output. Best-effort only: explicit
/// status updates always override whatever a classifier decides.
pub trait StatusClassifier: Send + Sync {
    fn classify(&self, text: &str, current: IncidentStatus) -> Option<IncidentStatus>;
}

/// One forward move produced by repeatedly applying a classifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: IncidentStatus,
    pub to: IncidentStatus,
}

impl Transition {
    pub fn event_kind(&self) -> EventKind {
        match self.to {
            IncidentStatus::Identified => EventKind::Analysis,
            IncidentStatus::Resolved => EventKind::Resolution,
            _ => EventKind::Action,
        }
    }
}

/// Applies `classifier` until it stops proposing forward moves. Proposals that
/// would regress or stay put are ignored, so the result is monotonic.
pub fn transitions(
    classifier: &dyn StatusClassifier,
    text: &str,
    mut current: IncidentStatus,
) -> Vec<Transition> {
    let mut out = Vec::new();
    // The forward track has four ranks, so three moves is the most possible.
    for _ in 0..3 {
        match classifier.classify(text, current) {
            Some(next) if current.advances_to(next) => {
                out.push(Transition { from: current, to: next });
                current = next;
            }
            _ => break,
        }
    }
    out
}

/// Case-insensitive phrase matching over model output.
#[derive(Clone, Debug)]
pub struct KeywordClassifier {
    pub root_cause_phrases: Vec<String>,
    pub remediation_phrases: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            root_cause_phrases: [
                "root cause",
                "caused by",
                "the cause is",
                "the culprit",
                "is due to",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            remediation_phrases: [
                "to fix",
                "to mitigate",
                "mitigation",
                "remediation",
                "rollback",
                "roll back",
                "apply the fix",
                "restart the",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl StatusClassifier for KeywordClassifier {
    fn classify(&self, text: &str, current: IncidentStatus) -> Option<IncidentStatus> {
        let lower = text.to_lowercase();
        let mentions = |phrases: &[String]| phrases.iter().any(|p| lower.contains(p.as_str()));

        match current {
            IncidentStatus::Investigating if mentions(&self.root_cause_phrases) => {
                Some(IncidentStatus::Identified)
            }
            IncidentStatus::Investigating | IncidentStatus::Identified
                if mentions(&self.remediation_phrases) =>
            {
                Some(IncidentStatus::Mitigating)
            }
            _ => None,
        }
    }
}
