//! Prompt construction for the inference steps. Each prompt is built from
//! the step's declared inputs only, never from an earlier raw context.

use crate::llm::{ChatMessage, InferenceParams};
use crate::record::Severity;

const ANALYST: &str = "You are a senior site reliability engineer performing automated incident analysis. \
Be specific and concise. Use short sections with headings. Do not invent evidence you were not given.";

pub const INITIAL_PARAMS: InferenceParams = InferenceParams {
    temperature: 0.3,
    max_tokens: 1024,
};
pub const ROOT_CAUSE_PARAMS: InferenceParams = InferenceParams {
    temperature: 0.4,
    max_tokens: 1536,
};
pub const REMEDIATION_PARAMS: InferenceParams = InferenceParams {
    temperature: 0.5,
    max_tokens: 2048,
};
pub const MONITORING_PARAMS: InferenceParams = InferenceParams {
    temperature: 0.6,
    max_tokens: 1536,
};

pub fn initial_analysis(
    severity: Severity,
    description: &str,
    logs: Option<&str>,
    metrics: Option<&str>,
) -> Vec<ChatMessage> {
    let mut prompt = format!(
        "A {severity} severity incident was just opened.\n\nDescription:\n{description}\n"
    );
    if let Some(logs) = logs.filter(|l| !l.trim().is_empty()) {
        prompt.push_str(&format!("\nLogs:\n{logs}\n"));
    }
    if let Some(metrics) = metrics.filter(|m| !m.trim().is_empty()) {
        prompt.push_str(&format!("\nMetrics:\n{metrics}\n"));
    }
    prompt.push_str(
        "\nProvide:\n\
         1. The systems most likely affected.\n\
         2. The immediate user and business impact.\n\
         3. The single first diagnostic step an engineer should take now.",
    );
    vec![ChatMessage::system(ANALYST), ChatMessage::user(prompt)]
}

pub fn root_cause(severity: Severity, description: &str, initial: &str) -> Vec<ChatMessage> {
    let prompt = format!(
        "Incident ({severity} severity):\n{description}\n\n\
         Initial analysis:\n{initial}\n\n\
         Determine:\n\
         1. The most likely root cause.\n\
         2. Contributing factors.\n\
         3. Monitoring gaps that delayed detection.\n\
         4. Known failure patterns this matches."
    );
    vec![ChatMessage::system(ANALYST), ChatMessage::user(prompt)]
}

pub fn remediation(severity: Severity, description: &str, root_cause: &str) -> Vec<ChatMessage> {
    let prompt = format!(
        "Incident ({severity} severity):\n{description}\n\n\
         Root cause analysis:\n{root_cause}\n\n\
         Write a remediation plan covering immediate mitigation, the short-term fix, \
         the long-term fix, a rollback plan and success criteria.\n\
         Format it as a numbered checklist: one action per line, each line starting \
         with its number followed by a period (\"1. ...\")."
    );
    vec![ChatMessage::system(ANALYST), ChatMessage::user(prompt)]
}

pub fn monitoring(severity: Severity, root_cause: &str) -> Vec<ChatMessage> {
    let prompt = format!(
        "A {severity} severity incident had this root cause analysis:\n{root_cause}\n\n\
         Recommend:\n\
         1. New alerts or threshold changes to existing alerts.\n\
         2. New metrics to collect.\n\
         3. Dashboard additions.\n\
         4. SLO or error-budget adjustments."
    );
    vec![ChatMessage::system(ANALYST), ChatMessage::user(prompt)]
}

/// Extracts `N.`-prefixed lines, in order. Anything unparseable is skipped,
/// so malformed model output degrades to an empty list.
pub fn parse_numbered_steps(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            let rest = line[digits..].strip_prefix('.')?.trim();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_numbered_checklist_lines() {
        let plan = "## Immediate mitigation\n\
                    1. Fail over to the replica\n\
                    \x20  2.   Drain the bad node \n\
                    - not numbered\n\
                    3) wrong delimiter\n\
                    10. Confirm error rate < 1%\n\
                    4.\n\
                    2024 was a good year";
        assert_eq!(
            parse_numbered_steps(plan),
            vec![
                "Fail over to the replica".to_string(),
                "Drain the bad node".to_string(),
                "Confirm error rate < 1%".to_string(),
            ]
        );
    }

    #[test]
    fn unnumbered_text_yields_empty_list() {
        assert!(parse_numbered_steps("Restart everything and hope.").is_empty());
    }

    #[test]
    fn initial_prompt_omits_absent_evidence() {
        let messages = initial_analysis(Severity::High, "Users reporting 504 errors", None, Some(" "));
        let prompt = &messages[1].content;
        assert!(prompt.contains("high severity"));
        assert!(!prompt.contains("Logs:"));
        assert!(!prompt.contains("Metrics:"));

        let with_logs = initial_analysis(Severity::Low, "d", Some("timeout after 30s"), None);
        assert!(with_logs[1].content.contains("Logs:\ntimeout after 30s"));
    }

    #[test]
    fn later_prompts_carry_previous_output() {
        let messages = remediation(Severity::Critical, "db down", "disk full on primary");
        assert!(messages[1].content.contains("disk full on primary"));
        assert!(messages[1].content.contains("numbered checklist"));
    }
}
