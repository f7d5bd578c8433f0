// crates/contextd-server/src/scrub/rules.rs
// Built-in secret detection rules

use regex::Regex;

/// Severity attached to a finding; reported in metrics, never with content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single detection rule.
///
/// When `capture_value` is set, only capture group 1 (the secret value) is
/// redacted; otherwise the whole match. `keyword` is a cheap substring gate
/// checked before the regex runs.
pub struct Rule {
    pub id: &'static str,
    pub pattern: Regex,
    pub keyword: Option<&'static str>,
    pub severity: Severity,
    pub capture_value: bool,
}

impl Rule {
    fn new(id: &'static str, pattern: &str, severity: Severity) -> Self {
        Self {
            id,
            pattern: Regex::new(pattern).unwrap_or_else(|e| {
                // Built-in patterns are compile-time constants; a bad one is a bug.
                panic!("invalid built-in scrub pattern {id}: {e}")
            }),
            keyword: None,
            severity,
            capture_value: false,
        }
    }

    fn gated(mut self, keyword: &'static str) -> Self {
        self.keyword = Some(keyword);
        self
    }

    fn value_only(mut self) -> Self {
        self.capture_value = true;
        self
    }
}

/// Default rule set, ordered by specificity: vendor-prefixed rules first so
/// that an overlapping generic match is attributed to the vendor rule.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "aws-access-key-id",
            r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b",
            Severity::Critical,
        ),
        Rule::new(
            "aws-secret-access-key",
            r#"(?i)\baws_?secret_?access_?key\b\s*[=:]\s*["']?([A-Za-z0-9/+=]{40})"#,
            Severity::Critical,
        )
        .value_only(),
        Rule::new(
            "github-token",
            r"\bgh[pousr]_[A-Za-z0-9]{36,255}\b",
            Severity::Critical,
        ),
        Rule::new(
            "gitlab-token",
            r"\bglpat-[A-Za-z0-9_\-]{20,}\b",
            Severity::Critical,
        ),
        Rule::new(
            "slack-token",
            r"\bxox[baprs]-[A-Za-z0-9\-]{10,}\b",
            Severity::High,
        ),
        Rule::new(
            "stripe-key",
            r"\b[sr]k_(?:live|test)_[A-Za-z0-9]{16,}\b",
            Severity::Critical,
        ),
        Rule::new(
            "google-api-key",
            r"\bAIza[0-9A-Za-z_\-]{35}\b",
            Severity::High,
        ),
        Rule::new(
            "anthropic-api-key",
            r"\bsk-ant-[A-Za-z0-9_\-]{24,}\b",
            Severity::Critical,
        ),
        Rule::new(
            "openai-api-key",
            r"\bsk-(?:proj-)?[A-Za-z0-9_\-]{32,}\b",
            Severity::Critical,
        ),
        Rule::new(
            "private-key-block",
            r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
            Severity::Critical,
        )
        .gated("PRIVATE KEY"),
        Rule::new(
            "jwt",
            r"\beyJ[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\b",
            Severity::High,
        )
        .gated("eyJ"),
        Rule::new(
            "database-url-credentials",
            r"(?i)\b(?:postgres(?:ql)?|mysql|mongodb(?:\+srv)?|redis|amqps?)://[^\s:@/]+:[^\s@/]+@",
            Severity::High,
        )
        .gated("://"),
        Rule::new(
            "generic-credential-assignment",
            r#"(?i)\b[A-Z0-9_]*(?:API_?KEY|SECRET|TOKEN|PASSWORD|PASSWD)\b\s*[=:]\s*["']?([^\s"'\[\]]{8,})"#,
            Severity::Medium,
        )
        .value_only(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_compile_and_are_unique() {
        let rules = default_rules();
        let mut ids: Vec<_> = rules.iter().map(|r| r.id).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before, "duplicate rule id");
    }

    #[test]
    fn test_vendor_rules_precede_generic_assignment() {
        let rules = default_rules();
        let openai = rules.iter().position(|r| r.id == "openai-api-key").unwrap();
        let generic = rules
            .iter()
            .position(|r| r.id == "generic-credential-assignment")
            .unwrap();
        assert!(openai < generic);
    }

    #[test]
    fn test_redaction_literal_is_not_rematched() {
        // The generic value pattern excludes brackets so that a second pass
        // over already-scrubbed text finds nothing.
        let rules = default_rules();
        let generic = rules
            .iter()
            .find(|r| r.id == "generic-credential-assignment")
            .unwrap();
        assert!(!generic.pattern.is_match("OPENAI_API_KEY=[REDACTED]"));
    }
}
