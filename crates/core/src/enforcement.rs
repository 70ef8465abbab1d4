use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure policy of the enforcement gate, explicit at every call
/// site: conversational text fails open (a disclaimer beats a blocked
/// chat), analytical payloads fail closed (unverified analysis must
/// never reach the user).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatePolicy {
    FailOpen,
    FailClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    /// Must block or regenerate the output.
    Hard,
    /// Recorded, non-blocking.
    Soft,
}

/// One acceptance rule: the output violates it when any pattern
/// matches case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub severity: RuleSeverity,
    pub patterns: Vec<String>,
    pub message: String,
}

/// A named, versioned set of output-acceptance rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruleset {
    pub id: String,
    pub version: u32,
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftWarning {
    pub rule_id: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementResult {
    pub ruleset_id: String,
    pub ruleset_version: u32,
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub warnings: Vec<SoftWarning>,
    pub regeneration_attempts: u8,
    pub evaluated_at: DateTime<Utc>,
}

impl Ruleset {
    /// Evaluate visible reply text. `passed` is false iff at least one
    /// hard rule fires; soft rules only accumulate warnings.
    pub fn evaluate(&self, text: &str) -> EnforcementResult {
        let normalized = text.to_ascii_lowercase();
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for rule in &self.rules {
            let fired = rule
                .patterns
                .iter()
                .any(|pattern| normalized.contains(&pattern.to_ascii_lowercase()));
            if !fired {
                continue;
            }
            match rule.severity {
                RuleSeverity::Hard => violations.push(Violation {
                    rule_id: rule.id.clone(),
                    message: rule.message.clone(),
                }),
                RuleSeverity::Soft => warnings.push(SoftWarning {
                    rule_id: rule.id.clone(),
                    message: rule.message.clone(),
                }),
            }
        }

        EnforcementResult {
            ruleset_id: self.id.clone(),
            ruleset_version: self.version,
            passed: violations.is_empty(),
            violations,
            warnings,
            regeneration_attempts: 0,
            evaluated_at: Utc::now(),
        }
    }

    /// Evaluate a structured analysis payload: every string leaf is
    /// checked against the rules, and the profile's required sections
    /// must be present. Used only on the fail-closed path.
    pub fn evaluate_payload(
        &self,
        payload: &serde_json::Value,
        profile: &AnalysisProfile,
    ) -> EnforcementResult {
        let mut text = String::new();
        collect_string_leaves(payload, &mut text);
        let mut result = self.evaluate(&text);

        for section in &profile.required_sections {
            if payload.get(section).is_none() {
                result.violations.push(Violation {
                    rule_id: format!("{}.missing_section", profile.id),
                    message: format!("analysis payload missing required section `{section}`"),
                });
            }
        }
        result.passed = result.violations.is_empty();
        result
    }
}

/// Validation profile for the structured-analysis surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisProfile {
    pub id: String,
    pub required_sections: Vec<String>,
}

impl AnalysisProfile {
    pub fn financial() -> Self {
        Self {
            id: "financial-analysis".to_owned(),
            required_sections: vec!["assumptions".to_owned(), "methodology".to_owned()],
        }
    }
}

fn collect_string_leaves(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(text) => {
            out.push_str(text);
            out.push('\n');
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_string_leaves(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_string_leaves(item, out);
            }
        }
        _ => {}
    }
}

/// Compiled-in baseline ruleset for conversational replies.
pub fn conversation_baseline() -> Ruleset {
    Ruleset {
        id: "conversation-baseline".to_owned(),
        version: 3,
        rules: vec![
            Rule {
                id: "no-guaranteed-returns".to_owned(),
                severity: RuleSeverity::Hard,
                patterns: vec![
                    "guaranteed return".to_owned(),
                    "guaranteed profit".to_owned(),
                    "risk-free investment".to_owned(),
                    "cannot lose".to_owned(),
                ],
                message: "reply promises investment outcomes".to_owned(),
            },
            Rule {
                id: "no-legal-advice".to_owned(),
                severity: RuleSeverity::Hard,
                patterns: vec![
                    "this constitutes legal advice".to_owned(),
                    "as your attorney".to_owned(),
                ],
                message: "reply presents itself as legal counsel".to_owned(),
            },
            Rule {
                id: "no-credential-requests".to_owned(),
                severity: RuleSeverity::Hard,
                patterns: vec![
                    "send me your password".to_owned(),
                    "share your password".to_owned(),
                    "social security number".to_owned(),
                ],
                message: "reply solicits sensitive credentials".to_owned(),
            },
            Rule {
                id: "hedge-performance-claims".to_owned(),
                severity: RuleSeverity::Soft,
                patterns: vec![
                    "always profitable".to_owned(),
                    "best in the market".to_owned(),
                ],
                message: "reply makes an unhedged performance claim".to_owned(),
            },
        ],
    }
}
