//! Output enforcement gate.
//!
//! Conversational drafts fail open: one regeneration attempt, then the
//! original draft plus a disclaimer sentence. Structured analysis
//! payloads fail closed: a hard violation or a gate-internal error
//! blocks the payload entirely. The policy is chosen by the caller,
//! never inferred.

use parley_core::enforcement::{AnalysisProfile, EnforcementResult, GatePolicy, Ruleset};
use parley_core::protocol::{ParsedDraft, TokenParser};
use parley_core::{conversation_baseline, Directive, InlineFlag};
use thiserror::Error;
use tracing::{info, warn};

use crate::llm::LlmClient;
use crate::prompt::PromptPlan;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("ruleset `{0}` is not registered")]
    UnknownRuleset(String),
    #[error("enforcement requires the fail-closed policy, got {0:?}")]
    PolicyMismatch(GatePolicy),
}

/// Final reply for one chat turn after enforcement.
#[derive(Clone, Debug, PartialEq)]
pub struct GatedReply {
    pub visible_text: String,
    pub directives: Vec<Directive>,
    pub flags: Vec<InlineFlag>,
    pub result: EnforcementResult,
}

#[derive(Debug)]
pub struct EnforcementGate {
    ruleset: Ruleset,
    disclaimer: String,
    parser: TokenParser,
}

impl EnforcementGate {
    /// Resolve the active ruleset by name. Only compiled-in rulesets
    /// are selectable; uploaded rules are persisted for later review,
    /// not activated here.
    pub fn for_ruleset(name: &str, disclaimer: impl Into<String>) -> Result<Self, GateError> {
        let baseline = conversation_baseline();
        if name != baseline.id {
            return Err(GateError::UnknownRuleset(name.to_string()));
        }
        Ok(Self { ruleset: baseline, disclaimer: disclaimer.into(), parser: TokenParser::new() })
    }

    pub fn ruleset_id(&self) -> &str {
        &self.ruleset.id
    }

    /// Fail-open chat path. The parsed first draft comes in; if its
    /// visible text trips a hard rule, regenerate once with the
    /// violations appended to the instructions. The regenerated draft
    /// replaces the original only when it passes; any other outcome
    /// keeps the original text with the disclaimer appended.
    pub async fn enforce_chat(
        &self,
        llm: &dyn LlmClient,
        plan: &PromptPlan,
        first: ParsedDraft,
    ) -> GatedReply {
        let result = self.ruleset.evaluate(&first.visible_text);
        if result.passed {
            return GatedReply {
                visible_text: first.visible_text,
                directives: first.directives,
                flags: first.flags,
                result,
            };
        }

        info!(
            event_name = "enforcement.regenerating",
            ruleset = %self.ruleset.id,
            violations = result.violations.len(),
            "draft tripped hard rules, regenerating once"
        );

        let regen_plan = plan.with_violations(&result.violations);
        match llm.complete(&regen_plan.instructions, &regen_plan.messages).await {
            Ok(second_draft) => {
                let second = self.parser.parse(&second_draft);
                let mut second_result = self.ruleset.evaluate(&second.visible_text);
                second_result.regeneration_attempts = 1;
                if second_result.passed {
                    return GatedReply {
                        visible_text: second.visible_text,
                        directives: second.directives,
                        flags: second.flags,
                        result: second_result,
                    };
                }
                warn!(
                    event_name = "enforcement.regeneration_rejected",
                    ruleset = %self.ruleset.id,
                    "regenerated draft still fails, keeping original with disclaimer"
                );
                // The second draft is discarded, so its evaluation is
                // too: the returned result describes the text the
                // caller actually gets.
                let mut result = result;
                result.regeneration_attempts = 1;
                self.disclaimed(first, result)
            }
            Err(error) => {
                warn!(
                    event_name = "enforcement.regeneration_failed",
                    error = %error,
                    "provider failed during regeneration, keeping original with disclaimer"
                );
                let mut result = result;
                result.regeneration_attempts = 1;
                self.disclaimed(first, result)
            }
        }
    }

    /// Fail-closed analysis path: the caller names the ruleset and
    /// only gets a result when it resolves; a failing payload comes
    /// back as `Ok(result)` with `passed == false` and must not be
    /// released.
    pub fn enforce_analysis(
        &self,
        policy: GatePolicy,
        ruleset_id: &str,
        payload: &serde_json::Value,
        profile: &AnalysisProfile,
    ) -> Result<EnforcementResult, GateError> {
        if policy != GatePolicy::FailClosed {
            return Err(GateError::PolicyMismatch(policy));
        }
        if ruleset_id != self.ruleset.id {
            return Err(GateError::UnknownRuleset(ruleset_id.to_string()));
        }
        Ok(self.ruleset.evaluate_payload(payload, profile))
    }

    fn disclaimed(&self, first: ParsedDraft, result: EnforcementResult) -> GatedReply {
        let mut visible_text = first.visible_text;
        if !visible_text.is_empty() {
            visible_text.push(' ');
        }
        visible_text.push_str(&self.disclaimer);
        GatedReply { visible_text, directives: first.directives, flags: first.flags, result }
    }
}

#[cfg(test)]
mod tests {
    use parley_core::enforcement::{AnalysisProfile, GatePolicy};
    use parley_core::protocol::TokenParser;
    use serde_json::json;

    use super::{EnforcementGate, GateError};
    use crate::llm::ScriptedLlmClient;
    use crate::prompt::PromptPlan;

    const DISCLAIMER: &str = "This reply is informational only.";

    fn gate() -> EnforcementGate {
        EnforcementGate::for_ruleset("conversation-baseline", DISCLAIMER).expect("baseline")
    }

    fn plan() -> PromptPlan {
        PromptPlan { instructions: "be careful".to_owned(), messages: Vec::new() }
    }

    #[tokio::test]
    async fn passing_draft_goes_through_untouched() {
        let llm = ScriptedLlmClient::default();
        let parsed = TokenParser::new().parse("Happy to walk you through onboarding.");

        let reply = gate().enforce_chat(&llm, &plan(), parsed).await;
        assert_eq!(reply.visible_text, "Happy to walk you through onboarding.");
        assert_eq!(reply.result.regeneration_attempts, 0);
        assert!(reply.result.passed);
    }

    #[tokio::test]
    async fn failing_draft_is_replaced_by_a_passing_regeneration() {
        let llm = ScriptedLlmClient::new(["Returns depend on performance; nothing is promised."]);
        let parsed = TokenParser::new().parse("This is a guaranteed return.");

        let reply = gate().enforce_chat(&llm, &plan(), parsed).await;
        assert!(reply.result.passed);
        assert_eq!(reply.result.regeneration_attempts, 1);
        assert!(reply.visible_text.starts_with("Returns depend on performance"));
        assert!(!reply.visible_text.contains(DISCLAIMER));
    }

    #[tokio::test]
    async fn twice_failing_draft_keeps_original_with_disclaimer() {
        let llm = ScriptedLlmClient::new(["Still a guaranteed return, sorry."]);
        let parsed = TokenParser::new().parse("This is a guaranteed return.");

        let reply = gate().enforce_chat(&llm, &plan(), parsed).await;
        assert!(!reply.result.passed);
        assert_eq!(reply.result.regeneration_attempts, 1);
        assert_eq!(
            reply.visible_text,
            format!("This is a guaranteed return. {DISCLAIMER}")
        );
    }

    #[tokio::test]
    async fn disclaimer_path_reports_the_kept_draft_violations() {
        // The regeneration trips a different rule than the original;
        // the returned result must describe the text the caller got,
        // which is the original draft.
        let llm = ScriptedLlmClient::new(["As your attorney I recommend this deal."]);
        let parsed = TokenParser::new().parse("This is a guaranteed return.");

        let reply = gate().enforce_chat(&llm, &plan(), parsed).await;
        assert!(reply.visible_text.starts_with("This is a guaranteed return."));
        assert_eq!(reply.result.violations.len(), 1);
        assert_eq!(reply.result.violations[0].rule_id, "no-guaranteed-returns");
        assert_eq!(reply.result.regeneration_attempts, 1);
    }

    #[tokio::test]
    async fn provider_outage_during_regeneration_falls_back_to_disclaimer() {
        let llm = ScriptedLlmClient::failing();
        let parsed = TokenParser::new().parse("This is a guaranteed return.");

        let reply = gate().enforce_chat(&llm, &plan(), parsed).await;
        assert!(!reply.result.passed);
        assert!(reply.visible_text.ends_with(DISCLAIMER));
    }

    #[tokio::test]
    async fn directives_from_the_original_draft_survive_the_disclaimer_path() {
        let llm = ScriptedLlmClient::failing();
        let draft = "A guaranteed return.|||CREATE_RECORD|||{\"record_type\": \"lead\"}|||END_RECORD|||";
        let parsed = TokenParser::new().parse(draft);

        let reply = gate().enforce_chat(&llm, &plan(), parsed).await;
        assert_eq!(reply.directives.len(), 1);
        assert!(!reply.visible_text.contains("|||"));
    }

    #[test]
    fn analysis_path_requires_fail_closed() {
        let error = gate()
            .enforce_analysis(
                GatePolicy::FailOpen,
                "conversation-baseline",
                &json!({}),
                &AnalysisProfile::financial(),
            )
            .expect_err("must reject fail-open");
        assert!(matches!(error, GateError::PolicyMismatch(_)));
    }

    #[test]
    fn analysis_payload_with_violation_does_not_pass() {
        let result = gate()
            .enforce_analysis(
                GatePolicy::FailClosed,
                "conversation-baseline",
                &json!({
                    "assumptions": ["full occupancy"],
                    "methodology": "a risk-free investment thesis",
                }),
                &AnalysisProfile::financial(),
            )
            .expect("evaluated");
        assert!(!result.passed);
    }

    #[test]
    fn analysis_with_an_unknown_ruleset_name_is_rejected() {
        let error = gate()
            .enforce_analysis(
                GatePolicy::FailClosed,
                "no-such-ruleset",
                &json!({}),
                &AnalysisProfile::financial(),
            )
            .expect_err("unknown ruleset must not evaluate");
        assert!(matches!(error, GateError::UnknownRuleset(name) if name == "no-such-ruleset"));
    }

    #[test]
    fn unknown_ruleset_is_a_gate_error() {
        let error =
            EnforcementGate::for_ruleset("nonexistent", DISCLAIMER).expect_err("unknown");
        assert!(matches!(error, GateError::UnknownRuleset(_)));
    }
}
