//! Prompt assembly for one dialogue turn.
//!
//! The engine is deterministic: given the same session and utterance
//! it yields the same instruction block and message list. All judgment
//! lives in the instruction text; the engine itself never calls the
//! provider.

use parley_core::session::{HistoryRole, Session, Step, Surface};
use parley_core::Violation;

use crate::llm::ChatMessage;

/// Extracted text of an uploaded file, annotated onto the utterance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub text: String,
}

/// Instruction block plus ordered messages, ready for one completion
/// call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptPlan {
    pub instructions: String,
    pub messages: Vec<ChatMessage>,
}

impl PromptPlan {
    /// Derive the regeneration plan: same messages, instructions
    /// extended with the violations the first draft tripped.
    pub fn with_violations(&self, violations: &[Violation]) -> PromptPlan {
        let mut instructions = self.instructions.clone();
        instructions.push_str(
            "\n\nYour previous draft was rejected. Rewrite it so that none of these apply:\n",
        );
        for violation in violations {
            instructions.push_str(&format!("- {} ({})\n", violation.message, violation.rule_id));
        }
        PromptPlan { instructions, messages: self.messages.clone() }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DialogueEngine;

impl DialogueEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(
        &self,
        session: &Session,
        utterance: &str,
        attachment: Option<&Attachment>,
    ) -> PromptPlan {
        let mut messages = Vec::new();
        let history = session.surface_history();
        if history.is_empty() {
            messages.push(ChatMessage::assistant(opener(session.surface)));
        }
        for entry in history {
            messages.push(match entry.role {
                HistoryRole::User => ChatMessage::user(entry.text.clone()),
                HistoryRole::Assistant => ChatMessage::assistant(entry.text.clone()),
            });
        }

        let mut turn_text = utterance.to_string();
        if let Some(attachment) = attachment {
            turn_text.push_str(&format!(
                "\n\n[Attached file: {}]\n{}",
                attachment.file_name, attachment.text
            ));
        }
        messages.push(ChatMessage::user(turn_text));

        PromptPlan { instructions: instructions_for(session), messages }
    }

    pub fn fallback_reply(&self, surface: Surface) -> &'static str {
        match surface {
            Surface::Discovery => {
                "I hit a snag generating a reply just now. Could you say that again, or tell me a bit more about your business?"
            }
            Surface::Invest => {
                "I couldn't reach our systems just now. Please try again in a moment, or leave your email and we'll follow up."
            }
            Surface::Developer => {
                "Something went wrong on my side. Please retry; your API questions are safe to ask again."
            }
            Surface::Sandbox => "The sandbox hiccuped. Run that once more, please.",
            Surface::Privacy | Surface::Contact => {
                "I couldn't process that just now. Please try again shortly."
            }
        }
    }

    /// Suggested quick replies shown under the reply box.
    pub fn prompt_chips(&self, session: &Session) -> Vec<String> {
        let chips: &[&str] = match (session.surface, session.step) {
            (Surface::Discovery, Step::Discovery) => {
                &["I manage rental properties", "I run a restaurant", "Just exploring"]
            }
            (Surface::Discovery, _) => &["What happens next?", "Show me an example"],
            (Surface::Invest, Step::InvestVerify) => &["Resend the sign-in link"],
            (Surface::Invest, _) => &["How do I invest?", "Send me the deck"],
            (Surface::Developer, _) => &["How do I get an API key?", "Show webhook docs"],
            (Surface::Sandbox, _) => &["Reset the sandbox"],
            (Surface::Privacy, _) => &["Delete my data", "What do you store?"],
            (Surface::Contact, _) => &["Talk to a human"],
        };
        chips.iter().map(|chip| (*chip).to_string()).collect()
    }
}

fn opener(surface: Surface) -> &'static str {
    match surface {
        Surface::Discovery => {
            "Hi! I help business owners get set up here. What kind of business do you run?"
        }
        Surface::Invest => {
            "Welcome to investor relations. I can share materials and get you verified access."
        }
        Surface::Developer => {
            "Hey, developer desk here. Ask me about the API, webhooks, or building an agent."
        }
        Surface::Sandbox => "Sandbox is live. Anything you try here stays here.",
        Surface::Privacy => "I handle privacy requests. What would you like to do with your data?",
        Surface::Contact => "I can route you to the right person. What is this about?",
    }
}

fn instructions_for(session: &Session) -> String {
    let mut block = String::from(
        "You are the conversational front door of a multi-tenant business platform. \
         Be concise and concrete. Never promise investment outcomes, never give \
         legal advice, never ask for credentials.\n",
    );

    block.push_str(match session.surface {
        Surface::Discovery => {
            "Surface: discovery. Learn what the visitor's business is, then guide them \
             toward creating an account. When they should sign up, include the token \
             [SHOW_SIGNUP] in your reply."
        }
        Surface::Invest => {
            "Surface: invest. Collect the investor's email for a magic-link sign-in and \
             answer questions about the offering. When documents should open, include \
             [GO_TO_DATAROOM]."
        }
        Surface::Developer => {
            "Surface: developer. Answer API and integration questions; collect a worker \
             spec when the visitor wants an automated agent."
        }
        Surface::Sandbox => "Surface: sandbox. Demonstrate capabilities with throwaway data.",
        Surface::Privacy => "Surface: privacy. Intake data-subject requests, never resolve them inline.",
        Surface::Contact => "Surface: contact. Collect a name, an email, and the topic.",
    });

    block.push_str(match session.step {
        Step::ConfirmIntent => "\nStep: the visitor's business context is known; confirm it and move to signup.",
        Step::Authenticated | Step::InvestAuthenticated | Step::DevAuthenticated => {
            "\nStep: the visitor is signed in; skip onboarding talk."
        }
        Step::InvestVerify => "\nStep: a sign-in link was issued; help them complete verification.",
        Step::DevSpec => "\nStep: a worker spec is being drafted; keep refining it.",
        _ => "",
    });

    if !session.fields.is_empty() {
        block.push_str("\nKnown about this visitor:");
        for (key, value) in &session.fields {
            block.push_str(&format!("\n- {key}: {value}"));
        }
    }

    block
}
