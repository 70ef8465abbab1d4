//! Embedded action protocol parser.
//!
//! The model is instructed to optionally emit two marker families in
//! its own output: short bracketed inline flags and triple-pipe block
//! directives carrying a JSON payload. The marker syntax is fixed for
//! compatibility with the existing prompt corpus and must never leak
//! to the end user: any recognized span is stripped from the visible
//! text even when its payload fails to parse, and a directive is only
//! emitted from a fully well-formed span (never partially applied).

use crate::directive::{
    AccountSignupPayload, ConfigSavePayload, Directive, DocumentGeneratePayload, IrActionPayload,
    RecordCreatePayload, RuleUploadPayload, TenantClaimPayload,
};

/// Boolean intents carried by single bracketed tokens. Matching is
/// case-insensitive and every occurrence is stripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InlineFlag {
    /// "offer the signup card"
    ShowSignup,
    /// "navigate the user to a restricted destination"
    GoToDataroom,
}

impl InlineFlag {
    pub const ALL: &'static [InlineFlag] = &[Self::ShowSignup, Self::GoToDataroom];

    pub fn token(&self) -> &'static str {
        match self {
            Self::ShowSignup => "[SHOW_SIGNUP]",
            Self::GoToDataroom => "[GO_TO_DATAROOM]",
        }
    }
}

/// One block-directive family: marker pair plus a typed payload
/// decoder. The close markers are asymmetric for two families
/// (`END_RECORD`, `END_DOCUMENT`); that asymmetry is part of the wire
/// protocol and is reproduced verbatim.
struct BlockFamily {
    open: &'static str,
    close: &'static str,
    decode: fn(&str) -> Result<Directive, serde_json::Error>,
}

const FAMILIES: &[BlockFamily] = &[
    BlockFamily {
        open: "|||ACCOUNT_SIGNUP|||",
        close: "|||END_ACCOUNT_SIGNUP|||",
        decode: |payload| {
            serde_json::from_str::<AccountSignupPayload>(payload).map(Directive::AccountSignup)
        },
    },
    BlockFamily {
        open: "|||TENANT_CLAIM|||",
        close: "|||END_TENANT_CLAIM|||",
        decode: |payload| {
            serde_json::from_str::<TenantClaimPayload>(payload).map(Directive::TenantClaim)
        },
    },
    BlockFamily {
        open: "|||CREATE_RECORD|||",
        close: "|||END_RECORD|||",
        decode: |payload| {
            serde_json::from_str::<RecordCreatePayload>(payload).map(Directive::RecordCreate)
        },
    },
    BlockFamily {
        open: "|||GENERATE_DOCUMENT|||",
        close: "|||END_DOCUMENT|||",
        decode: |payload| {
            serde_json::from_str::<DocumentGeneratePayload>(payload)
                .map(Directive::DocumentGenerate)
        },
    },
    BlockFamily {
        open: "|||IR_ACTION|||",
        close: "|||END_IR_ACTION|||",
        decode: |payload| {
            serde_json::from_str::<IrActionPayload>(payload).map(Directive::IrAction)
        },
    },
    BlockFamily {
        open: "|||RULE_UPLOAD|||",
        close: "|||END_RULE_UPLOAD|||",
        decode: |payload| {
            serde_json::from_str::<RuleUploadPayload>(payload).map(Directive::RuleUpload)
        },
    },
    BlockFamily {
        open: "|||WORKER_SPEC|||",
        close: "|||END_WORKER_SPEC|||",
        decode: |payload| {
            serde_json::from_str::<ConfigSavePayload>(payload).map(Directive::ConfigSave)
        },
    },
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseFailure {
    pub marker: &'static str,
    pub reason: String,
}

/// Result of scanning one model draft.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedDraft {
    /// Human-readable remainder, all marker spans stripped and
    /// residual whitespace trimmed.
    pub visible_text: String,
    pub directives: Vec<Directive>,
    pub flags: Vec<InlineFlag>,
    /// Malformed spans that were stripped without emitting a
    /// directive; callers log these.
    pub failures: Vec<ParseFailure>,
}

impl ParsedDraft {
    pub fn has_flag(&self, flag: InlineFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Clone, Debug, Default)]
pub struct TokenParser;

impl TokenParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, draft: &str) -> ParsedDraft {
        let mut text = draft.to_string();
        let mut directives = Vec::new();
        let mut failures = Vec::new();

        for family in FAMILIES {
            loop {
                let Some(open_at) = text.find(family.open) else {
                    break;
                };
                let payload_start = open_at + family.open.len();

                let Some(close_offset) = text[payload_start..].find(family.close) else {
                    // Unterminated block: swallow everything from the
                    // open marker so neither the marker nor a partial
                    // payload reaches the user.
                    failures.push(ParseFailure {
                        marker: family.open,
                        reason: "missing close marker".to_owned(),
                    });
                    text.truncate(open_at);
                    break;
                };

                let payload_end = payload_start + close_offset;
                let span_end = payload_end + family.close.len();
                let payload = text[payload_start..payload_end].trim().to_string();

                match (family.decode)(&payload) {
                    Ok(directive) => directives.push(directive),
                    Err(error) => failures.push(ParseFailure {
                        marker: family.open,
                        reason: error.to_string(),
                    }),
                }
                text.replace_range(open_at..span_end, "");
            }
        }

        let mut flags = Vec::new();
        for flag in InlineFlag::ALL {
            if strip_case_insensitive(&mut text, flag.token()) {
                flags.push(*flag);
            }
        }

        ParsedDraft {
            visible_text: collapse_whitespace(&text),
            directives,
            flags,
            failures,
        }
    }
}

/// Remove every case-insensitive occurrence of `token`; returns
/// whether at least one was found.
fn strip_case_insensitive(text: &mut String, token: &str) -> bool {
    let needle = token.to_ascii_lowercase();
    let mut found = false;
    loop {
        let haystack = text.to_ascii_lowercase();
        let Some(at) = haystack.find(&needle) else {
            break;
        };
        text.replace_range(at..at + needle.len(), "");
        found = true;
    }
    found
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::{InlineFlag, TokenParser};
    use crate::directive::{Directive, DirectiveKind};

    fn parser() -> TokenParser {
        TokenParser::new()
    }

    #[test]
    fn plain_text_passes_through_untouched() {
        let parsed = parser().parse("Happy to help with your rental portfolio.");
        assert_eq!(parsed.visible_text, "Happy to help with your rental portfolio.");
        assert!(parsed.directives.is_empty());
        assert!(parsed.flags.is_empty());
        assert!(parsed.failures.is_empty());
    }

    #[test]
    fn inline_flags_are_detected_case_insensitively_and_stripped_everywhere() {
        let parsed = parser().parse(
            "Create an account to continue. [show_signup] Really. [SHOW_SIGNUP]",
        );
        assert!(parsed.has_flag(InlineFlag::ShowSignup));
        assert_eq!(parsed.visible_text, "Create an account to continue.  Really.");
        assert!(!parsed.visible_text.to_ascii_lowercase().contains("[show_signup]"));
    }

    #[test]
    fn well_formed_block_yields_directive_and_clean_text() {
        let draft = concat!(
            "I can set that up now.\n",
            "|||TENANT_CLAIM|||{\"tenant_name\": \"Hill Country PM\", \"vertical\": ",
            "\"real-estate\"}|||END_TENANT_CLAIM|||\n",
            "You'll get a confirmation shortly.",
        );
        let parsed = parser().parse(draft);

        assert_eq!(parsed.directives.len(), 1);
        assert_eq!(parsed.directives[0].kind(), DirectiveKind::TenantClaim);
        assert_eq!(
            parsed.visible_text,
            "I can set that up now.\n\nYou'll get a confirmation shortly."
        );
        assert!(!parsed.visible_text.contains("|||"));
    }

    #[test]
    fn asymmetric_close_markers_are_honored() {
        let draft = "|||CREATE_RECORD|||{\"record_type\": \"lead\"}|||END_RECORD|||done\
                     |||GENERATE_DOCUMENT|||{\"template\": \"welcome\"}|||END_DOCUMENT|||";
        let parsed = parser().parse(draft);
        let kinds: Vec<_> = parsed.directives.iter().map(Directive::kind).collect();
        assert_eq!(kinds, vec![DirectiveKind::RecordCreate, DirectiveKind::DocumentGenerate]);
        assert_eq!(parsed.visible_text, "done");
    }

    #[test]
    fn malformed_json_strips_span_but_emits_no_directive() {
        let draft = "Before |||IR_ACTION|||{not json at all}|||END_IR_ACTION||| after";
        let parsed = parser().parse(draft);

        assert!(parsed.directives.is_empty());
        assert_eq!(parsed.failures.len(), 1);
        assert_eq!(parsed.failures[0].marker, "|||IR_ACTION|||");
        assert_eq!(parsed.visible_text, "Before  after");
        assert!(!parsed.visible_text.contains("|||"));
    }

    #[test]
    fn unterminated_block_never_shows_marker_or_partial_payload() {
        let draft = "All set. |||WORKER_SPEC|||{\"worker_name\": \"intake\"";
        let parsed = parser().parse(draft);

        assert!(parsed.directives.is_empty());
        assert_eq!(parsed.failures.len(), 1);
        assert_eq!(parsed.visible_text, "All set.");
    }

    #[test]
    fn open_marker_casing_is_significant_for_blocks() {
        let draft = "|||tenant_claim|||{}|||end_tenant_claim|||";
        let parsed = parser().parse(draft);
        assert!(parsed.directives.is_empty());
        // Lowercased pseudo-markers are not protocol spans and are left
        // as ordinary (if odd) visible text.
        assert!(parsed.visible_text.contains("tenant_claim"));
    }

    #[test]
    fn multiple_families_parse_independently_with_cumulative_stripping() {
        let draft = concat!(
            "[GO_TO_DATAROOM]Your documents are ready.",
            "|||ACCOUNT_SIGNUP|||{\"email\": \"a@b.com\"}|||END_ACCOUNT_SIGNUP|||",
            "|||RULE_UPLOAD|||{\"ruleset_id\": \"conversation-baseline\"}|||END_RULE_UPLOAD|||",
        );
        let parsed = parser().parse(draft);

        assert!(parsed.has_flag(InlineFlag::GoToDataroom));
        assert_eq!(parsed.directives.len(), 2);
        assert_eq!(parsed.visible_text, "Your documents are ready.");
    }

    #[test]
    fn repeated_blocks_of_one_family_all_parse() {
        let draft = "|||CREATE_RECORD|||{\"record_type\": \"a\"}|||END_RECORD|||\
                     |||CREATE_RECORD|||{\"record_type\": \"b\"}|||END_RECORD|||";
        let parsed = parser().parse(draft);
        assert_eq!(parsed.directives.len(), 2);
        assert!(parsed.visible_text.is_empty());
    }
}
