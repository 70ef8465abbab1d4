//! Deterministic keyword extraction over the inbound utterance.
//!
//! No model involvement: the extractor recognizes a business vertical,
//! unit counts, a location hint, and a contact email, and merges them
//! into the session's surface-scoped fields. The model only ever sees
//! the result as "known about this visitor" context.

use std::collections::BTreeSet;

use parley_core::session::{Session, Surface};
use serde_json::json;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveredContext {
    pub vertical: Option<String>,
    pub subtype: Option<String>,
    pub unit_count: Option<u32>,
    pub location: Option<String>,
    pub email: Option<String>,
}

impl DiscoveredContext {
    pub fn is_empty(&self) -> bool {
        self.vertical.is_none()
            && self.subtype.is_none()
            && self.unit_count.is_none()
            && self.location.is_none()
            && self.email.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct DiscoveryExtractor;

impl DiscoveryExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> DiscoveredContext {
        let normalized = text.to_ascii_lowercase();
        let tokens = tokenize(&normalized);

        let (vertical, subtype) = extract_vertical(&normalized);
        DiscoveredContext {
            vertical,
            subtype,
            unit_count: extract_unit_count(&tokens),
            location: extract_location(text),
            email: extract_email(text),
        }
    }

    /// Merge extracted context into the session. Keys already present
    /// are kept so earlier answers are never overwritten by a weaker
    /// later mention.
    pub fn apply(&self, session: &mut Session, context: &DiscoveredContext) {
        if context.is_empty() {
            return;
        }

        let mut discovered = session
            .fields
            .get("discovered_context")
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();

        let mut set_if_absent = |key: &str, value: Option<serde_json::Value>| {
            if let Some(value) = value {
                discovered.entry(key.to_string()).or_insert(value);
            }
        };
        set_if_absent("vertical", context.vertical.clone().map(serde_json::Value::from));
        set_if_absent("subtype", context.subtype.clone().map(serde_json::Value::from));
        set_if_absent("unit_count", context.unit_count.map(|count| json!(count)));
        set_if_absent("location", context.location.clone().map(serde_json::Value::from));

        session.set_field("discovered_context", serde_json::Value::Object(discovered));

        if let Some(email) = &context.email {
            let key = if session.surface == Surface::Invest {
                "investorEmail"
            } else {
                "contactEmail"
            };
            if session.field_str(key).is_none() {
                session.set_field(key, json!(email));
            }
        }
    }
}

fn tokenize(normalized: &str) -> Vec<String> {
    normalized
        .split(|character: char| !(character.is_ascii_alphanumeric() || character == '@' || character == '.'))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect()
}

fn extract_vertical(normalized: &str) -> (Option<String>, Option<String>) {
    const REAL_ESTATE: &[&str] =
        &["rental unit", "rental units", "properties", "property", "tenants", "landlord", "lease"];
    const RESTAURANT: &[&str] = &["restaurant", "cafe", "diner", "food truck", "kitchen"];
    const RETAIL: &[&str] = &["retail", "storefront", "shop", "boutique", "ecommerce"];
    const SERVICES: &[&str] = &["agency", "consulting", "plumbing", "landscaping", "cleaning"];

    if REAL_ESTATE.iter().any(|keyword| normalized.contains(keyword)) {
        let subtype = if normalized.contains("manage") || normalized.contains("management") {
            Some("pm".to_string())
        } else {
            None
        };
        return (Some("real-estate".to_string()), subtype);
    }
    if RESTAURANT.iter().any(|keyword| normalized.contains(keyword)) {
        return (Some("restaurant".to_string()), None);
    }
    if RETAIL.iter().any(|keyword| normalized.contains(keyword)) {
        return (Some("retail".to_string()), None);
    }
    if SERVICES.iter().any(|keyword| normalized.contains(keyword)) {
        return (Some("services".to_string()), None);
    }
    (None, None)
}

fn extract_unit_count(tokens: &[String]) -> Option<u32> {
    let units: BTreeSet<&str> = [
        "unit", "units", "properties", "doors", "locations", "stores", "trucks", "employees",
    ]
    .into_iter()
    .collect();

    // The unit word may be one token away ("40 rental units").
    for (index, token) in tokens.iter().enumerate() {
        let Ok(count) = token.parse::<u32>() else {
            continue;
        };
        let lookahead = tokens[index + 1..].iter().take(2);
        if lookahead.into_iter().any(|candidate| units.contains(candidate.as_str())) {
            return Some(count);
        }
    }
    None
}

/// Capitalized run following " in ", e.g. "in Austin" or
/// "in San Antonio". Original casing is preserved.
fn extract_location(text: &str) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    for (index, word) in words.iter().enumerate() {
        if !word.eq_ignore_ascii_case("in") {
            continue;
        }
        let run: Vec<&str> = words[index + 1..]
            .iter()
            .take_while(|candidate| {
                candidate.chars().next().is_some_and(|first| first.is_ascii_uppercase())
            })
            .copied()
            .collect();
        if !run.is_empty() {
            let location = run.join(" ");
            return Some(location.trim_end_matches(['.', ',', '!', '?']).to_string());
        }
    }
    None
}

fn extract_email(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|character: char| !character.is_ascii_alphanumeric() && character != '@' && character != '.'))
        .find(|token| {
            let Some((local, domain)) = token.split_once('@') else {
                return false;
            };
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        })
        .map(|token| token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use parley_core::session::{Session, SessionId, Surface};

    use super::DiscoveryExtractor;

    #[test]
    fn property_manager_utterance_yields_full_context() {
        let context =
            DiscoveryExtractor::new().extract("I manage 40 rental units in Austin");
        assert_eq!(context.vertical.as_deref(), Some("real-estate"));
        assert_eq!(context.subtype.as_deref(), Some("pm"));
        assert_eq!(context.unit_count, Some(40));
        assert_eq!(context.location.as_deref(), Some("Austin"));
        assert!(context.email.is_none());
    }

    #[test]
    fn email_is_captured_and_normalized() {
        let context = DiscoveryExtractor::new().extract("my email is A@B.com, thanks");
        assert_eq!(context.email.as_deref(), Some("a@b.com"));
    }

    #[test]
    fn plain_chatter_extracts_nothing() {
        let context = DiscoveryExtractor::new().extract("can you help me?");
        assert!(context.is_empty());
    }

    #[test]
    fn context_merges_into_fields_without_overwriting() {
        let extractor = DiscoveryExtractor::new();
        let mut session = Session::new(SessionId("sess-1".to_owned()), Surface::Discovery);

        extractor.apply(&mut session, &extractor.extract("I manage 40 rental units in Austin"));
        extractor.apply(&mut session, &extractor.extract("well, 45 units actually, in Dallas"));

        let discovered = session.fields.get("discovered_context").expect("context stored");
        assert_eq!(discovered["vertical"], "real-estate");
        assert_eq!(discovered["unit_count"], 40);
        assert_eq!(discovered["location"], "Austin");
    }

    #[test]
    fn email_lands_in_investor_field_on_the_invest_surface() {
        let extractor = DiscoveryExtractor::new();
        let mut session = Session::new(SessionId("sess-1".to_owned()), Surface::Invest);
        extractor.apply(&mut session, &extractor.extract("my email is a@b.com"));
        assert_eq!(session.field_str("investorEmail"), Some("a@b.com"));
    }
}
