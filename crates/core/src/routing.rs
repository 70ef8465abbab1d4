use crate::session::{Session, Surface};

/// Explicit surface tag supplied by the caller, if any. The `invest`
/// and `developer` tags model caller-initiated deep links and override
/// sticky session state; other tags only win when the session has not
/// already entered a specialized surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceTag {
    Discovery,
    Invest,
    Developer,
    Sandbox,
    Privacy,
    Contact,
}

impl SurfaceTag {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "discovery" | "landing" => Some(Self::Discovery),
            "invest" => Some(Self::Invest),
            "developer" => Some(Self::Developer),
            "sandbox" => Some(Self::Sandbox),
            "privacy" => Some(Self::Privacy),
            "contact" => Some(Self::Contact),
            _ => None,
        }
    }

    fn surface(self) -> Surface {
        match self {
            Self::Discovery => Surface::Discovery,
            Self::Invest => Surface::Invest,
            Self::Developer => Surface::Developer,
            Self::Sandbox => Surface::Sandbox,
            Self::Privacy => Surface::Privacy,
            Self::Contact => Surface::Contact,
        }
    }

    fn is_deep_link(self) -> bool {
        matches!(self, Self::Invest | Self::Developer)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SurfaceRouter;

impl SurfaceRouter {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the surface for one inbound turn.
    ///
    /// Order: deep-link tags always force their surface; any other
    /// explicit non-default tag wins next; then sticky step affinity;
    /// then keyword intent classifiers; then the default surface.
    pub fn resolve(
        &self,
        tag: Option<SurfaceTag>,
        session: Option<&Session>,
        utterance: &str,
    ) -> Surface {
        if let Some(tag) = tag {
            if tag.is_deep_link() {
                return tag.surface();
            }
        }

        let sticky = session
            .map(|session| session.step.owner())
            .filter(|surface| !surface.is_default());

        if let Some(tag) = tag {
            if !tag.surface().is_default() && sticky.is_none() {
                return tag.surface();
            }
        }

        if let Some(surface) = sticky {
            return surface;
        }

        if investor_intent(utterance) {
            return Surface::Invest;
        }
        if developer_intent(utterance) {
            return Surface::Developer;
        }

        Surface::Discovery
    }
}

fn investor_intent(utterance: &str) -> bool {
    let normalized = utterance.to_ascii_lowercase();
    const KEYWORDS: &[&str] = &[
        "invest",
        "investor",
        "investing",
        "equity",
        "shares",
        "funding round",
        "cap table",
        "dataroom",
        "data room",
    ];
    KEYWORDS.iter().any(|keyword| normalized.contains(keyword))
}

fn developer_intent(utterance: &str) -> bool {
    let normalized = utterance.to_ascii_lowercase();
    const KEYWORDS: &[&str] = &[
        "api key",
        "api access",
        "webhook",
        "sdk",
        "integration",
        "build an agent",
        "build a worker",
        "developer",
        "endpoint",
    ];
    KEYWORDS.iter().any(|keyword| normalized.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::{SurfaceRouter, SurfaceTag};
    use crate::session::{Session, SessionId, Step, Surface};

    fn session_on(surface: Surface) -> Session {
        Session::new(SessionId("sess-route".to_owned()), surface)
    }

    #[test]
    fn no_tag_no_state_no_keywords_stays_on_discovery() {
        let router = SurfaceRouter::new();
        let surface = router.resolve(None, None, "I manage 40 rental units in Austin");
        assert_eq!(surface, Surface::Discovery);
    }

    #[test]
    fn explicit_non_default_tag_wins_over_keywords() {
        let router = SurfaceRouter::new();
        let surface = router.resolve(
            Some(SurfaceTag::Privacy),
            None,
            "how do I get api access?",
        );
        assert_eq!(surface, Surface::Privacy);
    }

    #[test]
    fn sticky_step_keeps_specialized_surface_without_tag() {
        let router = SurfaceRouter::new();
        let mut session = session_on(Surface::Developer);
        session.advance_step(Step::DevSpec).expect("owned step");

        let surface = router.resolve(None, Some(&session), "thanks, what next?");
        assert_eq!(surface, Surface::Developer);
    }

    #[test]
    fn sticky_surface_beats_non_deep_link_tag() {
        let router = SurfaceRouter::new();
        let session = session_on(Surface::Invest);
        let surface = router.resolve(Some(SurfaceTag::Contact), Some(&session), "hello");
        assert_eq!(surface, Surface::Invest);
    }

    #[test]
    fn deep_link_tag_overrides_sticky_state() {
        let router = SurfaceRouter::new();
        let session = session_on(Surface::Invest);
        let surface = router.resolve(Some(SurfaceTag::Developer), Some(&session), "hello");
        assert_eq!(surface, Surface::Developer);
    }

    #[test]
    fn investor_keywords_switch_surface_from_default() {
        let router = SurfaceRouter::new();
        let session = session_on(Surface::Discovery);
        let surface =
            router.resolve(None, Some(&session), "can I invest in the platform?");
        assert_eq!(surface, Surface::Invest);
    }

    #[test]
    fn developer_keywords_switch_surface_from_default() {
        let router = SurfaceRouter::new();
        let surface = router.resolve(None, None, "I need an api key for my integration");
        assert_eq!(surface, Surface::Developer);
    }

    #[test]
    fn tag_parsing_accepts_known_tags_only() {
        assert_eq!(SurfaceTag::parse("invest"), Some(SurfaceTag::Invest));
        assert_eq!(SurfaceTag::parse(" Developer "), Some(SurfaceTag::Developer));
        assert_eq!(SurfaceTag::parse("landing"), Some(SurfaceTag::Discovery));
        assert_eq!(SurfaceTag::parse("unknown"), None);
    }
}
