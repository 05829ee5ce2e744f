use crate::message::{EventKind, MessageKind};
use crate::registry::{LookupError, MessageContext, Registry};

/// Compiled regular expression compared by its source pattern.
#[derive(Debug, Clone)]
pub struct Pattern(regex::Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        regex::Regex::new(source).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.0.is_match(haystack)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Pattern {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    All,
    MsgType(MessageKind),
    Event(EventKind),
    EventKey { event: EventKind, key: String },
    /// Text content contains the pattern.
    Contain(String),
    /// Text content equals the pattern.
    Equal(String),
    /// Pattern matches anywhere in the text content.
    Regex(Pattern),
    /// Registered predicate, looked up by name.
    Custom { program: String },
}

/// Outcome of evaluating one rule. `Failed` is kept apart from `NotMatched`
/// so callers can log it, but both mean the rule did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Matched,
    NotMatched,
    Failed(String),
}

impl RuleOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

impl From<bool> for RuleOutcome {
    fn from(matched: bool) -> Self {
        if matched {
            Self::Matched
        } else {
            Self::NotMatched
        }
    }
}

/// Scan-subscribe compares equal to plain subscribe.
fn same_event(rule: &EventKind, actual: &EventKind) -> bool {
    use EventKind::{Subscribe, SubscribeScan};
    matches!(
        (rule, actual),
        (Subscribe | SubscribeScan, Subscribe | SubscribeScan)
    ) || rule == actual
}

impl Rule {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::MsgType(_) => "msg_type",
            Self::Event(_) => "event",
            Self::EventKey { .. } => "event_key",
            Self::Contain(_) => "contain",
            Self::Equal(_) => "equal",
            Self::Regex(_) => "regex",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn evaluate(&self, ctx: &MessageContext, registry: &Registry) -> RuleOutcome {
        let message = &ctx.message;
        match self {
            Self::All => RuleOutcome::Matched,
            Self::MsgType(kind) => (message.kind() == *kind).into(),
            Self::Event(kind) => message
                .event()
                .is_some_and(|event| same_event(kind, &event.kind))
                .into(),
            Self::EventKey { event: kind, key } => message
                .event()
                .is_some_and(|event| {
                    same_event(kind, &event.kind) && event.key.as_deref() == Some(key.as_str())
                })
                .into(),
            Self::Contain(pattern) => message
                .text()
                .is_some_and(|content| content.contains(pattern.as_str()))
                .into(),
            Self::Equal(pattern) => message.text().is_some_and(|content| content == pattern).into(),
            Self::Regex(pattern) => message
                .text()
                .is_some_and(|content| pattern.is_match(content))
                .into(),
            Self::Custom { program } => match registry.predicate(program, &ctx.account) {
                Ok(predicate) => match predicate(ctx) {
                    Ok(matched) => matched.into(),
                    Err(err) => {
                        RuleOutcome::Failed(format!("predicate `{program}` failed: {err:#}"))
                    }
                },
                Err(LookupError::OutOfScope { .. }) => RuleOutcome::NotMatched,
                Err(err @ LookupError::Unknown(_)) => RuleOutcome::Failed(err.to_string()),
            },
        }
    }
}
