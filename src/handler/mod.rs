//! Handlers: prioritized bundles of rules and replies, and the matcher that
//! picks one handler per inbound message.

pub mod resolver;
pub mod rule;

pub use resolver::{RenderedReply, ReplyResolver, Resolution};
pub use rule::{Pattern, Rule, RuleOutcome};

use crate::message::ParseError;
use crate::platform::{ForwardError, SendError};
use crate::registry::{LookupError, MessageContext, Registry};
use crate::reply::Reply;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("invalid reply strategy `{0}`")]
    InvalidStrategy(String),
    #[error("custom program `{name}` cannot be resolved: {source}")]
    UnresolvableCustomProgram {
        name: String,
        #[source]
        source: LookupError,
    },
    #[error("custom program `{name}` failed: {message}")]
    Program { name: String, message: String },
    #[error(transparent)]
    ForwardEndpoint(#[from] ForwardError),
    #[error("forward endpoint did not return a reply document: {0}")]
    UnreadableForwardReply(#[source] ParseError),
    #[error("out-of-band send failed: {0}")]
    OutboundSend(#[from] SendError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyStrategy {
    /// First reply answers the request, the rest go out-of-band.
    #[default]
    ReplyAll,
    RandomOne,
    None,
}

impl ReplyStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplyAll => "reply_all",
            Self::RandomOne => "random_one",
            Self::None => "none",
        }
    }
}

impl FromStr for ReplyStrategy {
    type Err = HandleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "reply_all" | "all" => Ok(Self::ReplyAll),
            "random_one" | "random" => Ok(Self::RandomOne),
            "none" => Ok(Self::None),
            _ => Err(HandleError::InvalidStrategy(raw.to_string())),
        }
    }
}

impl fmt::Display for ReplyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Weighted<T> {
    weight: i32,
    item: T,
}

/// Inserts keeping weight-descending order, later entries after earlier
/// ones of the same weight.
fn insert_weighted<T>(items: &mut Vec<Weighted<T>>, weight: i32, item: T) {
    let at = items.partition_point(|existing| existing.weight >= weight);
    items.insert(at, Weighted { weight, item });
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub id: u64,
    pub name: String,
    pub strategy: ReplyStrategy,
    pub enabled: bool,
    pub starts: Option<DateTime<Utc>>,
    /// Exclusive.
    pub ends: Option<DateTime<Utc>>,
    pub weight: i32,
    pub created_at: DateTime<Utc>,
    pub log_messages: bool,
    rules: Vec<Weighted<Rule>>,
    replies: Vec<Weighted<Reply>>,
}

impl Handler {
    pub fn new(id: u64, name: impl Into<String>, strategy: ReplyStrategy) -> Self {
        Self {
            id,
            name: name.into(),
            strategy,
            enabled: true,
            starts: None,
            ends: None,
            weight: 0,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            log_messages: false,
            rules: Vec::new(),
            replies: Vec::new(),
        }
    }

    pub fn with_rule(mut self, weight: i32, rule: Rule) -> Self {
        insert_weighted(&mut self.rules, weight, rule);
        self
    }

    pub fn with_reply(mut self, weight: i32, reply: Reply) -> Self {
        insert_weighted(&mut self.replies, weight, reply);
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_window(
        mut self,
        starts: Option<DateTime<Utc>>,
        ends: Option<DateTime<Utc>>,
    ) -> Self {
        self.starts = starts;
        self.ends = ends;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn rules(&self) -> impl ExactSizeIterator<Item = &Rule> {
        self.rules.iter().map(|rule| &rule.item)
    }

    pub fn replies(&self) -> impl ExactSizeIterator<Item = &Reply> {
        self.replies.iter().map(|reply| &reply.item)
    }

    pub fn available_at(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.starts.is_none_or(|starts| starts <= now)
            && self.ends.is_none_or(|ends| now < ends)
    }

    /// True if any rule matches. Failing rules count as not matching.
    pub fn matches(&self, ctx: &MessageContext, registry: &Registry) -> bool {
        self.rules().any(|rule| match rule.evaluate(ctx, registry) {
            RuleOutcome::Matched => true,
            RuleOutcome::NotMatched => false,
            RuleOutcome::Failed(reason) => {
                tracing::warn!(handler = %self.name, rule = rule.kind(), "rule failed: {reason}");
                false
            }
        })
    }
}

/// Handlers of one account in evaluation order: weight, then creation time,
/// then id, all descending.
#[derive(Debug, Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<Handler>,
}

impl HandlerSet {
    pub fn new(mut handlers: Vec<Handler>) -> Self {
        handlers.sort_by_key(|handler| Reverse((handler.weight, handler.created_at, handler.id)));
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handler> {
        self.handlers.iter()
    }

    /// First available handler with a matching rule. Stops at the first hit.
    pub fn match_message(
        &self,
        ctx: &MessageContext,
        registry: &Registry,
        now: DateTime<Utc>,
    ) -> Option<&Handler> {
        self.handlers
            .iter()
            .filter(|handler| handler.available_at(now))
            .find(|handler| handler.matches(ctx, registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::text_context;
    use crate::reply::ReplyBody;
    use chrono::Duration;

    fn contain(id: u64, weight: i32, pattern: &str) -> Handler {
        Handler::new(id, format!("h{id}"), ReplyStrategy::ReplyAll)
            .with_weight(weight)
            .with_rule(0, Rule::Contain(pattern.to_string()))
    }

    fn matched_id(set: &HandlerSet, content: &str) -> Option<u64> {
        set.match_message(&text_context("main", content), &Registry::new(), Utc::now())
            .map(|handler| handler.id)
    }

    #[test]
    fn strategy_parsing_accepts_aliases_and_rejects_unknown() {
        assert_eq!("reply_all".parse::<ReplyStrategy>().unwrap(), ReplyStrategy::ReplyAll);
        assert_eq!("ALL".parse::<ReplyStrategy>().unwrap(), ReplyStrategy::ReplyAll);
        assert_eq!("random".parse::<ReplyStrategy>().unwrap(), ReplyStrategy::RandomOne);
        assert_eq!("none".parse::<ReplyStrategy>().unwrap(), ReplyStrategy::None);
        assert!(matches!(
            "sometimes".parse::<ReplyStrategy>(),
            Err(HandleError::InvalidStrategy(_))
        ));
    }

    #[test]
    fn weighted_handlers_match_their_own_rule_regardless_of_insertion_order() {
        let handlers = vec![contain(1, 5, "five"), contain(2, 0, "zero"), contain(3, -5, "minus")];
        let orders: [[usize; 3]; 3] = [[0, 1, 2], [2, 1, 0], [1, 2, 0]];
        for order in orders {
            let set = HandlerSet::new(order.iter().map(|&i| handlers[i].clone()).collect());
            assert_eq!(matched_id(&set, "five"), Some(1));
            assert_eq!(matched_id(&set, "zero"), Some(2));
            assert_eq!(matched_id(&set, "minus"), Some(3));
            assert_eq!(matched_id(&set, "nothing"), None);
        }
    }

    #[test]
    fn higher_weight_wins_when_both_match() {
        let set = HandlerSet::new(vec![contain(1, 0, "x"), contain(2, 10, "x")]);
        assert_eq!(matched_id(&set, "x"), Some(2));
    }

    #[test]
    fn equal_weight_prefers_recent_then_higher_id() {
        let older = Utc::now() - Duration::days(2);
        let newer = Utc::now() - Duration::days(1);
        let set = HandlerSet::new(vec![
            contain(9, 0, "x").with_created_at(older),
            contain(1, 0, "x").with_created_at(newer),
        ]);
        assert_eq!(matched_id(&set, "x"), Some(1));

        let set = HandlerSet::new(vec![contain(4, 0, "x"), contain(7, 0, "x"), contain(5, 0, "x")]);
        assert_eq!(matched_id(&set, "x"), Some(7));
    }

    #[test]
    fn unavailable_handlers_never_match() {
        let now = Utc::now();
        let always = |id| Handler::new(id, "h", ReplyStrategy::ReplyAll).with_rule(0, Rule::All);

        let disabled = always(1).enabled(false);
        let future = always(2).with_window(Some(now + Duration::hours(1)), None);
        let expired = always(3).with_window(None, Some(now - Duration::hours(1)));
        let ending_now = always(4).with_window(None, Some(now));
        for handler in [&disabled, &future, &expired, &ending_now] {
            assert!(!handler.available_at(now));
        }
        let set = HandlerSet::new(vec![disabled, future, expired, ending_now]);
        assert!(set
            .match_message(&text_context("main", "x"), &Registry::new(), now)
            .is_none());

        let open =
            always(5).with_window(Some(now - Duration::hours(1)), Some(now + Duration::hours(1)));
        assert!(open.available_at(now));
        assert!(always(6).with_window(Some(now), None).available_at(now));
    }

    #[test]
    fn rules_are_any_of() {
        let handler = Handler::new(1, "h", ReplyStrategy::ReplyAll)
            .with_rule(0, Rule::Equal("a".into()))
            .with_rule(0, Rule::Equal("b".into()));
        let registry = Registry::new();
        assert!(handler.matches(&text_context("main", "a"), &registry));
        assert!(handler.matches(&text_context("main", "b"), &registry));
        assert!(!handler.matches(&text_context("main", "c"), &registry));
    }

    #[test]
    fn failing_custom_rule_falls_through_to_next_handler() {
        let mut registry = Registry::new();
        registry.register_predicate(
            "boom",
            crate::registry::AccountScope::All,
            |_| anyhow::bail!("broken"),
        );
        let set = HandlerSet::new(vec![
            Handler::new(1, "custom", ReplyStrategy::ReplyAll)
                .with_weight(10)
                .with_rule(0, Rule::Custom {
                    program: "boom".into(),
                }),
            Handler::new(2, "fallback", ReplyStrategy::ReplyAll).with_rule(0, Rule::All),
        ]);
        let matched = set.match_message(&text_context("main", "x"), &registry, Utc::now());
        assert_eq!(matched.map(|handler| handler.id), Some(2));
    }

    #[test]
    fn replies_keep_weight_then_declaration_order() {
        let handler = Handler::new(1, "h", ReplyStrategy::ReplyAll)
            .with_reply(0, Reply::Message(ReplyBody::text("a")))
            .with_reply(5, Reply::Message(ReplyBody::text("b")))
            .with_reply(0, Reply::Message(ReplyBody::text("c")))
            .with_reply(5, Reply::Message(ReplyBody::text("d")));
        let order: Vec<_> = handler
            .replies()
            .map(|reply| match reply {
                Reply::Message(ReplyBody::Text { content }) => content.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }
}
