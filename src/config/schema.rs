use crate::account::{Account, EncodingMode};
use crate::crypto::WeChatCrypto;
use crate::handler::{Handler, HandlerSet, Pattern, ReplyStrategy, Rule};
use crate::message::{EventKind, MessageKind};
use crate::platform::forward::parse_forward_url;
use crate::platform::Credentials;
use crate::reply::{Article, Reply, ReplyBody, MAX_NEWS_ARTICLES};
use crate::security::signature::DEFAULT_TIMESTAMP_TOLERANCE_SECS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate account `{0}`")]
    DuplicateAccount(String),
    #[error("account `{account}`: {reason}")]
    Account { account: String, reason: String },
    #[error("account `{account}`, handler `{handler}`: {reason}")]
    Handler {
        account: String,
        handler: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_tolerance")]
    pub timestamp_tolerance_secs: u64,
    /// Disabling only skips replay detection; signatures are always checked.
    #[serde(default = "default_true")]
    pub replay_protection: bool,
}

fn default_tolerance() -> u64 {
    DEFAULT_TIMESTAMP_TOLERANCE_SECS
}

fn default_true() -> bool {
    true
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_secs: default_tolerance(),
            replay_protection: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Applies to out-of-band sends, token fetches and forward replies.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_api_base_url() -> String {
    "https://api.weixin.qq.com".into()
}

fn default_timeout_ms() -> u64 {
    4500
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default)]
    pub appid: String,
    #[serde(default)]
    pub appsecret: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding_aes_key: Option<String>,
    #[serde(default)]
    pub encoding_mode: EncodingMode,
    #[serde(default)]
    pub encrypt_replies: bool,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    #[serde(default)]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// RFC 3339.
    #[serde(default)]
    pub starts: Option<String>,
    /// RFC 3339, exclusive.
    #[serde(default)]
    pub ends: Option<String>,
    #[serde(default)]
    pub weight: i32,
    /// RFC 3339. Breaks ties between handlers of equal weight.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub log_messages: bool,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub replies: Vec<ReplyConfig>,
}

fn default_strategy() -> String {
    ReplyStrategy::ReplyAll.as_str().into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub weight: i32,
    #[serde(flatten)]
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    All,
    MsgType { msg_type: MessageKind },
    Event { event: EventKind },
    EventKey { event: EventKind, key: String },
    Contain { pattern: String },
    Equal { pattern: String },
    Regex { pattern: String },
    Custom { program: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    #[serde(default)]
    pub weight: i32,
    #[serde(flatten)]
    pub kind: ReplyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyKind {
    Text {
        content: String,
    },
    Image {
        media_id: String,
    },
    Voice {
        media_id: String,
    },
    Video {
        media_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Music {
        thumb_media_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        music_url: Option<String>,
        #[serde(default)]
        hq_music_url: Option<String>,
    },
    News {
        articles: Vec<Article>,
    },
    Forward {
        url: String,
    },
    Custom {
        program: String,
    },
}

fn parse_time(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|time| time.with_timezone(&Utc))
            .map_err(|err| format!("`{field}` is not an RFC 3339 timestamp: {err}"))
    })
    .transpose()
}

impl RuleKind {
    fn build(&self) -> Result<Rule, String> {
        Ok(match self {
            Self::All => Rule::All,
            Self::MsgType { msg_type } => Rule::MsgType(msg_type.clone()),
            Self::Event { event } => Rule::Event(event.clone()),
            Self::EventKey { event, key } => Rule::EventKey {
                event: event.clone(),
                key: key.clone(),
            },
            Self::Contain { pattern } => Rule::Contain(pattern.clone()),
            Self::Equal { pattern } => Rule::Equal(pattern.clone()),
            Self::Regex { pattern } => Rule::Regex(
                Pattern::new(pattern).map_err(|err| format!("invalid regex `{pattern}`: {err}"))?,
            ),
            Self::Custom { program } => Rule::Custom {
                program: program.clone(),
            },
        })
    }
}

impl ReplyKind {
    fn build(&self) -> Result<Reply, String> {
        let body = match self {
            Self::Text { content } => ReplyBody::Text {
                content: content.clone(),
            },
            Self::Image { media_id } => ReplyBody::Image {
                media_id: media_id.clone(),
            },
            Self::Voice { media_id } => ReplyBody::Voice {
                media_id: media_id.clone(),
            },
            Self::Video {
                media_id,
                title,
                description,
            } => ReplyBody::Video {
                media_id: media_id.clone(),
                title: title.clone(),
                description: description.clone(),
            },
            Self::Music {
                thumb_media_id,
                title,
                description,
                music_url,
                hq_music_url,
            } => ReplyBody::Music {
                thumb_media_id: thumb_media_id.clone(),
                title: title.clone(),
                description: description.clone(),
                music_url: music_url.clone(),
                hq_music_url: hq_music_url.clone(),
            },
            Self::News { articles } => {
                if articles.is_empty() || articles.len() > MAX_NEWS_ARTICLES {
                    return Err(format!(
                        "news reply needs 1 to {MAX_NEWS_ARTICLES} articles, got {}",
                        articles.len()
                    ));
                }
                ReplyBody::News {
                    articles: articles.clone(),
                }
            }
            Self::Forward { url } => {
                parse_forward_url(url).map_err(|err| err.to_string())?;
                return Ok(Reply::Forward { url: url.clone() });
            }
            Self::Custom { program } => {
                return Ok(Reply::Custom {
                    program: program.clone(),
                })
            }
        };
        Ok(Reply::Message(body))
    }
}

impl HandlerConfig {
    fn build(&self, default_id: u64) -> Result<Handler, String> {
        let strategy = self
            .strategy
            .parse::<ReplyStrategy>()
            .map_err(|err| err.to_string())?;
        if self.rules.is_empty() {
            return Err("handler has no rules".into());
        }

        let starts = parse_time("starts", self.starts.as_deref())?;
        let ends = parse_time("ends", self.ends.as_deref())?;
        let created_at = parse_time("created_at", self.created_at.as_deref())?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let mut handler = Handler::new(self.id.unwrap_or(default_id), self.name.clone(), strategy)
            .enabled(self.enabled)
            .with_window(starts, ends)
            .with_weight(self.weight)
            .with_created_at(created_at);
        handler.log_messages = self.log_messages;
        for rule in &self.rules {
            handler = handler.with_rule(rule.weight, rule.kind.build()?);
        }
        for reply in &self.replies {
            handler = handler.with_reply(reply.weight, reply.kind.build()?);
        }
        Ok(handler)
    }
}

impl AccountConfig {
    pub fn build_handlers(&self) -> Result<HandlerSet, ConfigError> {
        let mut ids = HashSet::new();
        let mut handlers = Vec::with_capacity(self.handlers.len());
        for (index, config) in self.handlers.iter().enumerate() {
            let handler = config.build(index as u64 + 1).map_err(|reason| ConfigError::Handler {
                account: self.name.clone(),
                handler: config.name.clone(),
                reason,
            })?;
            if !ids.insert(handler.id) {
                return Err(ConfigError::Handler {
                    account: self.name.clone(),
                    handler: config.name.clone(),
                    reason: format!("duplicate handler id {}", handler.id),
                });
            }
            handlers.push(handler);
        }
        Ok(HandlerSet::new(handlers))
    }

    pub fn build(&self) -> Result<Account, ConfigError> {
        let account = Account::new(&self.name, &self.appid, &self.appsecret, &self.token);
        let account = match self.encoding_mode {
            EncodingMode::Plain => account,
            EncodingMode::Safe => {
                let crypto = self
                    .encoding_aes_key
                    .as_deref()
                    .filter(|key| !key.trim().is_empty())
                    .map(|key| WeChatCrypto::new(&self.token, key, &self.appid))
                    .transpose()
                    .map_err(|err| ConfigError::Account {
                        account: self.name.clone(),
                        reason: err.to_string(),
                    })?;
                account.with_safe_mode(crypto, self.encrypt_replies)
            }
        };
        Ok(account.with_handlers(self.build_handlers()?))
    }
}

impl Config {
    pub fn build_accounts(&self) -> Result<Vec<Account>, ConfigError> {
        let mut seen = HashSet::new();
        let mut accounts = Vec::with_capacity(self.accounts.len());
        for config in &self.accounts {
            if config.name.trim().is_empty() {
                return Err(ConfigError::Account {
                    account: config.name.clone(),
                    reason: "account name must not be empty".into(),
                });
            }
            if !seen.insert(config.name.as_str()) {
                return Err(ConfigError::DuplicateAccount(config.name.clone()));
            }
            accounts.push(config.build()?);
        }
        Ok(accounts)
    }

    /// Handler sets keyed by account name, for reloading a running gateway.
    pub fn build_handler_sets(&self) -> Result<HashMap<String, HandlerSet>, ConfigError> {
        self.accounts
            .iter()
            .map(|account| Ok((account.name.clone(), account.build_handlers()?)))
            .collect()
    }

    pub fn credentials(&self) -> HashMap<String, Credentials> {
        self.accounts
            .iter()
            .map(|account| {
                (
                    account.name.clone(),
                    Credentials {
                        appid: account.appid.clone(),
                        appsecret: account.appsecret.clone(),
                    },
                )
            })
            .collect()
    }

    /// Custom rule and reply program names referenced anywhere.
    pub fn referenced_programs(&self) -> (HashSet<&str>, HashSet<&str>) {
        let mut predicates = HashSet::new();
        let mut programs = HashSet::new();
        for handler in self.accounts.iter().flat_map(|account| &account.handlers) {
            for rule in &handler.rules {
                if let RuleKind::Custom { program } = &rule.kind {
                    predicates.insert(program.as_str());
                }
            }
            for reply in &handler.replies {
                if let ReplyKind::Custom { program } = &reply.kind {
                    programs.insert(program.as_str());
                }
            }
        }
        (predicates, programs)
    }
}
