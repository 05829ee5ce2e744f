//! Named custom predicates and programs that rules and replies refer to.
//!
//! Entries are registered once at startup and looked up by name per message.
//! Each entry carries an account scope; lookups from accounts outside it are
//! refused.

use crate::message::InboundMessage;
use crate::reply::ReplyBody;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Everything a predicate or program can see about the current request.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Configured account name (the `/<account>/` path segment).
    pub account: String,
    pub message: InboundMessage,
    /// Raw query string of the inbound request, without the leading `?`.
    pub query: String,
    /// Request body exactly as received, before decryption.
    pub body: Vec<u8>,
}

/// Which accounts may use a registered entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AccountScope {
    #[default]
    All,
    Only(HashSet<String>),
}

impl AccountScope {
    pub fn only<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(accounts.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, account: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(accounts) => accounts.contains(account),
        }
    }
}

/// Value returned by a custom program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramOutput {
    Reply(ReplyBody),
    /// Shorthand for a text reply. Empty text means no reply.
    Text(String),
    Empty,
}

impl ProgramOutput {
    pub fn into_reply(self) -> Option<ReplyBody> {
        match self {
            Self::Reply(body) if !body.is_empty() => Some(body),
            Self::Text(text) if !text.is_empty() => Some(ReplyBody::Text { content: text }),
            _ => None,
        }
    }
}

impl From<ReplyBody> for ProgramOutput {
    fn from(body: ReplyBody) -> Self {
        Self::Reply(body)
    }
}

impl From<String> for ProgramOutput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ProgramOutput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Option<ReplyBody>> for ProgramOutput {
    fn from(body: Option<ReplyBody>) -> Self {
        body.map_or(Self::Empty, Self::Reply)
    }
}

#[async_trait]
pub trait MessageProgram: Send + Sync {
    async fn run(&self, ctx: &MessageContext) -> anyhow::Result<ProgramOutput>;
}

struct FnProgram<F>(F);

#[async_trait]
impl<F> MessageProgram for FnProgram<F>
where
    F: Fn(&MessageContext) -> anyhow::Result<ProgramOutput> + Send + Sync,
{
    async fn run(&self, ctx: &MessageContext) -> anyhow::Result<ProgramOutput> {
        (self.0)(ctx)
    }
}

pub type Predicate = Arc<dyn Fn(&MessageContext) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no entry named `{0}` is registered")]
    Unknown(String),
    #[error("`{name}` is not available to account `{account}`")]
    OutOfScope { name: String, account: String },
}

struct Entry<T> {
    scope: AccountScope,
    value: T,
}

impl<T> Entry<T> {
    fn lookup(&self, name: &str, account: &str) -> Result<&T, LookupError> {
        if self.scope.allows(account) {
            Ok(&self.value)
        } else {
            Err(LookupError::OutOfScope {
                name: name.to_string(),
                account: account.to_string(),
            })
        }
    }
}

#[derive(Default)]
pub struct Registry {
    predicates: HashMap<String, Entry<Predicate>>,
    programs: HashMap<String, Entry<Arc<dyn MessageProgram>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut predicates: Vec<_> = self.predicates.keys().collect();
        let mut programs: Vec<_> = self.programs.keys().collect();
        predicates.sort();
        programs.sort();
        f.debug_struct("Registry")
            .field("predicates", &predicates)
            .field("programs", &programs)
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_predicate<F>(
        &mut self,
        name: impl Into<String>,
        scope: AccountScope,
        predicate: F,
    ) where
        F: Fn(&MessageContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.predicates.insert(
            name.into(),
            Entry {
                scope,
                value: Arc::new(predicate),
            },
        );
    }

    pub fn register_program(
        &mut self,
        name: impl Into<String>,
        scope: AccountScope,
        program: Arc<dyn MessageProgram>,
    ) {
        self.programs.insert(name.into(), Entry { scope, value: program });
    }

    /// Registers a synchronous function as a program.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, scope: AccountScope, program: F)
    where
        F: Fn(&MessageContext) -> anyhow::Result<ProgramOutput> + Send + Sync + 'static,
    {
        self.register_program(name, scope, Arc::new(FnProgram(program)));
    }

    pub fn predicate(&self, name: &str, account: &str) -> Result<&Predicate, LookupError> {
        self.predicates
            .get(name)
            .ok_or_else(|| LookupError::Unknown(name.to_string()))?
            .lookup(name, account)
    }

    pub fn program(
        &self,
        name: &str,
        account: &str,
    ) -> Result<Arc<dyn MessageProgram>, LookupError> {
        self.programs
            .get(name)
            .ok_or_else(|| LookupError::Unknown(name.to_string()))?
            .lookup(name, account)
            .cloned()
    }

    pub fn has_predicate(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }
}

/// Sample program shipped with the binary.
pub fn greeting(ctx: &MessageContext) -> anyhow::Result<ProgramOutput> {
    Ok(ProgramOutput::Text(format!(
        "hello, {}! we received a {} message.",
        ctx.message.source,
        ctx.message.kind()
    )))
}
