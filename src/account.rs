use crate::crypto::WeChatCrypto;
use crate::handler::HandlerSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMode {
    #[default]
    Plain,
    /// Bodies arrive in an encrypted `<Encrypt>` envelope.
    Safe,
}

/// One configured official account and its current handler snapshot.
pub struct Account {
    pub name: String,
    pub appid: String,
    appsecret: String,
    token: String,
    pub encoding_mode: EncodingMode,
    crypto: Option<WeChatCrypto>,
    pub encrypt_replies: bool,
    handlers: RwLock<Arc<HandlerSet>>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("name", &self.name)
            .field("appid", &self.appid)
            .field("encoding_mode", &self.encoding_mode)
            .field("interactable", &self.is_interactable())
            .finish_non_exhaustive()
    }
}

impl Account {
    pub fn new(
        name: impl Into<String>,
        appid: impl Into<String>,
        appsecret: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            appid: appid.into(),
            appsecret: appsecret.into(),
            token: token.into(),
            encoding_mode: EncodingMode::Plain,
            crypto: None,
            encrypt_replies: false,
            handlers: RwLock::new(Arc::new(HandlerSet::default())),
        }
    }

    /// Switches the account to the encrypted envelope.
    pub fn with_safe_mode(mut self, crypto: Option<WeChatCrypto>, encrypt_replies: bool) -> Self {
        self.encoding_mode = EncodingMode::Safe;
        self.crypto = crypto;
        self.encrypt_replies = encrypt_replies;
        self
    }

    pub fn with_handlers(self, handlers: HandlerSet) -> Self {
        self.replace_handlers(handlers);
        self
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn appsecret(&self) -> &str {
        &self.appsecret
    }

    pub fn crypto(&self) -> Option<&WeChatCrypto> {
        self.crypto.as_ref()
    }

    /// Credentials present, plus an AES key when in safe mode.
    pub fn is_interactable(&self) -> bool {
        !self.appsecret.is_empty()
            && !self.token.is_empty()
            && (self.encoding_mode == EncodingMode::Plain || self.crypto.is_some())
    }

    pub fn handlers(&self) -> Arc<HandlerSet> {
        Arc::clone(&self.handlers.read())
    }

    pub fn replace_handlers(&self, handlers: HandlerSet) {
        *self.handlers.write() = Arc::new(handlers);
    }
}
