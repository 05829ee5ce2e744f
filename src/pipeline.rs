//! End-to-end handling of one callback request.
//!
//! `Receive -> verify -> (GET: echo | POST: decode -> parse -> match ->
//! resolve -> render)`. Only account lookup and verification failures are
//! visible to the caller; everything after verification collapses to an
//! empty reply.

use crate::account::{Account, EncodingMode};
use crate::crypto::DecodeError;
use crate::handler::{HandleError, HandlerSet, RenderedReply, ReplyResolver};
use crate::message::parse_message;
use crate::registry::MessageContext;
use crate::security::{CallbackParams, SignatureVerifier, VerifyError};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Query parameters of a callback. All optional so that missing ones map to
/// a verification error instead of an extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
    pub msg_signature: Option<String>,
}

impl CallbackQuery {
    fn params(&self) -> Result<CallbackParams<'_>, VerifyError> {
        Ok(CallbackParams {
            signature: self
                .signature
                .as_deref()
                .ok_or(VerifyError::MissingParameter("signature"))?,
            timestamp: self
                .timestamp
                .as_deref()
                .ok_or(VerifyError::MissingParameter("timestamp"))?,
            nonce: self
                .nonce
                .as_deref()
                .ok_or(VerifyError::MissingParameter("nonce"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResponse {
    /// Unknown or non-interactable account.
    NotFound,
    BadRequest(VerifyError),
    /// Verification handshake challenge.
    Echo(String),
    /// No reply; answered with an empty 200.
    Empty,
    Reply(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
enum MessageError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Parse(#[from] crate::message::ParseError),
    #[error(transparent)]
    Handle(#[from] HandleError),
    #[error("reply encryption failed: {0}")]
    Encrypt(#[source] DecodeError),
}

/// Owns the accounts, the verifier (and its replay cache) and the resolver.
pub struct Pipeline {
    accounts: HashMap<String, Arc<Account>>,
    verifier: SignatureVerifier,
    resolver: ReplyResolver,
}

impl Pipeline {
    pub fn new(
        accounts: Vec<Account>,
        verifier: SignatureVerifier,
        resolver: ReplyResolver,
    ) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|account| (account.name.clone(), Arc::new(account)))
            .collect();
        Self {
            accounts,
            verifier,
            resolver,
        }
    }

    pub fn account(&self, name: &str) -> Option<&Arc<Account>> {
        self.accounts.get(name)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Arc<Account>> {
        self.accounts.values()
    }

    /// Swaps in new handler snapshots. Requests already in flight finish on
    /// the snapshot they started with. Returns the number of accounts updated.
    pub fn reload_handlers(&self, mut sets: HashMap<String, HandlerSet>) -> usize {
        let mut updated = 0;
        for (name, account) in &self.accounts {
            if let Some(handlers) = sets.remove(name) {
                account.replace_handlers(handlers);
                updated += 1;
            }
        }
        for name in sets.keys() {
            tracing::warn!(account = %name, "new account ignored until restart");
        }
        updated
    }

    fn interactable(&self, name: &str) -> Option<&Arc<Account>> {
        let account = self.accounts.get(name)?;
        if account.is_interactable() {
            Some(account)
        } else {
            tracing::warn!(account = name, "account is not interactable");
            None
        }
    }

    fn verify(&self, account: &Account, query: &CallbackQuery) -> Result<(), VerifyError> {
        let result = query
            .params()
            .and_then(|params| self.verifier.verify(account.token(), params));
        if let Err(err) = &result {
            tracing::debug!("rejected callback: {err}");
        }
        result
    }

    /// Platform verification handshake.
    pub fn handle_verify(&self, account: &str, query: &CallbackQuery) -> PipelineResponse {
        let Some(account) = self.interactable(account) else {
            return PipelineResponse::NotFound;
        };
        if let Err(err) = self.verify(account, query) {
            return PipelineResponse::BadRequest(err);
        }
        match &query.echostr {
            Some(echostr) => PipelineResponse::Echo(echostr.clone()),
            None => PipelineResponse::BadRequest(VerifyError::MissingParameter("echostr")),
        }
    }

    /// Inbound message push.
    pub async fn handle_message(
        &self,
        account: &str,
        query: &CallbackQuery,
        raw_query: &str,
        body: &[u8],
    ) -> PipelineResponse {
        let Some(account) = self.interactable(account) else {
            return PipelineResponse::NotFound;
        };
        if let Err(err) = self.verify(account, query) {
            return PipelineResponse::BadRequest(err);
        }

        match self.process(account, query, raw_query, body).await {
            Ok(Some(reply)) => PipelineResponse::Reply(reply),
            Ok(None) => PipelineResponse::Empty,
            Err(MessageError::Handle(err)) => {
                match &err {
                    HandleError::InvalidStrategy(_)
                    | HandleError::UnresolvableCustomProgram { .. }
                    | HandleError::ForwardEndpoint(_) => {
                        tracing::error!("reply resolution failed: {err}")
                    }
                    _ => tracing::warn!("reply resolution failed: {err}"),
                }
                PipelineResponse::Empty
            }
            Err(err) => {
                tracing::warn!("dropping message: {err}");
                PipelineResponse::Empty
            }
        }
    }

    fn decode(
        &self,
        account: &Account,
        query: &CallbackQuery,
        body: &[u8],
    ) -> Result<String, DecodeError> {
        match (account.encoding_mode, account.crypto()) {
            (EncodingMode::Safe, Some(crypto)) => {
                let msg_signature = query
                    .msg_signature
                    .as_deref()
                    .ok_or(DecodeError::MissingSignature)?;
                crypto.decrypt_message(
                    body,
                    msg_signature,
                    query.timestamp.as_deref().unwrap_or_default(),
                    query.nonce.as_deref().unwrap_or_default(),
                )
            }
            (EncodingMode::Safe, None) => Err(DecodeError::InvalidKey),
            (EncodingMode::Plain, _) => std::str::from_utf8(body)
                .map(ToOwned::to_owned)
                .map_err(|_| DecodeError::InvalidUtf8),
        }
    }

    async fn process(
        &self,
        account: &Account,
        query: &CallbackQuery,
        raw_query: &str,
        body: &[u8],
    ) -> Result<Option<Vec<u8>>, MessageError> {
        let plaintext = self.decode(account, query, body)?;
        let message = parse_message(&plaintext)?;
        let ctx = Arc::new(MessageContext {
            account: account.name.clone(),
            message,
            query: raw_query.to_string(),
            body: body.to_vec(),
        });

        let handlers = account.handlers();
        let Some(handler) = handlers.match_message(&ctx, self.resolver.registry(), Utc::now())
        else {
            tracing::debug!(kind = %ctx.message.kind(), "no handler matched");
            return Ok(None);
        };
        if handler.log_messages {
            tracing::info!(
                handler = %handler.name,
                kind = %ctx.message.kind(),
                from = %ctx.message.source,
                "message: {}",
                ctx.message.raw
            );
        } else {
            tracing::debug!(handler = %handler.name, "handler matched");
        }

        let resolution = self.resolver.resolve(handler, &ctx).await?;
        let Some(reply) = resolution.reply else {
            return Ok(None);
        };

        match (reply, account.crypto()) {
            (RenderedReply::Xml(xml), Some(crypto)) if account.encrypt_replies => {
                let timestamp = query.timestamp.as_deref().unwrap_or_default();
                let nonce = query.nonce.as_deref().unwrap_or_default();
                let envelope = crypto
                    .encrypt_message(&xml, timestamp, nonce)
                    .map_err(MessageError::Encrypt)?;
                Ok(Some(envelope.into_bytes()))
            }
            (reply, _) => Ok(Some(reply.into_bytes())),
        }
    }
}
