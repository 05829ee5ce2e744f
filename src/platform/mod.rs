//! Outbound calls: the platform API used for out-of-band sends and the
//! external endpoints behind forward replies.

pub mod forward;
pub mod wechat;

pub use forward::{ForwardError, Forwarder};
pub use wechat::{Credentials, WeChatApiClient};

use crate::reply::ReplyBody;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("account `{0}` has no platform credentials")]
    UnknownAccount(String),
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned HTTP {0}")]
    Status(u16),
    #[error("platform error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("token response carried no access_token")]
    MissingToken,
    #[error("send timed out")]
    Timeout,
}

/// Capability used by out-of-band reply sends.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn fetch_access_token(&self, account: &str) -> Result<String, SendError>;

    /// Sends `body` to `touser` through the customer-service message API.
    async fn send_direct_message(
        &self,
        account: &str,
        touser: &str,
        body: &ReplyBody,
    ) -> Result<(), SendError>;
}
