use super::{PlatformClient, SendError};
use crate::reply::{direct_message_payload, ReplyBody};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Tokens are refreshed this long before the platform expires them.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
const DEFAULT_TOKEN_TTL_SECS: i64 = 7200;
/// `invalid credential`, `invalid access_token`, `access_token expired`.
const STALE_TOKEN_CODES: &[i64] = &[40001, 40014, 42001];

#[derive(Debug, Clone)]
pub struct Credentials {
    pub appid: String,
    pub appsecret: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Platform API client with a per-account access-token cache.
pub struct WeChatApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: HashMap<String, Credentials>,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl WeChatApiClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: HashMap<String, Credentials>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn cached_token(&self, account: &str) -> Option<String> {
        let refresh_after = Utc::now() + ChronoDuration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        self.tokens
            .lock()
            .get(account)
            .filter(|cached| cached.expires_at > refresh_after)
            .map(|cached| cached.access_token.clone())
    }

    fn invalidate_token(&self, account: &str) {
        self.tokens.lock().remove(account);
    }
}

#[async_trait]
impl PlatformClient for WeChatApiClient {
    async fn fetch_access_token(&self, account: &str) -> Result<String, SendError> {
        if let Some(token) = self.cached_token(account) {
            return Ok(token);
        }

        let credentials = self
            .credentials
            .get(account)
            .ok_or_else(|| SendError::UnknownAccount(account.to_string()))?;

        let response = self
            .http
            .get(format!("{}/cgi-bin/token", self.base_url))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", credentials.appid.as_str()),
                ("secret", credentials.appsecret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SendError::Status(response.status().as_u16()));
        }

        let token: AccessTokenResponse = response.json().await?;
        if let Some(code) = token.errcode.filter(|code| *code != 0) {
            return Err(SendError::Api {
                code,
                message: token.errmsg.unwrap_or_default(),
            });
        }
        let access_token = token.access_token.ok_or(SendError::MissingToken)?;
        let expires_in = token.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        self.tokens.lock().insert(
            account.to_string(),
            CachedToken {
                access_token: access_token.clone(),
                expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
            },
        );
        tracing::debug!(account, expires_in, "refreshed platform access token");
        Ok(access_token)
    }

    async fn send_direct_message(
        &self,
        account: &str,
        touser: &str,
        body: &ReplyBody,
    ) -> Result<(), SendError> {
        let access_token = self.fetch_access_token(account).await?;
        let payload = direct_message_payload(body, touser);

        let response = self
            .http
            .post(format!("{}/cgi-bin/message/custom/send", self.base_url))
            .query(&[("access_token", access_token.as_str())])
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SendError::Status(response.status().as_u16()));
        }

        let status: ApiStatus = response.json().await?;
        if status.errcode != 0 {
            if STALE_TOKEN_CODES.contains(&status.errcode) {
                self.invalidate_token(account);
            }
            return Err(SendError::Api {
                code: status.errcode,
                message: status.errmsg,
            });
        }
        Ok(())
    }
}
