use reqwest::Url;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("invalid forward url `{0}`")]
    InvalidUrl(String),
    #[error("forward request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forward endpoint {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Parses and checks a forward target. Only http(s) endpoints are accepted.
pub fn parse_forward_url(raw: &str) -> Result<Url, ForwardError> {
    let url = Url::parse(raw.trim()).map_err(|_| ForwardError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ForwardError::InvalidUrl(raw.to_string())),
    }
}

/// Relays raw inbound messages to external endpoints.
#[derive(Debug, Clone)]
pub struct Forwarder {
    http: reqwest::Client,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// POSTs `body` to `url` with the inbound `query` appended and returns
    /// the response body verbatim. Any non-2xx status is an error.
    pub async fn forward(
        &self,
        url: &str,
        query: &str,
        body: &[u8],
    ) -> Result<Vec<u8>, ForwardError> {
        let mut target = parse_forward_url(url)?;
        let query = query.trim_start_matches('?');
        if !query.is_empty() {
            let merged = match target.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                _ => query.to_string(),
            };
            target.set_query(Some(&merged));
        }

        let response = self
            .http
            .post(target)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(body.to_vec())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder() -> Forwarder {
        Forwarder::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn returns_endpoint_body_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(query_param("signature", "abc"))
            .and(query_param("nonce", "n"))
            .and(query_param("keep", "1"))
            .and(body_bytes(b"<xml>raw</xml>".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_string("B"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/hook?keep=1", server.uri());
        let bytes = forwarder()
            .forward(&url, "signature=abc&nonce=n", b"<xml>raw</xml>")
            .await
            .unwrap();
        assert_eq!(bytes, b"B");
    }

    #[tokio::test]
    async fn error_status_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = forwarder()
            .forward(&format!("{}/missing", server.uri()), "", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Status { status: 404, .. }));
    }

    #[test]
    fn only_http_urls_are_accepted() {
        assert!(parse_forward_url("https://example.com/x").is_ok());
        assert!(parse_forward_url("ftp://example.com/x").is_err());
        assert!(parse_forward_url("not a url").is_err());
    }
}
