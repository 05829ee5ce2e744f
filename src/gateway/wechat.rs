use super::AppState;
use crate::pipeline::{CallbackQuery, PipelineResponse};
use axum::{
    body::Bytes,
    extract::{Path, Query, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::Instrument;

impl IntoResponse for PipelineResponse {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad request").into_response(),
            Self::Echo(echostr) => (StatusCode::OK, echostr).into_response(),
            Self::Empty => (StatusCode::OK, "").into_response(),
            Self::Reply(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
                bytes,
            )
                .into_response(),
        }
    }
}

fn request_span(account: &str) -> tracing::Span {
    tracing::info_span!(
        "callback",
        account = %account,
        request_id = %uuid::Uuid::new_v4()
    )
}

pub(super) async fn handle_verify(
    State(state): State<AppState>,
    Path(account): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    request_span(&account).in_scope(|| {
        state
            .pipeline
            .handle_verify(&account, &query)
            .into_response()
    })
}

pub(super) async fn handle_message(
    State(state): State<AppState>,
    Path(account): Path<String>,
    Query(query): Query<CallbackQuery>,
    RawQuery(raw_query): RawQuery,
    body: Bytes,
) -> Response {
    let span = request_span(&account);
    let raw_query = raw_query.unwrap_or_default();
    state
        .pipeline
        .handle_message(&account, &query, &raw_query, &body)
        .instrument(span)
        .await
        .into_response()
}

#[cfg(test)]
mod tests {
    use crate::config::GatewayConfig;
    use crate::gateway::{router, AppState};
    use crate::pipeline::tests::{pipeline, plain_account, signed_query, text_push};
    use crate::pipeline::CallbackQuery;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let state = AppState {
            pipeline: Arc::new(pipeline(vec![plain_account()])),
        };
        router(state, &GatewayConfig::default())
    }

    fn query_string(query: &CallbackQuery) -> String {
        let mut pairs = vec![
            format!("signature={}", query.signature.as_deref().unwrap_or_default()),
            format!("timestamp={}", query.timestamp.as_deref().unwrap_or_default()),
            format!("nonce={}", query.nonce.as_deref().unwrap_or_default()),
        ];
        if let Some(echostr) = &query.echostr {
            pairs.push(format!("echostr={echostr}"));
        }
        pairs.join("&")
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn post(uri: String, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "text/xml")
            .header("content-length", body.len())
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn tampered_signature_is_bad_request() {
        let mut query = signed_query("n1");
        let mut signature = query.signature.take().unwrap();
        let flipped = if signature.starts_with('a') { "b" } else { "a" };
        signature.replace_range(0..1, flipped);
        query.signature = Some(signature);

        let (status, _) = send(
            app(),
            post(format!("/main/?{}", query_string(&query)), text_push("hello")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unmatched_message_is_empty_ok() {
        let query = signed_query("n1");
        let (status, body) = send(
            app(),
            post(format!("/main/?{}", query_string(&query)), text_push("nothing here")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn matching_message_gets_xml_reply() {
        let query = signed_query("n1");
        let (status, body) = send(
            app(),
            post(format!("/main?{}", query_string(&query)), text_push("hello")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<Content><![CDATA[world]]></Content>"));
        assert!(body.contains("<ToUserName><![CDATA[openid]]></ToUserName>"));
    }

    #[tokio::test]
    async fn handshake_echoes_echostr() {
        let mut query = signed_query("n1");
        query.echostr = Some("XYZ".into());
        let request = Request::builder()
            .uri(format!("/main/?{}", query_string(&query)))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "XYZ");
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let query = signed_query("n1");
        let (status, _) = send(
            app(),
            post(format!("/nobody/?{}", query_string(&query)), text_push("hello")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_probe() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = AppState {
            pipeline: Arc::new(pipeline(vec![plain_account()])),
        };
        let config = GatewayConfig {
            max_body_bytes: 16,
            ..GatewayConfig::default()
        };
        let query = signed_query("n1");
        let (status, _) = send(
            router(state, &config),
            post(format!("/main/?{}", query_string(&query)), text_push("hello")),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
