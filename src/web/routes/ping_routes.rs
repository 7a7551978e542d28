use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Path, Request, State},
    http::{StatusCode, header},
    routing::put,
};
use futures_util::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::db::enums::PingKind;
use crate::error::AppError;
use crate::lifecycle::NewPingRequest;
use crate::web::AppState;

async fn success_ping_handler(
    State(app_state): State<Arc<AppState>>,
    Path(check_id): Path<String>,
    request: Request,
) -> Result<StatusCode, AppError> {
    record(&app_state, &check_id, PingKind::Success, request).await
}

async fn start_ping_handler(
    State(app_state): State<Arc<AppState>>,
    Path(check_id): Path<String>,
    request: Request,
) -> Result<StatusCode, AppError> {
    record(&app_state, &check_id, PingKind::Start, request).await
}

async fn fail_ping_handler(
    State(app_state): State<Arc<AppState>>,
    Path(check_id): Path<String>,
    request: Request,
) -> Result<StatusCode, AppError> {
    record(&app_state, &check_id, PingKind::Fail, request).await
}

async fn record(
    app_state: &AppState,
    check_id: &str,
    kind: PingKind,
    request: Request,
) -> Result<StatusCode, AppError> {
    let check_id = Uuid::parse_str(check_id)
        .map_err(|_| AppError::Validation(format!("invalid check id: {check_id}")))?;

    let source = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = read_capped(request.into_body(), app_state.max_body_bytes).await?;

    debug!(%check_id, %kind, body_len = body.len(), "Ping received");
    app_state
        .recorder
        .record_ping(NewPingRequest {
            check_id,
            kind,
            source,
            user_agent,
            body,
        })
        .await?;
    Ok(StatusCode::OK)
}

/// Reads at most `limit` bytes; the rest of the body is dropped unread.
async fn read_capped(body: Body, limit: usize) -> Result<String, AppError> {
    let mut stream = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        let Some(chunk) = stream.next().await else {
            break;
        };
        let chunk = chunk.map_err(|e| AppError::Validation(format!("failed to read body: {e}")))?;
        let take = chunk.len().min(limit - buf.len());
        buf.extend_from_slice(&chunk[..take]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn create_ping_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{check_id}", put(success_ping_handler))
        .route("/{check_id}/start", put(start_ping_handler))
        .route("/{check_id}/fail", put(fail_ping_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::PingRecorder;
    use crate::web::create_router;
    use async_trait::async_trait;
    use axum::http::Method;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct MockRecorder {
        pings: Mutex<Vec<NewPingRequest>>,
        missing: bool,
    }

    #[async_trait]
    impl PingRecorder for MockRecorder {
        async fn record_ping(&self, request: NewPingRequest) -> Result<(), AppError> {
            if self.missing {
                return Err(AppError::NotExist("check not found".to_string()));
            }
            self.pings.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn app(recorder: Arc<MockRecorder>, max_body_bytes: usize) -> Router {
        create_router(Arc::new(AppState {
            recorder,
            max_body_bytes,
        }))
    }

    fn put_request(uri: &str, body: &str) -> Request {
        axum::http::Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(header::USER_AGENT, "curl/8.0")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn records_each_ping_kind() {
        let recorder = Arc::new(MockRecorder::default());
        let id = Uuid::new_v4();

        for (uri, kind) in [
            (format!("/pings/{id}"), PingKind::Success),
            (format!("/pings/{id}/start"), PingKind::Start),
            (format!("/v1/pings/{id}/fail"), PingKind::Fail),
        ] {
            let response = app(recorder.clone(), 300_000)
                .oneshot(put_request(&uri, "done"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let pings = recorder.pings.lock().unwrap();
            let last = pings.last().unwrap();
            assert_eq!(last.kind, kind);
            assert_eq!(last.check_id, id);
        }

        let pings = recorder.pings.lock().unwrap();
        assert_eq!(pings.len(), 3);
        assert_eq!(pings[0].user_agent, "curl/8.0");
        assert_eq!(pings[0].body, "done");
    }

    #[tokio::test]
    async fn source_comes_from_peer_address() {
        let recorder = Arc::new(MockRecorder::default());
        let mut request = put_request(&format!("/pings/{}", Uuid::new_v4()), "");
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = app(recorder.clone(), 300_000).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(recorder.pings.lock().unwrap()[0].source, "10.1.2.3");
    }

    #[tokio::test]
    async fn oversized_body_is_truncated() {
        let recorder = Arc::new(MockRecorder::default());
        let uri = format!("/pings/{}", Uuid::new_v4());
        let response = app(recorder.clone(), 4)
            .oneshot(put_request(&uri, "abcdefgh"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(recorder.pings.lock().unwrap()[0].body, "abcd");
    }

    #[tokio::test]
    async fn malformed_id_is_bad_request() {
        let recorder = Arc::new(MockRecorder::default());
        let response = app(recorder.clone(), 300_000)
            .oneshot(put_request("/pings/not-a-uuid", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("not-a-uuid"));
        assert!(recorder.pings.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_check_is_not_found() {
        let recorder = Arc::new(MockRecorder {
            missing: true,
            ..MockRecorder::default()
        });
        let response = app(recorder, 300_000)
            .oneshot(put_request(&format!("/pings/{}", Uuid::new_v4()), ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "check not found");
    }

    #[tokio::test]
    async fn only_put_is_routed() {
        let recorder = Arc::new(MockRecorder::default());
        let request = axum::http::Request::builder()
            .method(Method::GET)
            .uri(format!("/pings/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let response = app(recorder, 300_000).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
