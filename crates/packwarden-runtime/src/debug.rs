//! Debug HTTP server on a Unix domain socket
//!
//! Routes:
//! - `GET /packages/dump`
//! - `GET /packages/queues/dump`
//! - `GET /packages/scheduler/dump`
//! - `GET /packages/render/:name`

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::operator::Operator;

pub const DEFAULT_SOCKET: &str = "/tmp/deckhouse-debug.socket";

const YAML: &str = "application/yaml";

pub fn router(operator: Arc<Operator>) -> Router {
    Router::new()
        .route("/packages/dump", get(packages_dump))
        .route("/packages/queues/dump", get(queues_dump))
        .route("/packages/scheduler/dump", get(scheduler_dump))
        .route("/packages/render/:name", get(render))
        .with_state(operator)
}

async fn packages_dump(State(operator): State<Arc<Operator>>) -> Response {
    yaml(operator.packages_dump())
}

async fn queues_dump(State(operator): State<Arc<Operator>>) -> Response {
    yaml(operator.queues_dump())
}

async fn scheduler_dump(State(operator): State<Arc<Operator>>) -> Response {
    yaml(operator.scheduler_dump())
}

async fn render(State(operator): State<Arc<Operator>>, UrlPath(name): UrlPath<String>) -> Response {
    match operator.render(&name).await {
        Ok(manifests) => ([(header::CONTENT_TYPE, YAML)], manifests).into_response(),
        Err(e) if e.is_not_helm() => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(e @ RuntimeError::PackageNotFound(_)) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn yaml(result: Result<String>) -> Response {
    match result {
        Ok(body) => ([(header::CONTENT_TYPE, YAML)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Bind the socket, replacing a stale socket file
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    UnixListener::bind(path)
        .map_err(|e| RuntimeError::Server(format!("bind {}: {}", path.display(), e)))
}

/// Accept connections until cancelled, then remove the socket file
pub async fn serve(
    listener: UnixListener,
    path: &Path,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(socket = %path.display(), "debug server listening");

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept debug connection");
                    continue;
                }
            },
        };

        let app = router.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = TowerToHyperService::new(app);
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "debug connection error");
            }
        });
    }

    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!(error = %e, "failed to remove debug socket");
    }
    tracing::info!("debug server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalValues;
    use crate::manager::ManagerServices;
    use crate::operator::OperatorConfig;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use packwarden_kube::{
        HelmService, MockHelmClient, MockHookExecutor, MockKubeEventsManager, MockResourceChecker,
        RecordingPatcher, ScheduleManager,
    };
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    fn operator(tmp: &TempDir) -> Arc<Operator> {
        let services = ManagerServices {
            helm: Arc::new(HelmService::new(
                Arc::new(MockHelmClient::new()),
                Arc::new(MockResourceChecker::new()),
                tmp.path().join("tmp"),
                Duration::from_secs(60),
            )),
            executor: Arc::new(MockHookExecutor::new()),
            patcher: Arc::new(RecordingPatcher::new()),
            events: Arc::new(MockKubeEventsManager::new()),
            schedules: Arc::new(ScheduleManager::new()),
            global: Arc::new(GlobalValues::default()),
        };
        Arc::new(Operator::new(services, OperatorConfig::default()))
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_dump_routes() {
        let tmp = TempDir::new().unwrap();
        let router = router(operator(&tmp));

        let (status, body) = get(router.clone(), "/packages/scheduler/dump").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("global"));

        let (status, _) = get(router.clone(), "/packages/queues/dump").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get(router.clone(), "/packages/dump").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(router, "/packages/render/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_over_socket() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("debug.socket");
        std::fs::write(&path, "stale").unwrap();

        let listener = bind(&path).unwrap();
        let cancel = CancellationToken::new();
        let server = {
            let path = path.clone();
            let router = router(operator(&tmp));
            let cancel = cancel.clone();
            tokio::spawn(async move { serve(listener, &path, router, cancel).await })
        };

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"GET /packages/scheduler/dump HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("application/yaml"));

        cancel.cancel();
        server.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
