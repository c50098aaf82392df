use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::RunnerError;
use crate::service::Service;
use crate::types::{ErrorKind, ExecutionRequest, Language};

/// Largest accepted request body (source code plus input).
const MAX_BODY_BYTES: usize = 1024 * 1024;

const SERVICE_NAME: &str = "code-execution-service";

#[derive(Clone)]
pub struct AppState {
    service: Service,
    api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(service: Service, api_key: Option<String>) -> Self {
        Self {
            service,
            api_key: api_key.map(Arc::from),
        }
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
}

pub fn router(state: AppState) -> Router {
    let execute = Router::new()
        .route("/python", post(execute_python))
        .route("/cpp", post(execute_cpp))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .nest("/execute", execute)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        service: SERVICE_NAME,
    })
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.service.stats().await).into_response()
}

async fn execute_python(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    execute(state, Language::Python, payload).await
}

async fn execute_cpp(
    State(state): State<AppState>,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    execute(state, Language::Cpp, payload).await
}

async fn execute(
    state: AppState,
    language: Language,
    payload: Result<Json<ExecutionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Bad Request",
                rejection.body_text(),
                None,
            );
        }
    };

    match state.service.execute(language, request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => runner_error_response(language, e),
    }
}

fn runner_error_response(language: Language, err: RunnerError) -> Response {
    match err {
        RunnerError::Validation(message) => {
            error_response(StatusCode::BAD_REQUEST, "Bad Request", message, None)
        }
        RunnerError::SandboxUnavailable(message) => {
            warn!(language = language.as_str(), error = %message, "no sandbox for request");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Service Unavailable",
                message,
                Some(ErrorKind::SandboxUnavailable),
            )
        }
        other => {
            error!(language = language.as_str(), error = %other, "execution failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                other.to_string(),
                Some(ErrorKind::RuntimeFault),
            )
        }
    }
}

fn error_response(
    status: StatusCode,
    error: &'static str,
    message: String,
    error_kind: Option<ErrorKind>,
) -> Response {
    let body = ErrorBody {
        error,
        message,
        error_kind,
    };
    (status, Json(body)).into_response()
}

/// Key sent by the caller, from `x-api-key` or a bearer token.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Compare without short-circuiting on the first differing byte.
fn keys_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    match presented_key(request.headers()) {
        Some(key) if keys_match(key, expected) => next.run(request).await,
        presented => {
            warn!(
                uri = %request.uri(),
                key_present = presented.is_some(),
                "rejected unauthenticated request"
            );
            error_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "Invalid or missing API key".into(),
                None,
            )
        }
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Method;
    use sandbox::ExecResult;
    use sandbox::testing::FakeRuntime;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::testutil::test_service;

    fn app(runtime: &Arc<FakeRuntime>, api_key: Option<&str>) -> Router {
        router(AppState::new(test_service(runtime), api_key.map(String::from)))
    }

    fn post_json(uri: &str, body: Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    /// Answer execs of `program` with `stdout`, everything else with nothing.
    fn answer(runtime: &FakeRuntime, program: &'static str, stdout: &'static str) {
        runtime.on_exec(move |call| {
            let out = if call.program() == program { stdout } else { "" };
            Ok(ExecResult {
                exit_code: 0,
                stdout: out.into(),
                stderr: String::new(),
            })
        });
    }

    #[tokio::test]
    async fn health_reports_service() {
        let runtime = Arc::new(FakeRuntime::new());
        let request = axum::http::Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(&runtime, Some("k")), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "service": "code-execution-service" }));
    }

    #[tokio::test]
    async fn stats_cover_both_pools_without_auth() {
        let runtime = Arc::new(FakeRuntime::new());
        let request = axum::http::Request::get("/stats").body(Body::empty()).unwrap();
        let (status, body) = send(app(&runtime, Some("k")), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["python"]["image"], "python-image");
        assert_eq!(body["cpp"]["poolSize"], 1);
        assert_eq!(body["cpp"]["initialized"], false);
    }

    #[tokio::test]
    async fn execute_python_round_trip() {
        let runtime = Arc::new(FakeRuntime::new());
        answer(&runtime, "python3", "4\n");
        let (status, body) = send(
            app(&runtime, None),
            post_json("/execute/python", json!({ "code": "print(2 + 2)" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "output": "4", "images": [] }));
    }

    #[tokio::test]
    async fn execute_cpp_round_trip() {
        let runtime = Arc::new(FakeRuntime::new());
        answer(&runtime, "sh", "5\n");
        let (status, body) = send(
            app(&runtime, None),
            post_json(
                "/execute/cpp",
                json!({ "code": "int main(){}", "input": "2 3" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"], "5");
        assert!(body.get("errorKind").is_none());
    }

    #[tokio::test]
    async fn missing_code_is_bad_request() {
        let runtime = Arc::new(FakeRuntime::new());
        let (status, body) =
            send(app(&runtime, None), post_json("/execute/python", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "No code provided");
        assert_eq!(runtime.started(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let runtime = Arc::new(FakeRuntime::new());
        let request = axum::http::Request::post("/execute/cpp")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(app(&runtime, None), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Bad Request");
    }

    #[tokio::test]
    async fn wrong_or_missing_key_is_rejected_before_runner() {
        let runtime = Arc::new(FakeRuntime::new());
        let body = json!({ "code": "print(1)" });

        let request = post_json("/execute/python", body.clone());
        let (status, _) = send(app(&runtime, Some("secret")), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut request = post_json("/execute/python", body);
        request
            .headers_mut()
            .insert("x-api-key", "wrong".parse().unwrap());
        let (status, body) = send(app(&runtime, Some("secret")), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
        assert_eq!(runtime.started(), 0);
    }

    #[tokio::test]
    async fn api_key_header_and_bearer_are_accepted() {
        let runtime = Arc::new(FakeRuntime::new());
        let body = json!({ "code": "print(1)" });

        let mut request = post_json("/execute/python", body.clone());
        request
            .headers_mut()
            .insert("x-api-key", "secret".parse().unwrap());
        let (status, _) = send(app(&runtime, Some("secret")), request).await;
        assert_eq!(status, StatusCode::OK);

        let mut request = post_json("/execute/python", body);
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        let (status, _) = send(app(&runtime, Some("secret")), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_is_service_unavailable() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_next_starts(10);
        let (status, body) = send(
            app(&runtime, None),
            post_json("/execute/cpp", json!({ "code": "int main(){}" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["errorKind"], "SandboxUnavailable");
    }

    #[test]
    fn key_comparison() {
        assert!(keys_match("abc", "abc"));
        assert!(!keys_match("abd", "abc"));
        assert!(!keys_match("ab", "abc"));
    }
}
