//! In-process remote cluster for push tests.
//!
//! Accepts any path, records every request and behaves like a minimal
//! artifact store:
//! - `PUT` stores the body under the path (201)
//! - `HEAD`/`GET` answer 200 with an `X-Checksum-Sha256` header for stored
//!   paths, 404 otherwise
//! - `DELETE` removes a stored path (204) or answers 404
//! - `POST .../blobs/uploads/` opens an upload session (202 + `Location`)
//! - `PUT` on a session with `?digest=` stores the blob under `.../blobs/{digest}`
//! - any other `POST` stores the raw body (201)
//!
//! Individual method/path pairs can be forced to answer a fixed status.

use artifact_replication::local_data::sha256_hex;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One request as the remote saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    stored: Arc<Mutex<HashMap<String, Bytes>>>,
    overrides: Arc<Mutex<HashMap<(String, String), u16>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    sessions: Arc<AtomicUsize>,
}

pub struct MockRemote {
    pub url: String,
    state: MockState,
    handle: tokio::task::JoinHandle<()>,
}

impl MockRemote {
    pub async fn start() -> Self {
        let state = MockState::default();
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{}", addr),
            state,
            handle,
        }
    }

    /// Always answer `status` for `method path`.
    pub fn respond_with(&self, method: &str, path: &str, status: u16) {
        self.state
            .overrides
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), status);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// `METHOD path` of every request, in arrival order.
    pub fn request_lines(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    pub fn stored(&self, path: &str) -> Option<Bytes> {
        self.state.stored.lock().unwrap().get(path).cloned()
    }

    pub fn store(&self, path: &str, body: impl Into<Bytes>) {
        self.state.stored.lock().unwrap().insert(path.to_string(), body.into());
    }
}

impl Drop for MockRemote {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

async fn handle(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().map(|q| q.to_string());
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string());

    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        query: query.clone(),
        authorization: header("authorization"),
        content_type: header("content-type"),
        body: body.clone(),
    });

    let delay = *state.delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let forced = state
        .overrides
        .lock()
        .unwrap()
        .get(&(method.to_string(), path.clone()))
        .copied();
    if let Some(status) = forced {
        let code = StatusCode::from_u16(status).unwrap();
        return (code, format!("forced {}", status)).into_response();
    }

    let mut stored = state.stored.lock().unwrap();
    match method {
        Method::PUT => {
            let digest = query_param(query.as_deref(), "digest");
            match (path.split_once("/blobs/uploads/"), digest) {
                (Some((prefix, _)), Some(digest)) => {
                    let digest = digest.replace("%3A", ":");
                    stored.insert(format!("{}/blobs/{}", prefix, digest), body);
                }
                _ => {
                    stored.insert(path, body);
                }
            }
            StatusCode::CREATED.into_response()
        }
        Method::POST if path.ends_with("/blobs/uploads/") => {
            let n = state.sessions.fetch_add(1, Ordering::SeqCst);
            let location = format!("{}session-{}", path, n);
            let mut response = StatusCode::ACCEPTED.into_response();
            response
                .headers_mut()
                .insert("location", HeaderValue::from_str(&location).unwrap());
            response
        }
        Method::POST => {
            stored.insert(path, body);
            StatusCode::CREATED.into_response()
        }
        Method::HEAD => match stored.get(&path) {
            Some(body) => (StatusCode::OK, [("x-checksum-sha256", sha256_hex(body))]).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::GET => match stored.get(&path) {
            Some(body) => (
                StatusCode::OK,
                [("x-checksum-sha256", sha256_hex(body))],
                body.clone(),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::DELETE => match stored.remove(&path) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
