//! Scripted capabilities for shell previews and tests.
//!
//! `ScriptedTransport` matches requests by method and URL path suffix and replays queued
//! replies in order. A reply can be held open with a gate so a test controls exactly when an
//! in-flight call completes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use super::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport};
use super::location::{LocationError, LocationProvider};
use crate::model::GeoPoint;

enum Reply {
    Ready(HttpResult),
    Gated(oneshot::Receiver<HttpResult>),
    Hang,
}

struct Route {
    method: HttpMethod,
    path_suffix: String,
    replies: VecDeque<Reply>,
    sticky: Option<HttpResult>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ok_json(status: u16, value: &serde_json::Value) -> HttpResult {
    let body = serde_json::to_vec(value).map_err(|e| HttpError::Serialization {
        message: e.to_string(),
    })?;
    Ok(HttpResponse::new(status, body, "scripted".into(), 0))
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: HttpMethod, path_suffix: &str, reply: Reply) {
        let mut routes = lock(&self.routes);
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.path_suffix == path_suffix)
        {
            route.replies.push_back(reply);
            return;
        }
        routes.push(Route {
            method,
            path_suffix: path_suffix.to_string(),
            replies: VecDeque::from([reply]),
            sticky: None,
        });
    }

    /// Queues one JSON reply with the given status.
    pub fn reply_json(
        &self,
        method: HttpMethod,
        path_suffix: &str,
        status: u16,
        body: serde_json::Value,
    ) {
        self.push(method, path_suffix, Reply::Ready(ok_json(status, &body)));
    }

    pub fn reply_raw(&self, method: HttpMethod, path_suffix: &str, status: u16, body: Vec<u8>) {
        let response = HttpResponse::new(status, body, "scripted".into(), 0);
        self.push(method, path_suffix, Reply::Ready(Ok(response)));
    }

    pub fn reply_error(&self, method: HttpMethod, path_suffix: &str, error: HttpError) {
        self.push(method, path_suffix, Reply::Ready(Err(error)));
    }

    /// Queues a reply that never completes; the caller's timeout decides the outcome.
    pub fn reply_hang(&self, method: HttpMethod, path_suffix: &str) {
        self.push(method, path_suffix, Reply::Hang);
    }

    /// Queues a reply that completes when the returned sender fires.
    pub fn reply_gated(&self, method: HttpMethod, path_suffix: &str) -> oneshot::Sender<HttpResult> {
        let (tx, rx) = oneshot::channel();
        self.push(method, path_suffix, Reply::Gated(rx));
        tx
    }

    /// Answers every request on this route with the same JSON once queued replies run out.
    pub fn always_json(
        &self,
        method: HttpMethod,
        path_suffix: &str,
        status: u16,
        body: serde_json::Value,
    ) {
        let mut routes = lock(&self.routes);
        let sticky = Some(ok_json(status, &body));
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.path_suffix == path_suffix)
        {
            route.sticky = sticky;
            return;
        }
        routes.push(Route {
            method,
            path_suffix: path_suffix.to_string(),
            replies: VecDeque::new(),
            sticky,
        });
    }

    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    #[must_use]
    pub fn count(&self, method: HttpMethod, path_suffix: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method() == method && r.path().ends_with(path_suffix))
            .count()
    }

    fn next_reply(&self, request: &HttpRequest) -> Reply {
        let path = request.path();
        let mut routes = lock(&self.routes);
        let route = routes
            .iter_mut()
            .filter(|r| r.method == request.method() && path.ends_with(&r.path_suffix))
            .max_by_key(|r| r.path_suffix.len());

        match route {
            Some(route) => match route.replies.pop_front() {
                Some(reply) => reply,
                None => match &route.sticky {
                    Some(result) => Reply::Ready(result.clone()),
                    None => Reply::Ready(Err(unscripted(request))),
                },
            },
            None => Reply::Ready(Err(unscripted(request))),
        }
    }
}

fn unscripted(request: &HttpRequest) -> HttpError {
    HttpError::HttpStatus {
        status: 404,
        message: format!("no scripted reply for {} {}", request.method().as_str(), request.path()),
        request_id: request.request_id().to_string(),
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let reply = self.next_reply(&request);
        lock(&self.requests).push(request.clone());

        match reply {
            Reply::Ready(result) => result,
            Reply::Gated(rx) => rx.await.unwrap_or_else(|_| {
                Err(HttpError::Connection {
                    host: "scripted".into(),
                    message: "gate dropped".into(),
                })
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Device location stub returning a fixed outcome.
pub struct FixedLocation(pub Result<GeoPoint, LocationError>);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_position(&self) -> Result<GeoPoint, LocationError> {
        self.0.clone()
    }
}
