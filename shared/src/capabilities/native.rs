use async_trait::async_trait;
use std::time::Instant;

use super::http::{HttpError, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport};

/// `reqwest`-backed transport for shells that let the core own networking.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_error(err: reqwest::Error, request: &HttpRequest) -> HttpError {
    if err.is_timeout() {
        return HttpError::Timeout {
            timeout_ms: u64::try_from(request.timeout().as_millis()).unwrap_or(u64::MAX),
            request_id: request.request_id().to_string(),
        };
    }
    let host = reqwest::Url::parse(request.url())
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default();
    HttpError::Connection {
        host,
        // reqwest's message embeds the full URL, query string included
        message: err.without_url().to_string(),
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let started = Instant::now();
        let method = match request.method() {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, request.url())
            .timeout(request.timeout());
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_error(e, &request))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_error(e, &request))?;

        Ok(HttpResponse::new(
            status,
            body.to_vec(),
            request.request_id().to_string(),
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        ))
    }
}
