use std::time::Instant;

use axum::http;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

tokio::task_local! {
    /// Correlation id of the repository run the current task belongs to.
    pub static CORRELATION_ID: String;
}

/// The current run's correlation id, or a fresh one outside of a run.
pub fn current_correlation_id() -> String {
    CORRELATION_ID
        .try_with(Clone::clone)
        .unwrap_or_else(|_| Uuid::new_v4().to_string())
}

/// Logs every outgoing request and tags it with a correlation id.
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
            Some(existing) => existing.to_str().unwrap_or_default().to_string(),
            None => {
                let id = current_correlation_id();
                if let Ok(value) = id.parse() {
                    req.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                id
            }
        };

        let method = req.method().clone();
        let path = req.url().path().to_string();
        let started = Instant::now();

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => debug!(
                correlation_id = %correlation_id,
                "{} {} -> {} in {:?}",
                method,
                path,
                resp.status(),
                started.elapsed()
            ),
            Err(err) => warn!(
                correlation_id = %correlation_id,
                "{} {} failed after {:?}: {}",
                method,
                path,
                started.elapsed(),
                err
            ),
        }

        response
    }
}
