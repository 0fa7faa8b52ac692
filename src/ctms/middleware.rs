//! HTTP middleware for the relay client.

use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};
use std::time::Duration;
use tracing::{debug, trace, warn};

pub struct TransactionMiddleware;

/// Relay round trips slower than this are logged at `warn`.
const SLOW_REQUEST: Duration = Duration::from_secs(5);

#[async_trait::async_trait]
impl Middleware for TransactionMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> std::result::Result<Response, reqwest_middleware::Error> {
        let method = req.method().to_string();
        // The portal path travels in the `url` query parameter.
        let target = req
            .url()
            .query_pairs()
            .find(|(k, _)| k == "url")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| req.url().path().to_owned());

        trace!(method, target, "Relay request started");
        let start = std::time::Instant::now();

        let response_result = next.run(req, extensions).await;
        let duration = start.elapsed();

        match response_result {
            Ok(response) => {
                let status = response.status().as_u16();
                if duration > SLOW_REQUEST {
                    warn!(method, target, status, duration = ?duration, "Slow relay request");
                } else {
                    debug!(method, target, status, duration = ?duration, "Relay request");
                }
                Ok(response)
            }
            Err(error) => {
                warn!(method, target, duration = ?duration, error = ?error, "Relay request failed");
                Err(error)
            }
        }
    }
}
