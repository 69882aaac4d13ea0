//! The gateway request service: snapshot pinning, plugin chain, upstream
//! forwarding.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::HOST;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::watch;
use tower::Service;
use tracing::{debug, info, warn};

use crate::wasm::{PluginEngine, PluginOutcome};

use super::router::{match_route, pick_endpoint, RouteError};
use super::snapshot::ActiveHandle;

/// Maximum time spent on one upstream exchange.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Flags cancellation to in-flight host calls when the request future is
/// dropped.
struct CancelGuard(watch::Sender<bool>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

/// Per-connection HTTP service for the data plane hot path.
#[derive(Clone)]
pub struct GatewayService {
    active: ActiveHandle,
    engine: Arc<PluginEngine>,
    client: Client<HttpConnector, Incoming>,
}

impl GatewayService {
    pub fn new(active: ActiveHandle, engine: Arc<PluginEngine>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { active, engine, client }
    }

    async fn handle(
        self,
        mut req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        // Pin the active snapshot for the whole request; a concurrent config
        // swap must not change what this request observes.
        let Some(active) = self.active.load_full() else {
            return error_response(StatusCode::NOT_FOUND, "no configuration");
        };

        let path = req.uri().path().to_string();
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string());

        let Some(route) = match_route(&active.snapshot, &path, host.as_deref()) else {
            debug!(path = %path, "No route matched");
            return error_response(StatusCode::NOT_FOUND, "no route");
        };

        if !route.plugins.is_empty() {
            let headers = collect_headers(&req);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let _guard = CancelGuard(cancel_tx);

            match self.engine.run_chain(&route.plugins, &headers, cancel_rx).await {
                Ok(PluginOutcome::Allow) => {}
                Ok(PluginOutcome::Deny { plugin, code }) => {
                    info!(path = %path, plugin = %plugin, code = code, "Request denied by plugin");
                    return error_response(StatusCode::FORBIDDEN, "denied");
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Plugin chain failed");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "plugin failure");
                }
            }
        }

        let endpoint = match pick_endpoint(&active, &route.cluster_id) {
            Ok(endpoint) => endpoint,
            Err(RouteError::EmptyCluster) | Err(RouteError::NoRoute) => {
                warn!(cluster = %route.cluster_id, "No usable endpoint");
                return error_response(StatusCode::BAD_GATEWAY, "no healthy upstream");
            }
        };

        let upstream_uri = match build_upstream_uri(&endpoint.address, endpoint.port, req.uri()) {
            Ok(uri) => uri,
            Err(message) => {
                warn!(error = %message, "Failed to build upstream URI");
                return error_response(StatusCode::BAD_GATEWAY, "invalid upstream");
            }
        };

        debug!(upstream = %upstream_uri, "Forwarding request");
        *req.uri_mut() = upstream_uri;

        match tokio::time::timeout(UPSTREAM_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Upstream request failed");
                error_response(StatusCode::BAD_GATEWAY, "upstream failure")
            }
            Err(_) => {
                warn!(timeout = ?UPSTREAM_TIMEOUT, "Upstream request timed out");
                error_response(StatusCode::BAD_GATEWAY, "upstream timeout")
            }
        }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

fn collect_headers(req: &Request<Incoming>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    headers
}

fn build_upstream_uri(
    address: &str,
    port: u32,
    original: &Uri,
) -> std::result::Result<Uri, String> {
    let path_and_query = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{}:{}{}", address, port, path_and_query)
        .parse()
        .map_err(|e| format!("{}", e))
}

fn error_response(
    status: StatusCode,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| Response::new(Empty::new().map_err(|never| match never {}).boxed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upstream_uri() {
        let original: Uri = "http://gateway.local/a/b?x=1".parse().unwrap();
        let uri = build_upstream_uri("10.0.0.1", 8080, &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/a/b?x=1");
    }

    #[test]
    fn test_build_upstream_uri_default_path() {
        let original: Uri = "/".parse().unwrap();
        let uri = build_upstream_uri("upstream", 80, &original).unwrap();
        assert_eq!(uri.to_string(), "http://upstream:80/");
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(StatusCode::FORBIDDEN, "denied");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
