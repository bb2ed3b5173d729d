//! # Request Metrics Middleware
//!
//! Times every HTTP request and records it against its endpoint in
//! `AppState`.
//!
//! ## Endpoint keys:
//! Requests are keyed by method and route template (`"GET /api/v1/voice/status"`),
//! falling back to the raw path for unmatched routes. WebSocket upgrades are
//! counted but not timed: their "duration" is the lifetime of the socket and
//! would swamp the averages.
//!
//! ## Rust Concepts:
//! - **Transform**: the factory actix calls once per worker to wrap a service
//! - **Service**: the per-request part; `call` returns a boxed future
//! - **LocalBoxFuture**: actix workers are single threaded, so the future
//!   doesn't need to be `Send`

use std::future::{ready, Ready};
use std::time::Instant;

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;

use crate::state::AppState;

/// Paths whose timings are not recorded
const UNTIMED_PREFIXES: &[&str] = &["/ws/"];

pub struct RequestMetrics;

impl<S, B> Transform<S, ServiceRequest> for RequestMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestMetricsService { service }))
    }
}

pub struct RequestMetricsService<S> {
    service: S,
}

/// `"{METHOD} {route}"`, preferring the matched route template so that
/// path parameters don't create one entry per value.
fn endpoint_key(req: &ServiceRequest) -> String {
    let route = req
        .match_pattern()
        .unwrap_or_else(|| req.path().to_string());
    format!("{} {}", req.method(), route)
}

impl<S, B> Service<ServiceRequest> for RequestMetricsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let endpoint = endpoint_key(&req);
        let timed = !UNTIMED_PREFIXES.iter().any(|p| req.path().starts_with(p));

        // Clone the handle up front; an `Err` result carries no request
        let state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(state) = &state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;

            if let Some(state) = state {
                let is_error = match &result {
                    Ok(response) => {
                        response.status().is_client_error() || response.status().is_server_error()
                    }
                    Err(_) => true,
                };
                if is_error {
                    state.increment_error_count();
                }
                if timed {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    state.record_endpoint_request(&endpoint, duration_ms, is_error);
                }
            }

            result
        })
    }
}
