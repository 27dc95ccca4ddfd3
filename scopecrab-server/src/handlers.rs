//! Responses for denied requests and for requests that could not be decided

use crate::error::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use scopecrab::RateLimitResult;

/// Builds the response for a request the limiter refused
pub trait DeniedHandler: Send + Sync {
    fn deny(&self, result: &RateLimitResult) -> Response;
}

/// Builds the response for a request that hit an error before a decision
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &Error) -> Response;
}

/// `429 Too Many Requests`
#[derive(Debug, Clone, Copy, Default)]
pub struct TooManyRequests;

impl DeniedHandler for TooManyRequests {
    fn deny(&self, _result: &RateLimitResult) -> Response {
        (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response()
    }
}

/// `503 Service Unavailable`; requests are never let through on error
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceUnavailable;

impl ErrorHandler for ServiceUnavailable {
    fn handle(&self, _error: &Error) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
    }
}

impl<F> DeniedHandler for F
where
    F: Fn(&RateLimitResult) -> Response + Send + Sync,
{
    fn deny(&self, result: &RateLimitResult) -> Response {
        self(result)
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&Error) -> Response + Send + Sync,
{
    fn handle(&self, error: &Error) -> Response {
        self(error)
    }
}
