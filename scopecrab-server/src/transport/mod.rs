//! Network front ends of the admission service
//!
//! - [`http`]: axum server with the admission middleware in front of a
//!   forward-auth style fallback route

pub mod http;

use crate::middleware::Dispatcher;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for transport implementations
#[async_trait]
pub trait Transport {
    /// Bind, serve requests through `dispatcher` and return on shutdown
    async fn start(self, dispatcher: Arc<Dispatcher>) -> Result<()>;
}
