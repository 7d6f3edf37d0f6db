use std::sync::Arc;
use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::context::RequestContext;
use crate::message::OutboundContent;

/// What a handler tells the dispatcher to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    /// Proceed to the next handler with the context unchanged.
    Continue,
    /// This handler declined to act on this particular command; proceed.
    Skip,
    /// Abort the rest of the pipeline for this dispatch.
    Stop,
    /// Overwrite the context output and proceed.
    Replace(OutboundContent),
}

/// Failure taxonomy for handlers.
///
/// `Domain` is an expected, user-visible refusal (insufficient balance,
/// room not found); its message becomes the dispatch output and it is not
/// logged as a bug. Anything else is wrapped as `Internal` and logged in
/// full, with a generic per-handler failure message delivered instead.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Domain(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn domain(msg: impl Into<String>) -> Self {
        HandlerError::Domain(msg.into())
    }
}

/// A named unit of request-processing logic, invoked sequentially by the
/// dispatcher. Ordering constraints live in the dependency graph, not
/// here.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, ctx: &mut RequestContext) -> Result<Status, HandlerError>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<Status, HandlerError>>
        + Send
        + Sync,
{
    async fn run(&self, ctx: &mut RequestContext) -> Result<Status, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure into a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, Result<Status, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

/// Placeholder handler for lifecycle checkpoints.
pub struct NoopHandler;

#[async_trait]
impl Handler for NoopHandler {
    async fn run(&self, _ctx: &mut RequestContext) -> Result<Status, HandlerError> {
        Ok(Status::Continue)
    }
}
