// src/dispatch.rs

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::context::RequestContext;
use crate::graph::{DependencyGraph, GraphError};
use crate::handler::{HandlerError, Status};
use crate::message::OutboundContent;
use crate::output::{Destination, OutputSender};

/// One record per executed handler, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HandlerRecord {
    pub handler: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub outcome: HandlerOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub enum HandlerOutcome {
    Continued,
    Skipped,
    Replaced,
    Stopped,
    DomainError(String),
    Failed(String),
}

/// What one dispatch did, handler by handler.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DispatchReport {
    pub records: Vec<HandlerRecord>,
    /// Set when the pipeline stopped early, to the responsible handler.
    pub stopped_by: Option<String>,
    /// total elapsed wall time
    pub total_ms: i64,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Executes the ordered handler sequence for one inbound event at a time.
///
/// Every failure inside a handler is converted into a user-visible
/// message plus a `false` return; the only error callers see is a graph
/// build failure, which is a configuration defect rather than a runtime
/// one.
#[derive(Clone)]
pub struct Dispatcher {
    graph: Arc<Mutex<DependencyGraph>>,
    sender: OutputSender,
}

impl Dispatcher {
    pub fn new(graph: Arc<Mutex<DependencyGraph>>, sender: OutputSender) -> Self {
        Self { graph, sender }
    }

    pub fn sender(&self) -> &OutputSender {
        &self.sender
    }

    /// Run the pipeline for `ctx`. Returns `Ok(true)` when every handler
    /// ran to completion, `Ok(false)` when the dispatch short-circuited
    /// (stop, failure or cancellation).
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<bool, DispatchError> {
        let (delivered, _report) = self.dispatch_reporting(ctx).await?;
        Ok(delivered)
    }

    /// Same as [`dispatch`](Self::dispatch), also returning the
    /// per-handler records of this run.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn dispatch_reporting(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<(bool, DispatchReport), DispatchError> {
        let order = { self.graph.lock().unwrap().build()? };

        let run_start = Utc::now();
        let mut records: Vec<HandlerRecord> = Vec::new();

        if order.is_empty() {
            return Ok((false, Self::report(records, None, run_start)));
        }

        let original = ctx.output().clone();
        let destination = Destination::for_message(ctx.message());

        for (name, handler) in order {
            if ctx.is_cancelled() {
                info!(handler = %name, "dispatch cancelled before handler");
                return Ok((false, Self::report(records, Some(name), run_start)));
            }

            let started = Utc::now();
            let result = handler.run(ctx).await;
            let finished = Utc::now();
            debug!(
                handler = %name,
                elapsed_ms = (finished - started).num_milliseconds(),
                "handler finished"
            );

            let outcome = match result {
                Ok(Status::Continue) => HandlerOutcome::Continued,
                Ok(Status::Skip) => HandlerOutcome::Skipped,
                Ok(Status::Replace(content)) => {
                    ctx.set_output(content);
                    HandlerOutcome::Replaced
                }
                Ok(Status::Stop) => {
                    records.push(HandlerRecord {
                        handler: name.clone(),
                        started,
                        finished,
                        outcome: HandlerOutcome::Stopped,
                    });
                    self.flush_if_changed(&destination, ctx, &original).await;
                    return Ok((false, Self::report(records, Some(name), run_start)));
                }
                Err(HandlerError::Domain(msg)) => {
                    records.push(HandlerRecord {
                        handler: name.clone(),
                        started,
                        finished,
                        outcome: HandlerOutcome::DomainError(msg.clone()),
                    });
                    ctx.set_output(OutboundContent::text(msg));
                    self.sender.deliver(&destination, ctx.output()).await;
                    return Ok((false, Self::report(records, Some(name), run_start)));
                }
                Err(HandlerError::Internal(err)) => {
                    error!("handler `{}` failed: {:#}", name, err);
                    records.push(HandlerRecord {
                        handler: name.clone(),
                        started,
                        finished,
                        outcome: HandlerOutcome::Failed(format!("{err:#}")),
                    });
                    ctx.set_output(OutboundContent::text(format!(
                        "handler {} failed: {}",
                        name, err
                    )));
                    self.sender.deliver(&destination, ctx.output()).await;
                    return Ok((false, Self::report(records, Some(name), run_start)));
                }
            };

            records.push(HandlerRecord {
                handler: name,
                started,
                finished,
                outcome,
            });
        }

        self.flush_if_changed(&destination, ctx, &original).await;
        Ok((true, Self::report(records, None, run_start)))
    }

    async fn flush_if_changed(
        &self,
        destination: &Destination,
        ctx: &RequestContext,
        original: &OutboundContent,
    ) {
        if ctx.output() != original {
            self.sender.deliver(destination, ctx.output()).await;
        }
    }

    fn report(
        records: Vec<HandlerRecord>,
        stopped_by: Option<String>,
        run_start: DateTime<Utc>,
    ) -> DispatchReport {
        DispatchReport {
            records,
            stopped_by,
            total_ms: (Utc::now() - run_start).num_milliseconds(),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish()
    }
}
