// src/registry.rs

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::context::RequestContext;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::graph::{DependencyGraph, GraphError, LIFECYCLE_ANCHORS};
use crate::handler::{Handler, NoopHandler};
use crate::lock::ObjectLock;
use crate::output::{OutputSender, OutputTransport};

/// Registration token returned by [`HandlerRegistry::register`]. Ordering
/// constraints chain off it; the token can be dropped once the handler is
/// fully declared.
pub struct HandleToken {
    graph: Arc<Mutex<DependencyGraph>>,
    name: String,
}

impl std::fmt::Debug for HandleToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleToken")
            .field("name", &self.name)
            .finish()
    }
}

impl HandleToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare that this handler runs before `other`.
    pub fn before(self, other: &str) -> Self {
        self.graph.lock().unwrap().before(&self.name, other);
        self
    }

    /// Declare that this handler runs after `other`.
    pub fn after(self, other: &str) -> Self {
        self.graph.lock().unwrap().after(&self.name, other);
        self
    }
}

/// Owns the dependency graph and the output chain for one dispatch
/// pipeline. Constructed explicitly and passed by reference to whatever
/// owns the dispatch lifecycle, so tests and embedders get isolated
/// registries instead of hidden process-wide state.
///
/// The lifecycle anchors are installed as no-op handlers at construction;
/// features register their real handlers relative to them.
pub struct HandlerRegistry {
    graph: Arc<Mutex<DependencyGraph>>,
    sender: OutputSender,
    lock: ObjectLock,
    /// feature name -> handler names it contributed
    features: DashMap<String, Vec<String>>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        let mut graph = DependencyGraph::new();
        for anchor in LIFECYCLE_ANCHORS.iter() {
            // fresh graph, duplicates are impossible here
            let _ = graph.add_node(*anchor, Arc::new(NoopHandler) as Arc<dyn Handler>);
        }
        Arc::new(Self {
            graph: Arc::new(Mutex::new(graph)),
            sender: OutputSender::new(),
            lock: ObjectLock::new(),
            features: DashMap::new(),
        })
    }

    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<HandleToken, GraphError> {
        self.graph.lock().unwrap().add_node(name, handler)?;
        info!("Registered handler: {}", name);
        Ok(HandleToken {
            graph: self.graph.clone(),
            name: name.to_string(),
        })
    }

    pub fn unregister(&self, name: &str) {
        self.graph.lock().unwrap().remove_node(name);
        info!("Removed handler: {}", name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graph.lock().unwrap().contains(name)
    }

    pub fn handler_count(&self) -> usize {
        self.graph.lock().unwrap().len()
    }

    /// Register a feature's handlers as one unit. Runs under the registry
    /// lock so two features installing or unloading concurrently never
    /// interleave; a failed registration rolls the whole feature back.
    pub async fn install(
        &self,
        feature: &str,
        handlers: Vec<(String, Arc<dyn Handler>)>,
    ) -> Result<Vec<HandleToken>, GraphError> {
        self.lock
            .run_locked(|| async {
                let mut tokens = Vec::new();
                let mut installed: Vec<String> = Vec::new();
                for (name, handler) in handlers {
                    match self.register(&name, handler) {
                        Ok(token) => {
                            installed.push(name);
                            tokens.push(token);
                        }
                        Err(e) => {
                            for done in &installed {
                                self.unregister(done);
                            }
                            return Err(e);
                        }
                    }
                }
                self.features.insert(feature.to_string(), installed);
                info!("Installed feature `{}`", feature);
                Ok(tokens)
            })
            .await
    }

    /// Remove every handler a feature contributed.
    pub async fn uninstall(&self, feature: &str) {
        self.lock
            .run_locked(|| async {
                if let Some((_, names)) = self.features.remove(feature) {
                    for name in names {
                        self.unregister(&name);
                    }
                    info!("Uninstalled feature `{}`", feature);
                } else {
                    warn!("Tried to uninstall unknown feature: {}", feature);
                }
            })
            .await
    }

    /// Append an output transport to the delivery chain.
    pub fn add_sender(&self, transport: Arc<dyn OutputTransport>) {
        self.sender.add_sender(transport);
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.graph.clone(), self.sender.clone())
    }

    /// The single entry point triggered on every inbound event.
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<bool, DispatchError> {
        self.dispatcher().dispatch(ctx).await
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_count())
            .field("features", &self.features.len())
            .finish()
    }
}
