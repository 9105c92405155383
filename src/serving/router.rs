//! Path router over several model servers.
//!
//! Resolves `/v2/models/<name>[/versions/<version>]/<op>` to the server
//! registered as `<name>` (or `<name>:<version>`) and hands it the event
//! with its path rewritten to `<op>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

use super::error::ServingError;
use super::server::ModelServer;
use crate::event::{Event, Method};
use crate::graph::{StepError, StepHandler};

pub const URL_PREFIX: &str = "v2/models";

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Route already exists for model: {0}")]
    RouteExists(String),
}

/// Routing table: route key → server.
pub struct ModelRouter {
    routes: RwLock<BTreeMap<String, Arc<ModelServer>>>,
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a server under its own name. Fails if the name is taken.
    pub async fn add_route(&self, server: ModelServer) -> Result<(), RouterError> {
        let mut routes = self.routes.write().await;
        let key = server.name().to_string();
        if routes.contains_key(&key) {
            return Err(RouterError::RouteExists(key));
        }
        routes.insert(key, Arc::new(server));
        Ok(())
    }

    pub async fn resolve(&self, key: &str) -> Option<Arc<ModelServer>> {
        self.routes.read().await.get(key).cloned()
    }

    /// Route keys in sorted order.
    pub async fn list_routes(&self) -> Vec<String> {
        self.routes.read().await.keys().cloned().collect()
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Route one event. A GET on the prefix lists the models.
    pub async fn route(&self, mut event: Event) -> Result<Event, ServingError> {
        let path = event.operation().to_string();
        let rest = match path.strip_prefix(URL_PREFIX) {
            Some(rest) => rest.trim_start_matches('/'),
            None => {
                // Unprefixed paths go to a lone server untouched.
                let lone = {
                    let routes = self.routes.read().await;
                    if routes.len() == 1 {
                        routes.values().next().cloned()
                    } else {
                        None
                    }
                };
                if let Some(server) = lone {
                    return server.handle(event).await;
                }
                return Err(ServingError::invalid_argument(format!(
                    "path {path} does not start with /{URL_PREFIX}"
                )));
            }
        };

        if rest.is_empty() {
            if event.method == Method::Get {
                let models = self.list_routes().await;
                return Ok(event.terminate(200, json!({ "models": models })));
            }
            return Err(ServingError::invalid_argument(format!(
                "no model name in path {path}"
            )));
        }

        let (key, op) = parse_route(rest);
        let server = self.resolve(&key).await.ok_or_else(|| {
            ServingError::invalid_argument(format!("model {key} doesnt exist"))
        })?;
        tracing::debug!(event_id = %event.id, model = %key, op = %op, "routing event");
        event.path = op;
        server.handle(event).await
    }
}

/// Split `<name>[/versions/<version>][/<op>]` into a route key and an op.
fn parse_route(rest: &str) -> (String, String) {
    let mut parts = rest.split('/');
    let name = parts.next().unwrap_or_default();
    let mut remaining: Vec<&str> = parts.collect();
    let key = if remaining.first() == Some(&"versions") && remaining.len() >= 2 {
        let version = remaining[1];
        remaining.drain(..2);
        format!("{name}:{version}")
    } else {
        name.to_string()
    };
    (key, remaining.join("/"))
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepHandler for ModelRouter {
    async fn init(&self) -> Result<(), StepError> {
        let servers: Vec<_> = self.routes.read().await.values().cloned().collect();
        for server in servers {
            StepHandler::init(server.as_ref()).await?;
        }
        Ok(())
    }

    async fn run(&self, event: Event) -> Result<Event, StepError> {
        self.route(event).await.map_err(StepError::from)
    }

    async fn shutdown(&self) {
        let servers: Vec<_> = self.routes.read().await.values().cloned().collect();
        for server in servers {
            StepHandler::shutdown(server.as_ref()).await;
        }
    }
}
