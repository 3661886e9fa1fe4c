use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
#[cfg(not(coverage_nightly))]
use tracing::debug;

mod ipc;

pub use ipc::{ControlAddress, ControlClient, ControlServer, DEFAULT_CONTROL_ADDRESS};

pub use crate::registry::ForwardDescriptor;
use crate::{
    identity::AddressPair, registry::Registry, resolver::Target, ssh::Credentials,
};

// Passed in place of ids to close every forward.
pub const CLOSE_ALL_SENTINEL: &str = "all";

/// One entry of an open request: a target, its credentials and the forwards to start on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    #[serde(default)]
    pub user: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    // OpenSSH-encoded private key contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub pairs: Vec<AddressPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Open { tunnels: Vec<TunnelRequest> },
    Close { ids: Vec<String> },
    CloseAll,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Open {
        opened_ids: Vec<String>,
        errors: Vec<String>,
    },
    Close {
        closed_ids: Vec<String>,
        errors: Vec<String>,
    },
    CloseAll {
        ok: bool,
        error: String,
    },
    List {
        forwards: Vec<ForwardDescriptor>,
    },
    Error {
        message: String,
    },
}

/// The four operations exposed over the control channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TunnelService: Send + Sync {
    async fn open(&self, tunnels: Vec<TunnelRequest>) -> ControlResponse;
    async fn close(&self, ids: Vec<String>) -> ControlResponse;
    async fn close_all(&self) -> ControlResponse;
    async fn list(&self) -> ControlResponse;
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Open { .. } => "open",
            ControlRequest::Close { .. } => "close",
            ControlRequest::CloseAll => "close_all",
            ControlRequest::List => "list",
        }
    }
}

/// Dispatch a decoded request to the matching service operation.
pub async fn dispatch(service: &dyn TunnelService, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Open { tunnels } => service.open(tunnels).await,
        ControlRequest::Close { ids } => service.close(ids).await,
        ControlRequest::CloseAll => service.close_all().await,
        ControlRequest::List => service.list().await,
    }
}

/// Control operations backed by the session registry.
pub struct ControlHandlers {
    registry: Arc<Registry>,
}

impl ControlHandlers {
    pub fn new(registry: Arc<Registry>) -> Self {
        ControlHandlers { registry }
    }
}

#[async_trait]
impl TunnelService for ControlHandlers {
    async fn open(&self, tunnels: Vec<TunnelRequest>) -> ControlResponse {
        let mut opened_ids = Vec::new();
        let mut errors = Vec::new();
        for tunnel in tunnels {
            if tunnel.host.trim().is_empty() {
                errors.push("no host provided".to_string());
                continue;
            }
            if tunnel.pairs.is_empty() {
                errors.push(format!(
                    "no address pairs provided for {}@{}",
                    tunnel.user, tunnel.host
                ));
                continue;
            }
            let target = Target::new(tunnel.user, tunnel.host, tunnel.port);
            let credentials = Credentials::new(tunnel.password, tunnel.private_key);
            for pair in tunnel.pairs {
                match self.registry.open(&target, pair, &credentials).await {
                    Ok(id) => opened_ids.push(id.to_string()),
                    Err(error) => errors.push(error.to_string()),
                }
            }
        }
        ControlResponse::Open { opened_ids, errors }
    }

    async fn close(&self, ids: Vec<String>) -> ControlResponse {
        if ids.iter().any(|id| id == CLOSE_ALL_SENTINEL) {
            #[cfg(not(coverage_nightly))]
            debug!("Close request asked for every forward.");
            let closed_ids = self
                .registry
                .list()
                .into_iter()
                .map(|forward| forward.id)
                .collect();
            let outcome = self.registry.close_all().await;
            return if outcome.ok {
                ControlResponse::Close {
                    closed_ids,
                    errors: vec![],
                }
            } else {
                ControlResponse::Close {
                    closed_ids: vec![],
                    errors: vec![outcome.error],
                }
            };
        }
        let outcome = self.registry.close(&ids).await;
        ControlResponse::Close {
            closed_ids: outcome.closed,
            errors: outcome.errors,
        }
    }

    async fn close_all(&self) -> ControlResponse {
        let outcome = self.registry.close_all().await;
        ControlResponse::CloseAll {
            ok: outcome.ok,
            error: outcome.error,
        }
    }

    async fn list(&self) -> ControlResponse {
        ControlResponse::List {
            forwards: self.registry.list(),
        }
    }
}
