//! Daemon that opens, tracks and restores local port forwards over SSH.
//!
//! Forwards that resolve to the same user and dial address share one SSH session.
//! Every forward is identified by a composite id, combining the identity of its
//! session with the identity of its address pair.

mod config;
pub mod control;
mod entrypoint;
pub mod error;
pub mod identity;
mod paths;
pub mod publish;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod ssh;
mod ssh_config;
pub mod store;
#[cfg(test)]
mod test_support;

pub use crate::{
    config::ApplicationConfig,
    entrypoint::entrypoint,
    registry::{ForwardDescriptor, Registry},
    resolver::Target,
};
