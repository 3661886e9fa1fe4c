use std::path::PathBuf;

use russh::keys::{PublicKey, check_known_hosts_path};
#[cfg(not(coverage_nightly))]
use tracing::{debug, warn};

use crate::{error::TunnelError, paths::default_known_hosts_file};

/// How server host keys are verified when dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Only accept keys listed for the host in the given known_hosts file.
    KnownHosts(PathBuf),
    /// Accept any host key.
    AcceptAny,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts(default_known_hosts_file())
    }
}

// Client-side handler for one SSH hop.
pub(crate) struct ClientHandler {
    // Host and port used for known_hosts lookups.
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        ClientHandler { host, port, policy }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let path = match &self.policy {
            HostKeyPolicy::AcceptAny => return Ok(true),
            HostKeyPolicy::KnownHosts(path) => path,
        };
        match check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => {
                #[cfg(not(coverage_nightly))]
                debug!(host = %self.host, port = self.port, "Host key verified.");
                Ok(true)
            }
            Ok(false) => {
                #[cfg(not(coverage_nightly))]
                warn!(
                    host = %self.host,
                    port = self.port,
                    known_hosts = %path.display(),
                    "Host key not found in known_hosts."
                );
                Err(TunnelError::HostKeyRejected {
                    address: self.address(),
                })
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                warn!(host = %self.host, port = self.port, %error, "Host key verification failed.");
                Err(TunnelError::HostKeyRejected {
                    address: self.address(),
                })
            }
        }
    }
}
