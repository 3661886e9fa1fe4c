use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
#[cfg(test)]
use mockall::automock;
use russh::{Disconnect, client};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
#[cfg(not(coverage_nightly))]
use tracing::{debug, info, warn};

mod auth;
mod handler;

pub use auth::Credentials;
pub use handler::HostKeyPolicy;

use crate::{
    error::TunnelError,
    resolver::{ResolvedHop, ResolvedTarget, Target},
};
use handler::ClientHandler;

/// A bidirectional byte stream opened through a transport.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// An authenticated connection that can open sub-connections to remote addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a logical connection to `address` (`host:port`) through this transport.
    async fn open_stream(&self, address: &str) -> Result<BoxedStream, TunnelError>;
    /// Close the underlying connection. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TunnelError>;
    fn is_closed(&self) -> bool;
}

#[cfg_attr(test, automock)]
#[async_trait]
/// Establishes authenticated transports to resolved targets.
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ResolvedTarget,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>, TunnelError>;
}

// Dial parameters for SSH connections.
#[derive(Builder, Debug, Clone)]
pub struct DialConfig {
    // Maximum time to establish and authenticate each hop.
    #[builder(default = Duration::from_secs(10))]
    connect_timeout: Duration,
    // Interval between keepalive requests, if any.
    keepalive_interval: Option<Duration>,
    // Verification policy for server host keys.
    #[builder(default)]
    host_key_policy: HostKeyPolicy,
    // Whether to try identities from the SSH agent.
    #[builder(default = true)]
    use_agent: bool,
}

/// Connector that dials real SSH servers, following proxy-jump chains.
pub struct SshConnector {
    config: DialConfig,
}

impl SshConnector {
    pub fn new(config: DialConfig) -> Self {
        SshConnector { config }
    }

    async fn connect_hop(
        &self,
        hop: &ResolvedHop,
        via: Option<&client::Handle<ClientHandler>>,
        credentials: &Credentials,
    ) -> Result<client::Handle<ClientHandler>, TunnelError> {
        let config = Arc::new(client::Config {
            keepalive_interval: self.config.keepalive_interval,
            ..Default::default()
        });
        let handler = ClientHandler::new(
            hop.hostname.clone(),
            hop.port,
            self.config.host_key_policy.clone(),
        );
        let establish = async {
            let mut handle = match via {
                None => {
                    let stream = TcpStream::connect((hop.hostname.as_str(), hop.port))
                        .await
                        .map_err(|error| TunnelError::Connection {
                            address: hop.address(),
                            reason: error.to_string(),
                        })?;
                    if let Err(error) = stream.set_nodelay(true) {
                        #[cfg(not(coverage_nightly))]
                        warn!(%hop, %error, "Error setting nodelay.");
                    }
                    client::connect_stream(config, stream, handler).await?
                }
                Some(previous) => {
                    let channel = previous
                        .channel_open_direct_tcpip(
                            hop.hostname.clone(),
                            u32::from(hop.port),
                            "127.0.0.1",
                            0,
                        )
                        .await?;
                    client::connect_stream(config, channel.into_stream(), handler).await?
                }
            };
            auth::authenticate(&mut handle, hop, credentials, self.config.use_agent).await?;
            Ok::<_, TunnelError>(handle)
        };
        timeout(self.config.connect_timeout, establish)
            .await
            .map_err(|_| TunnelError::Connection {
                address: hop.address(),
                reason: format!(
                    "timed out after {}",
                    humantime::format_duration(self.config.connect_timeout)
                ),
            })?
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ResolvedTarget,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>, TunnelError> {
        let mut jumps: Vec<client::Handle<ClientHandler>> = Vec::with_capacity(target.jumps.len());
        for hop in target.jumps.iter() {
            let handle = match self.connect_hop(hop, jumps.last(), credentials).await {
                Ok(handle) => handle,
                Err(error) => {
                    close_handles(&jumps).await;
                    return Err(TunnelError::Hop {
                        hop: hop.to_string(),
                        source: Box::new(error),
                    });
                }
            };
            #[cfg(not(coverage_nightly))]
            debug!(%hop, "Connected to jump host.");
            jumps.push(handle);
        }
        let handle = match self
            .connect_hop(&target.endpoint, jumps.last(), credentials)
            .await
        {
            Ok(handle) => handle,
            Err(error) => {
                close_handles(&jumps).await;
                return Err(error);
            }
        };
        #[cfg(not(coverage_nightly))]
        info!(endpoint = %target.endpoint, jumps = jumps.len(), "SSH session established.");
        Ok(Arc::new(SshTransport {
            address: target.dial_address(),
            handle,
            jumps,
        }))
    }
}

async fn close_handles(handles: &[client::Handle<ClientHandler>]) {
    for handle in handles.iter().rev() {
        if !handle.is_closed() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
    }
}

// Transport over an authenticated russh session.
struct SshTransport {
    address: String,
    handle: client::Handle<ClientHandler>,
    // Sessions to jump hosts, kept alive for as long as the final session.
    jumps: Vec<client::Handle<ClientHandler>>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_stream(&self, address: &str) -> Result<BoxedStream, TunnelError> {
        if self.handle.is_closed() {
            return Err(TunnelError::Connection {
                address: self.address.clone(),
                reason: "SSH session is closed".into(),
            });
        }
        let destination: Target = address.parse()?;
        if destination.port == 0 {
            return Err(TunnelError::Connection {
                address: address.to_string(),
                reason: "missing port".into(),
            });
        }
        let channel = self
            .handle
            .channel_open_direct_tcpip(destination.host, u32::from(destination.port), "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if !self.handle.is_closed() {
            self.handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await?;
        }
        close_handles(&self.jumps).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}
