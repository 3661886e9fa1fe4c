use std::{fmt::Display, io, net::SocketAddr, str::FromStr, sync::Arc};

#[cfg(unix)]
use std::path::PathBuf;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
#[cfg(not(coverage_nightly))]
use tracing::{debug, info, warn};

use super::{ControlRequest, ControlResponse, TunnelService, dispatch};
use crate::{error::ControlError, ssh::BoxedStream};

#[cfg(unix)]
pub const DEFAULT_CONTROL_ADDRESS: &str = "unix:/tmp/tunmand.sock";
#[cfg(not(unix))]
pub const DEFAULT_CONTROL_ADDRESS: &str = "tcp:127.0.0.1:17845";

/// Where the control channel listens: `unix:PATH` or `tcp:HOST:PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddress {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for ControlAddress {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            #[cfg(unix)]
            Some(("unix", path)) if !path.is_empty() => Ok(ControlAddress::Unix(path.into())),
            Some(("tcp", address)) if address.rsplit_once(':').is_some() => {
                Ok(ControlAddress::Tcp(address.to_string()))
            }
            _ => Err(ControlError::InvalidAddress(s.to_string())),
        }
    }
}

impl Display for ControlAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            ControlAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ControlAddress::Tcp(address) => write!(f, "tcp:{address}"),
        }
    }
}

enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Listening end of the control channel. Only one daemon may hold a given address.
pub struct ControlServer {
    listener: Listener,
    #[cfg(unix)]
    socket_path: Option<PathBuf>,
}

impl ControlServer {
    pub async fn bind(address: &ControlAddress) -> Result<Self, ControlError> {
        match address {
            #[cfg(unix)]
            ControlAddress::Unix(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if tokio::fs::try_exists(path).await? {
                    match UnixStream::connect(path).await {
                        Ok(_) => return Err(ControlError::AlreadyRunning(address.to_string())),
                        Err(error) => {
                            #[cfg(not(coverage_nightly))]
                            debug!(path = %path.display(), %error, "Removing stale control socket.");
                            tokio::fs::remove_file(path).await?;
                        }
                    }
                }
                let listener = UnixListener::bind(path)?;
                #[cfg(not(coverage_nightly))]
                info!(%address, "Listening for control connections.");
                Ok(ControlServer {
                    listener: Listener::Unix(listener),
                    socket_path: Some(path.clone()),
                })
            }
            ControlAddress::Tcp(tcp_address) => {
                let listener = TcpListener::bind(tcp_address.as_str())
                    .await
                    .map_err(|error| match error.kind() {
                        io::ErrorKind::AddrInUse => {
                            ControlError::AlreadyRunning(address.to_string())
                        }
                        _ => ControlError::Io(error),
                    })?;
                #[cfg(not(coverage_nightly))]
                info!(%address, "Listening for control connections.");
                Ok(ControlServer {
                    listener: Listener::Tcp(listener),
                    #[cfg(unix)]
                    socket_path: None,
                })
            }
        }
    }

    /// Bound TCP address, if listening on TCP.
    pub fn tcp_address(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    /// Accept control clients until cancelled, handling each one on its own task.
    pub async fn serve(
        &self,
        service: Arc<dyn TunnelService>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let stream: BoxedStream = tokio::select! {
                _ = cancellation_token.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        warn!(%error, "Error accepting control connection.");
                        continue;
                    }
                }
            };
            let service = Arc::clone(&service);
            let cancellation_token = cancellation_token.child_token();
            tokio::spawn(async move {
                if let Err(error) = handle_connection(stream, service, cancellation_token).await {
                    #[cfg(not(coverage_nightly))]
                    debug!(%error, "Control connection ended with error.");
                }
            });
        }
        #[cfg(not(coverage_nightly))]
        debug!("Control server stopped.");
    }

    async fn accept(&self) -> io::Result<BoxedStream> {
        match &self.listener {
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(path) = self.socket_path.take() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

// Read newline-delimited requests and answer each one in order.
async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    service: Arc<dyn TunnelService>,
    cancellation_token: CancellationToken,
) -> Result<(), ControlError> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            _ = cancellation_token.cancelled() => return Ok(()),
            read = stream.read_line(&mut line) => read?,
        };
        if read == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => {
                #[cfg(not(coverage_nightly))]
                debug!(request = request.name(), "Received control request.");
                dispatch(service.as_ref(), request).await
            }
            Err(error) => ControlResponse::Error {
                message: format!("invalid request: {error}"),
            },
        };
        write_line(stream.get_mut(), &response).await?;
    }
}

async fn write_line<W: AsyncWrite + Unpin, T: serde::Serialize>(
    writer: &mut W,
    value: &T,
) -> Result<(), ControlError> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Client end of the control channel, used by the CLI.
pub struct ControlClient {
    stream: BufReader<BoxedStream>,
}

impl ControlClient {
    pub async fn connect(address: &ControlAddress) -> Result<Self, ControlError> {
        let stream: BoxedStream = match address {
            #[cfg(unix)]
            ControlAddress::Unix(path) => Box::new(UnixStream::connect(path).await?),
            ControlAddress::Tcp(address) => Box::new(TcpStream::connect(address.as_str()).await?),
        };
        Ok(ControlClient {
            stream: BufReader::new(stream),
        })
    }

    /// Send one request and wait for its response.
    pub async fn request(
        &mut self,
        request: &ControlRequest,
    ) -> Result<ControlResponse, ControlError> {
        write_line(self.stream.get_mut(), request).await?;
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(ControlError::ConnectionClosed);
        }
        Ok(serde_json::from_str(&line)?)
    }
}
