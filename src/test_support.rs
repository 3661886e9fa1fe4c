use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::{
    io::copy,
    net::{TcpListener, TcpStream},
    time::sleep,
};

use crate::{
    error::TunnelError,
    resolver::ResolvedTarget,
    ssh::{BoxedStream, Connector, Credentials, Transport},
};

// Transport that dials addresses directly instead of through SSH.
#[derive(Default)]
pub(crate) struct LoopbackTransport {
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open_stream(&self, address: &str) -> Result<BoxedStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Connection {
                address: address.to_string(),
                reason: "transport closed".into(),
            });
        }
        let stream = TcpStream::connect(address)
            .await
            .map_err(|error| TunnelError::Connection {
                address: address.to_string(),
                reason: error.to_string(),
            })?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// Connector handing out loopback transports, counting how many were created.
#[derive(Default)]
pub(crate) struct LoopbackConnector {
    pub(crate) connects: AtomicUsize,
    pub(crate) delay: Duration,
    // When set, connections without this password are rejected.
    pub(crate) password: Option<String>,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackConnector {
    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(LoopbackConnector {
            delay,
            ..Default::default()
        })
    }

    pub(crate) fn requiring_password(password: &str) -> Arc<Self> {
        Arc::new(LoopbackConnector {
            password: Some(password.to_string()),
            ..Default::default()
        })
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    // Every transport handed out so far, oldest first.
    pub(crate) fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.transports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        target: &ResolvedTarget,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>, TunnelError> {
        sleep(self.delay).await;
        if let Some(password) = &self.password {
            let provided = credentials
                .password
                .as_ref()
                .map(|provided| provided.expose_secret());
            if provided != Some(password.as_str()) {
                return Err(TunnelError::Authentication {
                    user: target.user().to_string(),
                    address: target.dial_address(),
                });
            }
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(LoopbackTransport::default());
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = copy(&mut reader, &mut writer).await;
            });
        }
    });
    address
}
