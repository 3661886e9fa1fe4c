use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use russh::{
    Channel,
    keys::{PrivateKey, ssh_key::private::Ed25519Keypair},
    server::{self, Auth, Msg, Session},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, copy, copy_bidirectional},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tokio_util::task::AbortOnDropHandle;
use tunman::{
    ApplicationConfig,
    control::{ControlAddress, ControlClient, ControlRequest, ControlResponse, TunnelRequest},
    entrypoint,
    identity::AddressPair,
    ForwardDescriptor,
};

pub(crate) const SSH_USER: &str = "alice";
pub(crate) const SSH_PASSWORD: &str = "correct horse battery staple";

pub(crate) struct TunmanHandle(pub(crate) tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for TunmanHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// Start the daemon with its state in `dir`, accepting any host key.
pub(crate) async fn start_daemon(
    dir: &Path,
    socket_name: &str,
    extra_args: &[String],
) -> (TunmanHandle, ControlAddress) {
    let mut args = vec!["--insecure".to_string()];
    args.extend_from_slice(extra_args);
    launch_daemon(dir, socket_name, &args).await
}

// Start the daemon with its state in `dir`, and wait until its control socket answers.
pub(crate) async fn launch_daemon(
    dir: &Path,
    socket_name: &str,
    extra_args: &[String],
) -> (TunmanHandle, ControlAddress) {
    let address = ControlAddress::Unix(dir.join(socket_name));
    let mut args = vec![
        "tunmand".to_string(),
        format!("--listen={address}"),
        format!("--database-path={}", dir.join("state.db").display()),
        format!("--ssh-config-path={}", dir.join("ssh_config").display()),
        "--disable-agent".to_string(),
        "--connect-timeout=5s".to_string(),
        "--shutdown-grace-period=1s".to_string(),
    ];
    args.extend_from_slice(extra_args);
    let config = ApplicationConfig::parse_from(args);
    let handle = TunmanHandle(tokio::spawn(async move { entrypoint(config).await }));
    if timeout(Duration::from_secs(5), async {
        while ControlClient::connect(&address).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for tunmand to start.")
    };
    (handle, address)
}

pub(crate) async fn request(address: &ControlAddress, request: ControlRequest) -> ControlResponse {
    let mut client = ControlClient::connect(address).await.unwrap();
    client.request(&request).await.unwrap()
}

pub(crate) fn open_request(host: &str, port: u16, pairs: Vec<AddressPair>) -> ControlRequest {
    ControlRequest::Open {
        tunnels: vec![TunnelRequest {
            user: SSH_USER.into(),
            host: host.into(),
            port,
            password: Some(SSH_PASSWORD.into()),
            private_key: None,
            pairs,
        }],
    }
}

pub(crate) async fn list(address: &ControlAddress) -> Vec<ForwardDescriptor> {
    match request(address, ControlRequest::List).await {
        ControlResponse::List { forwards } => forwards,
        response => panic!("unexpected response {response:?}"),
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

// Send `payload` and read back as many bytes.
pub(crate) async fn roundtrip(address: &str, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(address).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    buf
}

// Minimal SSH server accepting one password and relaying direct-tcpip channels.
pub(crate) struct SshServer {
    pub(crate) address: SocketAddr,
    connections: Arc<AtomicUsize>,
    _join_handle: AbortOnDropHandle<()>,
}

impl SshServer {
    pub(crate) async fn spawn() -> Self {
        let key = PrivateKey::from(Ed25519Keypair::from_seed(&[7u8; 32]));
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![key],
            ..Default::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);
        let join_handle = AbortOnDropHandle::new(tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, TestHandler).await {
                        let _ = session.await;
                    }
                });
            }
        }));
        SshServer {
            address,
            connections,
            _join_handle: join_handle,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.address.port()
    }

    /// Number of SSH connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

struct TestHandler;

impl server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == SSH_USER && password == SSH_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut stream) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };
        tokio::spawn(async move {
            let mut channel = channel.into_stream();
            let _ = copy_bidirectional(&mut channel, &mut stream).await;
        });
        Ok(true)
    }
}
