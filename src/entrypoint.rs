use std::sync::Arc;

use color_eyre::eyre::Context;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, info, warn};

use crate::{
    config::ApplicationConfig,
    control::{ControlHandlers, ControlServer},
    paths::{default_known_hosts_file, default_ssh_config_file},
    registry::Registry,
    resolver::Resolver,
    ssh::{DialConfig, HostKeyPolicy, SshConnector},
    store::ForwardStore,
};

#[doc(hidden)]
// Main entrypoint of the daemon.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting tunmand...");
    let store = ForwardStore::open(&config.database_path)
        .await
        .with_context(|| "Error opening state database")?;
    let mut signals =
        ShutdownSignals::listen().with_context(|| "Error listening for shutdown signals")?;
    // Fails if another daemon already listens on this address.
    let control_server = ControlServer::bind(&config.listen)
        .await
        .with_context(|| "Error binding control channel")?;

    let host_key_policy = if config.insecure {
        warn!("Host key verification is disabled.");
        HostKeyPolicy::AcceptAny
    } else {
        HostKeyPolicy::KnownHosts(
            config
                .known_hosts_path
                .unwrap_or_else(default_known_hosts_file),
        )
    };
    let connector = SshConnector::new(
        DialConfig::builder()
            .connect_timeout(config.connect_timeout)
            .maybe_keepalive_interval(config.keepalive_interval)
            .host_key_policy(host_key_policy)
            .use_agent(!config.disable_agent)
            .build(),
    );
    let resolver = Resolver::builder()
        .ssh_config_path(
            config
                .ssh_config_path
                .unwrap_or_else(default_ssh_config_file),
        )
        .maybe_default_user(config.default_user)
        .build();
    let registry = Arc::new(
        Registry::builder()
            .resolver(resolver)
            .connector(Arc::new(connector))
            .store(store)
            .build(),
    );
    registry.restore().await;
    let _join_handle_reaper = AbortOnDropHandle::new(tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.reap_failed_forwards().await }
    }));

    let cancellation_token = CancellationToken::new();
    let service = Arc::new(ControlHandlers::new(Arc::clone(&registry)));
    let serve_token = cancellation_token.clone();
    let mut join_handle_control = AbortOnDropHandle::new(tokio::spawn(async move {
        control_server.serve(service, serve_token).await;
    }));
    info!(address = %config.listen, "tunmand is ready.");

    let control_running = tokio::select! {
        _ = signals.recv() => true,
        _ = &mut join_handle_control => {
            warn!("Control channel stopped unexpectedly.");
            false
        }
    };
    info!("tunmand is shutting down.");
    cancellation_token.cancel();
    registry.shutdown().await;
    if !registry.wait(config.shutdown_grace_period).await {
        warn!(
            grace_period = %humantime::format_duration(config.shutdown_grace_period),
            "Some connections didn't finish within the grace period."
        );
    }
    if control_running {
        // Wait for the control server to release its socket.
        let _ = join_handle_control.await;
    }
    Ok(())
}

// Shutdown signals, registered up front so none is missed once the daemon is reachable.
#[cfg(unix)]
struct ShutdownSignals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn listen() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(ShutdownSignals {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.terminate.recv() => debug!("Received SIGTERM."),
            _ = self.interrupt.recv() => debug!("Received SIGINT."),
        };
    }
}

#[cfg(windows)]
struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
    ctrl_break: tokio::signal::windows::CtrlBreak,
    ctrl_close: tokio::signal::windows::CtrlClose,
    ctrl_shutdown: tokio::signal::windows::CtrlShutdown,
}

#[cfg(windows)]
impl ShutdownSignals {
    fn listen() -> std::io::Result<Self> {
        use tokio::signal::windows;

        Ok(ShutdownSignals {
            ctrl_c: windows::ctrl_c()?,
            ctrl_break: windows::ctrl_break()?,
            ctrl_close: windows::ctrl_close()?,
            ctrl_shutdown: windows::ctrl_shutdown()?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.ctrl_c.recv() => debug!("Received CTRL_C."),
            _ = self.ctrl_break.recv() => debug!("Received CTRL_BREAK."),
            _ = self.ctrl_close.recv() => debug!("Received CTRL_CLOSE."),
            _ = self.ctrl_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
        };
    }
}
