use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::control::{ControlAddress, DEFAULT_CONTROL_ADDRESS};

#[derive(Debug, Parser)]
#[command(version, about = "Daemon keeping SSH port forwards alive.", long_about = None)]
pub struct ApplicationConfig {
    /// Address of the control channel, either `unix:PATH` or `tcp:HOST:PORT`.
    /// Only one daemon may listen on a given address.
    #[arg(long, default_value = DEFAULT_CONTROL_ADDRESS, value_name = "ADDRESS")]
    pub listen: ControlAddress,

    /// SQLite database where open forwards are recorded, so they can be restored after a restart.
    #[arg(long, default_value_os = "./state.db", value_name = "FILE")]
    pub database_path: PathBuf,

    /// OpenSSH client configuration used to resolve host aliases, users, ports and proxy jumps.
    ///
    /// Defaults to ~/.ssh/config.
    #[arg(long, value_name = "FILE")]
    pub ssh_config_path: Option<PathBuf>,

    /// Known hosts file used to verify server keys.
    ///
    /// Defaults to ~/.ssh/known_hosts.
    #[arg(long, value_name = "FILE")]
    pub known_hosts_path: Option<PathBuf>,

    /// Accept any server host key. Only use this on trusted networks.
    #[arg(long, default_value_t = false)]
    pub insecure: bool,

    /// User to connect as when neither the request nor the SSH config names one.
    ///
    /// Defaults to the current OS user.
    #[arg(long, value_name = "USER")]
    pub default_user: Option<String>,

    /// If set, identities from the SSH agent won't be tried.
    #[arg(long, default_value_t = false)]
    pub disable_agent: bool,

    /// Time allowed to connect and authenticate to each SSH hop.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration, value_name = "DURATION")]
    pub connect_timeout: Duration,

    /// Interval between SSH keepalive requests.
    ///
    /// By default, no keepalives are sent.
    #[arg(long, value_parser = humantime::parse_duration, value_name = "DURATION")]
    pub keepalive_interval: Option<Duration>,

    /// How long to wait for open connections to finish when shutting down.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, value_name = "DURATION")]
    pub shutdown_grace_period: Duration,

    /// Default log filter, overridden by RUST_LOG.
    #[arg(long, default_value_t = String::from("info"), value_name = "FILTER")]
    pub log_level: String,
}
