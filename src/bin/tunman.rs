use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, bail};
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tunman::{
    Target,
    control::{
        ControlAddress, ControlClient, ControlRequest, ControlResponse, DEFAULT_CONTROL_ADDRESS,
        TunnelRequest,
    },
    publish::parse_publishes,
};

#[derive(Parser)]
#[command(version, about = "Manage SSH port forwards held by tunmand.", long_about = None)]
struct Args {
    /// Control address of the daemon, either `unix:PATH` or `tcp:HOST:PORT`.
    #[arg(long, global = true, default_value = DEFAULT_CONTROL_ADDRESS, value_name = "ADDRESS")]
    socket: ControlAddress,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open forwards to a remote host.
    Open {
        /// Remote host, as `[user@]host[:port]`. Host aliases from the SSH config are accepted.
        target: String,

        /// SSH user, overriding the one in the target.
        #[arg(short, long)]
        user: Option<String>,

        /// SSH port, overriding the one in the target.
        #[arg(short = 'P', long)]
        port: Option<u16>,

        /// SSH password.
        #[arg(long)]
        password: Option<String>,

        /// Private key file to authenticate with.
        #[arg(short, long, value_name = "FILE")]
        identity_file: Option<PathBuf>,

        /// Forward to publish, as `[lhost:]lport:[rhost:]rport`.
        /// If a host is omitted, 0.0.0.0 is used.
        #[arg(short, long = "publish", value_name = "SPEC", required = true)]
        publish: Vec<String>,
    },
    /// Close forwards by id. Pass `all` to close every forward.
    Close {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Close every forward and session.
    CloseAll,
    /// List active forwards.
    Ps,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_writer(std::io::stderr).without_time())
        .init();
    let args = Args::parse();

    let request = match args.command {
        Command::Open {
            target,
            user,
            port,
            password,
            identity_file,
            publish,
        } => {
            let mut target: Target = target.parse()?;
            if let Some(user) = user {
                target.user = user;
            }
            if let Some(port) = port {
                target.port = port;
            }
            let private_key = match identity_file {
                Some(path) => Some(
                    tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Error reading identity file {}", path.display()))?,
                ),
                None => None,
            };
            ControlRequest::Open {
                tunnels: vec![TunnelRequest {
                    user: target.user,
                    host: target.host,
                    port: target.port,
                    password,
                    private_key,
                    pairs: parse_publishes(&publish)?,
                }],
            }
        }
        Command::Close { ids } => ControlRequest::Close { ids },
        Command::CloseAll => ControlRequest::CloseAll,
        Command::Ps => ControlRequest::List,
    };

    let mut client = ControlClient::connect(&args.socket)
        .await
        .with_context(|| format!("Error connecting to tunmand at {}", args.socket))?;
    let response = client
        .request(&request)
        .await
        .with_context(|| "Error sending request to tunmand")?;

    match response {
        ControlResponse::Open { opened_ids, errors } => {
            for id in opened_ids {
                println!("{id}");
            }
            report(&errors, "Error opening forward.")?;
        }
        ControlResponse::Close { closed_ids, errors } => {
            for id in closed_ids {
                println!("{id}");
            }
            report(&errors, "Error closing forward.")?;
        }
        ControlResponse::CloseAll { ok, error } => {
            if !ok {
                bail!(error);
            }
        }
        ControlResponse::List { forwards } => {
            if forwards.is_empty() {
                println!("no active forwards");
                return Ok(());
            }
            println!("ID\tHOST\t\tFWD");
            for forward in forwards {
                println!(
                    "{}\t{}@{}\t{} -> {}",
                    forward.id,
                    forward.user,
                    forward.address,
                    forward.local_address,
                    forward.remote_address
                );
            }
        }
        ControlResponse::Error { message } => bail!(message),
    }
    Ok(())
}

fn report(errors: &[String], message: &'static str) -> color_eyre::Result<()> {
    for reason in errors {
        error!(%reason, "{message}");
    }
    if !errors.is_empty() {
        bail!("{} request(s) failed", errors.len());
    }
    Ok(())
}
