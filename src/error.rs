use std::io;

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("failed to resolve target {target}: {reason}")]
    Resolution { target: String, reason: String },
    #[error("failed to connect to {address}: {reason}")]
    Connection { address: String, reason: String },
    #[error("failed to reach jump host {hop}: {source}")]
    Hop {
        hop: String,
        #[source]
        source: Box<TunnelError>,
    },
    #[error("authentication failed for {user}@{address}")]
    Authentication { user: String, address: String },
    #[error("host key for {address} was rejected")]
    HostKeyRejected { address: String },
    #[error("connection already exists")]
    Conflict,
    #[error("fwd with id {0} not found")]
    ForwardNotFound(String),
    #[error("could not find tunnel by {{ \"id\": \"{0}\"}}")]
    SessionNotFound(String),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("session {0} is closed")]
    SessionClosed(String),
    #[error("daemon is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid serialized ID")]
    MissingSeparator,
    #[error("invalid serialized ID: {0}")]
    Encoding(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PublishError {
    #[error("invalid publish spec {0}, expected [lhost:]lport:[rhost:]rport")]
    InvalidSpec(String),
    #[error("invalid port {port} in publish spec {spec}")]
    InvalidPort { spec: String, port: String },
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("stored port {0} is out of range")]
    InvalidPort(i32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("another daemon is already listening on {0}")]
    AlreadyRunning(String),
    #[error("invalid control address {0}, expected unix:PATH or tcp:HOST:PORT")]
    InvalidAddress(String),
    #[error("control connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}
