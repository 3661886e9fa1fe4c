use std::{fmt::Display, path::PathBuf, str::FromStr};

use bon::Builder;
use serde::{Deserialize, Serialize};
#[cfg(not(coverage_nightly))]
use tracing::{debug, warn};

use crate::{
    error::TunnelError,
    identity::SessionId,
    paths::current_os_user,
    ssh_config::SshConfig,
};

pub const DEFAULT_SSH_PORT: u16 = 22;
// Deepest ProxyJump nesting that will be followed before giving up.
const MAX_JUMP_DEPTH: usize = 8;

/// A logical remote endpoint. Empty strings and port 0 mean "unspecified".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub user: String,
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl Target {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Target {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.user.is_empty() {
            write!(f, "{}@", self.user)?;
        }
        f.write_str(&self.host)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

// Parses `[user@]host[:port]`, including bracketed IPv6 literals.
impl FromStr for Target {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TunnelError::Resolution {
            target: s.to_string(),
            reason: reason.to_string(),
        };
        let s = s.trim();
        let (user, rest) = match s.rsplit_once('@') {
            Some((user, rest)) => (user, rest),
            None => ("", s),
        };
        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(invalid("unexpected characters after IPv6 literal")),
            }
        } else {
            match rest.split_once(':') {
                // More than one colon without brackets is a bare IPv6 address.
                Some((_, port)) if port.contains(':') => (rest, None),
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => 0,
        };
        Ok(Target::new(user, host, port))
    }
}

/// One fully resolved SSH endpoint, either the final target or an intermediate jump host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHop {
    pub user: String,
    // Name as requested, before HostName substitution.
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub identity_files: Vec<PathBuf>,
}

impl ResolvedHop {
    pub fn address(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

impl Display for ResolvedHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.address())
    }
}

/// A target with its dial address and the ordered jump chain needed to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub endpoint: ResolvedHop,
    // Hops in dial order; the first one is dialed directly.
    pub jumps: Vec<ResolvedHop>,
}

impl ResolvedTarget {
    pub fn user(&self) -> &str {
        &self.endpoint.user
    }

    pub fn dial_address(&self) -> String {
        self.endpoint.address()
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(self.user(), &self.dial_address())
    }
}

// Turns targets into dial addresses and proxy-jump chains, consulting the SSH client config.
#[derive(Builder, Debug, Clone)]
pub struct Resolver {
    // Path to the OpenSSH client configuration, if any should be consulted.
    ssh_config_path: Option<PathBuf>,
    // User to fall back to before the current OS user.
    default_user: Option<String>,
}

impl Resolver {
    pub async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, TunnelError> {
        if target.host.is_empty() {
            return Err(TunnelError::Resolution {
                target: target.to_string(),
                reason: "no host provided".into(),
            });
        }
        let config = match &self.ssh_config_path {
            Some(path) => SshConfig::load(path).await,
            None => SshConfig::default(),
        };
        let mut visited = Vec::new();
        let (endpoint, jumps) = self.resolve_chain(&config, target, &mut visited, 0)?;
        #[cfg(not(coverage_nightly))]
        debug!(
            %endpoint,
            jumps = jumps.len(),
            "Resolved SSH target."
        );
        Ok(ResolvedTarget { endpoint, jumps })
    }

    fn resolve_chain(
        &self,
        config: &SshConfig,
        target: &Target,
        visited: &mut Vec<String>,
        depth: usize,
    ) -> Result<(ResolvedHop, Vec<ResolvedHop>), TunnelError> {
        if depth > MAX_JUMP_DEPTH {
            return Err(TunnelError::Resolution {
                target: target.to_string(),
                reason: format!("proxy jump chain is deeper than {MAX_JUMP_DEPTH} hops"),
            });
        }
        if visited.contains(&target.host) {
            return Err(TunnelError::Resolution {
                target: target.to_string(),
                reason: "proxy jump chain loops back on itself".into(),
            });
        }
        visited.push(target.host.clone());

        let settings = config.lookup(&target.host);
        let user = if !target.user.is_empty() {
            target.user.clone()
        } else if let Some(user) = settings.user {
            user
        } else {
            let user = self
                .default_user
                .clone()
                .unwrap_or_else(current_os_user);
            #[cfg(not(coverage_nightly))]
            warn!(host = %target.host, %user, "No user configured for host, using default.");
            user
        };
        let port = if target.port != 0 {
            target.port
        } else if let Some(port) = settings.port {
            port
        } else {
            #[cfg(not(coverage_nightly))]
            warn!(host = %target.host, port = DEFAULT_SSH_PORT, "No port configured for host, using default.");
            DEFAULT_SSH_PORT
        };
        let hop = ResolvedHop {
            user,
            alias: target.host.clone(),
            hostname: settings.hostname.unwrap_or_else(|| target.host.clone()),
            port,
            identity_files: settings.identity_files,
        };

        let mut jumps = Vec::new();
        if let Some(proxy_jump) = settings
            .proxy_jump
            .filter(|value| !value.eq_ignore_ascii_case("none"))
        {
            for entry in proxy_jump.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let jump_target: Target = entry.parse()?;
                let (jump, nested) = self.resolve_chain(config, &jump_target, visited, depth + 1)?;
                jumps.extend(nested);
                jumps.push(jump);
            }
        }

        visited.pop();
        Ok((hop, jumps))
    }
}
