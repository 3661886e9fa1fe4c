use std::path::{Path, PathBuf};

use ssh2_config::{ParseRule, SshConfig as ParsedConfig};
#[cfg(not(coverage_nightly))]
use tracing::{debug, warn};

use crate::paths::{expand_tilde, ssh_dir};

/// Settings that apply to a given host alias.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_files: Vec<PathBuf>,
    // Comma-separated jump hosts, as written in the config.
    pub proxy_jump: Option<String>,
}

/// Parsed OpenSSH client configuration.
#[derive(Default, Debug)]
pub struct SshConfig {
    parsed: ParsedConfig,
}

impl SshConfig {
    /// Load the config at the given path.
    ///
    /// A missing file is an empty config. Read or parse errors are logged and also yield an
    /// empty config, since resolution can always fall back to defaults.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => SshConfig::parse(&content).unwrap_or_else(|error| {
                #[cfg(not(coverage_nightly))]
                warn!(path = %path.display(), %error, "Unable to parse SSH config file.");
                SshConfig::default()
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                #[cfg(not(coverage_nightly))]
                debug!(path = %path.display(), "No SSH config file found.");
                SshConfig::default()
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                warn!(path = %path.display(), %error, "Unable to read SSH config file.");
                SshConfig::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, ssh2_config::SshParserError> {
        let parsed = ParsedConfig::default().parse(
            &mut content.as_bytes(),
            ParseRule::ALLOW_UNKNOWN_FIELDS | ParseRule::ALLOW_UNSUPPORTED_FIELDS,
        )?;
        Ok(SshConfig { parsed })
    }

    /// Collect settings for the given alias.
    pub fn lookup(&self, alias: &str) -> HostSettings {
        let params = self.parsed.query(alias);
        HostSettings {
            // %h expands to the alias that was looked up.
            hostname: params
                .host_name
                .map(|hostname| hostname.replace("%h", alias)),
            user: params.user,
            port: params.port,
            identity_files: params
                .identity_file
                .unwrap_or_default()
                .iter()
                .map(|path| expand_identity_path(&path.to_string_lossy()))
                .collect(),
            proxy_jump: params
                .proxy_jump
                .filter(|jumps| !jumps.is_empty())
                .map(|jumps| jumps.join(",")),
        }
    }
}

fn expand_identity_path(raw: &str) -> PathBuf {
    let expanded = expand_tilde(raw);
    if expanded.is_absolute() {
        return expanded;
    }
    match ssh_dir() {
        Some(dir) => dir.join(expanded),
        None => expanded,
    }
}
