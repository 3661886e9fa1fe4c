use std::path::PathBuf;

pub(crate) fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
}

pub(crate) fn ssh_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ssh"))
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

// Keys tried when neither the request nor the SSH config names one.
pub(crate) fn default_identity_files() -> Vec<PathBuf> {
    ssh_dir()
        .map(|dir| {
            ["id_ed25519", "id_ecdsa", "id_rsa"]
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn default_ssh_config_file() -> PathBuf {
    ssh_dir()
        .map(|dir| dir.join("config"))
        .unwrap_or_else(|| PathBuf::from(".ssh/config"))
}

pub(crate) fn default_known_hosts_file() -> PathBuf {
    ssh_dir()
        .map(|dir| dir.join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"))
}

/// Last-resort user when neither the request nor the SSH config provides one.
pub(crate) fn current_os_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
