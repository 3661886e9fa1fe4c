use std::{path::Path, sync::Arc};

use russh::{
    client::Handle,
    keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, load_secret_key},
};
use secrecy::{ExposeSecret, SecretString};
#[cfg(not(coverage_nightly))]
use tracing::{debug, warn};

use super::handler::ClientHandler;
use crate::{error::TunnelError, paths::default_identity_files, resolver::ResolvedHop};

/// Per-request credentials. Secrets are redacted from `Debug` output.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub password: Option<SecretString>,
    // OpenSSH-encoded private key contents.
    pub private_key: Option<SecretString>,
}

impl Credentials {
    pub fn new(password: Option<String>, private_key: Option<String>) -> Self {
        Credentials {
            password: password.filter(|p| !p.is_empty()).map(SecretString::from),
            private_key: private_key.filter(|k| !k.is_empty()).map(SecretString::from),
        }
    }
}

// Try every available method in order until the server accepts one.
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    hop: &ResolvedHop,
    credentials: &Credentials,
    use_agent: bool,
) -> Result<(), TunnelError> {
    let user = hop.user.as_str();

    if let Some(key) = &credentials.private_key {
        match decode_secret_key(key.expose_secret(), None) {
            Ok(key) => {
                if authenticate_with_key(handle, user, key).await? {
                    return Ok(());
                }
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                warn!(%hop, %error, "Unable to decode provided private key.");
            }
        }
    }

    if let Some(password) = &credentials.password {
        if handle
            .authenticate_password(user, password.expose_secret())
            .await?
            .success()
        {
            return Ok(());
        }
        #[cfg(not(coverage_nightly))]
        debug!(%hop, "Password rejected.");
    }

    for path in hop.identity_files.iter() {
        if authenticate_with_key_file(handle, user, path).await? {
            return Ok(());
        }
    }

    #[cfg(unix)]
    {
        if use_agent && authenticate_with_agent(handle, user).await? {
            return Ok(());
        }
    }
    #[cfg(not(unix))]
    let _ = use_agent;

    for path in default_identity_files()
        .iter()
        .filter(|path| !hop.identity_files.contains(path))
    {
        if authenticate_with_key_file(handle, user, path).await? {
            return Ok(());
        }
    }

    Err(TunnelError::Authentication {
        user: user.to_string(),
        address: hop.address(),
    })
}

async fn authenticate_with_key(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    key: PrivateKey,
) -> Result<bool, TunnelError> {
    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
    Ok(handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await?
        .success())
}

async fn authenticate_with_key_file(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    path: &Path,
) -> Result<bool, TunnelError> {
    if !path.exists() {
        return Ok(false);
    }
    match load_secret_key(path, None) {
        Ok(key) => {
            let accepted = authenticate_with_key(handle, user, key).await?;
            #[cfg(not(coverage_nightly))]
            debug!(path = %path.display(), accepted, "Tried identity file.");
            Ok(accepted)
        }
        Err(error) => {
            // Encrypted keys can't be used without a passphrase; move on to the next method.
            #[cfg(not(coverage_nightly))]
            warn!(path = %path.display(), %error, "Unable to load identity file.");
            Ok(false)
        }
    }
}

#[cfg(unix)]
async fn authenticate_with_agent(
    handle: &mut Handle<ClientHandler>,
    user: &str,
) -> Result<bool, TunnelError> {
    let Ok(agent_path) = std::env::var("SSH_AUTH_SOCK") else {
        return Ok(false);
    };
    let stream = match tokio::net::UnixStream::connect(&agent_path).await {
        Ok(stream) => stream,
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            warn!(%agent_path, %error, "Unable to connect to SSH agent.");
            return Ok(false);
        }
    };
    let mut agent = russh::keys::agent::client::AgentClient::connect(stream);
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            warn!(%error, "Unable to list SSH agent identities.");
            return Ok(false);
        }
    };
    for identity in identities {
        let hash_alg = if identity.algorithm().is_rsa() {
            handle.best_supported_rsa_hash().await?.flatten()
        } else {
            None
        };
        match handle
            .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                debug!(?error, "Agent key failed.");
            }
        }
    }
    Ok(false)
}
