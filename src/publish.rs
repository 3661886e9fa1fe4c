use crate::{error::PublishError, identity::AddressPair};

// Host used for whichever side of a publish spec leaves its host out.
pub const DEFAULT_PUBLISH_HOST: &str = "0.0.0.0";

// Split on colons, keeping bracketed IPv6 hosts whole.
fn split_parts(spec: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, c) in spec.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                parts.push(&spec[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&spec[start..]);
    parts
}

fn is_port(value: &str) -> bool {
    value.parse::<u16>().is_ok()
}

fn port<'a>(spec: &str, value: &'a str) -> Result<&'a str, PublishError> {
    if is_port(value) {
        Ok(value)
    } else {
        Err(PublishError::InvalidPort {
            spec: spec.to_string(),
            port: value.to_string(),
        })
    }
}

fn host<'a>(spec: &str, value: &'a str) -> Result<&'a str, PublishError> {
    if value.is_empty() {
        Err(PublishError::InvalidSpec(spec.to_string()))
    } else {
        Ok(value)
    }
}

/// Parse an `ssh -L` style publish spec into a local/remote address pair.
///
/// - `lport:rport` listens on `0.0.0.0:lport` and relays to `0.0.0.0:rport`.
/// - `lport:rhost:rport` or `lhost:lport:rport`, told apart by whether the first part is a port.
/// - `lhost:lport:rhost:rport` is taken as-is.
pub fn parse_publish(spec: &str) -> Result<AddressPair, PublishError> {
    let parts = split_parts(spec.trim());
    let (local_host, local_port, remote_host, remote_port) = match parts.as_slice() {
        [local_port, remote_port] => (
            DEFAULT_PUBLISH_HOST,
            port(spec, local_port)?,
            DEFAULT_PUBLISH_HOST,
            port(spec, remote_port)?,
        ),
        [first, second, third] if is_port(first) => (
            DEFAULT_PUBLISH_HOST,
            *first,
            host(spec, second)?,
            port(spec, third)?,
        ),
        [first, second, third] => (
            host(spec, first)?,
            port(spec, second)?,
            DEFAULT_PUBLISH_HOST,
            port(spec, third)?,
        ),
        [local_host, local_port, remote_host, remote_port] => (
            host(spec, local_host)?,
            port(spec, local_port)?,
            host(spec, remote_host)?,
            port(spec, remote_port)?,
        ),
        _ => return Err(PublishError::InvalidSpec(spec.to_string())),
    };
    Ok(AddressPair::new(
        format!("{local_host}:{local_port}"),
        format!("{remote_host}:{remote_port}"),
    ))
}

/// Parse every spec, stopping at the first invalid one.
pub fn parse_publishes<S: AsRef<str>>(specs: &[S]) -> Result<Vec<AddressPair>, PublishError> {
    specs.iter().map(|spec| parse_publish(spec.as_ref())).collect()
}
