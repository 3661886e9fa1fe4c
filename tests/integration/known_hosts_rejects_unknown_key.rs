use tunman::control::ControlResponse;
use tunman::identity::AddressPair;

use crate::common::{SshServer, launch_daemon, list, open_request, request};

/// This test ensures that, unless told otherwise, tunmand refuses servers
/// whose host key is missing from the known hosts file.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn known_hosts_rejects_unknown_key() {
    // 1. Initialize an SSH server and tunmand with an empty known hosts file
    let ssh = SshServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("known_hosts");
    tokio::fs::write(&known_hosts, "").await.unwrap();
    let (_tunman_handle, address) = launch_daemon(
        dir.path(),
        "tunmand.sock",
        &[format!("--known-hosts-path={}", known_hosts.display())],
    )
    .await;

    // 2. Opening a forward fails on the host key, before authentication
    let response = request(
        &address,
        open_request(
            "127.0.0.1",
            ssh.port(),
            vec![AddressPair::new("127.0.0.1:0", "127.0.0.1:80")],
        ),
    )
    .await;
    let ControlResponse::Open { opened_ids, errors } = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(opened_ids.is_empty());
    assert_eq!(
        errors,
        vec![format!("host key for 127.0.0.1:{} was rejected", ssh.port())]
    );
    assert_eq!(ssh.connections(), 1);
    assert!(list(&address).await.is_empty());
}
