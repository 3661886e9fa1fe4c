use tunman::control::ControlResponse;
use tunman::identity::AddressPair;

use crate::common::{
    SSH_USER, SshServer, list, open_request, request, roundtrip, spawn_echo_server, start_daemon,
};

/// This test ensures that a host alias with a ProxyJump is reached through the
/// jump host, using the SSH config for hostnames, ports and users.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn forward_through_proxy_jump() {
    // 1. Initialize servers and an SSH config with a jump host
    let echo = spawn_echo_server().await;
    let jump = SshServer::spawn().await;
    let destination = SshServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
        dir.path().join("ssh_config"),
        format!(
            "Host destination\n  HostName 127.0.0.1\n  Port {}\n  User {SSH_USER}\n  ProxyJump bastion\n\nHost bastion\n  HostName 127.0.0.1\n  Port {}\n  User {SSH_USER}\n",
            destination.port(),
            jump.port(),
        ),
    )
    .await
    .unwrap();
    let (_tunman_handle, address) = start_daemon(dir.path(), "tunmand.sock", &[]).await;

    // 2. Open a forward on the alias, leaving user and port to the config
    let mut open = open_request(
        "destination",
        0,
        vec![AddressPair::new("127.0.0.1:0", echo.to_string())],
    );
    if let tunman::control::ControlRequest::Open { tunnels } = &mut open {
        tunnels[0].user = String::new();
    }
    let response = request(&address, open).await;
    let ControlResponse::Open { opened_ids, errors } = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(opened_ids.len(), 1);

    // 3. Data goes through the jump host to the destination
    assert_eq!(jump.connections(), 1);
    assert_eq!(destination.connections(), 1);
    let forwards = list(&address).await;
    assert_eq!(forwards.len(), 1);
    assert_eq!(forwards[0].host, "destination");
    assert_eq!(forwards[0].user, SSH_USER);
    assert_eq!(forwards[0].port, destination.port());
    assert_eq!(
        forwards[0].address,
        format!("127.0.0.1:{}", destination.port())
    );
    assert_eq!(
        roundtrip(&forwards[0].bound_address, b"via bastion").await,
        b"via bastion"
    );
}
