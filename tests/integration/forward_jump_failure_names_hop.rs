use tokio::net::TcpListener;
use tunman::control::{ControlRequest, ControlResponse};
use tunman::identity::AddressPair;

use crate::common::{SSH_USER, SshServer, list, open_request, request, start_daemon};

/// This test ensures that when a jump host can't be reached, the error names
/// that hop, and nothing is left open.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn forward_jump_failure_names_hop() {
    // 1. Initialize a destination behind a bastion that refuses connections
    let destination = SshServer::spawn().await;
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(
        dir.path().join("ssh_config"),
        format!(
            "Host destination\n  HostName 127.0.0.1\n  Port {}\n  User {SSH_USER}\n  ProxyJump bastion\n\nHost bastion\n  HostName 127.0.0.1\n  Port {closed_port}\n  User {SSH_USER}\n",
            destination.port(),
        ),
    )
    .await
    .unwrap();
    let (_tunman_handle, address) = start_daemon(dir.path(), "tunmand.sock", &[]).await;

    // 2. Opening a forward on the alias fails at the bastion
    let mut open = open_request(
        "destination",
        0,
        vec![AddressPair::new("127.0.0.1:0", "127.0.0.1:80")],
    );
    if let ControlRequest::Open { tunnels } = &mut open {
        tunnels[0].user = String::new();
    }
    let response = request(&address, open).await;
    let ControlResponse::Open { opened_ids, errors } = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(opened_ids.is_empty());
    assert_eq!(errors.len(), 1);
    assert!(
        errors[0].starts_with(&format!(
            "failed to reach jump host {SSH_USER}@127.0.0.1:{closed_port}"
        )),
        "{errors:?}"
    );

    // 3. The destination was never reached, and nothing is listed
    assert_eq!(destination.connections(), 0);
    assert!(list(&address).await.is_empty());
}
