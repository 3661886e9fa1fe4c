use std::collections::HashSet;

use tunman::control::ControlResponse;
use tunman::identity::AddressPair;

use crate::common::{SshServer, list, open_request, request, roundtrip, spawn_echo_server, start_daemon};

/// This test ensures that forwards recorded in the state database are opened
/// again when tunmand restarts, with the same ids and the same sessions.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn restart_restores_forwards() {
    // 1. Initialize servers and tunmand
    let echo = spawn_echo_server().await;
    let first = SshServer::spawn().await;
    let second = SshServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let (tunman_handle, address) = start_daemon(dir.path(), "before.sock", &[]).await;

    // 2. Open three forwards across two sessions
    for (ssh, remote) in [
        (&first, echo.to_string()),
        (&first, format!("localhost:{}", echo.port())),
        (&second, echo.to_string()),
    ] {
        let response = request(
            &address,
            open_request(
                "127.0.0.1",
                ssh.port(),
                vec![AddressPair::new("127.0.0.1:0", remote)],
            ),
        )
        .await;
        assert!(
            matches!(response, ControlResponse::Open { ref errors, .. } if errors.is_empty()),
            "{response:?}"
        );
    }
    let before = list(&address).await;
    assert_eq!(before.len(), 3);

    // 3. Stop tunmand and start it again on the same database
    drop(tunman_handle);
    let (_tunman_handle, address) = start_daemon(dir.path(), "after.sock", &[]).await;

    // 4. The same forwards come back, grouped the same way
    let after = list(&address).await;
    let ids = |forwards: &[tunman::ForwardDescriptor]| {
        forwards
            .iter()
            .map(|forward| (forward.id.clone(), forward.session_id.clone()))
            .collect::<HashSet<_>>()
    };
    assert_eq!(ids(&after), ids(&before));
    let sessions = after
        .iter()
        .map(|forward| forward.session_id.clone())
        .collect::<HashSet<_>>();
    assert_eq!(sessions.len(), 2);
    assert_eq!(first.connections(), 2);
    assert_eq!(second.connections(), 2);
    for forward in after.iter() {
        assert_eq!(
            roundtrip(&forward.bound_address, b"restored").await,
            b"restored"
        );
    }
}
