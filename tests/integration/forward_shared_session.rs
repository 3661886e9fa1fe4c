use tunman::control::{ControlRequest, ControlResponse};
use tunman::identity::AddressPair;

use crate::common::{SshServer, list, open_request, request, roundtrip, spawn_echo_server, start_daemon};

/// This test ensures that forwards opened on the same endpoint share one SSH
/// connection, relay data, and that closing the last one closes the session.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn forward_shared_session() {
    // 1. Initialize servers and tunmand
    let echo = spawn_echo_server().await;
    let ssh = SshServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let (_tunman_handle, address) = start_daemon(dir.path(), "tunmand.sock", &[]).await;

    // 2. Open two forwards in separate requests
    let mut ids = Vec::new();
    for remote in [echo.to_string(), format!("localhost:{}", echo.port())] {
        let response = request(
            &address,
            open_request(
                "127.0.0.1",
                ssh.port(),
                vec![AddressPair::new("127.0.0.1:0", remote)],
            ),
        )
        .await;
        let ControlResponse::Open { opened_ids, errors } = response else {
            panic!("unexpected response {response:?}");
        };
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(opened_ids.len(), 1);
        ids.extend(opened_ids);
    }
    assert_eq!(ssh.connections(), 1, "forwards should share one session");

    // 3. Both forwards relay through the SSH server
    let forwards = list(&address).await;
    assert_eq!(forwards.len(), 2);
    assert_eq!(forwards[0].session_id, forwards[1].session_id);
    for forward in forwards.iter() {
        assert!(ids.contains(&forward.id));
        assert_eq!(
            roundtrip(&forward.bound_address, b"Hello, tunnel!").await,
            b"Hello, tunnel!"
        );
    }

    // 4. Closing a sibling leaves the other one alone
    let response = request(
        &address,
        ControlRequest::Close {
            ids: vec![ids[0].clone()],
        },
    )
    .await;
    assert_eq!(
        response,
        ControlResponse::Close {
            closed_ids: vec![ids[0].clone()],
            errors: vec![]
        }
    );
    let remaining = list(&address).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        roundtrip(&remaining[0].bound_address, b"still here").await,
        b"still here"
    );

    // 5. Closing the last forward removes the session
    request(
        &address,
        ControlRequest::Close {
            ids: vec![ids[1].clone()],
        },
    )
    .await;
    assert!(list(&address).await.is_empty());

    // 6. A new forward needs a new session
    let response = request(
        &address,
        open_request(
            "127.0.0.1",
            ssh.port(),
            vec![AddressPair::new("127.0.0.1:0", echo.to_string())],
        ),
    )
    .await;
    assert!(matches!(response, ControlResponse::Open { ref errors, .. } if errors.is_empty()));
    assert_eq!(ssh.connections(), 2);
}
