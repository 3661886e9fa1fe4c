use tunman::control::{ControlRequest, ControlResponse};
use tunman::identity::AddressPair;

use crate::common::{SshServer, list, open_request, request, spawn_echo_server, start_daemon};

/// This test ensures that close-all reports when there is nothing to close,
/// and otherwise closes every session.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn control_close_all_when_empty() {
    // 1. Initialize servers and tunmand
    let echo = spawn_echo_server().await;
    let ssh = SshServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    let (_tunman_handle, address) = start_daemon(dir.path(), "tunmand.sock", &[]).await;

    // 2. Nothing to close yet
    assert_eq!(
        request(&address, ControlRequest::CloseAll).await,
        ControlResponse::CloseAll {
            ok: false,
            error: "No open tunnels".into()
        }
    );

    // 3. Unknown and malformed ids are reported one by one
    let response = request(
        &address,
        ControlRequest::Close {
            ids: vec!["not-an-id".into()],
        },
    )
    .await;
    assert_eq!(
        response,
        ControlResponse::Close {
            closed_ids: vec![],
            errors: vec!["invalid serialized ID".into()]
        }
    );

    // 4. Open forwards, then close everything
    let response = request(
        &address,
        open_request(
            "127.0.0.1",
            ssh.port(),
            vec![
                AddressPair::new("127.0.0.1:0", echo.to_string()),
                AddressPair::new("127.0.0.1:0", format!("localhost:{}", echo.port())),
            ],
        ),
    )
    .await;
    assert!(matches!(response, ControlResponse::Open { ref opened_ids, .. } if opened_ids.len() == 2));
    assert_eq!(
        request(&address, ControlRequest::CloseAll).await,
        ControlResponse::CloseAll {
            ok: true,
            error: String::new()
        }
    );
    assert!(list(&address).await.is_empty());

    // 5. Wrong credentials are reported without affecting the daemon
    let mut open = open_request(
        "127.0.0.1",
        ssh.port(),
        vec![AddressPair::new("127.0.0.1:0", echo.to_string())],
    );
    if let ControlRequest::Open { tunnels } = &mut open {
        tunnels[0].password = Some("wrong".into());
    }
    let response = request(&address, open).await;
    let ControlResponse::Open { opened_ids, errors } = response else {
        panic!("unexpected response {response:?}");
    };
    assert!(opened_ids.is_empty());
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("authentication failed"), "{errors:?}");
    assert!(list(&address).await.is_empty());
}
