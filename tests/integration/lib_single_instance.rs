use clap::Parser;
use tunman::{ApplicationConfig, entrypoint};

use crate::common::start_daemon;

/// This test ensures that a second daemon refuses to start on a control
/// address that another daemon is serving.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lib_single_instance() {
    // 1. Initialize tunmand
    let dir = tempfile::tempdir().unwrap();
    let (_tunman_handle, address) = start_daemon(dir.path(), "tunmand.sock", &[]).await;

    // 2. A second instance on the same socket fails to start
    let config = ApplicationConfig::parse_from([
        "tunmand".to_string(),
        format!("--listen={address}"),
        format!("--database-path={}", dir.path().join("other.db").display()),
    ]);
    let error = entrypoint(config)
        .await
        .expect_err("second daemon should not start");
    assert!(
        format!("{error:?}").contains("already listening"),
        "unexpected error: {error:?}"
    );
}
