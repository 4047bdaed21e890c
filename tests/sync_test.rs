//! End-to-end synchronization tests over loopback TCP.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use remlaunch::protocol::{
    self, ConnectAccepted, MessageCode, OpResult, RequestFinishWriteFile, RequestWriteFile,
    ResponseFinishWriteFile, SendFileData, LINK_RUN_STATE,
};
use remlaunch::transport::{self, Frame};
use remlaunch::{
    ClientConfig, LauncherClient, NullHandler, NullRunner, RemoteClient, RunParameters, RunStatus,
    Server, ServerConfig, StopMode, SyncOutcome,
};

async fn start_pair(
    server_dir: &Path,
    client_dir: &Path,
    block_size: u32,
) -> (Arc<RemoteClient>, Arc<LauncherClient>) {
    let mut config = ServerConfig::new(server_dir, "127.0.0.1:0");
    config.block_size = block_size;
    let server = Server::bind(config, Arc::new(NullHandler)).await.unwrap();
    let addr = server.local_addr().unwrap();

    let accept = tokio::spawn(async move { server.accept().await });
    let client_config = ClientConfig::new(client_dir, "test-client", addr.to_string());
    let client = LauncherClient::connect(client_config, Box::new(NullRunner::new()))
        .await
        .unwrap();
    let remote = accept.await.unwrap().unwrap();
    (remote, client)
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_sync_empty_client_receives_single_file() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    fs::write(server_dir.path().join("hello.txt"), b"hi\n").unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 1_024_000).await;
    let outcome = remote.synchronize().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Success);

    let synced = fs::read(client_dir.path().join("hello.txt")).unwrap();
    assert_eq!(synced, b"hi\n");

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_sync_deletes_stale_client_file() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    fs::write(client_dir.path().join("stale.bin"), b"old data").unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 1_024_000).await;
    let outcome = remote.synchronize().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Success);
    assert!(!client_dir.path().join("stale.bin").exists());

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_sync_full_tree_with_subdirectories() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(server_dir.path().join("data/maps")).unwrap();
    fs::write(server_dir.path().join("game.cfg"), b"fullscreen=1\n").unwrap();
    fs::write(server_dir.path().join("data/content.pak"), vec![7u8; 5000]).unwrap();
    fs::write(server_dir.path().join("data/maps/level1.map"), b"level one").unwrap();
    // One file already matches, one is stale.
    fs::write(client_dir.path().join("game.cfg"), b"fullscreen=1\n").unwrap();
    fs::write(client_dir.path().join("leftover.tmp"), b"x").unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 2048).await;
    let outcome = remote.synchronize().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Success);

    assert_eq!(
        fs::read(client_dir.path().join("data/content.pak")).unwrap(),
        vec![7u8; 5000]
    );
    assert_eq!(
        fs::read(client_dir.path().join("data/maps/level1.map")).unwrap(),
        b"level one"
    );
    assert!(!client_dir.path().join("leftover.tmp").exists());

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_sync_partial_update_of_changed_block() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();

    // Three 1024-byte blocks; only the middle block differs.
    let mut server_content = vec![1u8; 3072];
    let mut client_content = server_content.clone();
    server_content[1500] = 0xAA;
    client_content[1500] = 0xBB;
    fs::write(server_dir.path().join("data.bin"), &server_content).unwrap();
    fs::write(client_dir.path().join("data.bin"), &client_content).unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 1024).await;
    let outcome = remote.synchronize().await.unwrap();
    assert_eq!(outcome, SyncOutcome::Success);
    assert_eq!(
        fs::read(client_dir.path().join("data.bin")).unwrap(),
        server_content
    );

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_sync_twice_is_idempotent() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    fs::write(server_dir.path().join("a.txt"), b"alpha").unwrap();
    fs::write(server_dir.path().join("b.txt"), vec![3u8; 4000]).unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 1024).await;
    assert_eq!(remote.synchronize().await.unwrap(), SyncOutcome::Success);
    assert_eq!(remote.synchronize().await.unwrap(), SyncOutcome::Success);

    assert_eq!(fs::read(client_dir.path().join("a.txt")).unwrap(), b"alpha");
    assert_eq!(
        fs::read(client_dir.path().join("b.txt")).unwrap(),
        vec![3u8; 4000]
    );

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_sync_fails_when_client_cannot_write() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();
    fs::write(server_dir.path().join("sub"), b"content").unwrap();
    // A directory where the client needs a regular file. Directories are
    // not part of layouts, so nothing deletes it before the write.
    fs::create_dir(client_dir.path().join("sub")).unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 1024).await;
    let outcome = remote.synchronize().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Failure(_)));

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_run_status_flows_over_link() {
    let server_dir = tempfile::tempdir().unwrap();
    let client_dir = tempfile::tempdir().unwrap();

    let (remote, client) = start_pair(server_dir.path(), client_dir.path(), 1024).await;
    assert_eq!(remote.synchronize().await.unwrap(), SyncOutcome::Success);
    assert_eq!(remote.run_status(), RunStatus::Stopped);

    remote
        .start_application(&RunParameters::new("", "default", ""))
        .unwrap();
    assert!(
        wait_until(|| remote.run_status() == RunStatus::Running, Duration::from_secs(5)).await,
        "server never observed the running state"
    );

    remote.stop_application(StopMode::KillProcess).unwrap();
    assert!(
        wait_until(|| remote.run_status() == RunStatus::Stopped, Duration::from_secs(5)).await,
        "server never observed the stop"
    );

    remote.disconnect();
    client.wait_closed().await;
}

#[tokio::test]
async fn test_wrong_client_signature_is_disconnected() {
    let server_dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(server_dir.path(), "127.0.0.1:0");
    let server = Server::bind(config, Arc::new(NullHandler)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let accept = tokio::spawn(async move { server.accept().await });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Hand-built connect request with a bad signature version.
    let mut body = vec![MessageCode::ConnectRequest as u8];
    body.extend_from_slice(b"DERemLaunchCnt-1");
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(4);
    body.extend_from_slice(b"test");
    let mut frame = (body.len() as u32).to_le_bytes().to_vec();
    frame.push(0);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await.unwrap();

    // The server must drop the connection without sending connectAccepted.
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server kept the connection open")
        .unwrap();
    assert_eq!(n, 0, "server sent data before disconnecting");

    accept.abort();
}

// =============================================================================
// Protocol-level client checks (scripted fake server)
// =============================================================================

/// Read protocol messages, skipping link traffic and keep-alives.
async fn read_message(rd: &mut (impl tokio::io::AsyncRead + Unpin)) -> (MessageCode, Bytes) {
    loop {
        match transport::read_frame(rd).await.unwrap() {
            Frame::Message(mut payload) => {
                let code = MessageCode::from_u8(payload.get_u8()).unwrap();
                if code == MessageCode::KeepAlive || code == MessageCode::Logs {
                    continue;
                }
                return (code, payload);
            }
            Frame::LinkUpdate { .. } | Frame::LinkState { .. } => continue,
        }
    }
}

#[tokio::test]
async fn test_finish_write_with_wrong_hash_reports_failure() {
    let client_dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let script = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut rd, mut wr) = stream.into_split();

        // Handshake.
        let (code, _) = read_message(&mut rd).await;
        assert_eq!(code, MessageCode::ConnectRequest);
        wr.write_all(&ConnectAccepted::new(0).encode()).await.unwrap();
        wr.write_all(&transport::link_state_frame(LINK_RUN_STATE, 0))
            .await
            .unwrap();
        wr.flush().await.unwrap();

        // The client needs a layout before it accepts write work.
        wr.write_all(&protocol::request_file_layout_frame())
            .await
            .unwrap();
        wr.flush().await.unwrap();
        let (code, _) = read_message(&mut rd).await;
        assert_eq!(code, MessageCode::ResponseFileLayout);

        // Write one block, then finish with a wrong expected hash.
        wr.write_all(
            &RequestWriteFile {
                path: "out.bin".to_string(),
                file_size: 4,
                block_size: 4,
                block_count: 1,
            }
            .encode(),
        )
        .await
        .unwrap();
        wr.flush().await.unwrap();
        let (code, payload) = read_message(&mut rd).await;
        assert_eq!(code, MessageCode::ResponseWriteFile);
        let resp = protocol::ResponseWriteFile::decode(payload).unwrap();
        assert_eq!(resp.result, OpResult::Success);

        wr.write_all(
            &SendFileData {
                path: "out.bin".to_string(),
                block_index: 0,
                data: Bytes::from_static(b"data"),
            }
            .encode(),
        )
        .await
        .unwrap();
        wr.flush().await.unwrap();
        let (code, payload) = read_message(&mut rd).await;
        assert_eq!(code, MessageCode::FileDataReceived);
        let resp = protocol::FileDataReceived::decode(payload).unwrap();
        assert_eq!(resp.result, OpResult::Success);

        wr.write_all(
            &RequestFinishWriteFile {
                path: "out.bin".to_string(),
                hash: vec![0xAA; 32],
            }
            .encode(),
        )
        .await
        .unwrap();
        wr.flush().await.unwrap();

        let (code, payload) = read_message(&mut rd).await;
        assert_eq!(code, MessageCode::ResponseFinishWriteFile);
        let resp = ResponseFinishWriteFile::decode(payload).unwrap();
        assert_eq!(resp.path, "out.bin");
        assert_eq!(resp.result, OpResult::Failure);
    });

    let config = ClientConfig::new(client_dir.path(), "test-client", addr.to_string());
    let client = LauncherClient::connect(config, Box::new(NullRunner::new()))
        .await
        .unwrap();

    script.await.unwrap();

    // The block write itself landed; only the verification failed.
    assert_eq!(fs::read(client_dir.path().join("out.bin")).unwrap(), b"data");
    client.disconnect();
}
