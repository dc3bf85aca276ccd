//! End-to-end client/server behavior over real sockets.

use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use harbor_client::{ArchiveClient, ClientEvent, ClientError, LockOutcome};
use harbor_proto::frame::{write_frame, FrameReader};
use harbor_server::RunningServer;
use harbor_types::{ServerConfig, TimeRange};

async fn start_server(root: &std::path::Path) -> RunningServer {
    let mut config = ServerConfig::for_root(root);
    config.listen_addr = "127.0.0.1:0".to_string();
    config.diagnostics_addr = "127.0.0.1:0".to_string();
    harbor_server::start(&config).await.unwrap()
}

#[tokio::test]
async fn write_commit_read_round_trip() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = ArchiveClient::connect(server.client_addr(), "ctd-ingest")
        .await
        .unwrap();
    client.begin(true).await.unwrap();
    client
        .write_file("mooring/ctd-7/2024.dat", b"salinity series")
        .await
        .unwrap();
    client.commit().await.unwrap();

    client.begin(false).await.unwrap();
    let content = client.read_file("mooring/ctd-7/2024.dat").await.unwrap();
    assert_eq!(content, b"salinity series");

    let listed = client.list_files("mooring", 0.0).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, "mooring/ctd-7/2024.dat");
    client.abort().await.unwrap();

    client.heartbeat().await.unwrap();
    client.close().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn aborted_write_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = ArchiveClient::connect(server.client_addr(), "ingest")
        .await
        .unwrap();
    client.begin(true).await.unwrap();
    client.write_file("line/a.dat", b"doomed").await.unwrap();
    client.abort().await.unwrap();

    client.begin(false).await.unwrap();
    let err = client.read_file("line/a.dat").await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(_)));
    client.abort().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn operations_require_a_transaction() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = ArchiveClient::connect(server.client_addr(), "stray")
        .await
        .unwrap();
    assert!(matches!(
        client.read_file("line/a.dat").await.unwrap_err(),
        ClientError::Remote(_)
    ));
    assert!(matches!(
        client.commit().await.unwrap_err(),
        ClientError::Remote(_)
    ));

    // A rejected WRITE_FILE must still drain its announced bytes, so the
    // connection keeps working afterwards.
    assert!(matches!(
        client.write_file("line/a.dat", &[7u8; 4096]).await.unwrap_err(),
        ClientError::Remote(_)
    ));
    client.heartbeat().await.unwrap();

    client.begin(false).await.unwrap();
    assert!(matches!(
        client.begin(false).await.unwrap_err(),
        ClientError::Remote(_)
    ));
    server.shutdown();
}

#[tokio::test]
async fn lock_denial_reports_blocker_status() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut first = ArchiveClient::connect(server.client_addr(), "w1")
        .await
        .unwrap();
    let mut second = ArchiveClient::connect(server.client_addr(), "w2")
        .await
        .unwrap();

    // Begin order fixes the generations: first gets the earlier one.
    first.begin(true).await.unwrap();
    second.begin(true).await.unwrap();
    second.set_status("surveying leg 2").await.unwrap();

    assert_eq!(
        second
            .lock_write("mooring/ctd-7", TimeRange::new(0, 100))
            .await
            .unwrap(),
        LockOutcome::Granted
    );

    // The earlier-generation writer must not write under the later one.
    match first
        .lock_write("mooring/ctd-7", TimeRange::new(50, 150))
        .await
        .unwrap()
    {
        LockOutcome::Denied { status } => assert_eq!(status, "surveying leg 2"),
        LockOutcome::Granted => panic!("overlapping write lock must be denied"),
    }

    // Disjoint range on the same key is fine.
    assert_eq!(
        first
            .lock_write("mooring/ctd-7", TimeRange::new(200, 300))
            .await
            .unwrap(),
        LockOutcome::Granted
    );

    // Once the blocker commits, its locks are gone.
    second.commit().await.unwrap();
    assert_eq!(
        first
            .lock_write("mooring/ctd-7", TimeRange::new(50, 150))
            .await
            .unwrap(),
        LockOutcome::Granted
    );
    server.shutdown();
}

#[tokio::test]
async fn notification_commit_blocks_until_acknowledged() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut listener = ArchiveClient::connect(server.client_addr(), "export")
        .await
        .unwrap();
    listener.listen("survey/leg1").await.unwrap();

    let mut writer = ArchiveClient::connect(server.client_addr(), "ingest")
        .await
        .unwrap();
    writer.begin(true).await.unwrap();
    writer
        .write_file("survey/leg1/a.dat", b"fresh")
        .await
        .unwrap();
    writer
        .send_notification("survey/leg1", TimeRange::new(1000, 2000))
        .await
        .unwrap();

    let committing = tokio::spawn(async move {
        writer.commit().await.unwrap();
        writer
    });

    let event = timeout(Duration::from_secs(5), listener.recv_event())
        .await
        .unwrap()
        .unwrap();
    let id = match event {
        ClientEvent::Notification { id, key, range } => {
            assert_eq!(key, "survey/leg1");
            assert_eq!(range, TimeRange::new(1000, 2000));
            id
        }
        other => panic!("expected a notification, got {other:?}"),
    };

    // The commit waits for the acknowledgment.
    sleep(Duration::from_millis(100)).await;
    assert!(!committing.is_finished());

    listener.acknowledge(id).await.unwrap();
    let mut writer = timeout(Duration::from_secs(5), committing)
        .await
        .unwrap()
        .unwrap();

    // The committed content is visible to the listener.
    listener.begin(false).await.unwrap();
    assert_eq!(
        listener.read_file("survey/leg1/a.dat").await.unwrap(),
        b"fresh"
    );
    listener.abort().await.unwrap();
    writer.heartbeat().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn listener_disconnect_unblocks_commit() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut listener = ArchiveClient::connect(server.client_addr(), "export")
        .await
        .unwrap();
    listener.listen("survey").await.unwrap();

    let mut writer = ArchiveClient::connect(server.client_addr(), "ingest")
        .await
        .unwrap();
    writer.begin(true).await.unwrap();
    writer
        .send_notification("survey", TimeRange::new(0, 10))
        .await
        .unwrap();

    let committing = tokio::spawn(async move { writer.commit().await });
    sleep(Duration::from_millis(100)).await;
    assert!(!committing.is_finished());

    // Dropping the listener is an implicit acknowledgment.
    drop(listener);
    timeout(Duration::from_secs(5), committing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    server.shutdown();
}

#[tokio::test]
async fn intent_conflict_pushes_hit_and_denies() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut holder = ArchiveClient::connect(server.client_addr(), "planner")
        .await
        .unwrap();
    holder.begin(true).await.unwrap();
    holder.set_status("staging leg 2").await.unwrap();
    let uid = holder
        .acquire_intent("mooring/ctd-7", TimeRange::new(0, 100), true)
        .await
        .unwrap();

    let mut requester = ArchiveClient::connect(server.client_addr(), "ingest")
        .await
        .unwrap();
    requester.begin(true).await.unwrap();
    match requester
        .lock_write("mooring/ctd-7", TimeRange::new(50, 60))
        .await
        .unwrap()
    {
        LockOutcome::Denied { status } => assert_eq!(status, "staging leg 2"),
        LockOutcome::Granted => panic!("intent conflict must deny the lock"),
    }

    // The intent holder hears about the contender.
    let event = timeout(Duration::from_secs(5), holder.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ClientEvent::IntentHit {
            key: "mooring/ctd-7".to_string(),
            range: TimeRange::new(50, 60),
        }
    );

    // Releasing the intent clears the way.
    holder.release_intent(uid, true).await.unwrap();
    assert_eq!(
        requester
            .lock_write("mooring/ctd-7", TimeRange::new(50, 60))
            .await
            .unwrap(),
        LockOutcome::Granted
    );
    server.shutdown();
}

async fn diag_request(
    reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    request: serde_json::Value,
) -> serde_json::Value {
    let raw = serde_json::to_vec(&request).unwrap();
    write_frame(writer, &raw).await.unwrap();
    writer.flush().await.unwrap();
    let frame = reader.next_frame().await.unwrap().unwrap();
    serde_json::from_slice(&frame).unwrap()
}

#[tokio::test]
async fn diagnostics_inspects_and_closes_connections() {
    let dir = tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let mut client = ArchiveClient::connect(server.client_addr(), "ctd-ingest")
        .await
        .unwrap();
    client.begin(true).await.unwrap();
    client.set_status("loading cast 12").await.unwrap();
    client
        .lock_write("mooring/ctd-7", TimeRange::new(0, 100))
        .await
        .unwrap();

    let diag = TcpStream::connect(server.diagnostics_addr()).await.unwrap();
    let (read_half, mut writer) = diag.into_split();
    let mut reader = FrameReader::new(read_half);

    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "list_connections"}),
    )
    .await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["data"][0]["name"], "ctd-ingest");
    assert_eq!(response["data"][0]["transaction_status"], "loading cast 12");
    let uid = response["data"][0]["id"].as_u64().unwrap();

    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "list_locks"}),
    )
    .await;
    assert_eq!(response["data"][0]["key"], "mooring/ctd-7");
    assert_eq!(response["data"][0]["write"], true);

    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "transaction_details", "uid": uid}),
    )
    .await;
    assert_eq!(response["ok"], true);
    assert_eq!(response["data"]["write"], true);
    assert_eq!(response["data"]["locks_held"], 1);
    assert_eq!(response["data"]["status"], "loading cast 12");

    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "bogus"}),
    )
    .await;
    assert_eq!(response["ok"], false);

    // close_connection tears the client down and aborts its transaction.
    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "close_connection", "uid": uid}),
    )
    .await;
    assert_eq!(response["ok"], true);

    sleep(Duration::from_millis(100)).await;
    assert!(client.heartbeat().await.is_err());

    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "list_connections"}),
    )
    .await;
    assert_eq!(response["data"].as_array().unwrap().len(), 0);
    let response = diag_request(
        &mut reader,
        &mut writer,
        serde_json::json!({"op": "list_locks"}),
    )
    .await;
    assert_eq!(response["data"].as_array().unwrap().len(), 0);
    server.shutdown();
}

#[tokio::test]
async fn dead_peer_is_disconnected_after_timeout() {
    let dir = tempdir().unwrap();
    let mut config = ServerConfig::for_root(dir.path());
    config.listen_addr = "127.0.0.1:0".to_string();
    config.diagnostics_addr = "127.0.0.1:0".to_string();
    config.read_timeout_secs = 1;
    let server = harbor_server::start(&config).await.unwrap();

    let mut client = ArchiveClient::connect(server.client_addr(), "quiet")
        .await
        .unwrap();
    client.heartbeat().await.unwrap();

    sleep(Duration::from_millis(1500)).await;
    assert!(client.heartbeat().await.is_err());
    server.shutdown();
}
