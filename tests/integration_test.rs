//! Integration tests for canopy
//!
//! Everything runs against the in-memory wire client, so connection loss,
//! session expiry, and retry behavior can be exercised deterministically.

use std::sync::Arc;
use std::time::Duration;

use canopy::testing::MemoryDialer;
use canopy::{
    Acl, CanopyClient, CanopyConfig, CanopyError, CanopyEvent, CompressionProvider, ConnectionState,
    CreateMode, FrameworkState, Result, TransactionResult, ANY_VERSION,
};
use canopy_retry::{ExponentialBackoffRetry, RetryNTimes};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_retry() -> Arc<RetryNTimes> {
    Arc::new(RetryNTimes::new(3, Duration::from_millis(10)))
}

async fn started_client(config: CanopyConfig) -> (CanopyClient, Arc<MemoryDialer>) {
    let dialer = Arc::new(MemoryDialer::new());
    let client = CanopyClient::with_config(config, dialer.clone()).expect("build client");
    client.start().expect("start");
    client
        .block_until_connected_timeout(Duration::from_secs(5))
        .await
        .expect("connect");
    (client, dialer)
}

fn event_channel(client: &CanopyClient) -> mpsc::UnboundedReceiver<CanopyEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.listenable().add(Arc::new(move |event: &CanopyEvent| {
        let _ = tx.send(event.clone());
        Ok(())
    }));
    rx
}

fn state_channel(client: &CanopyClient) -> mpsc::UnboundedReceiver<ConnectionState> {
    let (tx, rx) = mpsc::unbounded_channel();
    client
        .connection_state_listenable()
        .add(Arc::new(move |state: ConnectionState| {
            let _ = tx.send(state);
        }));
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<CanopyEvent>) -> CanopyEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_state(rx: &mut mpsc::UnboundedReceiver<ConnectionState>) -> ConnectionState {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed")
}

#[tokio::test]
async fn test_lifecycle_transitions_exactly_once() {
    init_tracing();
    let dialer = Arc::new(MemoryDialer::new());
    let client = CanopyClient::with_config(CanopyConfig::new("memory:2181"), dialer).unwrap();

    assert_eq!(client.state(), FrameworkState::Latent);

    // Builders fail fast before start, with the programmer-error category.
    let err = client.create().for_path("/x").await.unwrap_err();
    assert!(err.is_programmer_error());

    assert_ok!(client.start());
    assert!(client.started());

    // A second start is an error.
    let err = client.start().unwrap_err();
    assert!(matches!(err, CanopyError::Lifecycle(_)));

    assert_ok!(client.close().await);
    assert_eq!(client.state(), FrameworkState::Stopped);

    // A second close is a no-op.
    assert_ok!(client.close().await);

    let err = client.get_data().for_path("/x").await.unwrap_err();
    assert!(err.is_programmer_error());
}

#[tokio::test]
async fn test_close_broadcasts_closing_and_clears_listeners() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;
    let mut events = event_channel(&client);

    client.close().await.unwrap();

    let event = next_event(&mut events).await;
    assert!(matches!(event, CanopyEvent::Closing));
    assert!(client.listenable().is_empty());
}

#[tokio::test]
async fn test_namespace_facade_cache_returns_identical_instance() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;

    let first = client.using_namespace("ns").unwrap();
    let second = client.using_namespace("ns").unwrap();
    assert_eq!(first, second);

    let other = client.using_namespace("other").unwrap();
    assert_ne!(first, other);

    // The empty namespace behaves as the non-namespaced view.
    let root_view = client.non_namespace_view().unwrap();
    assert_eq!(root_view.namespace(), "");
    assert_eq!(root_view, client.using_namespace("").unwrap());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_namespace_write_read_roundtrip() {
    let config = CanopyConfig::new("memory:2181").with_namespace("ns");
    let (client, dialer) = started_client(config).await;

    client
        .create()
        .creating_parents_if_needed()
        .for_path_with_data("/a/b", b"payload".to_vec())
        .await
        .unwrap();

    // The facade never observes the prefix.
    let data = client.get_data().for_path("/a/b").await.unwrap();
    assert_eq!(data, b"payload");

    // The raw tree holds the prefixed path.
    assert!(dialer.node_exists("/ns/a/b"));
    assert!(!dialer.node_exists("/a/b"));

    // The non-namespaced view observes the path as /ns/a/b.
    let root_view = client.non_namespace_view().unwrap();
    let data = root_view.get_data().for_path("/ns/a/b").await.unwrap();
    assert_eq!(data, b"payload");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_sequential_create_under_namespace_strips_prefix() {
    let config = CanopyConfig::new("memory:2181").with_namespace("ns");
    let (client, dialer) = started_client(config).await;

    let created = client
        .create()
        .creating_parents_if_needed()
        .with_mode(CreateMode::PersistentSequential)
        .for_path_with_data("/a/b-", b"".to_vec())
        .await
        .unwrap();

    // The caller sees the suffixed name relative to the namespace while the
    // underlying write landed under /ns.
    assert_eq!(created, "/a/b-0000000000");
    assert!(dialer.node_exists("/ns/a/b-0000000000"));

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_against_unreachable_ensemble() {
    init_tracing();
    let dialer = Arc::new(MemoryDialer::new());
    dialer.set_unreachable(true);

    let config = CanopyConfig::new("memory:2181").with_retry_policy(Arc::new(
        ExponentialBackoffRetry::new(Duration::from_secs(1), 3, Duration::from_secs(15)),
    ));
    let client = CanopyClient::with_config(config, dialer).unwrap();
    client.start().unwrap();

    let before = tokio::time::Instant::now();
    let err = client.get_data().for_path("/x").await.unwrap_err();

    match err {
        CanopyError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert_eq!(*source, CanopyError::ConnectionLoss);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }

    // Two backoff sleeps of at least the base each separated the attempts.
    assert!(before.elapsed() >= Duration::from_secs(2));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_block_until_connected_times_out_when_unreachable() {
    let dialer = Arc::new(MemoryDialer::new());
    dialer.set_unreachable(true);

    let config = CanopyConfig::new("memory:2181").with_retry_policy(fast_retry());
    let client = CanopyClient::with_config(config, dialer).unwrap();
    client.start().unwrap();

    let err = client
        .block_until_connected_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert_eq!(err, CanopyError::ConnectionWaitTimeout);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_version_guard_semantics() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;

    client.create().for_path_with_data("/v", b"a".to_vec()).await.unwrap();

    // Matching version succeeds and bumps the version.
    let stat = client.set_data().with_version(0).for_path("/v", b"b".to_vec()).await.unwrap();
    assert_eq!(stat.version, 1);

    // Stale version fails and mutates nothing.
    let err = client
        .set_data()
        .with_version(0)
        .for_path("/v", b"c".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err, CanopyError::BadVersion("/v".to_string()));
    assert_eq!(client.get_data().for_path("/v").await.unwrap(), b"b");

    let err = client.delete().with_version(7).for_path("/v").await.unwrap_err();
    assert_eq!(err, CanopyError::BadVersion("/v".to_string()));

    // ANY_VERSION deletes irrespective of the current version.
    assert_ok!(client.delete().with_version(ANY_VERSION).for_path("/v").await);
    assert_eq!(client.check_exists().for_path("/v").await.unwrap(), None);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_create_on_retry_is_treated_as_success() {
    let config = CanopyConfig::new("memory:2181").with_retry_policy(fast_retry());
    let (client, dialer) = started_client(config).await;

    // The create lands server-side, but the client observes a transport
    // error and retries; the duplicate answer must not surface.
    dialer.fail_ops_after_apply(1, CanopyError::ConnectionLoss);

    let created = client.create().for_path_with_data("/dup", b"x".to_vec()).await.unwrap();
    assert_eq!(created, "/dup");

    let stat = client.check_exists().for_path("/dup").await.unwrap();
    assert!(stat.is_some());
    assert_eq!(client.get_data().for_path("/dup").await.unwrap(), b"x");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_retriable_failures_are_retried_and_terminal_are_not() {
    let config = CanopyConfig::new("memory:2181").with_retry_policy(fast_retry());
    let (client, dialer) = started_client(config).await;

    client.create().for_path_with_data("/r", b"x".to_vec()).await.unwrap();

    // Two transient failures, then success.
    dialer.fail_ops(2, CanopyError::OperationTimeout);
    assert_eq!(client.get_data().for_path("/r").await.unwrap(), b"x");

    // Terminal answers are returned immediately, never retried.
    let err = client.get_data().for_path("/absent").await.unwrap_err();
    assert_eq!(err, CanopyError::NoNode("/absent".to_string()));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_background_create_delivers_event_with_context() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;
    let mut events = event_channel(&client);

    client
        .create()
        .in_background_with_context(777u32)
        .for_path_with_data("/bg", b"x".to_vec())
        .unwrap();

    match next_event(&mut events).await {
        CanopyEvent::Created {
            path,
            created_path,
            error,
            context,
        } => {
            assert_eq!(path, "/bg");
            assert_eq!(created_path.as_deref(), Some("/bg"));
            assert!(error.is_none());
            let context = context.expect("context attached");
            assert_eq!(context.downcast_ref::<u32>(), Some(&777));
        }
        other => panic!("expected Created event, got {other:?}"),
    }

    // At most once: no second delivery for the same invocation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_background_errors_arrive_on_the_event_not_the_caller() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;
    let mut events = event_channel(&client);

    // The caller's terminal returns Ok immediately; the failure is carried
    // on the delivered event.
    assert_ok!(client.get_data().in_background().for_path("/missing"));

    match next_event(&mut events).await {
        CanopyEvent::GetData { path, data, error, .. } => {
            assert_eq!(path, "/missing");
            assert!(data.is_none());
            assert_eq!(error, Some(CanopyError::NoNode("/missing".to_string())));
        }
        other => panic!("expected GetData event, got {other:?}"),
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_sync_is_always_background_and_honors_context() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;
    let mut events = event_channel(&client);

    client.do_sync("/", "corr-9").unwrap();

    match next_event(&mut events).await {
        CanopyEvent::Synced { path, error, context } => {
            assert_eq!(path, "/");
            assert!(error.is_none());
            let context = context.expect("context attached");
            assert_eq!(context.downcast_ref::<&str>(), Some(&"corr-9"));
        }
        other => panic!("expected Synced event, got {other:?}"),
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_watched_event_paths_are_namespace_stripped() {
    let config = CanopyConfig::new("memory:2181").with_namespace("ns");
    let (client, _dialer) = started_client(config).await;
    let mut events = event_channel(&client);

    client.create().for_path_with_data("/w", b"1".to_vec()).await.unwrap();
    client.get_data().watched().for_path("/w").await.unwrap();

    client.set_data().for_path("/w", b"2".to_vec()).await.unwrap();

    match next_event(&mut events).await {
        CanopyEvent::Watched(watched) => {
            assert_eq!(watched.path, "/w");
            assert_eq!(watched.kind, canopy::NodeEventKind::DataChanged);
        }
        other => panic!("expected Watched event, got {other:?}"),
    }

    // One-shot: a second write does not fire again.
    client.set_data().for_path("/w", b"3".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_state_flow_through_disconnect_and_reconnect() {
    init_tracing();
    let config = CanopyConfig::new("memory:2181").with_retry_policy(fast_retry());
    let dialer = Arc::new(MemoryDialer::new());
    let client = CanopyClient::with_config(config, dialer.clone()).unwrap();
    let mut states = state_channel(&client);

    client.start().unwrap();
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    dialer.drop_connections();
    assert_eq!(next_state(&mut states).await, ConnectionState::Suspended);
    assert_eq!(next_state(&mut states).await, ConnectionState::Reconnected);

    assert_eq!(client.state_manager().missed_states(), 0);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_session_expiry_reports_lost_and_reaps_ephemerals() {
    let config = CanopyConfig::new("memory:2181").with_retry_policy(fast_retry());
    let dialer = Arc::new(MemoryDialer::new());
    let client = CanopyClient::with_config(config, dialer.clone()).unwrap();
    let mut states = state_channel(&client);

    client.start().unwrap();
    assert_eq!(next_state(&mut states).await, ConnectionState::Connected);

    client
        .create()
        .with_mode(CreateMode::Ephemeral)
        .for_path_with_data("/worker", b"".to_vec())
        .await
        .unwrap();

    dialer.expire_sessions();

    // Lost is never skipped, even though the re-handshake follows
    // immediately.
    assert_eq!(next_state(&mut states).await, ConnectionState::Lost);
    assert_eq!(next_state(&mut states).await, ConnectionState::Reconnected);

    // The ephemeral node died with its session.
    assert_eq!(client.check_exists().for_path("/worker").await.unwrap(), None);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_listener_errors_route_to_unhandled_error_listeners() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    client
        .unhandled_error_listenable()
        .add(Arc::new(move |error: &CanopyError| {
            let _ = err_tx.send(error.clone());
        }));

    // First listener fails; the second must still be invoked.
    client.listenable().add(Arc::new(|_: &CanopyEvent| {
        Err(CanopyError::Wire("listener boom".into()))
    }));
    let (ok_tx, mut ok_rx) = mpsc::unbounded_channel();
    client.listenable().add(Arc::new(move |event: &CanopyEvent| {
        let _ = ok_tx.send(event.kind());
        Ok(())
    }));

    client.create().in_background().for_path_with_data("/evt", b"".to_vec()).unwrap();

    let routed = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("timed out")
        .expect("closed");
    assert_eq!(routed, CanopyError::Wire("listener boom".into()));

    let kind = tokio::time::timeout(Duration::from_secs(5), ok_rx.recv())
        .await
        .expect("timed out")
        .expect("closed");
    assert_eq!(kind, "created");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_transaction_commits_atomically() {
    let config = CanopyConfig::new("memory:2181").with_namespace("ns");
    let (client, dialer) = started_client(config).await;

    let results = client
        .in_transaction()
        .create("/t", b"1".to_vec(), CreateMode::Persistent)
        .set_data("/t", b"2".to_vec(), 0)
        .check("/t", 1)
        .commit()
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0], TransactionResult::Created { path: "/t".to_string() });
    assert!(matches!(results[2], TransactionResult::Checked { .. }));
    assert!(dialer.node_exists("/ns/t"));
    assert_eq!(client.get_data().for_path("/t").await.unwrap(), b"2");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_transaction_abort_reports_failing_index() {
    let (client, dialer) = started_client(CanopyConfig::new("memory:2181")).await;

    let err = client
        .in_transaction()
        .create("/u", b"".to_vec(), CreateMode::Persistent)
        .delete("/missing", ANY_VERSION)
        .commit()
        .await
        .unwrap_err();

    match err {
        CanopyError::TransactionAborted { index, source } => {
            assert_eq!(index, 1);
            assert_eq!(*source, CanopyError::NoNode("/missing".to_string()));
        }
        other => panic!("expected TransactionAborted, got {other:?}"),
    }

    // All-or-nothing: the first sub-operation was rolled back.
    assert!(!dialer.node_exists("/u"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_recursive_delete() {
    let (client, dialer) = started_client(CanopyConfig::new("memory:2181")).await;

    for path in ["/r", "/r/a", "/r/b", "/r/a/c"] {
        client.create().for_path_with_data(path, b"".to_vec()).await.unwrap();
    }

    // Without the flag a populated node refuses to go.
    let err = client.delete().for_path("/r").await.unwrap_err();
    assert_eq!(err, CanopyError::NotEmpty("/r".to_string()));

    assert_ok!(client.delete().deleting_children_if_needed().for_path("/r").await);
    assert!(!dialer.node_exists("/r"));
    assert!(!dialer.node_exists("/r/a/c"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_default_data_used_when_create_has_no_payload() {
    let config = CanopyConfig::new("memory:2181").with_default_data(b"seed".to_vec());
    let (client, _dialer) = started_client(config).await;

    client.create().for_path("/d").await.unwrap();
    assert_eq!(client.get_data().for_path("/d").await.unwrap(), b"seed");

    client.close().await.unwrap();
}

/// Toy provider: flips every byte. Enough to prove routing through the
/// compression hooks without dragging in a real codec.
struct FlipCompression;

impl CompressionProvider for FlipCompression {
    fn compress(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.iter().map(|b| !b).collect())
    }

    fn decompress(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.iter().map(|b| !b).collect())
    }
}

#[tokio::test]
async fn test_compression_provider_roundtrip() {
    let config = CanopyConfig::new("memory:2181").with_compression(Arc::new(FlipCompression));
    let (client, dialer) = started_client(config).await;

    client
        .create()
        .compressed()
        .for_path_with_data("/c", b"secret".to_vec())
        .await
        .unwrap();

    // Raw bytes on the server are transformed.
    assert_ne!(dialer.node_data("/c").unwrap(), b"secret");

    let data = client.get_data().decompressed().for_path("/c").await.unwrap();
    assert_eq!(data, b"secret");

    // Opting in without a provider configured is an error.
    let bare = started_client(CanopyConfig::new("memory:2181")).await.0;
    assert_err!(bare.create().compressed().for_path_with_data("/c2", b"x".to_vec()).await);
    bare.close().await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_set_acl_and_get_acl() {
    let (client, _dialer) = started_client(CanopyConfig::new("memory:2181")).await;

    client.create().for_path_with_data("/secure", b"".to_vec()).await.unwrap();

    let acl = vec![Acl::new(canopy::perms::READ, "world", "anyone")];
    let stat = client.set_acl().with_acl(acl.clone()).for_path("/secure").await.unwrap();
    assert_eq!(stat.aversion, 1);

    let (read_back, _stat) = client.get_acl().for_path("/secure").await.unwrap();
    assert_eq!(read_back, acl);

    // Stale ACL version is refused.
    let err = client
        .set_acl()
        .with_acl(Acl::open_unsafe())
        .with_version(0)
        .for_path("/secure")
        .await
        .unwrap_err();
    assert_eq!(err, CanopyError::BadVersion("/secure".to_string()));

    client.close().await.unwrap();
}
