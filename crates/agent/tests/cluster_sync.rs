//! Token, sync and control-plane behaviour against the fake coordinator.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent::prelude::*;
use async_trait::async_trait;
use bytes::Bytes;
use common::prelude::{
    hash_to_filename, Counters, FileInfo, FileList, GcCounter, KeepAliveRequest, SyncConfig,
};
use serde_json::json;
use storage::prelude::{FileStorage, ServeResult, Storage, StorageError};
use tokio::sync::Semaphore;

use support::{file, FakeCoordinator, CLUSTER_ID, SECRET};

const ABCD_MD5: &str = "e2fc714c4727ee9395f324cd2e7f331f";
const ABC_SHA1: &str = "a9993e364706816aba3e25717850c26c9cd0d89d";
const HOUR_MS: u64 = 60 * 60 * 1000;
const NUMBERED_FILES: [(&[u8], &str); 8] = [
    (b"file-0", "f5c425f0a00ff5449721151d516e3e4e"),
    (b"file-1", "df0f9df5365af2a12c38974f665500ac"),
    (b"file-2", "5cfd4e24659f94de7ab0eabc8707d1b7"),
    (b"file-3", "bb92482bc675a2570a27fa36c406b13e"),
    (b"file-4", "b09d56139810ab6f2be0fadfbb171472"),
    (b"file-5", "8255d775c966ed7c0d417918d608a5b4"),
    (b"file-6", "d2c759aadca0d352d31211a17b302ba8"),
    (b"file-7", "709f53bcc8a309c29be33f708e3f6203"),
];

struct Harness {
    cluster: Arc<ClusterService>,
    tokens: Arc<TokenManager>,
    storage: Arc<dyn Storage>,
    _temp: tempfile::TempDir,
}

fn harness(coordinator: &FakeCoordinator) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(temp.path().join("cache")));
    harness_with(coordinator, storage, temp)
}

fn harness_with(
    coordinator: &FakeCoordinator,
    storage: Arc<dyn Storage>,
    temp: tempfile::TempDir,
) -> Harness {
    let mut config = ClusterConfig::new(CLUSTER_ID, SECRET, coordinator.url.clone());
    config.public_port = 14000;
    config.cache_dir = temp.path().join("cache");
    let config = Arc::new(config);

    let client = CoordinatorClient::new(&config.bmclapi).unwrap();
    let tokens = Arc::new(TokenManager::new(CLUSTER_ID, SECRET, client.clone()));
    let cluster = Arc::new(ClusterService::new(
        config,
        client,
        tokens.clone(),
        storage.clone(),
        Arc::new(NatService::disabled()),
    ));

    Harness {
        cluster,
        tokens,
        storage,
        _temp: temp,
    }
}

#[tokio::test]
async fn test_token_fetch_and_refresh() {
    let coordinator = FakeCoordinator::start(2_000).await;
    let h = harness(&coordinator);

    assert_eq!(h.tokens.get_token().await.unwrap(), "token-1");
    assert_eq!(h.tokens.get_token().await.unwrap(), "token-1");
    assert_eq!(coordinator.state.issued.load(Ordering::SeqCst), 1);

    // ttl 2s schedules a refresh every second
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let refreshed = coordinator.state.refreshed.load(Ordering::SeqCst);
    assert!(refreshed >= 2, "refreshed {} times", refreshed);
    assert_ne!(h.tokens.get_token().await.unwrap(), "token-1");

    h.tokens.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_close = coordinator.state.refreshed.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(coordinator.state.refreshed.load(Ordering::SeqCst), after_close);
}

#[tokio::test]
async fn test_failed_refresh_keeps_current_token() {
    let coordinator = FakeCoordinator::start(2_000).await;
    let h = harness(&coordinator);

    assert_eq!(h.tokens.get_token().await.unwrap(), "token-1");
    coordinator.state.fail_refresh.store(true, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let failures = coordinator.state.failed_refreshes.load(Ordering::SeqCst);
    assert!(failures >= 2, "failed {} times", failures);
    assert_eq!(coordinator.state.refreshed.load(Ordering::SeqCst), 0);
    assert_eq!(h.tokens.get_token().await.unwrap(), "token-1");
    assert_eq!(coordinator.state.issued.load(Ordering::SeqCst), 1);

    // the next scheduled attempt recovers
    coordinator.state.fail_refresh.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(coordinator.state.refreshed.load(Ordering::SeqCst) >= 1);
    assert_ne!(h.tokens.get_token().await.unwrap(), "token-1");
}

#[tokio::test]
async fn test_token_fetch_failure_surfaces() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    let client = CoordinatorClient::new(&coordinator.url).unwrap();
    let tokens = TokenManager::new(CLUSTER_ID, "wrong-secret", client);

    assert!(matches!(
        tokens.get_token().await,
        Err(TokenError::Api(ApiError::HttpStatus(status, _))) if status.as_u16() == 403
    ));
}

#[tokio::test]
async fn test_sync_end_to_end() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    coordinator.publish(file("/a", ABCD_MD5, 4, 1000), b"abcd");
    coordinator.publish(file("/b/c.txt", ABC_SHA1, 3, 2000), b"abc");
    let h = harness(&coordinator);

    let list = h.cluster.get_file_list(None).await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list.last_modified(), Some(2000));

    let config = h.cluster.get_configuration().await.unwrap();
    assert_eq!(config.sync.concurrency, 4);

    assert_eq!(h.cluster.sync_files(&list, &config.sync).await.unwrap(), 2);
    assert!(h.storage.exists(&hash_to_filename(ABCD_MD5)).await);
    assert!(h.storage.exists("a9/a9993e364706816aba3e25717850c26c9cd0d89d").await);
    assert!(h.storage.get_missing_files(&list.files).await.unwrap().is_empty());

    // nothing left to fetch
    let downloads = coordinator.state.downloads.load(Ordering::SeqCst);
    assert_eq!(h.cluster.sync_files(&list, &config.sync).await.unwrap(), 0);
    assert_eq!(coordinator.state.downloads.load(Ordering::SeqCst), downloads);

    assert_eq!(h.storage.gc(&list.files).await.unwrap(), GcCounter::default());
    assert_eq!(
        h.storage.gc(&[]).await.unwrap(),
        GcCounter { count: 2, size: 7 }
    );
}

#[tokio::test]
async fn test_sync_respects_concurrency() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    for (i, (content, hash)) in NUMBERED_FILES.into_iter().enumerate() {
        let path = format!("/numbered/{}", i);
        coordinator.publish(file(&path, hash, content.len() as u64, i as i64 + 1), content);
    }
    coordinator.state.sync_concurrency.store(2, Ordering::SeqCst);
    coordinator.state.download_delay_ms.store(50, Ordering::SeqCst);
    let h = harness(&coordinator);

    let list = h.cluster.get_file_list(None).await.unwrap();
    let config = h.cluster.get_configuration().await.unwrap();
    assert_eq!(config.sync.concurrency, 2);

    assert_eq!(h.cluster.sync_files(&list, &config.sync).await.unwrap(), 8);
    assert_eq!(coordinator.state.downloads.load(Ordering::SeqCst), 8);
    let peak = coordinator.state.peak_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "{} downloads at once", peak);
    for (_, hash) in NUMBERED_FILES {
        assert!(h.storage.exists(&hash_to_filename(hash)).await);
    }
}

#[tokio::test]
async fn test_sync_rejects_corrupt_content() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    coordinator.publish(file("/good", ABCD_MD5, 4, 1), b"abcd");
    coordinator.publish(file("/bad", &"deadbeef".repeat(4), 4, 2), b"abcd");
    let h = harness(&coordinator);

    let list = h.cluster.get_file_list(None).await.unwrap();
    let config = SyncConfig {
        source: "center".to_string(),
        concurrency: 1,
    };
    let err = h.cluster.sync_files(&list, &config).await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Sync(SyncError::Validation { ref path, .. }) if path == "/bad"
    ));
    assert!(!h.storage.exists(&hash_to_filename(&"deadbeef".repeat(4))).await);
}

#[tokio::test]
async fn test_sync_fails_after_retries() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    let h = harness(&coordinator);

    let list = FileList::new(vec![file("/missing", ABCD_MD5, 4, 1)]);
    let err = h
        .cluster
        .sync_files(&list, &SyncConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Sync(SyncError::Download { attempts: 5, .. })
    ));
    assert_eq!(coordinator.state.downloads.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_empty_manifest_is_no_content() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    coordinator.publish(file("/a", ABCD_MD5, 4, 1000), b"abcd");
    let h = harness(&coordinator);

    let newer = h.cluster.get_file_list(Some(1000)).await.unwrap();
    assert!(newer.is_empty());
    assert_eq!(
        *coordinator.state.list_queries.lock(),
        vec![Some("1000".to_string())]
    );
}

#[tokio::test]
async fn test_enable_keepalive_disable() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    let h = harness(&coordinator);

    assert!(matches!(h.cluster.enable().await, Err(ClusterError::NotConnected)));

    h.cluster.connect().await.unwrap();
    h.cluster.connect().await.unwrap();
    assert_eq!(coordinator.state.connections.load(Ordering::SeqCst), 1);
    assert!(h.cluster.is_connected());
    assert!(!h.cluster.is_enabled());

    h.cluster.enable().await.unwrap();
    h.cluster.enable().await.unwrap();
    assert!(h.cluster.is_enabled());

    let events = coordinator.state.events.lock().clone();
    assert_eq!(events.len(), 1);
    let (name, payload) = &events[0];
    assert_eq!(name, "enable");
    assert_eq!(payload["port"], 14000);
    assert_eq!(payload["version"], common::version::PROTOCOL_VERSION);
    assert_eq!(payload["byoc"], false);
    assert_eq!(payload["noFastEnable"], false);
    assert_eq!(payload["flavor"]["storage"], "file");
    assert!(payload.get("host").is_none());

    let report = KeepAliveRequest {
        time: "2024-01-01T00:00:00Z".to_string(),
        hits: 3,
        bytes: 1024,
    };
    assert!(matches!(
        h.cluster.keep_alive(&report).await.unwrap(),
        Ack::Success(_)
    ));
    *coordinator.state.keepalive_reply.lock() = json!([null, false]);
    assert_eq!(h.cluster.keep_alive(&report).await.unwrap(), Ack::Kicked);

    let (_, sent) = coordinator.state.events.lock()[1].clone();
    assert_eq!(sent["hits"], 3);
    assert_eq!(sent["bytes"], 1024);

    h.cluster.disable().await.unwrap();
    assert!(!h.cluster.is_enabled());
    assert!(!h.cluster.is_connected());
    assert!(matches!(
        h.cluster.keep_alive(&report).await,
        Err(ClusterError::NotEnabled)
    ));
}

#[tokio::test]
async fn test_enable_rejected() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    *coordinator.state.enable_reply.lock() = json!([{ "message": "cluster is banned" }]);
    let h = harness(&coordinator);

    h.cluster.connect().await.unwrap();
    let err = h.cluster.enable().await.unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Rejected { event: "enable", ref reason } if reason == "cluster is banned"
    ));
    assert!(!h.cluster.is_enabled());
}

#[tokio::test]
async fn test_request_cert_connects_first() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    let h = harness(&coordinator);

    let cert = h.cluster.request_cert().await.unwrap();
    assert_eq!(cert.cert, "CERT");
    assert_eq!(cert.key, "KEY");
    assert_eq!(coordinator.state.event_names(), vec!["request-cert"]);
}

#[tokio::test]
async fn test_bootstrap_recheck_and_shutdown() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    coordinator.publish(file("/a", ABCD_MD5, 4, 1000), b"abcd");
    let h = harness(&coordinator);

    let keepalive = Arc::new(
        KeepaliveService::new(h.cluster.clone(), Arc::new(Counters::new()))
            .with_interval(Duration::from_millis(100)),
    );
    let bootstrap = BootstrapService::new(
        h.cluster.clone(),
        h.storage.clone(),
        h.tokens.clone(),
        keepalive,
    )
    .with_recheck_interval(Duration::from_millis(150));

    bootstrap.bootstrap().await.unwrap();
    assert!(h.cluster.is_enabled());
    assert!(h.storage.exists(&hash_to_filename(ABCD_MD5)).await);
    assert_eq!(bootstrap.last_modified(), 1000);

    coordinator.publish(file("/b", ABC_SHA1, 3, 5000), b"abc");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(h.storage.exists(&hash_to_filename(ABC_SHA1)).await);
    assert_eq!(bootstrap.last_modified(), 5000);
    assert!(coordinator
        .state
        .list_queries
        .lock()
        .contains(&Some("1000".to_string())));
    assert!(coordinator.state.event_names().contains(&"keep-alive".to_string()));

    bootstrap.shutdown().await;
    assert!(!h.cluster.is_enabled());
    let events = coordinator.state.events.lock().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.state.events.lock().len(), events);
}

#[tokio::test]
async fn test_bootstrap_fails_when_storage_unusable() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    let h = harness(&coordinator);

    let temp = tempfile::tempdir().unwrap();
    let blocked = temp.path().join("blocked");
    std::fs::write(&blocked, b"file, not a directory").unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&blocked));

    let keepalive = Arc::new(KeepaliveService::new(h.cluster.clone(), Arc::new(Counters::new())));
    let bootstrap = BootstrapService::new(h.cluster.clone(), storage, h.tokens.clone(), keepalive);

    assert!(matches!(
        bootstrap.bootstrap().await,
        Err(BootstrapError::StorageNotReady)
    ));
    assert!(!h.cluster.is_enabled());
}

/// File storage whose garbage collection waits for a permit.
#[derive(Debug)]
struct GatedStorage {
    inner: FileStorage,
    gate: Semaphore,
    gc_finished: AtomicBool,
}

impl GatedStorage {
    fn new(root: std::path::PathBuf) -> Self {
        Self {
            inner: FileStorage::new(root),
            gate: Semaphore::new(0),
            gc_finished: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Storage for GatedStorage {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn check(&self) -> bool {
        self.inner.check().await
    }

    async fn exists(&self, path: &str) -> bool {
        self.inner.exists(path).await
    }

    async fn write_file(&self, path: &str, content: Bytes, file: &FileInfo) -> Result<(), StorageError> {
        self.inner.write_file(path, content, file).await
    }

    async fn get_missing_files(&self, files: &[FileInfo]) -> Result<Vec<FileInfo>, StorageError> {
        self.inner.get_missing_files(files).await
    }

    async fn gc(&self, files: &[FileInfo]) -> Result<GcCounter, StorageError> {
        let _ = self.gate.acquire().await;
        let counter = self.inner.gc(files).await?;
        self.gc_finished.store(true, Ordering::SeqCst);
        Ok(counter)
    }

    async fn serve_file(&self, path: &str, name: Option<&str>) -> Result<ServeResult, StorageError> {
        self.inner.serve_file(path, name).await
    }
}

fn gated_bootstrap(coordinator: &FakeCoordinator) -> (Harness, Arc<GatedStorage>, BootstrapService) {
    let temp = tempfile::tempdir().unwrap();
    let storage = Arc::new(GatedStorage::new(temp.path().join("cache")));
    let h = harness_with(coordinator, storage.clone(), temp);

    let keepalive = Arc::new(
        KeepaliveService::new(h.cluster.clone(), Arc::new(Counters::new()))
            .with_interval(Duration::from_millis(100)),
    );
    let bootstrap = BootstrapService::new(
        h.cluster.clone(),
        h.storage.clone(),
        h.tokens.clone(),
        keepalive,
    )
    .with_recheck_interval(Duration::from_millis(100));
    (h, storage, bootstrap)
}

#[tokio::test]
async fn test_recheck_waits_for_garbage_collection() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    coordinator.publish(file("/a", ABCD_MD5, 4, 1000), b"abcd");
    let (h, storage, bootstrap) = gated_bootstrap(&coordinator);

    bootstrap.bootstrap().await.unwrap();
    assert!(bootstrap.is_collecting());

    coordinator.publish(file("/b", ABC_SHA1, 3, 5000), b"abc");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!h.storage.exists(&hash_to_filename(ABC_SHA1)).await);
    assert_eq!(bootstrap.last_modified(), 1000);

    storage.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(storage.gc_finished.load(Ordering::SeqCst));
    assert!(!bootstrap.is_collecting());
    assert!(h.storage.exists(&hash_to_filename(ABC_SHA1)).await);
    assert!(h.storage.exists(&hash_to_filename(ABCD_MD5)).await);
    assert_eq!(bootstrap.last_modified(), 5000);

    bootstrap.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_garbage_collection() {
    let coordinator = FakeCoordinator::start(HOUR_MS).await;
    coordinator.publish(file("/a", ABCD_MD5, 4, 1000), b"abcd");
    let (h, storage, bootstrap) = gated_bootstrap(&coordinator);

    let stale = file("/old", "ff00", 3, 1);
    h.storage
        .write_file(&hash_to_filename(&stale.hash), Bytes::from_static(b"old"), &stale)
        .await
        .unwrap();

    bootstrap.bootstrap().await.unwrap();
    assert!(bootstrap.is_collecting());
    bootstrap.shutdown().await;
    assert!(!bootstrap.is_collecting());

    storage.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!storage.gc_finished.load(Ordering::SeqCst));
    assert!(h.storage.exists("ff/ff00").await);
}
