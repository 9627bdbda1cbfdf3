//! End-to-end scenarios against a running controller.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use keel_orphan_controller::disk_service::{MockDiskService, MockOutcome};
use keel_orphan_controller::store::{DataStore, MemoryStore};
use keel_types::{ConditionStatus, ConditionType, DataEngine, DiskType, FINALIZER};

async fn cleanable(store: &MemoryStore, name: &str) -> Option<(ConditionStatus, String)> {
    let orphan = store.get_orphan(&key(name)).await.ok()?;
    let condition = orphan.status.conditions.get(ConditionType::DataCleanable)?;
    Some((condition.status, condition.reason.clone()))
}

async fn gone(store: &MemoryStore, name: &str) -> bool {
    matches!(store.get_orphan(&key(name)).await, Err(e) if e.is_not_found())
}

#[tokio::test]
async fn test_filesystem_orphan_cleaned_on_deletion() {
    let disk = tempfile::tempdir().unwrap();
    let disk_path = disk.path().to_str().unwrap();
    let replica = create_replica_dir(disk.path());

    let store = Arc::new(MemoryStore::new());
    add_live_node(&store, node("node-x", disk_path, DiskType::Filesystem), DataEngine::V1).await;
    store
        .create_orphan(filesystem_orphan("orphan-a", "node-x", disk_path))
        .await
        .unwrap();

    let controller = start_controller(store.clone(), MockDiskService::default(), fast_config("node-x"));

    eventually("DataCleanable=True", || async {
        cleanable(&store, "orphan-a").await == Some((ConditionStatus::True, String::new()))
    })
    .await;
    let orphan = store.get_orphan(&key("orphan-a")).await.unwrap();
    assert_eq!(orphan.status.owner_id, "node-x");

    store.request_orphan_deletion(&key("orphan-a")).await.unwrap();
    eventually("orphan erased", || gone(&store, "orphan-a")).await;

    assert!(!replica.exists());
    assert!(disk.path().join("replicas").exists());

    controller.stop().await;
}

#[tokio::test]
async fn test_evicted_node_keeps_data() {
    let disk = tempfile::tempdir().unwrap();
    let disk_path = disk.path().to_str().unwrap();
    let replica = create_replica_dir(disk.path());

    let store = Arc::new(MemoryStore::new());
    let mut evicted = node("node-x", disk_path, DiskType::Filesystem);
    evicted.spec.eviction_requested = true;
    add_live_node(&store, evicted, DataEngine::V1).await;
    store
        .create_orphan(filesystem_orphan("orphan-b", "node-x", disk_path))
        .await
        .unwrap();

    let controller = start_controller(store.clone(), MockDiskService::default(), fast_config("node-x"));

    eventually("DataCleanable=False/NodeEvicted", || async {
        cleanable(&store, "orphan-b").await
            == Some((ConditionStatus::False, "NodeEvicted".to_string()))
    })
    .await;

    store.request_orphan_deletion(&key("orphan-b")).await.unwrap();
    eventually("orphan erased", || gone(&store, "orphan-b")).await;

    assert!(replica.exists());

    controller.stop().await;
}

#[tokio::test]
async fn test_block_orphan_remote_not_found_finalizes() {
    let store = Arc::new(MemoryStore::new());
    add_live_node(&store, node("node-x", "/dev/nvme1n1", DiskType::Block), DataEngine::V2).await;
    store
        .create_orphan(block_orphan("orphan-c", "node-x", "/dev/nvme1n1"))
        .await
        .unwrap();

    let disk_service = MockDiskService::new(MockOutcome::NotFound);
    let controller = start_controller(store.clone(), disk_service.clone(), fast_config("node-x"));

    eventually("DataCleanable=True", || async {
        cleanable(&store, "orphan-c").await == Some((ConditionStatus::True, String::new()))
    })
    .await;

    store.request_orphan_deletion(&key("orphan-c")).await.unwrap();
    eventually("orphan erased", || gone(&store, "orphan-c")).await;

    let calls = disk_service.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "im-node-x-v2");
    assert_eq!(calls[0].1.disk_name, DISK_NAME);
    assert_eq!(calls[0].1.disk_uuid, DISK_UUID);
    assert_eq!(calls[0].1.replica_instance_name, DATA_NAME);
    assert_eq!(disk_service.open_connections(), 0);

    controller.stop().await;
}

#[tokio::test]
async fn test_block_orphan_transient_failure_keeps_finalizer() {
    let store = Arc::new(MemoryStore::new());
    add_live_node(&store, node("node-x", "/dev/nvme1n1", DiskType::Block), DataEngine::V2).await;
    store
        .create_orphan(block_orphan("orphan-d", "node-x", "/dev/nvme1n1"))
        .await
        .unwrap();

    let disk_service = MockDiskService::new(MockOutcome::Fail("spdk unavailable".to_string()));
    let config = fast_config("node-x");
    let max_retries = config.retry.max_retries as usize;
    let controller = start_controller(store.clone(), disk_service.clone(), config);

    eventually("DataCleanable=True", || async {
        cleanable(&store, "orphan-d").await == Some((ConditionStatus::True, String::new()))
    })
    .await;

    store.request_orphan_deletion(&key("orphan-d")).await.unwrap();

    // Retries are capped: the call count settles once the key is dropped.
    eventually("retries exhausted", || async {
        disk_service.call_count() > max_retries
    })
    .await;
    let mut settled = disk_service.call_count();
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let now = disk_service.call_count();
        if now == settled {
            break;
        }
        settled = now;
    }

    let orphan = store.get_orphan(&key("orphan-d")).await.unwrap();
    assert!(orphan.metadata.has_finalizer(FINALIZER));
    let error = orphan.status.conditions.get(ConditionType::Error).unwrap();
    assert_eq!(error.status, ConditionStatus::True);
    assert!(error.message.contains("spdk unavailable"));
    assert_eq!(disk_service.open_connections(), 0);

    // Once the remote side recovers, the next event finishes the job.
    disk_service.set_outcome(MockOutcome::Success);
    store
        .put_node(node("node-x", "/dev/nvme1n1", DiskType::Block))
        .await
        .unwrap();
    eventually("orphan erased", || gone(&store, "orphan-d")).await;

    controller.stop().await;
}

#[tokio::test]
async fn test_node_event_recomputes_conditions() {
    let disk = tempfile::tempdir().unwrap();
    let disk_path = disk.path().to_str().unwrap();

    let store = Arc::new(MemoryStore::new());
    add_live_node(&store, node("node-x", disk_path, DiskType::Filesystem), DataEngine::V1).await;
    store
        .create_orphan(filesystem_orphan("orphan-e", "node-x", disk_path))
        .await
        .unwrap();

    let controller = start_controller(store.clone(), MockDiskService::default(), fast_config("node-x"));

    eventually("DataCleanable=True", || async {
        cleanable(&store, "orphan-e").await == Some((ConditionStatus::True, String::new()))
    })
    .await;

    let mut draining = node("node-x", disk_path, DiskType::Filesystem);
    draining
        .spec
        .disks
        .get_mut(DISK_NAME)
        .unwrap()
        .eviction_requested = true;
    store.put_node(draining).await.unwrap();

    eventually("DataCleanable=False/DiskEvicted", || async {
        cleanable(&store, "orphan-e").await
            == Some((ConditionStatus::False, "DiskEvicted".to_string()))
    })
    .await;

    store
        .delete_instance_manager("im-node-x-v1")
        .await
        .unwrap();
    eventually("DataCleanable=False/NodeUnavailable", || async {
        cleanable(&store, "orphan-e").await
            == Some((ConditionStatus::False, "NodeUnavailable".to_string()))
    })
    .await;

    controller.stop().await;
}

#[tokio::test]
async fn test_controller_stops_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let controller = start_controller(store, MockDiskService::default(), fast_config("node-x"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.stop().await;
}
