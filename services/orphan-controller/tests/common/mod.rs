//! Shared fixtures for orphan controller integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_orphan_controller::cleanup::CleanupExecutor;
use keel_orphan_controller::disk_service::MockDiskService;
use keel_orphan_controller::reconciler::OrphanReconciler;
use keel_orphan_controller::store::{DataStore, MemoryStore};
use keel_orphan_controller::{ControllerConfig, OrphanController};
use keel_reconcile::{BackoffPolicy, RetryPolicy, WorkQueue};
use keel_types::{
    params, DataEngine, DiskSpec, DiskStatus, DiskType, InstanceManager, InstanceManagerState,
    Node, NodeSpec, NodeStatus, ObjectMeta, Orphan, OrphanSpec, OrphanStatus, OrphanType,
    ResourceKey,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const NAMESPACE: &str = "keel-system";
pub const DISK_NAME: &str = "disk-1";
pub const DISK_UUID: &str = "uuid-1";
pub const DATA_NAME: &str = "pvc-1-r-0";

pub fn key(name: &str) -> ResourceKey {
    ResourceKey::new(NAMESPACE, name)
}

/// A ready node with one ready disk.
pub fn node(name: &str, disk_path: &str, disk_type: DiskType) -> Node {
    Node {
        metadata: ObjectMeta::new("", name),
        spec: NodeSpec {
            eviction_requested: false,
            disks: BTreeMap::from([(
                DISK_NAME.to_string(),
                DiskSpec {
                    path: disk_path.to_string(),
                    disk_type,
                    eviction_requested: false,
                    uuid: DISK_UUID.to_string(),
                },
            )]),
        },
        status: NodeStatus {
            ready: true,
            disks: BTreeMap::from([(DISK_NAME.to_string(), DiskStatus { ready: true })]),
        },
    }
}

pub fn instance_manager(node_id: &str, engine: DataEngine) -> InstanceManager {
    let suffix = match engine {
        DataEngine::V1 => "v1",
        DataEngine::V2 => "v2",
    };
    InstanceManager {
        metadata: ObjectMeta::new("", format!("im-{node_id}-{suffix}")),
        node_id: node_id.to_string(),
        data_engine: engine,
        state: InstanceManagerState::Running,
        ip: "10.0.0.1".to_string(),
    }
}

/// Add a ready node with a running instance manager.
pub async fn add_live_node(store: &MemoryStore, node: Node, engine: DataEngine) {
    let name = node.metadata.name.clone();
    store.put_node(node).await.unwrap();
    store
        .put_instance_manager(instance_manager(&name, engine))
        .await
        .unwrap();
}

pub fn filesystem_orphan(name: &str, node_id: &str, disk_path: &str) -> Orphan {
    Orphan {
        metadata: ObjectMeta::new(NAMESPACE, name),
        spec: OrphanSpec {
            node_id: node_id.to_string(),
            orphan_type: OrphanType::Replica,
            parameters: BTreeMap::from([
                (params::DISK_TYPE.to_string(), "filesystem".to_string()),
                (params::DISK_NAME.to_string(), DISK_NAME.to_string()),
                (params::DISK_UUID.to_string(), DISK_UUID.to_string()),
                (params::DISK_PATH.to_string(), disk_path.to_string()),
                (params::DATA_NAME.to_string(), DATA_NAME.to_string()),
            ]),
        },
        status: OrphanStatus::default(),
    }
}

pub fn block_orphan(name: &str, node_id: &str, disk_path: &str) -> Orphan {
    let mut orphan = filesystem_orphan(name, node_id, disk_path);
    orphan
        .spec
        .parameters
        .insert(params::DISK_TYPE.to_string(), "block".to_string());
    orphan
}

/// Create `<disk_path>/replicas/<DATA_NAME>` with some content.
pub fn create_replica_dir(disk_path: &std::path::Path) -> std::path::PathBuf {
    let dir = disk_path.join("replicas").join(DATA_NAME);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("volume-head-000.img"), b"replica data").unwrap();
    dir
}

pub fn fast_config(controller_id: &str) -> ControllerConfig {
    ControllerConfig {
        controller_id: controller_id.to_string(),
        namespace: NAMESPACE.to_string(),
        workers: 2,
        retry: RetryPolicy { max_retries: 3 },
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(20)),
    }
}

/// A reconciler wired to the store, for driving single passes.
pub fn reconciler(
    store: Arc<MemoryStore>,
    disk: MockDiskService,
    controller_id: &str,
) -> OrphanReconciler {
    let store: Arc<dyn DataStore> = store;
    let cleanup = CleanupExecutor::new(controller_id, Arc::clone(&store), Arc::new(disk));
    OrphanReconciler::new(
        controller_id,
        NAMESPACE,
        store,
        cleanup,
        WorkQueue::new("orphan", BackoffPolicy::default()),
    )
}

pub struct RunningController {
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

impl RunningController {
    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked");
    }
}

pub fn start_controller(
    store: Arc<MemoryStore>,
    disk: MockDiskService,
    config: ControllerConfig,
) -> RunningController {
    let controller = OrphanController::new(config, store, Arc::new(disk));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { controller.run(shutdown_rx).await });
    RunningController { shutdown, handle }
}

/// Poll until `check` returns true or the timeout passes.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
