//! Disk service client.
//!
//! Block-backed replica instances are deleted through the disk service
//! exposed by the node's V2 instance manager. Connections are per call:
//! [`DiskServiceConnector::connect`] opens one, the returned client is used
//! for a single request and the connection closes when it is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_reconcile::{Classify, ErrorKind};
use keel_types::{DiskType, InstanceManager};
use thiserror::Error;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

/// Default disk service port on instance managers.
pub const DEFAULT_DISK_SERVICE_PORT: u16 = 8503;

const DELETE_REPLICA_INSTANCE_PATH: &str = "/imrpc.DiskService/DiskReplicaInstanceDelete";

/// Errors from the disk service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiskServiceError {
    /// The replica instance does not exist.
    #[error("replica instance not found: {0}")]
    NotFound(String),

    #[error("failed to connect to disk service at {address}: {message}")]
    Connect { address: String, message: String },

    #[error("disk service call failed ({code}): {message}")]
    Rpc { code: String, message: String },
}

impl DiskServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Classify for DiskServiceError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Connect { .. } | Self::Rpc { .. } => ErrorKind::Transient,
        }
    }
}

/// Delete a replica instance from a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReplicaInstance {
    pub disk_type: DiskType,
    pub disk_name: String,
    pub disk_uuid: String,
    pub disk_driver: String,
    pub replica_instance_name: String,
}

/// Opens per-call disk service connections.
#[async_trait]
pub trait DiskServiceConnector: Send + Sync {
    /// Connect to the disk service of an instance manager.
    async fn connect(
        &self,
        instance_manager: &InstanceManager,
    ) -> Result<Box<dyn DiskServiceClient>, DiskServiceError>;
}

/// A live disk service connection. Dropping it closes the connection.
#[async_trait]
pub trait DiskServiceClient: Send {
    async fn delete_replica_instance(
        &mut self,
        request: &DeleteReplicaInstance,
    ) -> Result<(), DiskServiceError>;
}

/// Wire message for `DiskReplicaInstanceDelete`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DiskReplicaInstanceDeleteRequest {
    #[prost(string, tag = "1")]
    pub disk_type: String,
    #[prost(string, tag = "2")]
    pub disk_name: String,
    #[prost(string, tag = "3")]
    pub disk_uuid: String,
    #[prost(string, tag = "4")]
    pub replica_instance_name: String,
    #[prost(string, tag = "5")]
    pub disk_driver: String,
}

impl From<&DeleteReplicaInstance> for DiskReplicaInstanceDeleteRequest {
    fn from(req: &DeleteReplicaInstance) -> Self {
        Self {
            disk_type: req.disk_type.as_str().to_string(),
            disk_name: req.disk_name.clone(),
            disk_uuid: req.disk_uuid.clone(),
            replica_instance_name: req.replica_instance_name.clone(),
            disk_driver: req.disk_driver.clone(),
        }
    }
}

/// Connects to instance managers over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcDiskServiceConnector {
    port: u16,
    timeout: Duration,
}

impl GrpcDiskServiceConnector {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    fn address(&self, ip: &str) -> String {
        if ip.contains(':') && !ip.starts_with('[') {
            format!("http://[{ip}]:{}", self.port)
        } else {
            format!("http://{ip}:{}", self.port)
        }
    }
}

#[async_trait]
impl DiskServiceConnector for GrpcDiskServiceConnector {
    async fn connect(
        &self,
        instance_manager: &InstanceManager,
    ) -> Result<Box<dyn DiskServiceClient>, DiskServiceError> {
        let address = self.address(&instance_manager.ip);
        let connect_error = |message: String| DiskServiceError::Connect {
            address: address.clone(),
            message,
        };

        if instance_manager.ip.is_empty() {
            return Err(connect_error(format!(
                "instance manager {} has no address",
                instance_manager.metadata.name
            )));
        }

        let channel = Endpoint::from_shared(address.clone())
            .map_err(|e| connect_error(e.to_string()))?
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .connect()
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        debug!(address = %address, "Disk service connection opened");
        Ok(Box::new(GrpcDiskServiceClient { channel, address }))
    }
}

/// Single-connection gRPC disk service client.
pub struct GrpcDiskServiceClient {
    channel: Channel,
    address: String,
}

#[async_trait]
impl DiskServiceClient for GrpcDiskServiceClient {
    async fn delete_replica_instance(
        &mut self,
        request: &DeleteReplicaInstance,
    ) -> Result<(), DiskServiceError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| DiskServiceError::Connect {
            address: self.address.clone(),
            message: e.to_string(),
        })?;

        let codec: ProstCodec<DiskReplicaInstanceDeleteRequest, ()> = ProstCodec::default();
        let message = DiskReplicaInstanceDeleteRequest::from(request);
        grpc.unary(
            tonic::Request::new(message),
            PathAndQuery::from_static(DELETE_REPLICA_INSTANCE_PATH),
            codec,
        )
        .await
        .map(|_| ())
        .map_err(map_status)
    }
}

impl Drop for GrpcDiskServiceClient {
    fn drop(&mut self) {
        debug!(address = %self.address, "Disk service connection closed");
    }
}

/// Map a gRPC status, folding every not-found flavor into
/// [`DiskServiceError::NotFound`].
fn map_status(status: Status) -> DiskServiceError {
    let message = status.message().to_string();
    if status.code() == Code::NotFound || is_not_found_message(&message) {
        return DiskServiceError::NotFound(message);
    }
    DiskServiceError::Rpc {
        code: format!("{:?}", status.code()),
        message,
    }
}

fn is_not_found_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not found") || message.contains("cannot find")
}

/// Scripted response for [`MockDiskService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Success,
    NotFound,
    Fail(String),
    ConnectFail,
}

struct MockShared {
    outcome: Mutex<MockOutcome>,
    calls: Mutex<Vec<(String, DeleteReplicaInstance)>>,
    connects: AtomicUsize,
    open: AtomicUsize,
}

/// In-process disk service for tests and local runs.
///
/// Records every call and tracks open connections so tests can check that
/// each connection is released.
#[derive(Clone)]
pub struct MockDiskService {
    shared: Arc<MockShared>,
}

impl Default for MockDiskService {
    fn default() -> Self {
        Self::new(MockOutcome::Success)
    }
}

impl MockDiskService {
    pub fn new(outcome: MockOutcome) -> Self {
        Self {
            shared: Arc::new(MockShared {
                outcome: Mutex::new(outcome),
                calls: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        *lock(&self.shared.outcome) = outcome;
    }

    /// Requests received, with the instance manager each went to.
    pub fn calls(&self) -> Vec<(String, DeleteReplicaInstance)> {
        lock(&self.shared.calls).clone()
    }

    /// Number of delete calls received.
    pub fn call_count(&self) -> usize {
        lock(&self.shared.calls).len()
    }

    /// Number of successful connects.
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of connections not yet released.
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DiskServiceConnector for MockDiskService {
    async fn connect(
        &self,
        instance_manager: &InstanceManager,
    ) -> Result<Box<dyn DiskServiceClient>, DiskServiceError> {
        if *lock(&self.shared.outcome) == MockOutcome::ConnectFail {
            return Err(DiskServiceError::Connect {
                address: instance_manager.ip.clone(),
                message: "[MOCK] connection refused".to_string(),
            });
        }

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDiskClient {
            shared: Arc::clone(&self.shared),
            instance_manager: instance_manager.metadata.name.clone(),
        }))
    }
}

struct MockDiskClient {
    shared: Arc<MockShared>,
    instance_manager: String,
}

#[async_trait]
impl DiskServiceClient for MockDiskClient {
    async fn delete_replica_instance(
        &mut self,
        request: &DeleteReplicaInstance,
    ) -> Result<(), DiskServiceError> {
        lock(&self.shared.calls).push((self.instance_manager.clone(), request.clone()));
        debug!(
            replica_instance = %request.replica_instance_name,
            disk_uuid = %request.disk_uuid,
            "[MOCK] Deleting replica instance"
        );

        let outcome = lock(&self.shared.outcome).clone();
        match outcome {
            MockOutcome::Success | MockOutcome::ConnectFail => Ok(()),
            MockOutcome::NotFound => Err(map_status(Status::not_found(format!(
                "replica instance {} not found",
                request.replica_instance_name
            )))),
            MockOutcome::Fail(message) => Err(map_status(Status::unavailable(message))),
        }
    }
}

impl Drop for MockDiskClient {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
    }
}
