//! Dispatch - The dock's backend table and reply envelope
//!
//! A request names a backend, an operation and a bag of params. The params
//! are parsed once into a typed [`Operation`], validated, routed to the
//! driver serving that backend, and the outcome is wrapped in a [`Reply`].
//! Drivers enforce their own operation deadline; the dock cuts off any call
//! that overruns it by more than [`DEADLINE_GRACE`].

use crate::config::{BackendProperties, DockConfig};
use crate::controlplane::exec::{CommandRunnerRef, SystemRunner};
use crate::controlplane::locks::LockTable;
use crate::controlplane::registry::{self, DriverContext, DriverRegistry};
use crate::domain::model::StorageType;
use crate::domain::opts::*;
use crate::domain::ports::*;
use crate::domain::validate::{self, Validate};
use crate::error::{Error, Result};
use futures::FutureExt;
use parking_lot::RwLock;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Slack past the operation timeout before the dock abandons a driver call
pub const DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Metrics label for names the dock does not know
const UNKNOWN_LABEL: &str = "unknown";

// =============================================================================
// Operations
// =============================================================================

/// Driver family an operation is served by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFamily {
    Block,
    FileShare,
    Replication,
    Metrics,
}

impl std::fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverFamily::Block => write!(f, "block"),
            DriverFamily::FileShare => write!(f, "file share"),
            DriverFamily::Replication => write!(f, "replication"),
            DriverFamily::Metrics => write!(f, "metrics"),
        }
    }
}

/// A dispatched operation with its typed options
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    // Block
    CreateVolume(CreateVolumeOpts),
    PullVolume(PullOpts),
    DeleteVolume(DeleteVolumeOpts),
    ExtendVolume(ExtendVolumeOpts),
    CreateSnapshot(CreateSnapshotOpts),
    PullSnapshot(PullOpts),
    DeleteSnapshot(DeleteSnapshotOpts),
    InitializeConnection(AttachmentOpts),
    TerminateConnection(AttachmentOpts),
    InitializeSnapshotConnection(SnapshotAttachmentOpts),
    TerminateSnapshotConnection(SnapshotAttachmentOpts),
    CreateVolumeGroup(VolumeGroupOpts),
    UpdateVolumeGroup(VolumeGroupOpts),
    DeleteVolumeGroup(VolumeGroupOpts),
    ListPools,

    // File share
    CreateFileShare(CreateFileShareOpts),
    DeleteFileShare(DeleteFileShareOpts),
    CreateFileShareSnapshot(CreateFileShareSnapshotOpts),
    DeleteFileShareSnapshot(DeleteFileShareSnapshotOpts),
    CreateFileShareAcl(CreateFileShareAclOpts),
    DeleteFileShareAcl(DeleteFileShareAclOpts),
    ListFileSharePools,

    // Replication
    CreateReplication(ReplicationOpts),
    DeleteReplication(ReplicationOpts),
    EnableReplication(ReplicationOpts),
    DisableReplication(ReplicationOpts),
    FailoverReplication(ReplicationOpts),

    // Metrics
    CollectMetrics(CollectMetricsOpts),
}

fn decode<T: DeserializeOwned>(operation: &str, params: serde_json::Value) -> Result<T> {
    validate::metadata(&params)?;
    serde_json::from_value(params).map_err(|e| {
        Error::InvalidArgument(format!("invalid params for {}: {}", operation, e))
    })
}

impl Operation {
    /// Parse and validate an operation from its wire name and params
    pub fn parse(name: &str, params: serde_json::Value) -> Result<Self> {
        let params = match params {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };

        let op = match name {
            "create_volume" => Operation::CreateVolume(decode(name, params)?),
            "pull_volume" => Operation::PullVolume(decode(name, params)?),
            "delete_volume" => Operation::DeleteVolume(decode(name, params)?),
            "extend_volume" => Operation::ExtendVolume(decode(name, params)?),
            "create_snapshot" => Operation::CreateSnapshot(decode(name, params)?),
            "pull_snapshot" => Operation::PullSnapshot(decode(name, params)?),
            "delete_snapshot" => Operation::DeleteSnapshot(decode(name, params)?),
            "initialize_connection" => Operation::InitializeConnection(decode(name, params)?),
            "terminate_connection" => Operation::TerminateConnection(decode(name, params)?),
            "initialize_snapshot_connection" => {
                Operation::InitializeSnapshotConnection(decode(name, params)?)
            }
            "terminate_snapshot_connection" => {
                Operation::TerminateSnapshotConnection(decode(name, params)?)
            }
            "create_volume_group" => Operation::CreateVolumeGroup(decode(name, params)?),
            "update_volume_group" => Operation::UpdateVolumeGroup(decode(name, params)?),
            "delete_volume_group" => Operation::DeleteVolumeGroup(decode(name, params)?),
            "list_pools" => Operation::ListPools,

            "create_file_share" => Operation::CreateFileShare(decode(name, params)?),
            "delete_file_share" => Operation::DeleteFileShare(decode(name, params)?),
            "create_file_share_snapshot" => {
                Operation::CreateFileShareSnapshot(decode(name, params)?)
            }
            "delete_file_share_snapshot" => {
                Operation::DeleteFileShareSnapshot(decode(name, params)?)
            }
            "create_file_share_acl" => Operation::CreateFileShareAcl(decode(name, params)?),
            "delete_file_share_acl" => Operation::DeleteFileShareAcl(decode(name, params)?),
            "list_file_share_pools" => Operation::ListFileSharePools,

            "create_replication" => Operation::CreateReplication(decode(name, params)?),
            "delete_replication" => Operation::DeleteReplication(decode(name, params)?),
            "enable_replication" => Operation::EnableReplication(decode(name, params)?),
            "disable_replication" => Operation::DisableReplication(decode(name, params)?),
            "failover_replication" => Operation::FailoverReplication(decode(name, params)?),

            "collect_metrics" => Operation::CollectMetrics(decode(name, params)?),

            _ => return Err(Error::UnknownOperation(name.to_string())),
        };

        op.validate()?;
        Ok(op)
    }

    /// Wire name of the operation
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateVolume(_) => "create_volume",
            Operation::PullVolume(_) => "pull_volume",
            Operation::DeleteVolume(_) => "delete_volume",
            Operation::ExtendVolume(_) => "extend_volume",
            Operation::CreateSnapshot(_) => "create_snapshot",
            Operation::PullSnapshot(_) => "pull_snapshot",
            Operation::DeleteSnapshot(_) => "delete_snapshot",
            Operation::InitializeConnection(_) => "initialize_connection",
            Operation::TerminateConnection(_) => "terminate_connection",
            Operation::InitializeSnapshotConnection(_) => "initialize_snapshot_connection",
            Operation::TerminateSnapshotConnection(_) => "terminate_snapshot_connection",
            Operation::CreateVolumeGroup(_) => "create_volume_group",
            Operation::UpdateVolumeGroup(_) => "update_volume_group",
            Operation::DeleteVolumeGroup(_) => "delete_volume_group",
            Operation::ListPools => "list_pools",
            Operation::CreateFileShare(_) => "create_file_share",
            Operation::DeleteFileShare(_) => "delete_file_share",
            Operation::CreateFileShareSnapshot(_) => "create_file_share_snapshot",
            Operation::DeleteFileShareSnapshot(_) => "delete_file_share_snapshot",
            Operation::CreateFileShareAcl(_) => "create_file_share_acl",
            Operation::DeleteFileShareAcl(_) => "delete_file_share_acl",
            Operation::ListFileSharePools => "list_file_share_pools",
            Operation::CreateReplication(_) => "create_replication",
            Operation::DeleteReplication(_) => "delete_replication",
            Operation::EnableReplication(_) => "enable_replication",
            Operation::DisableReplication(_) => "disable_replication",
            Operation::FailoverReplication(_) => "failover_replication",
            Operation::CollectMetrics(_) => "collect_metrics",
        }
    }

    pub fn family(&self) -> DriverFamily {
        match self {
            Operation::CreateFileShare(_)
            | Operation::DeleteFileShare(_)
            | Operation::CreateFileShareSnapshot(_)
            | Operation::DeleteFileShareSnapshot(_)
            | Operation::CreateFileShareAcl(_)
            | Operation::DeleteFileShareAcl(_)
            | Operation::ListFileSharePools => DriverFamily::FileShare,
            Operation::CreateReplication(_)
            | Operation::DeleteReplication(_)
            | Operation::EnableReplication(_)
            | Operation::DisableReplication(_)
            | Operation::FailoverReplication(_) => DriverFamily::Replication,
            Operation::CollectMetrics(_) => DriverFamily::Metrics,
            _ => DriverFamily::Block,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Operation::CreateVolume(o) => o.validate(),
            Operation::PullVolume(o) | Operation::PullSnapshot(o) => o.validate(),
            Operation::DeleteVolume(o) => o.validate(),
            Operation::ExtendVolume(o) => o.validate(),
            Operation::CreateSnapshot(o) => o.validate(),
            Operation::DeleteSnapshot(o) => o.validate(),
            Operation::InitializeConnection(o) | Operation::TerminateConnection(o) => o.validate(),
            Operation::InitializeSnapshotConnection(o)
            | Operation::TerminateSnapshotConnection(o) => o.validate(),
            Operation::CreateVolumeGroup(o)
            | Operation::UpdateVolumeGroup(o)
            | Operation::DeleteVolumeGroup(o) => o.validate(),
            Operation::CreateFileShare(o) => o.validate(),
            Operation::DeleteFileShare(o) => o.validate(),
            Operation::CreateFileShareSnapshot(o) => o.validate(),
            Operation::DeleteFileShareSnapshot(o) => o.validate(),
            Operation::CreateFileShareAcl(o) => o.validate(),
            Operation::DeleteFileShareAcl(o) => o.validate(),
            Operation::CreateReplication(o)
            | Operation::DeleteReplication(o)
            | Operation::EnableReplication(o)
            | Operation::DisableReplication(o)
            | Operation::FailoverReplication(o) => o.validate(),
            Operation::CollectMetrics(o) => o.validate(),
            Operation::ListPools | Operation::ListFileSharePools => Ok(()),
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Request record as it arrives on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockRequest {
    pub backend: String,
    pub operation: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Outcome of exactly one dispatched call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Result { message: String },
    Error { code: String, description: String },
}

impl Reply {
    /// Wrap a driver result: null is empty, a string passes through, anything else is compact JSON
    pub fn from_value(value: serde_json::Value) -> Self {
        let message = match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Reply::Result { message }
    }

    pub fn from_error(err: &Error) -> Self {
        Reply::Error {
            code: err.code().to_string(),
            description: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Result { .. })
    }

    /// Envelope code, `200` for a result
    pub fn code(&self) -> &str {
        match self {
            Reply::Result { .. } => "200",
            Reply::Error { code, .. } => code,
        }
    }
}

fn encode<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Backend Table
// =============================================================================

/// A driver instance and whether its setup has completed
pub struct DriverSlot<D: ?Sized> {
    driver: Arc<D>,
    initialized: AtomicBool,
}

impl<D: DriverLifecycle + ?Sized> DriverSlot<D> {
    fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ready(&self, backend: &str) -> Result<Arc<D>> {
        if !self.is_initialized() {
            return Err(Error::BackendUnreachable {
                backend: backend.to_string(),
                reason: format!("driver {} is not initialized", self.driver.kind()),
            });
        }
        Ok(self.driver.clone())
    }
}

/// A configured backend and the drivers serving it
pub struct Backend {
    name: String,
    props: BackendProperties,
    block: Option<DriverSlot<dyn BlockDriver>>,
    file_share: Option<DriverSlot<dyn FileShareDriver>>,
    replication: Option<DriverSlot<dyn ReplicationDriver>>,
    metrics: Option<DriverSlot<dyn MetricsDriver>>,
}

fn family_slot<'a, D: DriverLifecycle + ?Sized>(
    slot: &'a Option<DriverSlot<D>>,
    backend: &str,
    operation: &str,
) -> Result<&'a DriverSlot<D>> {
    slot.as_ref().ok_or_else(|| {
        Error::not_implemented(format!("{} on backend {}", operation, backend))
    })
}

impl Backend {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether every driver of this backend finished setup
    pub fn is_initialized(&self) -> bool {
        self.block.as_ref().map_or(true, |s| s.is_initialized())
            && self.file_share.as_ref().map_or(true, |s| s.is_initialized())
            && self.replication.as_ref().map_or(true, |s| s.is_initialized())
            && self.metrics.as_ref().map_or(true, |s| s.is_initialized())
    }

    fn block(&self, operation: &str) -> Result<BlockDriverRef> {
        family_slot(&self.block, &self.name, operation)?.ready(&self.name)
    }

    fn file_share(&self, operation: &str) -> Result<FileShareDriverRef> {
        family_slot(&self.file_share, &self.name, operation)?.ready(&self.name)
    }

    fn replication(&self, operation: &str) -> Result<ReplicationDriverRef> {
        family_slot(&self.replication, &self.name, operation)?.ready(&self.name)
    }

    fn metrics(&self, operation: &str) -> Result<MetricsDriverRef> {
        family_slot(&self.metrics, &self.name, operation)?.ready(&self.name)
    }
}

/// Backend state reported by health checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub driver_name: String,
    pub storage_type: StorageType,
    pub initialized: bool,
}

// =============================================================================
// Metrics
// =============================================================================

struct DockMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
}

impl DockMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let operations = IntCounterVec::new(
            Opts::new("sds_dock_operations_total", "Dispatched operations by outcome"),
            &["backend", "operation", "code"],
        )
        .map_err(|e| Error::Internal(format!("metrics: {}", e)))?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "sds_dock_operation_duration_seconds",
                "Duration of dispatched operations",
            ),
            &["backend", "operation"],
        )
        .map_err(|e| Error::Internal(format!("metrics: {}", e)))?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(|e| Error::Internal(format!("metrics: {}", e)))?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(|e| Error::Internal(format!("metrics: {}", e)))?;

        Ok(Self {
            registry,
            operations,
            duration,
        })
    }

    fn observe(&self, backend: &str, operation: &str, code: &str, elapsed: Duration) {
        self.operations
            .with_label_values(&[backend, operation, code])
            .inc();
        self.duration
            .with_label_values(&[backend, operation])
            .observe(elapsed.as_secs_f64());
    }
}

// =============================================================================
// Dock
// =============================================================================

/// Routes requests to the drivers of each configured backend
pub struct Dock {
    config: DockConfig,
    registry: Arc<DriverRegistry>,
    locks: Arc<LockTable>,
    runner: CommandRunnerRef,
    backends: RwLock<BTreeMap<String, Arc<Backend>>>,
    metrics: DockMetrics,
}

impl Dock {
    /// Create a dock running external commands on this host
    pub fn new(config: DockConfig, registry: Arc<DriverRegistry>) -> Result<Arc<Self>> {
        let runner = Arc::new(SystemRunner::new(config.operation_timeout()));
        Self::with_runner(config, registry, runner)
    }

    pub fn with_runner(
        config: DockConfig,
        registry: Arc<DriverRegistry>,
        runner: CommandRunnerRef,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            config,
            registry,
            locks: Arc::new(LockTable::new()),
            runner,
            backends: RwLock::new(BTreeMap::new()),
            metrics: DockMetrics::new()?,
        }))
    }

    /// Registry holding the dispatch counters
    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics.registry
    }

    /// Construct the drivers of a backend and add it to the table, not yet set up
    pub fn register_backend(&self, name: &str, props: &BackendProperties) -> Result<Arc<Backend>> {
        let ctx = DriverContext::new(name, self.config.operation_timeout())
            .with_config_path(props.config_path.clone())
            .with_locks(self.locks.clone())
            .with_runner(self.runner.clone());

        let (block, file_share) = match props.storage_type {
            StorageType::Block => (
                Some(DriverSlot::new(
                    self.registry.init_block(&props.driver_name, ctx.clone()),
                )),
                None,
            ),
            StorageType::File => (
                None,
                Some(DriverSlot::new(
                    self.registry.init_file_share(&props.driver_name, ctx.clone()),
                )),
            ),
        };
        let replication = props
            .replication_driver_name
            .as_deref()
            .map(|kind| DriverSlot::new(self.registry.init_replication(kind, ctx.clone())));
        let metrics = props
            .metrics_driver_name
            .as_deref()
            .map(|kind| DriverSlot::new(self.registry.init_metrics(kind, ctx.clone())));

        let backend = Arc::new(Backend {
            name: name.to_string(),
            props: props.clone(),
            block,
            file_share,
            replication,
            metrics,
        });

        let previous = self
            .backends
            .write()
            .insert(name.to_string(), backend.clone());
        if previous.is_some() {
            warn!("Backend {} replaced", name);
        }

        info!(
            "Registered backend {} ({} driver {})",
            name, props.storage_type, props.driver_name
        );
        Ok(backend)
    }

    /// Run setup on every driver of a backend
    pub async fn initialize_backend(&self, backend: &Backend) -> Result<()> {
        if let Some(slot) = &backend.block {
            self.setup_with_retry(&backend.name, slot).await?;
        }
        if let Some(slot) = &backend.file_share {
            self.setup_with_retry(&backend.name, slot).await?;
        }
        if let Some(slot) = &backend.replication {
            self.setup_with_retry(&backend.name, slot).await?;
        }
        if let Some(slot) = &backend.metrics {
            self.setup_with_retry(&backend.name, slot).await?;
        }

        info!("Backend {} initialized", backend.name);
        Ok(())
    }

    /// Register a backend and set its drivers up
    pub async fn load_backend(&self, name: &str, props: &BackendProperties) -> Result<()> {
        let backend = self.register_backend(name, props)?;
        self.initialize_backend(&backend).await
    }

    /// Setup with retry on transient failures and panics until `setup_max_wait`
    async fn setup_with_retry<D: DriverLifecycle + ?Sized>(
        &self,
        backend: &str,
        slot: &DriverSlot<D>,
    ) -> Result<()> {
        let kind = slot.driver.kind().to_string();
        let interval = self.config.setup_retry_interval();
        let max_wait = self.config.setup_max_wait();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match AssertUnwindSafe(slot.driver.setup()).catch_unwind().await {
                Ok(Ok(())) => {
                    slot.initialized.store(true, Ordering::SeqCst);
                    info!("Driver {} of backend {} set up", kind, backend);
                    return Ok(());
                }
                Ok(Err(e)) if !e.is_transient() => {
                    error!("Setup of driver {} for backend {} failed: {}", kind, backend, e);
                    return Err(e);
                }
                Ok(Err(e)) => {
                    warn!(
                        "Setup of driver {} for backend {} failed (attempt {}): {}",
                        kind, backend, attempt, e
                    );
                }
                Err(panic) => {
                    error!(
                        "Setup of driver {} for backend {} panicked (attempt {}): {}",
                        kind,
                        backend,
                        attempt,
                        panic_message(&*panic)
                    );
                }
            }

            let elapsed = started.elapsed();
            if elapsed + interval > max_wait {
                return Err(Error::Timeout {
                    operation: format!("setup of driver {} for backend {}", kind, backend),
                    elapsed,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Register every configured backend and set them up in the background
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut registered = Vec::new();
        for (name, props) in &self.config.backends {
            match self.register_backend(name, props) {
                Ok(backend) => registered.push(backend),
                Err(e) => error!("Failed to register backend {}: {}", name, e),
            }
        }

        let dock = self.clone();
        tokio::spawn(async move {
            let loads = registered.iter().map(|backend| {
                let dock = dock.clone();
                async move {
                    if let Err(e) = dock.initialize_backend(backend).await {
                        error!("Backend {} unavailable: {}", backend.name, e);
                    }
                }
            });
            futures::future::join_all(loads).await;
            info!("Dock started with {} backends", registered.len());
        })
    }

    /// Current state of every backend
    pub fn status(&self) -> Vec<BackendStatus> {
        self.backends
            .read()
            .values()
            .map(|b| BackendStatus {
                name: b.name.clone(),
                driver_name: b.props.driver_name.clone(),
                storage_type: b.props.storage_type,
                initialized: b.is_initialized(),
            })
            .collect()
    }

    fn backend(&self, name: &str) -> Result<Arc<Backend>> {
        self.backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("backend", name))
    }

    pub async fn dispatch_request(&self, request: DockRequest) -> Reply {
        self.dispatch(&request.backend, &request.operation, request.params)
            .await
    }

    /// Dispatch one operation; always yields exactly one reply
    pub async fn dispatch(&self, backend: &str, operation: &str, params: serde_json::Value) -> Reply {
        let started = Instant::now();
        let budget = self.config.operation_timeout() + DEADLINE_GRACE;

        let (label, outcome) = match Operation::parse(operation, params) {
            Ok(op) => {
                debug!(
                    "Dispatching {} to {} driver of backend {}",
                    operation,
                    op.family(),
                    backend
                );
                let call = AssertUnwindSafe(self.execute(backend, op)).catch_unwind();
                let outcome = match tokio::time::timeout(budget, call).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(Error::Internal(format!(
                        "{} panicked: {}",
                        operation,
                        panic_message(&*panic)
                    ))),
                    Err(_) => Err(Error::Timeout {
                        operation: format!("{} on backend {}", operation, backend),
                        elapsed: started.elapsed(),
                    }),
                };
                (operation, outcome)
            }
            Err(e @ Error::UnknownOperation(_)) => (UNKNOWN_LABEL, Err(e)),
            Err(e) => (operation, Err(e)),
        };

        let reply = match outcome {
            Ok(value) => Reply::from_value(value),
            Err(e) => {
                if e.code() == "500" {
                    error!("{} on backend {} failed: {}", operation, backend, e);
                } else {
                    warn!("{} on backend {} refused: {}", operation, backend, e);
                }
                Reply::from_error(&e)
            }
        };

        let backend_label = if self.backends.read().contains_key(backend) {
            backend
        } else {
            UNKNOWN_LABEL
        };
        self.metrics
            .observe(backend_label, label, reply.code(), started.elapsed());
        reply
    }

    async fn execute(&self, backend: &str, op: Operation) -> Result<serde_json::Value> {
        let entry = self.backend(backend)?;
        let name = op.name();

        match op {
            Operation::CreateVolume(o) => {
                let d = entry.block(name)?;
                validate::pool(&o.pool_name, &d.declared_pools())?;
                encode(d.create_volume(&o).await?)
            }
            Operation::PullVolume(o) => encode(entry.block(name)?.pull_volume(&o).await?),
            Operation::DeleteVolume(o) => encode(entry.block(name)?.delete_volume(&o).await?),
            Operation::ExtendVolume(o) => encode(entry.block(name)?.extend_volume(&o).await?),
            Operation::CreateSnapshot(o) => {
                encode(entry.block(name)?.create_snapshot(&o).await?)
            }
            Operation::PullSnapshot(o) => encode(entry.block(name)?.pull_snapshot(&o).await?),
            Operation::DeleteSnapshot(o) => {
                encode(entry.block(name)?.delete_snapshot(&o).await?)
            }
            Operation::InitializeConnection(o) => {
                encode(entry.block(name)?.initialize_connection(&o).await?)
            }
            Operation::TerminateConnection(o) => {
                encode(entry.block(name)?.terminate_connection(&o).await?)
            }
            Operation::InitializeSnapshotConnection(o) => {
                encode(entry.block(name)?.initialize_snapshot_connection(&o).await?)
            }
            Operation::TerminateSnapshotConnection(o) => {
                encode(entry.block(name)?.terminate_snapshot_connection(&o).await?)
            }
            Operation::CreateVolumeGroup(o) => {
                let d = entry.block(name)?;
                if !o.pool_name.is_empty() {
                    validate::pool(&o.pool_name, &d.declared_pools())?;
                }
                encode(d.create_volume_group(&o).await?)
            }
            Operation::UpdateVolumeGroup(o) => {
                encode(entry.block(name)?.update_volume_group(&o).await?)
            }
            Operation::DeleteVolumeGroup(o) => {
                encode(entry.block(name)?.delete_volume_group(&o).await?)
            }
            Operation::ListPools => encode(entry.block(name)?.list_pools().await?),

            Operation::CreateFileShare(o) => {
                let d = entry.file_share(name)?;
                validate::pool(&o.pool_name, &d.declared_pools())?;
                encode(d.create_file_share(&o).await?)
            }
            Operation::DeleteFileShare(o) => {
                encode(entry.file_share(name)?.delete_file_share(&o).await?)
            }
            Operation::CreateFileShareSnapshot(o) => {
                encode(entry.file_share(name)?.create_file_share_snapshot(&o).await?)
            }
            Operation::DeleteFileShareSnapshot(o) => {
                encode(entry.file_share(name)?.delete_file_share_snapshot(&o).await?)
            }
            Operation::CreateFileShareAcl(o) => {
                encode(entry.file_share(name)?.create_file_share_acl(&o).await?)
            }
            Operation::DeleteFileShareAcl(o) => {
                encode(entry.file_share(name)?.delete_file_share_acl(&o).await?)
            }
            Operation::ListFileSharePools => encode(entry.file_share(name)?.list_pools().await?),

            Operation::CreateReplication(o) => {
                encode(entry.replication(name)?.create_replication(&o).await?)
            }
            Operation::DeleteReplication(o) => {
                encode(entry.replication(name)?.delete_replication(&o).await?)
            }
            Operation::EnableReplication(o) => {
                encode(entry.replication(name)?.enable_replication(&o).await?)
            }
            Operation::DisableReplication(o) => {
                encode(entry.replication(name)?.disable_replication(&o).await?)
            }
            Operation::FailoverReplication(o) => {
                encode(entry.replication(name)?.failover_replication(&o).await?)
            }

            Operation::CollectMetrics(o) => {
                encode(entry.metrics(name)?.collect_metrics(&o).await?)
            }
        }
    }

    /// Tear down every driver and empty the backend table
    pub async fn shutdown(&self) {
        let backends: Vec<Arc<Backend>> = {
            let mut table = self.backends.write();
            std::mem::take(&mut *table).into_values().collect()
        };

        for backend in backends {
            if let Some(slot) = &backend.block {
                clean_slot(&backend.name, slot).await;
            }
            if let Some(slot) = &backend.file_share {
                clean_slot(&backend.name, slot).await;
            }
            if let Some(slot) = &backend.replication {
                clean_slot(&backend.name, slot).await;
            }
            if let Some(slot) = &backend.metrics {
                clean_slot(&backend.name, slot).await;
            }
        }
        info!("Dock shut down");
    }
}

async fn clean_slot<D: DriverLifecycle + ?Sized>(backend: &str, slot: &DriverSlot<D>) {
    slot.initialized.store(false, Ordering::SeqCst);
    if let Err(e) = registry::clean(slot.driver.clone()).await {
        warn!("Teardown of driver {} for backend {} failed: {}", slot.driver.kind(), backend, e);
    }
}
