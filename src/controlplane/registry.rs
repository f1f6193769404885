//! Driver registry
//!
//! Maps a driver kind string to a constructor, one table per driver family.
//! Unknown kinds fall back to the built-in sample driver so the dock can
//! boot with no vendor backend configured.

use crate::controlplane::backends::{
    ceph::CephDriver, chubaofs::ChubaoFsDriver, hostrep::HostReplicationDriver,
    ontap::OntapSanDriver, sample::SampleDriver,
};
use crate::controlplane::exec::{CommandRunnerRef, SystemRunner};
use crate::controlplane::locks::LockTable;
use crate::domain::ports::*;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Kind of the fallback driver
pub const SAMPLE_KIND: &str = "sample";

// =============================================================================
// Driver Context
// =============================================================================

/// Everything a driver constructor receives
#[derive(Clone)]
pub struct DriverContext {
    /// Backend name the driver serves
    pub backend: String,
    /// Driver config file, the driver default when unset
    pub config_path: Option<PathBuf>,
    /// Shared per-resource lock table
    pub locks: Arc<LockTable>,
    /// Runner for external commands
    pub runner: CommandRunnerRef,
    /// Deadline for each command, vendor request and job wait
    pub op_timeout: Duration,
}

impl DriverContext {
    pub fn new(backend: impl Into<String>, op_timeout: Duration) -> Self {
        Self {
            backend: backend.into(),
            config_path: None,
            locks: Arc::new(LockTable::new()),
            runner: Arc::new(SystemRunner::new(op_timeout)),
            op_timeout,
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn with_locks(mut self, locks: Arc<LockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_runner(mut self, runner: CommandRunnerRef) -> Self {
        self.runner = runner;
        self
    }
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("backend", &self.backend)
            .field("config_path", &self.config_path)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

pub type BlockCtor = Arc<dyn Fn(DriverContext) -> BlockDriverRef + Send + Sync>;
pub type FileShareCtor = Arc<dyn Fn(DriverContext) -> FileShareDriverRef + Send + Sync>;
pub type ReplicationCtor = Arc<dyn Fn(DriverContext) -> ReplicationDriverRef + Send + Sync>;
pub type MetricsCtor = Arc<dyn Fn(DriverContext) -> MetricsDriverRef + Send + Sync>;

/// Driver constructors by family and kind
#[derive(Default)]
pub struct DriverRegistry {
    block: RwLock<BTreeMap<String, BlockCtor>>,
    file_share: RwLock<BTreeMap<String, FileShareCtor>>,
    replication: RwLock<BTreeMap<String, ReplicationCtor>>,
    metrics: RwLock<BTreeMap<String, MetricsCtor>>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_block<F>(&self, kind: &str, ctor: F)
    where
        F: Fn(DriverContext) -> BlockDriverRef + Send + Sync + 'static,
    {
        self.block.write().insert(kind.to_string(), Arc::new(ctor));
    }

    pub fn register_file_share<F>(&self, kind: &str, ctor: F)
    where
        F: Fn(DriverContext) -> FileShareDriverRef + Send + Sync + 'static,
    {
        self.file_share.write().insert(kind.to_string(), Arc::new(ctor));
    }

    pub fn register_replication<F>(&self, kind: &str, ctor: F)
    where
        F: Fn(DriverContext) -> ReplicationDriverRef + Send + Sync + 'static,
    {
        self.replication.write().insert(kind.to_string(), Arc::new(ctor));
    }

    pub fn register_metrics<F>(&self, kind: &str, ctor: F)
    where
        F: Fn(DriverContext) -> MetricsDriverRef + Send + Sync + 'static,
    {
        self.metrics.write().insert(kind.to_string(), Arc::new(ctor));
    }

    /// Construct a block driver, the sample driver when `kind` is unknown
    pub fn init_block(&self, kind: &str, ctx: DriverContext) -> BlockDriverRef {
        let ctor = self.block.read().get(kind).cloned();
        match ctor {
            Some(ctor) => ctor(ctx),
            None => {
                warn!("Unknown block driver {}, using {}", kind, SAMPLE_KIND);
                SampleDriver::new(ctx)
            }
        }
    }

    /// Construct a file share driver, the sample driver when `kind` is unknown
    pub fn init_file_share(&self, kind: &str, ctx: DriverContext) -> FileShareDriverRef {
        let ctor = self.file_share.read().get(kind).cloned();
        match ctor {
            Some(ctor) => ctor(ctx),
            None => {
                warn!("Unknown file share driver {}, using {}", kind, SAMPLE_KIND);
                SampleDriver::new(ctx)
            }
        }
    }

    /// Construct a replication driver, the sample driver when `kind` is unknown
    pub fn init_replication(&self, kind: &str, ctx: DriverContext) -> ReplicationDriverRef {
        let ctor = self.replication.read().get(kind).cloned();
        match ctor {
            Some(ctor) => ctor(ctx),
            None => {
                warn!("Unknown replication driver {}, using {}", kind, SAMPLE_KIND);
                SampleDriver::new(ctx)
            }
        }
    }

    /// Construct a metrics driver, the sample driver when `kind` is unknown
    pub fn init_metrics(&self, kind: &str, ctx: DriverContext) -> MetricsDriverRef {
        let ctor = self.metrics.read().get(kind).cloned();
        match ctor {
            Some(ctor) => ctor(ctx),
            None => {
                warn!("Unknown metrics driver {}, using {}", kind, SAMPLE_KIND);
                SampleDriver::new(ctx)
            }
        }
    }

    /// Registered block driver kinds
    pub fn block_kinds(&self) -> Vec<String> {
        self.block.read().keys().cloned().collect()
    }

    /// Registered file share driver kinds
    pub fn file_share_kinds(&self) -> Vec<String> {
        self.file_share.read().keys().cloned().collect()
    }

    /// Registered replication driver kinds
    pub fn replication_kinds(&self) -> Vec<String> {
        self.replication.read().keys().cloned().collect()
    }

    /// Registered metrics driver kinds
    pub fn metrics_kinds(&self) -> Vec<String> {
        self.metrics.read().keys().cloned().collect()
    }
}

/// Tear a driver down and release it
pub async fn clean<D: DriverLifecycle + ?Sized>(driver: Arc<D>) -> Result<()> {
    let kind = driver.kind().to_string();
    driver.teardown().await?;
    info!("Cleaned driver {}", kind);
    Ok(())
}

/// Build the registry with every built-in driver
pub fn init_registry() -> DriverRegistry {
    let registry = DriverRegistry::new();

    registry.register_block(SAMPLE_KIND, |ctx| SampleDriver::new(ctx));
    registry.register_block(OntapSanDriver::KIND, |ctx| OntapSanDriver::new(ctx));
    registry.register_block(CephDriver::KIND, |ctx| CephDriver::new(ctx));

    registry.register_file_share(SAMPLE_KIND, |ctx| SampleDriver::new(ctx));
    registry.register_file_share(ChubaoFsDriver::KIND, |ctx| ChubaoFsDriver::new(ctx));

    registry.register_replication(SAMPLE_KIND, |ctx| SampleDriver::new(ctx));
    registry.register_replication(HostReplicationDriver::KIND, |ctx| {
        HostReplicationDriver::new(ctx)
    });

    registry.register_metrics(SAMPLE_KIND, |ctx| SampleDriver::new(ctx));
    registry.register_metrics(CephDriver::KIND, |ctx| CephDriver::new(ctx));

    info!(
        "Driver registry initialized: block={:?} file_share={:?} replication={:?} metrics={:?}",
        registry.block_kinds(),
        registry.file_share_kinds(),
        registry.replication_kinds(),
        registry.metrics_kinds()
    );

    registry
}
