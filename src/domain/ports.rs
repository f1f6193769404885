//! Domain Ports - Driver contracts
//!
//! One trait per driver family. Every family shares [`DriverLifecycle`];
//! operations a backend does not offer keep their default body and report
//! `NotImplemented`.

use crate::domain::model::{
    ConnectionInfo, FileShare, FileShareAcl, FileShareSnapshot, MetricSample, Pool,
    ReplicationSpec, Snapshot, Volume, VolumeGroup,
};
use crate::domain::opts::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Lifecycle
// =============================================================================

/// Setup and teardown shared by every driver family
#[async_trait]
pub trait DriverLifecycle: Send + Sync {
    /// Registered kind of this driver, e.g. `netapp_ontap_san`
    fn kind(&self) -> &str;

    /// Load config and open vendor sessions. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Release vendor sessions. Idempotent.
    async fn teardown(&self) -> Result<()>;
}

// =============================================================================
// Block Driver Port
// =============================================================================

/// Port for block volume backends
#[async_trait]
pub trait BlockDriver: DriverLifecycle {
    /// Pool names declared in driver config, used to resolve requests
    fn declared_pools(&self) -> Vec<String>;

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<Volume>;

    /// Discover a volume that already exists on the backend
    async fn pull_volume(&self, _opts: &PullOpts) -> Result<Volume> {
        Err(Error::not_implemented("pull_volume"))
    }

    /// Succeeds when the volume is already absent
    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<()>;

    /// Shrinking is a `Conflict` and leaves the volume untouched
    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<Volume>;

    async fn create_snapshot(&self, opts: &CreateSnapshotOpts) -> Result<Snapshot>;

    async fn pull_snapshot(&self, _opts: &PullOpts) -> Result<Snapshot> {
        Err(Error::not_implemented("pull_snapshot"))
    }

    /// Succeeds when the snapshot is already absent
    async fn delete_snapshot(&self, opts: &DeleteSnapshotOpts) -> Result<()>;

    /// Map the volume to the host initiator and describe how to reach it
    async fn initialize_connection(&self, opts: &AttachmentOpts) -> Result<ConnectionInfo>;

    /// Unmap the volume; succeeds when it is already unmapped or gone
    async fn terminate_connection(&self, opts: &AttachmentOpts) -> Result<()>;

    async fn initialize_snapshot_connection(
        &self,
        _opts: &SnapshotAttachmentOpts,
    ) -> Result<ConnectionInfo> {
        Err(Error::not_implemented("initialize_snapshot_connection"))
    }

    async fn terminate_snapshot_connection(&self, _opts: &SnapshotAttachmentOpts) -> Result<()> {
        Err(Error::not_implemented("terminate_snapshot_connection"))
    }

    async fn create_volume_group(&self, _opts: &VolumeGroupOpts) -> Result<VolumeGroup> {
        Err(Error::not_implemented("create_volume_group"))
    }

    async fn update_volume_group(&self, _opts: &VolumeGroupOpts) -> Result<VolumeGroup> {
        Err(Error::not_implemented("update_volume_group"))
    }

    async fn delete_volume_group(&self, _opts: &VolumeGroupOpts) -> Result<()> {
        Err(Error::not_implemented("delete_volume_group"))
    }

    /// Pools on the backend, filtered to those declared in config
    async fn list_pools(&self) -> Result<Vec<Pool>>;
}

// =============================================================================
// File Share Driver Port
// =============================================================================

/// Port for file share backends
#[async_trait]
pub trait FileShareDriver: DriverLifecycle {
    /// Pool names declared in driver config, used to resolve requests
    fn declared_pools(&self) -> Vec<String>;

    /// The share is returned mounted, with at least one export location
    async fn create_file_share(&self, opts: &CreateFileShareOpts) -> Result<FileShare>;

    /// Succeeds when the share is already absent
    async fn delete_file_share(&self, opts: &DeleteFileShareOpts) -> Result<()>;

    async fn create_file_share_snapshot(
        &self,
        _opts: &CreateFileShareSnapshotOpts,
    ) -> Result<FileShareSnapshot> {
        Err(Error::not_implemented("create_file_share_snapshot"))
    }

    async fn delete_file_share_snapshot(&self, _opts: &DeleteFileShareSnapshotOpts) -> Result<()> {
        Err(Error::not_implemented("delete_file_share_snapshot"))
    }

    async fn create_file_share_acl(&self, _opts: &CreateFileShareAclOpts) -> Result<FileShareAcl> {
        Err(Error::not_implemented("create_file_share_acl"))
    }

    async fn delete_file_share_acl(&self, _opts: &DeleteFileShareAclOpts) -> Result<()> {
        Err(Error::not_implemented("delete_file_share_acl"))
    }

    async fn list_pools(&self) -> Result<Vec<Pool>>;
}

// =============================================================================
// Replication Driver Port
// =============================================================================

/// Port for replication engines
///
/// When `is_primary` is false the call targets the peer side; drivers return
/// success without touching storage for work they do not own.
#[async_trait]
pub trait ReplicationDriver: DriverLifecycle {
    async fn create_replication(&self, opts: &ReplicationOpts) -> Result<ReplicationSpec>;

    async fn delete_replication(&self, opts: &ReplicationOpts) -> Result<()>;

    async fn enable_replication(&self, opts: &ReplicationOpts) -> Result<()>;

    async fn disable_replication(&self, opts: &ReplicationOpts) -> Result<()>;

    async fn failover_replication(&self, opts: &ReplicationOpts) -> Result<()>;
}

// =============================================================================
// Metrics Driver Port
// =============================================================================

/// Port for metric collectors
#[async_trait]
pub trait MetricsDriver: DriverLifecycle {
    async fn collect_metrics(&self, opts: &CollectMetricsOpts) -> Result<Vec<MetricSample>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BlockDriverRef = Arc<dyn BlockDriver>;
pub type FileShareDriverRef = Arc<dyn FileShareDriver>;
pub type ReplicationDriverRef = Arc<dyn ReplicationDriver>;
pub type MetricsDriverRef = Arc<dyn MetricsDriver>;
