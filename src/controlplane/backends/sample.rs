//! Sample Driver
//!
//! In-memory driver for every family. It is the fallback for unknown driver
//! kinds, lets the dock boot without a vendor backend, and keeps the full
//! lifecycle semantics so it doubles as a reference backend in tests.

use crate::config::{PoolProperties, PoolTable};
use crate::controlplane::registry::{DriverContext, SAMPLE_KIND};
use crate::domain::model::*;
use crate::domain::naming::{NameScheme, PrefixedName};
use crate::domain::opts::*;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Capacity of each sample pool, GiB
const SAMPLE_POOL_CAPACITY: u64 = 100;

const SAMPLE_TARGET_IQN: &str = "iqn.2017-10.io.opensds:volume:00000001";

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct SampleState {
    volumes: BTreeMap<String, Volume>,
    snapshots: BTreeMap<String, Snapshot>,
    /// volume id -> initiator it is mapped to
    attachments: BTreeMap<String, String>,
    groups: BTreeMap<String, VolumeGroup>,
    shares: BTreeMap<String, FileShare>,
    share_snapshots: BTreeMap<String, FileShareSnapshot>,
    acls: BTreeMap<String, FileShareAcl>,
    replications: BTreeMap<String, ReplicationSpec>,
}

impl SampleState {
    fn used_in_pool(&self, pool_id: &str) -> u64 {
        let volumes: u64 = self
            .volumes
            .values()
            .filter(|v| v.pool_id == pool_id)
            .map(|v| v.size)
            .sum();
        let shares: u64 = self
            .shares
            .values()
            .filter(|s| s.pool_id == pool_id)
            .map(|s| s.size)
            .sum();
        volumes + shares
    }

    fn replication_of(&self, volume_id: &str) -> Option<&ReplicationSpec> {
        self.replications.values().find(|r| {
            r.primary_volume_id == volume_id || r.secondary_volume_id == volume_id
        })
    }
}

// =============================================================================
// Sample Driver
// =============================================================================

/// In-memory driver implementing every driver family
pub struct SampleDriver {
    ctx: DriverContext,
    pools: PoolTable,
    ready: AtomicBool,
    state: RwLock<SampleState>,
}

impl SampleDriver {
    /// Create a new sample driver
    pub fn new(ctx: DriverContext) -> Arc<Self> {
        let mut pools = PoolTable::new();
        pools.insert(
            "sample-pool-01".to_string(),
            sample_pool(StorageType::Block, "iscsi"),
        );
        pools.insert(
            "sample-pool-02".to_string(),
            sample_pool(StorageType::File, "nfs"),
        );

        Arc::new(Self {
            ctx,
            pools,
            ready: AtomicBool::new(false),
            state: RwLock::new(SampleState::default()),
        })
    }

    fn pool_names(&self, storage_type: StorageType) -> Vec<String> {
        self.pools
            .iter()
            .filter(|(_, p)| p.storage_type == storage_type)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn pool(&self, name: &str, storage_type: StorageType) -> Result<Pool> {
        match self.pools.get(name) {
            Some(props) if props.storage_type == storage_type => {
                Ok(Pool::new(name, props, DEFAULT_AVAILABILITY_ZONE))
            }
            _ => Err(Error::InvalidArgument(format!(
                "unknown {} pool: {}",
                storage_type, name
            ))),
        }
    }

    async fn pools_of(&self, storage_type: StorageType) -> Vec<Pool> {
        let state = self.state.read().await;
        self.pools
            .iter()
            .filter(|(_, p)| p.storage_type == storage_type)
            .map(|(name, props)| {
                let pool = Pool::new(name, props, DEFAULT_AVAILABILITY_ZONE);
                let used = state.used_in_pool(&pool.id);
                pool.with_capacity(
                    SAMPLE_POOL_CAPACITY,
                    SAMPLE_POOL_CAPACITY.saturating_sub(used),
                )
            })
            .collect()
    }

    fn connection_info(
        &self,
        volume: &Volume,
        opts: &AttachmentOpts,
        initiator: &str,
    ) -> ConnectionInfo {
        let volume_name = PrefixedName::volume().internal_name(&volume.id);

        match opts.access_protocol {
            AccessProtocol::Iscsi => ConnectionInfo::new(AccessProtocol::Iscsi.as_str())
                .with("target_discovered", true)
                .with("volume_id", volume.id.clone())
                .with("volume", volume_name)
                .with("description", volume.description.clone())
                .with("host", opts.host_info.host.clone())
                .with("initiator", initiator)
                .with("targetIQN", vec![SAMPLE_TARGET_IQN])
                .with("targetPortal", vec![format!("{}:3260", opts.host_info.ip)])
                .with("targetLun", 1)
                .with("igroup", "sample"),
            protocol => ConnectionInfo::new(protocol.as_str())
                .with("volume_id", volume.id.clone())
                .with("volume", volume_name)
                .with("initiator", initiator)
                .with("access_mode", "rw"),
        }
    }
}

fn sample_pool(storage_type: StorageType, protocol: &str) -> PoolProperties {
    PoolProperties {
        storage_type,
        availability_zone: String::new(),
        multi_attach: false,
        extras: PoolExtras {
            provisioning_policy: Some("Thin".to_string()),
            access_protocol: Some(protocol.to_string()),
            ..Default::default()
        },
    }
}

#[async_trait]
impl DriverLifecycle for SampleDriver {
    fn kind(&self) -> &str {
        SAMPLE_KIND
    }

    async fn setup(&self) -> Result<()> {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!("Sample driver ready for backend {}", self.ctx.backend);
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Block
// =============================================================================

#[async_trait]
impl BlockDriver for SampleDriver {
    fn declared_pools(&self) -> Vec<String> {
        self.pool_names(StorageType::Block)
    }

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<Volume> {
        let pool = self.pool(&opts.pool_name, StorageType::Block)?;
        let mut state = self.state.write().await;

        if state.volumes.contains_key(&opts.id) {
            return Err(Error::already_exists("volume", &opts.id));
        }
        if let Some(snapshot_id) = &opts.snapshot_id {
            let snapshot = state
                .snapshots
                .get(snapshot_id)
                .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
            if opts.size < snapshot.size {
                return Err(Error::InvalidArgument(format!(
                    "volume size {} is smaller than snapshot size {}",
                    opts.size, snapshot.size
                )));
            }
        }

        let mut metadata = opts.metadata.clone();
        metadata.insert(
            "internal_name".to_string(),
            PrefixedName::volume().internal_name(&opts.id),
        );

        let volume = Volume {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            size: opts.size,
            availability_zone: pool.availability_zone,
            pool_id: pool.id,
            snapshot_id: opts.snapshot_id.clone(),
            identifier: None,
            metadata,
        };
        state.volumes.insert(volume.id.clone(), volume.clone());

        info!("Created sample volume {} ({} GiB)", volume.id, volume.size);
        Ok(volume)
    }

    async fn pull_volume(&self, opts: &PullOpts) -> Result<Volume> {
        self.state
            .read()
            .await
            .volumes
            .get(&opts.id)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", &opts.id))
    }

    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<()> {
        let mut state = self.state.write().await;
        if state.volumes.remove(&opts.id).is_none() {
            warn!("Sample volume {} already deleted", opts.id);
            return Ok(());
        }
        state.attachments.remove(&opts.id);

        info!("Deleted sample volume {}", opts.id);
        Ok(())
    }

    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<Volume> {
        let mut state = self.state.write().await;
        let volume = state
            .volumes
            .get_mut(&opts.id)
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;

        if opts.size < volume.size {
            return Err(Error::Conflict(format!(
                "cannot shrink volume {} from {} to {} GiB",
                opts.id, volume.size, opts.size
            )));
        }
        volume.size = opts.size;

        info!("Extended sample volume {} to {} GiB", opts.id, opts.size);
        Ok(volume.clone())
    }

    async fn create_snapshot(&self, opts: &CreateSnapshotOpts) -> Result<Snapshot> {
        let mut state = self.state.write().await;

        let size = state
            .volumes
            .get(&opts.volume_id)
            .map(|v| v.size)
            .ok_or_else(|| Error::not_found("volume", &opts.volume_id))?;
        if state.snapshots.contains_key(&opts.id) {
            return Err(Error::already_exists("snapshot", &opts.id));
        }

        let mut metadata = opts.metadata.clone();
        metadata.insert(
            "internal_name".to_string(),
            PrefixedName::snapshot().internal_name(&opts.id),
        );
        metadata.insert("creationTime".to_string(), chrono::Utc::now().to_rfc3339());

        let snapshot = Snapshot {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            volume_id: opts.volume_id.clone(),
            size,
            metadata,
        };
        state.snapshots.insert(snapshot.id.clone(), snapshot.clone());

        info!("Created sample snapshot {} of {}", snapshot.id, snapshot.volume_id);
        Ok(snapshot)
    }

    async fn pull_snapshot(&self, opts: &PullOpts) -> Result<Snapshot> {
        self.state
            .read()
            .await
            .snapshots
            .get(&opts.id)
            .cloned()
            .ok_or_else(|| Error::not_found("snapshot", &opts.id))
    }

    async fn delete_snapshot(&self, opts: &DeleteSnapshotOpts) -> Result<()> {
        if self.state.write().await.snapshots.remove(&opts.id).is_none() {
            warn!("Sample snapshot {} already deleted", opts.id);
        }
        Ok(())
    }

    async fn initialize_connection(&self, opts: &AttachmentOpts) -> Result<ConnectionInfo> {
        let mut state = self.state.write().await;

        let volume = state
            .volumes
            .get(&opts.volume_id)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", &opts.volume_id))?;

        let initiator = opts
            .host_info
            .initiator_for(opts.access_protocol)
            .map(|i| i.port_name.clone())
            .unwrap_or_else(|| opts.host_info.host.clone());

        match state.attachments.get(&opts.volume_id) {
            Some(mapped) if *mapped == initiator => {
                debug!("Volume {} already mapped to {}", opts.volume_id, initiator);
            }
            Some(mapped) => {
                return Err(Error::Conflict(format!(
                    "volume {} is mapped to {}",
                    opts.volume_id, mapped
                )));
            }
            None => {
                state
                    .attachments
                    .insert(opts.volume_id.clone(), initiator.clone());
                info!("Mapped sample volume {} to {}", opts.volume_id, initiator);
            }
        }

        Ok(self.connection_info(&volume, opts, &initiator))
    }

    async fn terminate_connection(&self, opts: &AttachmentOpts) -> Result<()> {
        if self
            .state
            .write()
            .await
            .attachments
            .remove(&opts.volume_id)
            .is_none()
        {
            warn!("Sample volume {} is not mapped", opts.volume_id);
        }
        Ok(())
    }

    async fn create_volume_group(&self, opts: &VolumeGroupOpts) -> Result<VolumeGroup> {
        let pool_id = if opts.pool_name.is_empty() {
            String::new()
        } else {
            self.pool(&opts.pool_name, StorageType::Block)?.id
        };

        let mut state = self.state.write().await;
        if state.groups.contains_key(&opts.id) {
            return Err(Error::already_exists("volume group", &opts.id));
        }

        let group = VolumeGroup {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            pool_id,
            volume_ids: Vec::new(),
        };
        state.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn update_volume_group(&self, opts: &VolumeGroupOpts) -> Result<VolumeGroup> {
        let mut state = self.state.write().await;

        for id in &opts.add_volumes {
            if !state.volumes.contains_key(id) {
                return Err(Error::not_found("volume", id));
            }
        }

        let group = state
            .groups
            .get_mut(&opts.id)
            .ok_or_else(|| Error::not_found("volume group", &opts.id))?;

        group.volume_ids.retain(|v| !opts.remove_volumes.contains(v));
        for id in &opts.add_volumes {
            if !group.volume_ids.contains(id) {
                group.volume_ids.push(id.clone());
            }
        }
        Ok(group.clone())
    }

    async fn delete_volume_group(&self, opts: &VolumeGroupOpts) -> Result<()> {
        self.state.write().await.groups.remove(&opts.id);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.pools_of(StorageType::Block).await)
    }
}

// =============================================================================
// File Share
// =============================================================================

#[async_trait]
impl FileShareDriver for SampleDriver {
    fn declared_pools(&self) -> Vec<String> {
        self.pool_names(StorageType::File)
    }

    async fn create_file_share(&self, opts: &CreateFileShareOpts) -> Result<FileShare> {
        let pool = self.pool(&opts.pool_name, StorageType::File)?;
        let mut state = self.state.write().await;

        if state.shares.contains_key(&opts.id) {
            return Err(Error::already_exists("file share", &opts.id));
        }

        let share = FileShare {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            size: opts.size,
            pool_id: pool.id,
            availability_zone: pool.availability_zone,
            protocols: vec!["nfs".to_string()],
            export_locations: vec![format!("127.0.0.1:/sample/{}", opts.id)],
            metadata: opts.metadata.clone(),
        };
        state.shares.insert(share.id.clone(), share.clone());

        info!("Created sample file share {}", share.id);
        Ok(share)
    }

    async fn delete_file_share(&self, opts: &DeleteFileShareOpts) -> Result<()> {
        let mut state = self.state.write().await;
        if state.shares.remove(&opts.id).is_none() {
            warn!("Sample file share {} already deleted", opts.id);
            return Ok(());
        }
        state.acls.retain(|_, acl| acl.file_share_id != opts.id);
        Ok(())
    }

    async fn create_file_share_snapshot(
        &self,
        opts: &CreateFileShareSnapshotOpts,
    ) -> Result<FileShareSnapshot> {
        let mut state = self.state.write().await;

        let size = state
            .shares
            .get(&opts.file_share_id)
            .map(|s| s.size)
            .ok_or_else(|| Error::not_found("file share", &opts.file_share_id))?;
        if state.share_snapshots.contains_key(&opts.id) {
            return Err(Error::already_exists("file share snapshot", &opts.id));
        }

        let snapshot = FileShareSnapshot {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            file_share_id: opts.file_share_id.clone(),
            snapshot_size: size,
            metadata: opts.metadata.clone(),
        };
        state
            .share_snapshots
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_file_share_snapshot(&self, opts: &DeleteFileShareSnapshotOpts) -> Result<()> {
        self.state.write().await.share_snapshots.remove(&opts.id);
        Ok(())
    }

    async fn create_file_share_acl(&self, opts: &CreateFileShareAclOpts) -> Result<FileShareAcl> {
        let mut state = self.state.write().await;

        if !state.shares.contains_key(&opts.file_share_id) {
            return Err(Error::not_found("file share", &opts.file_share_id));
        }

        let acl = FileShareAcl {
            id: opts.id.clone(),
            file_share_id: opts.file_share_id.clone(),
            access_type: opts.access_type.clone(),
            access_to: opts.access_to.clone(),
            access_capability: opts.access_capability.clone(),
            metadata: opts.metadata.clone(),
        };
        state.acls.insert(acl.id.clone(), acl.clone());
        Ok(acl)
    }

    async fn delete_file_share_acl(&self, opts: &DeleteFileShareAclOpts) -> Result<()> {
        self.state.write().await.acls.remove(&opts.id);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.pools_of(StorageType::File).await)
    }
}

// =============================================================================
// Replication
// =============================================================================

#[async_trait]
impl ReplicationDriver for SampleDriver {
    async fn create_replication(&self, opts: &ReplicationOpts) -> Result<ReplicationSpec> {
        let spec = opts.to_spec();
        if !opts.is_primary {
            return Ok(spec);
        }

        let mut state = self.state.write().await;
        for volume in [&opts.primary_volume_id, &opts.secondary_volume_id] {
            if let Some(existing) = state.replication_of(volume) {
                return Err(Error::already_exists(
                    "replication volume",
                    format!("{} in {}", volume, existing.id),
                ));
            }
        }
        state.replications.insert(spec.id.clone(), spec.clone());

        info!(
            "Created sample replication {} ({} -> {})",
            spec.id, spec.primary_volume_id, spec.secondary_volume_id
        );
        Ok(spec)
    }

    async fn delete_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        if opts.is_primary {
            self.state.write().await.replications.remove(&opts.id);
        }
        Ok(())
    }

    async fn enable_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        if !opts.is_primary {
            return Ok(());
        }
        if !self.state.read().await.replications.contains_key(&opts.id) {
            return Err(Error::not_found("replication", &opts.id));
        }
        Ok(())
    }

    async fn disable_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        self.enable_replication(opts).await
    }

    async fn failover_replication(&self, _opts: &ReplicationOpts) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Metrics
// =============================================================================

#[async_trait]
impl MetricsDriver for SampleDriver {
    async fn collect_metrics(&self, opts: &CollectMetricsOpts) -> Result<Vec<MetricSample>> {
        let timestamp = chrono::Utc::now().timestamp();
        let wanted = |name: &str| opts.metrics.is_empty() || opts.metrics.iter().any(|m| m == name);

        let mut samples = Vec::new();
        let mut pools = self.pools_of(StorageType::Block).await;
        pools.extend(self.pools_of(StorageType::File).await);

        for pool in pools {
            let mut labels = BTreeMap::new();
            labels.insert("pool".to_string(), pool.name.clone());

            for (name, value) in [
                ("total_capacity", pool.total_capacity),
                ("free_capacity", pool.free_capacity),
            ] {
                if wanted(name) {
                    samples.push(MetricSample {
                        instance_id: opts.instance_id.clone(),
                        name: name.to_string(),
                        unit: "GiB".to_string(),
                        value: value as f64,
                        timestamp,
                        labels: labels.clone(),
                    });
                }
            }
        }

        if wanted("volume_count") {
            samples.push(MetricSample {
                instance_id: opts.instance_id.clone(),
                name: "volume_count".to_string(),
                unit: "count".to_string(),
                value: self.state.read().await.volumes.len() as f64,
                timestamp,
                labels: BTreeMap::new(),
            });
        }

        Ok(samples)
    }
}
