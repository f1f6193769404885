//! NetApp ONTAP SAN Driver
//!
//! Block volumes on an ONTAP SVM: one FlexVol per volume holding a single
//! LUN at `/vol/<name>/lun0`. Volume create, delete and resize return jobs
//! that are joined with [`wait_for_job`] inside one [`Deadline`] per
//! operation. Each initiator gets its own igroup, so a LUN map names exactly
//! one host initiator.

pub mod api;
#[cfg(test)]
pub(crate) mod fake;

pub use api::*;

use crate::config::{self, PoolTable};
use crate::controlplane::jobs::{wait_for_job, Deadline, JobPollConfig};
use crate::controlplane::registry::DriverContext;
use crate::domain::model::*;
use crate::domain::naming::{lun_path, naa_from_serial, pool_id, NameScheme, PrefixedName};
use crate::domain::opts::*;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// FlexVols are sized this much above the LUN, percent
const VOLUME_OVERHEAD_PERCENT: u64 = 10;

const ISCSI_PORT: u16 = 3260;

// =============================================================================
// Configuration
// =============================================================================

/// `backend_options` block of the driver config
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OntapBackendOptions {
    pub version: u32,
    pub storage_driver_name: String,
    pub management_lif: String,
    pub data_lif: String,
    pub svm: String,
    pub igroup_name: String,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
}

impl std::fmt::Debug for OntapBackendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OntapBackendOptions")
            .field("version", &self.version)
            .field("storage_driver_name", &self.storage_driver_name)
            .field("management_lif", &self.management_lif)
            .field("data_lif", &self.data_lif)
            .field("svm", &self.svm)
            .field("igroup_name", &self.igroup_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Driver config file for `netapp_ontap_san`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OntapConfig {
    pub pool: PoolTable,
    pub backend_options: OntapBackendOptions,
}

impl OntapConfig {
    /// Check required options and fill defaults
    pub fn normalize(mut self) -> Result<Self> {
        let opts = &mut self.backend_options;
        for (field, value) in [
            ("management_lif", &opts.management_lif),
            ("svm", &opts.svm),
            ("username", &opts.username),
        ] {
            if value.is_empty() {
                return Err(Error::Configuration(format!(
                    "backend_options.{} is required",
                    field
                )));
            }
        }
        if opts.igroup_name.is_empty() {
            opts.igroup_name = DEFAULT_IGROUP.to_string();
        }
        Ok(self)
    }
}

const DEFAULT_IGROUP: &str = "opensds";

/// Igroup holding only `initiator`, named after the configured igroup
pub fn initiator_igroup(base: &str, initiator: &str) -> String {
    let digest = format!("{:x}", md5::compute(initiator.as_bytes()));
    format!("{}_{}", base, &digest[..16])
}

// =============================================================================
// ONTAP SAN Driver
// =============================================================================

struct Session {
    api: OntapApiRef,
    config: OntapConfig,
}

/// Block driver for ONTAP SAN
pub struct OntapSanDriver {
    ctx: DriverContext,
    session: RwLock<Option<Arc<Session>>>,
}

impl OntapSanDriver {
    pub const KIND: &'static str = "netapp_ontap_san";

    pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/opensds/driver/netapp_ontap_san.yaml";

    /// Create a driver; the session opens on `setup`
    pub fn new(ctx: DriverContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            session: RwLock::new(None),
        })
    }

    /// Create a driver bound to an already open API
    pub fn with_api(ctx: DriverContext, config: OntapConfig, api: OntapApiRef) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            session: RwLock::new(Some(Arc::new(Session { api, config }))),
        })
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or_else(|| Error::BackendUnreachable {
            backend: self.ctx.backend.clone(),
            reason: "driver is not set up".to_string(),
        })
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.ctx.op_timeout)
    }

    async fn join(&self, api: &OntapApiRef, job_id: String, deadline: &Deadline) -> Result<()> {
        let config = JobPollConfig::default()
            .with_max_wait(self.ctx.op_timeout)
            .within(deadline);
        wait_for_job(api.as_ref(), &job_id, &config).await
    }

    fn pool_for(&self, config: &OntapConfig, pool_name: &str) -> Result<Pool> {
        let props = config
            .pool
            .get(pool_name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pool: {}", pool_name)))?;
        Ok(Pool::new(pool_name, props, DEFAULT_AVAILABILITY_ZONE))
    }

    /// Backend name of the parent volume of a snapshot passed in `metadata`
    fn parent_volume(metadata: &Metadata) -> Result<String> {
        if let Some(name) = metadata.get("volume").filter(|v| !v.is_empty()) {
            return Ok(name.clone());
        }
        if let Some(id) = metadata.get("volumeId").filter(|v| !v.is_empty()) {
            return Ok(PrefixedName::volume().internal_name(id));
        }
        Err(Error::InvalidArgument(
            "creating from a snapshot needs metadata volume or volumeId".to_string(),
        ))
    }

    async fn create_from_snapshot(
        &self,
        api: &OntapApiRef,
        name: &str,
        snapshot_id: &str,
        opts: &CreateVolumeOpts,
        deadline: &Deadline,
    ) -> Result<Lun> {
        let parent = Self::parent_volume(&opts.metadata)?;
        let snapshot = PrefixedName::snapshot().internal_name(snapshot_id);

        info!("Cloning volume {} from {}@{}", name, parent, snapshot);
        let job = api.clone_volume(name, &parent, &snapshot).await?;

        let cloned = async {
            self.join(api, job, deadline).await?;

            let path = lun_path(name);
            let lun = api
                .get_lun(&path)
                .await?
                .ok_or_else(|| Error::not_found("lun", &path))?;

            let size_bytes = opts.size * GIB;
            if lun.size_bytes < size_bytes {
                let job = api.resize_volume(name, with_overhead(size_bytes)).await?;
                self.join(api, job, deadline).await?;
                api.resize_lun(&path, size_bytes).await?;
                return Ok(Lun { size_bytes, ..lun });
            }
            Ok(lun)
        }
        .await;

        if let Err(e) = &cloned {
            warn!("Clone {} failed, removing it: {}", name, e);
            self.abandon(api, name).await;
        }
        cloned
    }

    async fn create_empty(
        &self,
        api: &OntapApiRef,
        name: &str,
        aggregate: &str,
        size_gib: u64,
        deadline: &Deadline,
    ) -> Result<Lun> {
        let size_bytes = size_gib * GIB;
        let job = api
            .create_volume(name, aggregate, with_overhead(size_bytes))
            .await?;

        let created = async {
            self.join(api, job, deadline).await?;
            api.create_lun(&lun_path(name), size_bytes).await
        }
        .await;

        if let Err(e) = &created {
            warn!("Create of {} failed, removing volume: {}", name, e);
            self.abandon(api, name).await;
        }
        created
    }

    async fn destroy(&self, api: &OntapApiRef, name: &str, deadline: &Deadline) -> Result<()> {
        match api.delete_volume(name).await {
            Ok(job) => self.join(api, job, deadline).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Start removal of a half-created volume without waiting on the job
    async fn abandon(&self, api: &OntapApiRef, name: &str) {
        match api.delete_volume(name).await {
            Ok(job) => info!("Removing volume {} (job {})", name, job),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to remove volume {}: {}", name, e),
        }
    }

    /// Pool of an existing volume, from the aggregate it lives on
    fn pool_of(&self, config: &OntapConfig, volume: &FlexVol) -> Option<Pool> {
        let aggregate = volume.aggregate.as_deref()?;
        match config.pool.get(aggregate) {
            Some(props) => Some(Pool::new(aggregate, props, DEFAULT_AVAILABILITY_ZONE)),
            None => {
                debug!("Aggregate {} of {} is not a declared pool", aggregate, volume.name);
                None
            }
        }
    }

    fn to_volume(
        &self,
        config: &OntapConfig,
        id: &str,
        name: &str,
        description: &str,
        pool: Option<&Pool>,
        aggregate: Option<&str>,
        lun: &Lun,
    ) -> Volume {
        let mut metadata = Metadata::new();
        metadata.insert("lunPath".to_string(), lun.path.clone());

        let availability_zone = pool
            .map(|p| p.availability_zone.clone())
            .or_else(|| {
                config
                    .pool
                    .iter()
                    .next()
                    .map(|(n, p)| Pool::new(n, p, DEFAULT_AVAILABILITY_ZONE).availability_zone)
            })
            .unwrap_or_else(|| DEFAULT_AVAILABILITY_ZONE.to_string());

        let pool_id = pool
            .map(|p| p.id.clone())
            .or_else(|| aggregate.map(pool_id))
            .unwrap_or_default();

        Volume {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            size: lun.size_bytes / GIB,
            availability_zone,
            pool_id,
            snapshot_id: None,
            identifier: Some(Identifier {
                durable_name: naa_from_serial(&lun.serial_number),
                durable_name_format: DurableNameFormat::Naa,
            }),
            metadata,
        }
    }
}

fn with_overhead(size_bytes: u64) -> u64 {
    size_bytes + size_bytes * VOLUME_OVERHEAD_PERCENT / 100
}

#[async_trait]
impl DriverLifecycle for OntapSanDriver {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn setup(&self) -> Result<()> {
        if self.session.read().is_some() {
            return Ok(());
        }

        let path = config::resolve_path(self.ctx.config_path.as_deref(), Self::DEFAULT_CONFIG_PATH);
        let config = config::load_yaml::<OntapConfig>(&path)?.normalize()?;
        let opts = &config.backend_options;

        let client = OntapRestClient::new(OntapEndpoint {
            backend: self.ctx.backend.clone(),
            management_lif: opts.management_lif.clone(),
            svm: opts.svm.clone(),
            username: opts.username.clone(),
            password: opts.password.clone(),
            insecure_skip_verify: opts.insecure_skip_verify,
            timeout: self.ctx.op_timeout,
        })?;
        client.ping().await?;

        info!(
            "ONTAP SAN driver connected to SVM {} via {}",
            opts.svm, opts.management_lif
        );

        *self.session.write() = Some(Arc::new(Session {
            api: Arc::new(client),
            config,
        }));
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if self.session.write().take().is_some() {
            info!("ONTAP SAN driver for {} closed", self.ctx.backend);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDriver for OntapSanDriver {
    fn declared_pools(&self) -> Vec<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.config.pool.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<Volume> {
        let session = self.session()?;
        let api = &session.api;
        let pool = self.pool_for(&session.config, &opts.pool_name)?;
        let name = PrefixedName::volume().internal_name(&opts.id);
        let deadline = self.deadline();

        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        if api.get_volume(&name).await?.is_some() {
            return Err(Error::already_exists("volume", &opts.id));
        }

        let lun = match &opts.snapshot_id {
            Some(snapshot_id) => {
                self.create_from_snapshot(api, &name, snapshot_id, opts, &deadline)
                    .await?
            }
            None => {
                self.create_empty(api, &name, &opts.pool_name, opts.size, &deadline)
                    .await?
            }
        };

        let mut volume = self.to_volume(
            &session.config,
            &opts.id,
            &opts.name,
            &opts.description,
            Some(&pool),
            None,
            &lun,
        );
        volume.snapshot_id = opts.snapshot_id.clone();

        info!("Created ONTAP volume {} as {}", opts.id, name);
        Ok(volume)
    }

    async fn pull_volume(&self, opts: &PullOpts) -> Result<Volume> {
        let session = self.session()?;
        let name = PrefixedName::volume().internal_name(&opts.id);

        let flexvol = session
            .api
            .get_volume(&name)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;
        let lun = session
            .api
            .get_lun(&lun_path(&name))
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;

        let pool = self.pool_of(&session.config, &flexvol);
        Ok(self.to_volume(
            &session.config,
            &opts.id,
            "",
            "",
            pool.as_ref(),
            flexvol.aggregate.as_deref(),
            &lun,
        ))
    }

    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<()> {
        let session = self.session()?;
        let name = PrefixedName::volume().internal_name(&opts.id);
        let deadline = self.deadline();
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        if session.api.get_volume(&name).await?.is_none() {
            debug!("ONTAP volume {} already absent", name);
            return Ok(());
        }
        self.destroy(&session.api, &name, &deadline).await?;

        info!("Deleted ONTAP volume {}", opts.id);
        Ok(())
    }

    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<Volume> {
        let session = self.session()?;
        let api = &session.api;
        let name = PrefixedName::volume().internal_name(&opts.id);
        let path = lun_path(&name);
        let deadline = self.deadline();
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        let flexvol = api
            .get_volume(&name)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;
        let lun = api
            .get_lun(&path)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;

        let size_bytes = opts.size * GIB;
        if size_bytes < lun.size_bytes {
            return Err(Error::Conflict(format!(
                "volume {} cannot shrink from {} GiB to {} GiB",
                opts.id,
                lun.size_bytes / GIB,
                opts.size
            )));
        }

        if size_bytes > lun.size_bytes {
            let job = api.resize_volume(&name, with_overhead(size_bytes)).await?;
            self.join(api, job, &deadline).await?;
            api.resize_lun(&path, size_bytes).await?;
            info!("Extended ONTAP volume {} to {} GiB", opts.id, opts.size);
        }

        let lun = Lun { size_bytes, ..lun };
        let pool = self.pool_of(&session.config, &flexvol);
        Ok(self.to_volume(
            &session.config,
            &opts.id,
            "",
            "",
            pool.as_ref(),
            flexvol.aggregate.as_deref(),
            &lun,
        ))
    }

    async fn create_snapshot(&self, opts: &CreateSnapshotOpts) -> Result<Snapshot> {
        let session = self.session()?;
        let api = &session.api;
        let volume = PrefixedName::volume().internal_name(&opts.volume_id);
        let name = PrefixedName::snapshot().internal_name(&opts.id);
        let deadline = self.deadline();
        let _guard = self.ctx.locks.lock_until(&opts.volume_id, &deadline).await?;

        if api.get_volume(&volume).await?.is_none() {
            return Err(Error::not_found("volume", &opts.volume_id));
        }

        let job = api.create_snapshot(&volume, &name).await?;
        self.join(api, job, &deadline).await?;

        let info = api
            .get_snapshot(&volume, &name)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", &name))?;

        let mut metadata = opts.metadata.clone();
        metadata.insert("name".to_string(), name.clone());
        metadata.insert("volume".to_string(), volume);
        metadata.insert("creationTime".to_string(), info.create_time);
        metadata.insert("size".to_string(), format!("{}K", info.size_bytes / 1024));

        info!("Created ONTAP snapshot {} of {}", opts.id, opts.volume_id);
        Ok(Snapshot {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            volume_id: opts.volume_id.clone(),
            size: opts.size,
            metadata,
        })
    }

    async fn delete_snapshot(&self, opts: &DeleteSnapshotOpts) -> Result<()> {
        let session = self.session()?;
        let api = &session.api;
        let volume = opts
            .metadata
            .get("volume")
            .cloned()
            .unwrap_or_else(|| PrefixedName::volume().internal_name(&opts.volume_id));
        let name = PrefixedName::snapshot().internal_name(&opts.id);
        let deadline = self.deadline();

        match api.delete_snapshot(&volume, &name).await {
            Ok(job) => self.join(api, job, &deadline).await?,
            Err(e) if e.is_not_found() => {
                debug!("ONTAP snapshot {} already absent", name);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        info!("Deleted ONTAP snapshot {}", opts.id);
        Ok(())
    }

    async fn initialize_connection(&self, opts: &AttachmentOpts) -> Result<ConnectionInfo> {
        let session = self.session()?;
        let api = &session.api;
        let name = PrefixedName::volume().internal_name(&opts.volume_id);
        let path = lun_path(&name);

        let initiator = opts
            .host_info
            .initiator_for(opts.access_protocol)
            .map(|i| i.port_name.clone())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "host {} has no {} initiator",
                    opts.host_info.host, opts.access_protocol
                ))
            })?;

        let igroup = initiator_igroup(&session.config.backend_options.igroup_name, &initiator);
        let deadline = self.deadline();
        let _guard = self.ctx.locks.lock_until(&opts.volume_id, &deadline).await?;

        if api.get_lun(&path).await?.is_none() {
            return Err(Error::not_found("volume", &opts.volume_id));
        }

        let maps = api.lun_maps(&path).await?;
        let (lun_id, mapped_group) = match maps.iter().find(|m| m.igroup == igroup) {
            Some(existing) => (existing.lun_id, existing.igroup.clone()),
            None if !maps.is_empty() => {
                return Err(Error::Conflict(format!(
                    "volume {} is mapped to another initiator",
                    opts.volume_id
                )));
            }
            None => {
                let volume = api
                    .get_volume(&name)
                    .await?
                    .ok_or_else(|| Error::not_found("volume", &opts.volume_id))?;
                if volume.junction_path.is_none() {
                    api.mount_volume(&name, &format!("/{}", name)).await?;
                }
                api.ensure_igroup(&igroup, &initiator).await?;
                let lun_id = api.map_lun(&path, &igroup).await?;
                info!("Mapped {} to {} as LUN {}", path, initiator, lun_id);
                (lun_id, igroup.clone())
            }
        };

        let target_iqn = api.iscsi_target_name().await?;

        Ok(ConnectionInfo::new(opts.access_protocol.as_str())
            .with("target_discovered", true)
            .with("volume_id", opts.volume_id.clone())
            .with("volume", name)
            .with("description", "NetApp ONTAP Attachment")
            .with("host", opts.host_info.host.clone())
            .with("initiator", initiator)
            .with("targetIQN", vec![target_iqn])
            .with(
                "targetPortal",
                vec![format!("{}:{}", opts.host_info.ip, ISCSI_PORT)],
            )
            .with("targetLun", lun_id)
            .with("igroup", mapped_group))
    }

    async fn terminate_connection(&self, opts: &AttachmentOpts) -> Result<()> {
        let session = self.session()?;
        let api = &session.api;
        let name = PrefixedName::volume().internal_name(&opts.volume_id);
        let path = lun_path(&name);
        let deadline = self.deadline();
        let _guard = self.ctx.locks.lock_until(&opts.volume_id, &deadline).await?;

        let Some(volume) = api.get_volume(&name).await? else {
            debug!("ONTAP volume {} gone, nothing to unmap", name);
            return Ok(());
        };

        for map in api.lun_maps(&path).await? {
            api.unmap_lun(&path, &map.igroup).await?;
        }
        if volume.junction_path.is_some() {
            api.unmount_volume(&name).await?;
        }

        info!("Unmapped ONTAP volume {}", opts.volume_id);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let session = self.session()?;
        let aggregates = session.api.aggregates().await?;

        let pools = aggregates
            .into_iter()
            .filter_map(|aggr| {
                let props = session.config.pool.get(&aggr.name)?;
                let free = aggr.size_bytes.saturating_sub(aggr.allocated_bytes);
                Some(
                    Pool::new(&aggr.name, props, DEFAULT_AVAILABILITY_ZONE)
                        .with_capacity(aggr.size_bytes / GIB, free / GIB),
                )
            })
            .collect();

        Ok(pools)
    }
}
