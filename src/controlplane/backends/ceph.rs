//! Ceph RBD Driver
//!
//! Block volumes as RBD images, driven through the `rbd` and `ceph` CLIs.
//! Image names follow [`RbdImageName`] so volumes can be found again by id
//! when listing a pool. The same driver collects pool metrics from
//! `ceph df detail`.

use crate::config::{self, PoolTable};
use crate::controlplane::exec::CommandOutput;
use crate::controlplane::jobs::Deadline;
use crate::controlplane::registry::DriverContext;
use crate::domain::model::*;
use crate::domain::naming::RbdImageName;
use crate::domain::opts::*;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Zone reported when a pool declares none
const CEPH_AVAILABILITY_ZONE: &str = "ceph";

const MONITOR_PORT: &str = "6789";

/// Pool metrics the driver can collect, with their units
pub const SUPPORTED_METRICS: [(&str, &str); 9] = [
    ("pool_used_bytes", "bytes"),
    ("pool_raw_used_bytes", "bytes"),
    ("pool_available_bytes", "bytes"),
    ("pool_objects_total", ""),
    ("pool_dirty_objects_total", ""),
    ("pool_read_total", ""),
    ("pool_read_bytes_total", "bytes"),
    ("pool_write_total", ""),
    ("pool_write_bytes_total", "bytes"),
];

/// Requested metrics this driver supports, every metric when none are named
pub fn supported_metrics(requested: &[String]) -> Vec<&'static str> {
    if requested.is_empty() {
        return SUPPORTED_METRICS.iter().map(|(name, _)| *name).collect();
    }
    requested
        .iter()
        .filter_map(|wanted| {
            let found = SUPPORTED_METRICS
                .iter()
                .find(|(name, _)| name == wanted)
                .map(|(name, _)| *name);
            if found.is_none() {
                info!("Metric {} is not supported by the ceph driver", wanted);
            }
            found
        })
        .collect()
}

fn metric_unit(metric: &str) -> &'static str {
    SUPPORTED_METRICS
        .iter()
        .find(|(name, _)| *name == metric)
        .map_or("", |(_, unit)| *unit)
}

// =============================================================================
// Configuration
// =============================================================================

/// Driver config file for `ceph`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CephConfig {
    pub pool: PoolTable,
    /// ceph.conf passed to every CLI call
    pub config_file: PathBuf,
    pub cluster_name: String,
    /// Monitor hosts handed to attaching clients
    pub monitors: Vec<String>,
}

impl Default for CephConfig {
    fn default() -> Self {
        Self {
            pool: PoolTable::new(),
            config_file: PathBuf::from("/etc/ceph/ceph.conf"),
            cluster_name: "ceph".to_string(),
            monitors: Vec::new(),
        }
    }
}

// =============================================================================
// CLI Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ImageInfo {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SnapInfo {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct DfReport {
    #[serde(default)]
    pools: Vec<DfPool>,
}

#[derive(Debug, Deserialize)]
struct DfPool {
    name: String,
    stats: DfStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DfStats {
    bytes_used: u64,
    max_avail: u64,
    stored_raw: u64,
    objects: u64,
    dirty: u64,
    rd: u64,
    rd_bytes: u64,
    wr: u64,
    wr_bytes: u64,
}

impl DfStats {
    fn value(&self, metric: &str) -> Option<u64> {
        let v = match metric {
            "pool_used_bytes" => self.bytes_used,
            "pool_raw_used_bytes" => self.stored_raw,
            "pool_available_bytes" => self.max_avail,
            "pool_objects_total" => self.objects,
            "pool_dirty_objects_total" => self.dirty,
            "pool_read_total" => self.rd,
            "pool_read_bytes_total" => self.rd_bytes,
            "pool_write_total" => self.wr,
            "pool_write_bytes_total" => self.wr_bytes,
            _ => return None,
        };
        Some(v)
    }
}

/// An image located in one of the configured pools
#[derive(Debug, Clone)]
struct Located {
    pool: String,
    image: RbdImageName,
}

impl Located {
    fn spec(&self) -> String {
        format!("{}/{}", self.pool, self.image)
    }
}

// =============================================================================
// Ceph Driver
// =============================================================================

/// Block driver for Ceph RBD
pub struct CephDriver {
    ctx: DriverContext,
    config: RwLock<Option<Arc<CephConfig>>>,
}

impl CephDriver {
    pub const KIND: &'static str = "ceph";

    pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/opensds/driver/ceph.yaml";

    pub fn new(ctx: DriverContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config: RwLock::new(None),
        })
    }

    /// Create a driver with its config already loaded
    pub fn with_config(ctx: DriverContext, config: CephConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config: RwLock::new(Some(Arc::new(config))),
        })
    }

    fn config(&self) -> Result<Arc<CephConfig>> {
        self.config.read().clone().ok_or_else(|| Error::BackendUnreachable {
            backend: self.ctx.backend.clone(),
            reason: "driver is not set up".to_string(),
        })
    }

    /// Run a CLI subcommand with the cluster selection appended
    async fn cli(&self, cfg: &CephConfig, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let conf = cfg.config_file.to_string_lossy().into_owned();
        let mut full: Vec<&str> = args.to_vec();
        full.extend(["-c", conf.as_str(), "--cluster", cfg.cluster_name.as_str()]);
        self.ctx.runner.run(program, &full).await
    }

    async fn rbd(&self, cfg: &CephConfig, args: &[&str]) -> Result<CommandOutput> {
        self.cli(cfg, "rbd", args).await
    }

    async fn images(&self, cfg: &CephConfig, pool: &str) -> Result<Vec<String>> {
        let out = self.rbd(cfg, &["ls", "-p", pool, "--format", "json"]).await?;
        parse_list(&out.stdout)
    }

    /// Find the image of volume `id` in any configured pool
    async fn locate(&self, cfg: &CephConfig, id: &str) -> Result<Option<Located>> {
        for pool in cfg.pool.keys() {
            let found = self
                .images(cfg, pool)
                .await?
                .iter()
                .filter_map(|name| RbdImageName::parse(name))
                .find(|image| image.id == id);

            if let Some(image) = found {
                return Ok(Some(Located {
                    pool: pool.clone(),
                    image,
                }));
            }
        }
        Ok(None)
    }

    async fn image_size(&self, cfg: &CephConfig, located: &Located) -> Result<u64> {
        let out = self
            .rbd(cfg, &["info", &located.spec(), "--format", "json"])
            .await?;
        let info: ImageInfo = serde_json::from_str(&out.stdout)?;
        Ok(info.size)
    }

    async fn snapshots(&self, cfg: &CephConfig, located: &Located) -> Result<Vec<SnapInfo>> {
        let out = self
            .rbd(cfg, &["snap", "ls", &located.spec(), "--format", "json"])
            .await?;
        if out.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out.stdout)?)
    }

    fn pool_for(&self, cfg: &CephConfig, name: &str) -> Result<Pool> {
        let props = cfg
            .pool
            .get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pool: {}", name)))?;
        Ok(Pool::new(name, props, CEPH_AVAILABILITY_ZONE))
    }

    fn to_volume(
        &self,
        cfg: &CephConfig,
        id: &str,
        description: &str,
        located: &Located,
        size_bytes: u64,
    ) -> Volume {
        let pool = cfg
            .pool
            .get(&located.pool)
            .map(|props| Pool::new(&located.pool, props, CEPH_AVAILABILITY_ZONE));

        let mut metadata = Metadata::new();
        metadata.insert("internal_name".to_string(), located.image.to_string());
        metadata.insert("volume_name".to_string(), located.image.name.clone());
        metadata.insert("pool".to_string(), located.pool.clone());

        Volume {
            id: id.to_string(),
            name: located.image.name.clone(),
            description: description.to_string(),
            size: size_bytes / GIB,
            availability_zone: pool
                .as_ref()
                .map(|p| p.availability_zone.clone())
                .unwrap_or_else(|| CEPH_AVAILABILITY_ZONE.to_string()),
            pool_id: pool.map(|p| p.id).unwrap_or_default(),
            snapshot_id: None,
            identifier: None,
            metadata,
        }
    }

    /// Volume located through request metadata, falling back to a pool scan
    async fn locate_from(
        &self,
        cfg: &CephConfig,
        id: &str,
        metadata: &Metadata,
    ) -> Result<Option<Located>> {
        let hint = metadata
            .get("pool")
            .zip(metadata.get("internal_name"))
            .and_then(|(pool, name)| {
                RbdImageName::parse(name)
                    .filter(|image| image.id == id)
                    .map(|image| Located {
                        pool: pool.clone(),
                        image,
                    })
            });
        match hint {
            Some(located) => Ok(Some(located)),
            None => self.locate(cfg, id).await,
        }
    }
}

fn parse_list(stdout: &str) -> Result<Vec<String>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(stdout)?)
}

fn size_arg(size_gib: u64) -> String {
    format!("{}G", size_gib)
}

#[async_trait]
impl DriverLifecycle for CephDriver {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn setup(&self) -> Result<()> {
        if self.config.read().is_some() {
            return Ok(());
        }

        let path = config::resolve_path(self.ctx.config_path.as_deref(), Self::DEFAULT_CONFIG_PATH);
        let cfg: CephConfig = config::load_yaml(&path)?;

        self.cli(&cfg, "ceph", &["health"])
            .await
            .map_err(|e| Error::BackendUnreachable {
                backend: self.ctx.backend.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "Ceph driver ready for cluster {} ({} pools)",
            cfg.cluster_name,
            cfg.pool.len()
        );
        *self.config.write() = Some(Arc::new(cfg));
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.config.write().take();
        Ok(())
    }
}

#[async_trait]
impl BlockDriver for CephDriver {
    fn declared_pools(&self) -> Vec<String> {
        self.config
            .read()
            .as_ref()
            .map(|c| c.pool.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn create_volume(&self, opts: &CreateVolumeOpts) -> Result<Volume> {
        let cfg = self.config()?;
        self.pool_for(&cfg, &opts.pool_name)?;
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        if self.locate(&cfg, &opts.id).await?.is_some() {
            return Err(Error::already_exists("volume", &opts.id));
        }

        let located = Located {
            pool: opts.pool_name.clone(),
            image: RbdImageName::new(&opts.name, &opts.id),
        };
        let spec = located.spec();

        match &opts.snapshot_id {
            Some(snapshot_id) => {
                let parent = opts
                    .metadata
                    .get("internal_name")
                    .filter(|n| n.contains('@'))
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!(
                            "snapshot {} carries no internal_name",
                            snapshot_id
                        ))
                    })?;
                let parent_pool = opts.metadata.get("pool").unwrap_or(&opts.pool_name);
                let parent_spec = format!("{}/{}", parent_pool, parent);

                self.rbd(&cfg, &["clone", &parent_spec, &spec]).await?;

                let finished = async {
                    self.rbd(&cfg, &["flatten", &spec]).await?;
                    if self.image_size(&cfg, &located).await? < opts.size * GIB {
                        self.rbd(&cfg, &["resize", &spec, "--size", &size_arg(opts.size)])
                            .await?;
                    }
                    Ok::<_, Error>(())
                }
                .await;

                if let Err(e) = finished {
                    warn!("Clone {} failed, removing it: {}", spec, e);
                    if let Err(cleanup) = self.rbd(&cfg, &["rm", &spec]).await {
                        warn!("Failed to remove clone {}: {}", spec, cleanup);
                    }
                    return Err(e);
                }
            }
            None => {
                self.rbd(
                    &cfg,
                    &["create", &spec, "--size", &size_arg(opts.size), "--image-format", "2"],
                )
                .await?;
            }
        }

        let mut volume =
            self.to_volume(&cfg, &opts.id, &opts.description, &located, opts.size * GIB);
        volume.snapshot_id = opts.snapshot_id.clone();

        info!("Created RBD image {}", spec);
        Ok(volume)
    }

    async fn pull_volume(&self, opts: &PullOpts) -> Result<Volume> {
        let cfg = self.config()?;
        let located = self
            .locate(&cfg, &opts.id)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;
        let size = self.image_size(&cfg, &located).await?;
        Ok(self.to_volume(&cfg, &opts.id, "", &located, size))
    }

    async fn delete_volume(&self, opts: &DeleteVolumeOpts) -> Result<()> {
        let cfg = self.config()?;
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        let Some(located) = self.locate_from(&cfg, &opts.id, &opts.metadata).await? else {
            debug!("RBD image of volume {} already absent", opts.id);
            return Ok(());
        };

        match self.rbd(&cfg, &["rm", &located.spec()]).await {
            Ok(_) => {}
            Err(Error::CommandFailed { output, .. }) if output.contains("has snapshots") => {
                return Err(Error::Conflict(format!(
                    "volume {} still has snapshots, delete them first",
                    opts.id
                )));
            }
            Err(e) => return Err(e),
        }
        info!("Deleted RBD image {}", located.spec());
        Ok(())
    }

    async fn extend_volume(&self, opts: &ExtendVolumeOpts) -> Result<Volume> {
        let cfg = self.config()?;
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        let located = self
            .locate_from(&cfg, &opts.id, &opts.metadata)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.id))?;
        let current = self.image_size(&cfg, &located).await?;
        let wanted = opts.size * GIB;

        if wanted < current {
            return Err(Error::Conflict(format!(
                "volume {} cannot shrink from {} GiB to {} GiB",
                opts.id,
                current / GIB,
                opts.size
            )));
        }
        if wanted > current {
            self.rbd(&cfg, &["resize", &located.spec(), "--size", &size_arg(opts.size)])
                .await?;
            info!("Extended RBD image {} to {} GiB", located.spec(), opts.size);
        }

        Ok(self.to_volume(&cfg, &opts.id, "", &located, wanted))
    }

    async fn create_snapshot(&self, opts: &CreateSnapshotOpts) -> Result<Snapshot> {
        let cfg = self.config()?;
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.volume_id, &deadline).await?;

        let located = self
            .locate_from(&cfg, &opts.volume_id, &opts.metadata)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.volume_id))?;

        let snap_name = if opts.name.is_empty() { &opts.id } else { &opts.name };
        let snap = RbdImageName::new(snap_name, &opts.id);
        let snap_spec = format!("{}@{}", located.spec(), snap);

        self.rbd(&cfg, &["snap", "create", &snap_spec]).await?;
        self.rbd(&cfg, &["snap", "protect", &snap_spec]).await?;

        let mut metadata = opts.metadata.clone();
        metadata.insert(
            "internal_name".to_string(),
            format!("{}@{}", located.image, snap),
        );
        metadata.insert("pool".to_string(), located.pool.clone());

        info!("Created RBD snapshot {}", snap_spec);
        Ok(Snapshot {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            volume_id: opts.volume_id.clone(),
            size: opts.size,
            metadata,
        })
    }

    async fn pull_snapshot(&self, opts: &PullOpts) -> Result<Snapshot> {
        let cfg = self.config()?;
        for pool in cfg.pool.keys() {
            for name in self.images(&cfg, pool).await? {
                let Some(image) = RbdImageName::parse(&name) else {
                    continue;
                };
                let located = Located {
                    pool: pool.clone(),
                    image,
                };
                let found = self
                    .snapshots(&cfg, &located)
                    .await?
                    .into_iter()
                    .find_map(|s| {
                        RbdImageName::parse(&s.name)
                            .filter(|n| n.id == opts.id)
                            .map(|n| (n, s.size))
                    });

                if let Some((snap, size)) = found {
                    let mut metadata = Metadata::new();
                    metadata.insert(
                        "internal_name".to_string(),
                        format!("{}@{}", located.image, snap),
                    );
                    metadata.insert("pool".to_string(), located.pool.clone());
                    return Ok(Snapshot {
                        id: opts.id.clone(),
                        name: snap.name,
                        description: String::new(),
                        volume_id: located.image.id.clone(),
                        size: size / GIB,
                        metadata,
                    });
                }
            }
        }
        Err(Error::not_found("snapshot", &opts.id))
    }

    async fn delete_snapshot(&self, opts: &DeleteSnapshotOpts) -> Result<()> {
        let cfg = self.config()?;
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.volume_id, &deadline).await?;

        let Some(located) = self.locate(&cfg, &opts.volume_id).await? else {
            debug!("Volume {} gone, snapshot {} goes with it", opts.volume_id, opts.id);
            return Ok(());
        };

        let snap = self
            .snapshots(&cfg, &located)
            .await?
            .into_iter()
            .find(|s| RbdImageName::parse(&s.name).is_some_and(|n| n.id == opts.id));
        let Some(snap) = snap else {
            debug!("RBD snapshot {} already absent", opts.id);
            return Ok(());
        };

        let snap_spec = format!("{}@{}", located.spec(), snap.name);
        if let Err(e) = self.rbd(&cfg, &["snap", "unprotect", &snap_spec]).await {
            warn!("Unprotect of {} failed: {}", snap_spec, e);
        }
        self.rbd(&cfg, &["snap", "rm", &snap_spec]).await?;

        info!("Deleted RBD snapshot {}", snap_spec);
        Ok(())
    }

    async fn initialize_connection(&self, opts: &AttachmentOpts) -> Result<ConnectionInfo> {
        let cfg = self.config()?;
        let located = self
            .locate_from(&cfg, &opts.volume_id, &opts.metadata)
            .await?
            .ok_or_else(|| Error::not_found("volume", &opts.volume_id))?;

        Ok(ConnectionInfo::new(AccessProtocol::Rbd.as_str())
            .with("secret_type", "ceph")
            .with("name", located.spec())
            .with("cluster_name", cfg.cluster_name.clone())
            .with("hosts", cfg.monitors.clone())
            .with("volume_id", opts.volume_id.clone())
            .with("access_mode", "rw")
            .with("ports", vec![MONITOR_PORT]))
    }

    async fn terminate_connection(&self, opts: &AttachmentOpts) -> Result<()> {
        // Clients map RBD images themselves; nothing is held on the cluster
        debug!("Released RBD attachment of {}", opts.volume_id);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let cfg = self.config()?;
        let out = self.cli(&cfg, "ceph", &["df", "--format", "json"]).await?;
        let report: DfReport = serde_json::from_str(&out.stdout)?;

        Ok(report
            .pools
            .into_iter()
            .filter_map(|p| {
                let props = cfg.pool.get(&p.name)?;
                let total = p.stats.bytes_used + p.stats.max_avail;
                Some(
                    Pool::new(&p.name, props, CEPH_AVAILABILITY_ZONE)
                        .with_capacity(total / GIB, p.stats.max_avail / GIB),
                )
            })
            .collect())
    }
}

#[async_trait]
impl MetricsDriver for CephDriver {
    async fn collect_metrics(&self, opts: &CollectMetricsOpts) -> Result<Vec<MetricSample>> {
        let metrics = supported_metrics(&opts.metrics);
        if metrics.is_empty() {
            info!("No supported metrics requested for {}", opts.instance_id);
            return Ok(Vec::new());
        }

        let cfg = self.config()?;
        let out = self
            .cli(&cfg, "ceph", &["df", "detail", "--format", "json"])
            .await?;
        let report: DfReport = serde_json::from_str(&out.stdout)?;
        let timestamp = chrono::Utc::now().timestamp();

        let mut samples = Vec::new();
        for pool in &report.pools {
            let mut labels = BTreeMap::new();
            labels.insert("cluster".to_string(), cfg.cluster_name.clone());
            labels.insert("pool".to_string(), pool.name.clone());

            for metric in &metrics {
                let Some(value) = pool.stats.value(metric) else {
                    continue;
                };
                samples.push(MetricSample {
                    instance_id: opts.instance_id.clone(),
                    name: format!("ceph_{}", metric),
                    unit: metric_unit(metric).to_string(),
                    value: value as f64,
                    timestamp,
                    labels: labels.clone(),
                });
            }
        }

        debug!(
            "Collected {} ceph samples for {}",
            samples.len(),
            opts.instance_id
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolProperties;
    use crate::controlplane::exec::fake::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const VOL: &str = "4b1ba5c4-6ab8-4c8b-9a5b-0c4d2a7f1e21";

    fn config() -> CephConfig {
        let mut pool = PoolTable::new();
        pool.insert(
            "rbd".to_string(),
            PoolProperties {
                storage_type: StorageType::Block,
                availability_zone: String::new(),
                multi_attach: false,
                extras: PoolExtras::default(),
            },
        );
        CephConfig {
            pool,
            monitors: vec!["10.0.0.11".into(), "10.0.0.12".into()],
            ..Default::default()
        }
    }

    fn driver(runner: Arc<ScriptedRunner>) -> Arc<CephDriver> {
        let ctx = DriverContext::new("ceph", Duration::from_secs(5)).with_runner(runner);
        CephDriver::with_config(ctx, config())
    }

    fn image() -> String {
        format!("OPENSDS:vol-42:{}", VOL)
    }

    #[tokio::test]
    async fn test_create_names_image() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());

        let volume = d
            .create_volume(&CreateVolumeOpts {
                id: VOL.into(),
                name: "vol-42".into(),
                size: 1,
                pool_name: "rbd".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(runner.called(&format!("rbd create rbd/{} --size 1G", image())));
        assert_eq!(volume.metadata["internal_name"], image());
        assert_eq!(volume.metadata["volume_name"], "vol-42");
        assert_eq!(volume.metadata["pool"], "rbd");
        assert_eq!(volume.availability_zone, "ceph");

        let parsed = RbdImageName::parse(&volume.metadata["internal_name"]).unwrap();
        assert_eq!(parsed.name, "vol-42");
        assert_eq!(parsed.id, VOL);
        assert!(RbdImageName::parse("foo-bar").is_none());
    }

    #[tokio::test]
    async fn test_existing_image_is_already_exists() {
        let runner = ScriptedRunner::new();
        runner.ok("rbd ls", &format!("[\"{}\", \"unrelated\"]", image()));
        let d = driver(runner.clone());

        assert_matches!(
            d.create_volume(&CreateVolumeOpts {
                id: VOL.into(),
                name: "vol-42".into(),
                size: 1,
                pool_name: "rbd".into(),
                ..Default::default()
            })
            .await,
            Err(Error::AlreadyExists { .. })
        );
        assert!(!runner.called("rbd create"));
    }

    #[tokio::test]
    async fn test_pull_and_shrink() {
        let runner = ScriptedRunner::new();
        runner.ok("rbd ls", &format!("[\"{}\"]", image()));
        runner.ok("rbd info", &format!("{{\"name\":\"{}\",\"size\":{}}}", image(), 2 * GIB));
        let d = driver(runner.clone());

        let volume = d.pull_volume(&PullOpts { id: VOL.into() }).await.unwrap();
        assert_eq!(volume.size, 2);
        assert_eq!(volume.name, "vol-42");

        assert_matches!(
            d.extend_volume(&ExtendVolumeOpts {
                id: VOL.into(),
                size: 1,
                ..Default::default()
            })
            .await,
            Err(Error::Conflict(_))
        );
        assert!(!runner.called("rbd resize"));
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());

        let opts = DeleteVolumeOpts {
            id: VOL.into(),
            ..Default::default()
        };
        d.delete_volume(&opts).await.unwrap();
        assert!(!runner.called("rbd rm"));
        assert_matches!(
            d.pull_volume(&PullOpts { id: VOL.into() }).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_volume() {
        let d = driver(ScriptedRunner::new());
        assert_matches!(
            d.create_snapshot(&CreateSnapshotOpts {
                id: "3769855c-a102-11e7-b772-17b880d2f537".into(),
                name: "s1".into(),
                volume_id: VOL.into(),
                ..Default::default()
            })
            .await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_connection_info() {
        let runner = ScriptedRunner::new();
        runner.ok("rbd ls", &format!("[\"{}\"]", image()));
        let d = driver(runner);

        let info = d
            .initialize_connection(&AttachmentOpts {
                id: String::new(),
                volume_id: VOL.into(),
                host_info: HostInfo::default(),
                access_protocol: AccessProtocol::Rbd,
                metadata: Metadata::new(),
            })
            .await
            .unwrap();

        assert_eq!(info.driver_volume_type, "rbd");
        assert_eq!(info.get_str("secret_type"), Some("ceph"));
        assert_eq!(info.get_str("name"), Some(format!("rbd/{}", image()).as_str()));
        assert_eq!(info.get_str("cluster_name"), Some("ceph"));
        assert_eq!(info.data["ports"], serde_json::json!(["6789"]));
        assert_eq!(info.data["hosts"], serde_json::json!(["10.0.0.11", "10.0.0.12"]));
    }

    #[tokio::test]
    async fn test_list_pools_from_df() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "ceph df",
            &format!(
                r#"{{"stats":{{}},"pools":[
                    {{"name":"rbd","id":1,"stats":{{"bytes_used":{},"max_avail":{}}}}},
                    {{"name":"cephfs_data","id":2,"stats":{{"bytes_used":0,"max_avail":0}}}}
                ]}}"#,
                4 * GIB,
                6 * GIB
            ),
        );
        let d = driver(runner);

        let pools = d.list_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].total_capacity, 10);
        assert_eq!(pools[0].free_capacity, 6);
        assert_eq!(pools[0].consumed_capacity, Some(4));
        assert_eq!(pools[0].availability_zone, "ceph");
    }

    #[test]
    fn test_supported_metrics_filter() {
        assert_eq!(supported_metrics(&[]).len(), SUPPORTED_METRICS.len());
        assert_eq!(
            supported_metrics(&["pool_used_bytes".into(), "iops".into()]),
            vec!["pool_used_bytes"]
        );
        assert!(supported_metrics(&["latency".into()]).is_empty());
    }

    #[tokio::test]
    async fn test_collect_metrics_from_df_detail() {
        let runner = ScriptedRunner::new();
        runner.ok(
            "ceph df detail",
            r#"{"stats":{},"pools":[
                {"name":"rbd","id":1,"stats":{"bytes_used":859,"max_avail":4096,"objects":7,"rd_bytes":1024}}
            ]}"#,
        );
        let d = driver(runner.clone());

        let samples = d
            .collect_metrics(&CollectMetricsOpts {
                instance_id: "ceph-1".into(),
                metrics: vec![
                    "pool_used_bytes".into(),
                    "pool_objects_total".into(),
                    "iops".into(),
                ],
            })
            .await
            .unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "ceph_pool_used_bytes");
        assert_eq!(samples[0].value, 859.0);
        assert_eq!(samples[0].unit, "bytes");
        assert_eq!(samples[0].labels["pool"], "rbd");
        assert_eq!(samples[0].labels["cluster"], "ceph");
        assert_eq!(samples[1].name, "ceph_pool_objects_total");
        assert_eq!(samples[1].value, 7.0);
        assert_eq!(samples[1].unit, "");
        assert!(samples.iter().all(|s| s.instance_id == "ceph-1"));
    }

    #[tokio::test]
    async fn test_collect_unsupported_metrics_skips_cli() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());

        let samples = d
            .collect_metrics(&CollectMetricsOpts {
                instance_id: "ceph-1".into(),
                metrics: vec!["latency".into()],
            })
            .await
            .unwrap();

        assert!(samples.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_snapshots_conflicts() {
        let runner = ScriptedRunner::new();
        runner.ok("rbd ls", &format!("[\"{}\"]", image()));
        runner.fail("rbd rm", "rbd: image has snapshots - not removing.");
        let d = driver(runner);

        assert_matches!(
            d.delete_volume(&DeleteVolumeOpts {
                id: VOL.into(),
                ..Default::default()
            })
            .await,
            Err(Error::Conflict(ref m)) if m.contains("snapshots")
        );
    }

    #[tokio::test]
    async fn test_failed_clone_is_removed() {
        let runner = ScriptedRunner::new();
        runner.fail("rbd resize", "rbd: resize error");
        runner.ok("rbd info", "{\"size\":1024}");
        let d = driver(runner.clone());

        let err = d
            .create_volume(&CreateVolumeOpts {
                id: VOL.into(),
                name: "vol-42".into(),
                size: 1,
                pool_name: "rbd".into(),
                snapshot_id: Some("3769855c-a102-11e7-b772-17b880d2f537".into()),
                metadata: [
                    ("internal_name".to_string(), "OPENSDS:v:x@OPENSDS:s:y".to_string()),
                    ("pool".to_string(), "rbd".to_string()),
                ]
                .into_iter()
                .collect(),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::CommandFailed { .. });
        assert!(runner.called(&format!("rbd clone rbd/OPENSDS:v:x@OPENSDS:s:y rbd/{}", image())));
        assert!(runner.called(&format!("rbd rm rbd/{}", image())));
    }
}
