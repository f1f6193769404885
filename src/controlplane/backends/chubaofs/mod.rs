//! ChubaoFS File Share Driver
//!
//! Each share is a ChubaoFS volume mounted on this host by a `cfs-client`
//! daemon. Per share the driver keeps a client tree
//! `<client_path>/<id>/{conf,log,warnlog}` with one `conf/<i>/client.json`
//! per export location. A share is reported only once every mount point is
//! served by its client.

pub mod client;

pub use client::{ClusterClient, ClusterClientRef, MasterClient};

use crate::config::{self, PoolTable};
use crate::controlplane::jobs::Deadline;
use crate::controlplane::registry::DriverContext;
use crate::domain::model::*;
use crate::domain::opts::*;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CLIENT_CONFIG_FILE: &str = "client.json";

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ClusterInfo {
    pub name: String,
    /// Master nodes as `host:port`
    pub master_addr: Vec<String>,
    /// Capacity reported for every pool, GiB
    pub volume_cap_limit: u64,
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            master_addr: Vec::new(),
            volume_cap_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeEnv {
    /// Parent of the per-share mount points
    pub mnt_point: PathBuf,
    /// Client install dir; holds `bin/cfs-client` and the per-share trees
    pub client_path: PathBuf,
    pub log_level: String,
    pub owner: String,
    pub prof_port: String,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            mnt_point: PathBuf::from("/mnt/chubaofs"),
            client_path: PathBuf::from("/opt/chubaofs"),
            log_level: "error".to_string(),
            owner: "chubaofs".to_string(),
            prof_port: "10094".to_string(),
        }
    }
}

/// Driver config file for `chubaofs`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ChubaoFsConfig {
    pub pool: PoolTable,
    pub cluster_info: ClusterInfo,
    pub runtime_env: RuntimeEnv,
}

impl ChubaoFsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cluster_info.master_addr.is_empty() {
            return Err(Error::Configuration(
                "cluster_info.master_addr is empty".to_string(),
            ));
        }
        Ok(())
    }

    fn share_root(&self, id: &str) -> PathBuf {
        self.runtime_env.client_path.join(id)
    }

    fn client_binary(&self) -> PathBuf {
        self.runtime_env.client_path.join("bin").join("cfs-client")
    }
}

// =============================================================================
// ChubaoFS Driver
// =============================================================================

struct Session {
    cluster: ClusterClientRef,
    config: ChubaoFsConfig,
}

/// File share driver for ChubaoFS
pub struct ChubaoFsDriver {
    ctx: DriverContext,
    session: RwLock<Option<Arc<Session>>>,
}

impl ChubaoFsDriver {
    pub const KIND: &'static str = "chubaofs";

    pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/opensds/driver/chubaofs.yaml";

    pub fn new(ctx: DriverContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            session: RwLock::new(None),
        })
    }

    /// Create a driver bound to an already open cluster client
    pub fn with_client(
        ctx: DriverContext,
        config: ChubaoFsConfig,
        cluster: ClusterClientRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            session: RwLock::new(Some(Arc::new(Session { cluster, config }))),
        })
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or_else(|| Error::BackendUnreachable {
            backend: self.ctx.backend.clone(),
            reason: "driver is not set up".to_string(),
        })
    }

    /// Write the client tree and one client config per mount point
    fn prepare_client_tree(
        &self,
        config: &ChubaoFsConfig,
        id: &str,
        mount_points: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        let root = config.share_root(id);
        let conf_dir = root.join("conf");
        let log_dir = root.join("log");
        let warn_log_dir = root.join("warnlog");

        for dir in [&conf_dir, &log_dir, &warn_log_dir] {
            std::fs::create_dir_all(dir)?;
        }

        let env = &config.runtime_env;
        let mut files = Vec::with_capacity(mount_points.len());

        for (i, mount_point) in mount_points.iter().enumerate() {
            std::fs::create_dir_all(mount_point)?;

            let client_config = json!({
                "mountPoint": mount_point,
                "volName": id,
                "owner": env.owner,
                "masterAddr": config.cluster_info.master_addr.join(","),
                "logDir": log_dir,
                "warnLogDir": warn_log_dir,
                "logLevel": env.log_level,
                "profPort": env.prof_port,
            });

            let dir = conf_dir.join(i.to_string());
            std::fs::create_dir_all(&dir)?;
            let file = dir.join(CLIENT_CONFIG_FILE);
            std::fs::write(&file, serde_json::to_vec_pretty(&client_config)?)?;
            files.push(file);
        }

        Ok(files)
    }

    async fn mount(&self, config: &ChubaoFsConfig, files: &[PathBuf]) -> Result<()> {
        let binary = config.client_binary();
        let binary = binary.to_string_lossy();
        for file in files {
            let file = file.to_string_lossy();
            self.ctx.runner.run(&binary, &["-c", &file]).await?;
        }
        Ok(())
    }

    /// Wait until every mount point is served by a client
    async fn wait_mounted(&self, mount_points: &[PathBuf], deadline: &Deadline) -> Result<()> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(MOUNT_POLL_INTERVAL)
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(None)
            .build();

        for mount_point in mount_points {
            let target = mount_point.to_string_lossy();
            loop {
                match self.ctx.runner.run("mountpoint", &["-q", &target]).await {
                    Ok(_) => break,
                    Err(e) if deadline.is_expired() => {
                        warn!("Mount point {} never became ready: {}", target, e);
                        return Err(deadline.timeout(format!("mount of {}", target)));
                    }
                    Err(e) => debug!("Mount point {} not ready: {}", target, e),
                }
                let wait = backoff.next_backoff().unwrap_or(MOUNT_POLL_INTERVAL);
                tokio::time::sleep(wait.min(deadline.remaining())).await;
            }
        }

        debug!("{} mount points ready", mount_points.len());
        Ok(())
    }

    async fn unmount(&self, mount_points: &[PathBuf]) {
        for mount_point in mount_points {
            let target = mount_point.to_string_lossy();
            if let Err(e) = self.ctx.runner.run("umount", &[&target]).await {
                warn!("Unmount of {} failed: {}", target, e);
            }
        }
    }

    fn remove_tree(root: &Path) {
        match std::fs::remove_dir_all(root) {
            Ok(()) => debug!("Removed client tree {}", root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove client tree {}: {}", root.display(), e),
        }
    }

    /// Undo a partial create
    async fn rollback(&self, session: &Session, id: &str, mount_points: &[PathBuf]) {
        let config = &session.config;
        self.unmount(mount_points).await;
        if let Err(e) = session
            .cluster
            .delete_volume(id, &config.runtime_env.owner)
            .await
        {
            warn!("Failed to delete ChubaoFS volume {} during rollback: {}", id, e);
        }
        Self::remove_tree(&config.share_root(id));
        for mount_point in mount_points {
            if let Err(e) = std::fs::remove_dir(mount_point) {
                debug!("Mount point {} left in place: {}", mount_point.display(), e);
            }
        }
    }
}

/// Mount points of a share: the requested paths made absolute, or
/// `<mnt_point>/<id>` when none are requested
fn mount_points(config: &ChubaoFsConfig, id: &str, requested: &[String]) -> Result<Vec<PathBuf>> {
    if requested.is_empty() {
        return Ok(vec![config.runtime_env.mnt_point.join(id)]);
    }

    let mut out = Vec::with_capacity(requested.len());
    for location in requested {
        let path = Path::new(location);
        if path.is_absolute() {
            out.push(path.to_path_buf());
        } else {
            out.push(std::env::current_dir()?.join(path));
        }
    }
    Ok(out)
}

#[async_trait]
impl DriverLifecycle for ChubaoFsDriver {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn setup(&self) -> Result<()> {
        if self.session.read().is_some() {
            return Ok(());
        }

        let path = config::resolve_path(self.ctx.config_path.as_deref(), Self::DEFAULT_CONFIG_PATH);
        let config: ChubaoFsConfig = config::load_yaml(&path)?;
        config.validate()?;

        let client = MasterClient::new(
            &self.ctx.backend,
            config.cluster_info.master_addr.clone(),
            self.ctx.op_timeout,
        )?;
        let leader = client.leader().await?;

        info!(
            "ChubaoFS driver ready for cluster {} (leader {})",
            config.cluster_info.name, leader
        );
        *self.session.write() = Some(Arc::new(Session {
            cluster: Arc::new(client),
            config,
        }));
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.session.write().take();
        Ok(())
    }
}

#[async_trait]
impl FileShareDriver for ChubaoFsDriver {
    fn declared_pools(&self) -> Vec<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.config.pool.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn create_file_share(&self, opts: &CreateFileShareOpts) -> Result<FileShare> {
        let session = self.session()?;
        let config = &session.config;

        let props = config
            .pool
            .get(&opts.pool_name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown pool: {}", opts.pool_name)))?;
        let pool = Pool::new(&opts.pool_name, props, DEFAULT_AVAILABILITY_ZONE);

        let mount_points = mount_points(config, &opts.id, &opts.export_locations)?;

        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        session
            .cluster
            .create_volume(&opts.id, opts.size, &config.runtime_env.owner)
            .await?;

        let files = match self.prepare_client_tree(config, &opts.id, &mount_points) {
            Ok(files) => files,
            Err(e) => {
                error!("Client tree for share {} failed: {}", opts.id, e);
                self.rollback(&session, &opts.id, &[]).await;
                return Err(e);
            }
        };

        if let Err(e) = self.mount(config, &files).await {
            error!("Mount of share {} failed: {}", opts.id, e);
            self.rollback(&session, &opts.id, &mount_points).await;
            return Err(Error::Internal(format!(
                "mount of share {} failed: {}",
                opts.id, e
            )));
        }

        if let Err(e) = self.wait_mounted(&mount_points, &deadline).await {
            error!("Share {} did not come up: {}", opts.id, e);
            self.rollback(&session, &opts.id, &mount_points).await;
            return Err(e);
        }

        let export_locations: Vec<String> = mount_points
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();

        let mut metadata = opts.metadata.clone();
        metadata.insert("volName".to_string(), opts.id.clone());
        if let Some(first) = export_locations.first() {
            metadata.insert("mountPoint".to_string(), first.clone());
        }
        metadata.insert(
            "clientPath".to_string(),
            config.share_root(&opts.id).to_string_lossy().into_owned(),
        );
        metadata.insert("owner".to_string(), config.runtime_env.owner.clone());

        info!("Created ChubaoFS share {} at {:?}", opts.id, export_locations);
        Ok(FileShare {
            id: opts.id.clone(),
            name: opts.name.clone(),
            description: opts.description.clone(),
            size: opts.size,
            pool_id: pool.id,
            availability_zone: pool.availability_zone,
            protocols: opts.protocols.clone(),
            export_locations,
            metadata,
        })
    }

    async fn delete_file_share(&self, opts: &DeleteFileShareOpts) -> Result<()> {
        let session = self.session()?;
        let config = &session.config;
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&opts.id, &deadline).await?;

        let mount_points = mount_points(config, &opts.id, &opts.export_locations)?;
        self.unmount(&mount_points).await;

        match session
            .cluster
            .delete_volume(&opts.id, &config.runtime_env.owner)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("ChubaoFS volume {} already absent", opts.id),
            Err(e) => return Err(e),
        }

        Self::remove_tree(&config.share_root(&opts.id));
        for mount_point in &mount_points {
            if let Err(e) = std::fs::remove_dir(mount_point) {
                debug!("Mount point {} left in place: {}", mount_point.display(), e);
            }
        }

        info!("Deleted ChubaoFS share {}", opts.id);
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let session = self.session()?;
        let cap = session.config.cluster_info.volume_cap_limit;

        Ok(session
            .config
            .pool
            .iter()
            .map(|(name, props)| {
                Pool::new(name, props, DEFAULT_AVAILABILITY_ZONE).with_capacity(cap, cap)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::client::fake::FakeMaster;
    use super::*;
    use crate::config::PoolProperties;
    use crate::controlplane::exec::fake::ScriptedRunner;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ChubaoFsConfig {
        let mut pool = PoolTable::new();
        pool.insert(
            "pool-a".to_string(),
            PoolProperties {
                storage_type: StorageType::File,
                availability_zone: String::new(),
                multi_attach: false,
                extras: PoolExtras::default(),
            },
        );
        ChubaoFsConfig {
            pool,
            cluster_info: ClusterInfo {
                name: "cfs".into(),
                master_addr: vec!["m1:17010".into()],
                ..Default::default()
            },
            runtime_env: RuntimeEnv {
                mnt_point: dir.path().join("mnt"),
                client_path: dir.path().join("client"),
                ..Default::default()
            },
        }
    }

    fn driver(
        dir: &TempDir,
        runner: Arc<ScriptedRunner>,
        master: Arc<FakeMaster>,
    ) -> Arc<ChubaoFsDriver> {
        let ctx = DriverContext::new("cfs", Duration::from_secs(5)).with_runner(runner);
        ChubaoFsDriver::with_client(ctx, config(dir), master)
    }

    fn create_opts() -> CreateFileShareOpts {
        CreateFileShareOpts {
            id: "u1".into(),
            name: "share-1".into(),
            size: 8,
            pool_name: "pool-a".into(),
            protocols: vec!["nfs".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_config_requires_masters() {
        let raw = r#"
pool:
  pool-a:
    storage_type: file
cluster_info:
  name: cfs
runtime_env:
  owner: opensds
"#;
        let config: ChubaoFsConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.cluster_info.volume_cap_limit, 200);
        assert_eq!(config.runtime_env.owner, "opensds");
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_create_and_delete_share() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let master = FakeMaster::new();
        let d = driver(&dir, runner.clone(), master.clone());

        let share = d.create_file_share(&create_opts()).await.unwrap();
        assert!(master.has_volume("u1"));
        assert_eq!(share.export_locations.len(), 1);
        assert_eq!(share.availability_zone, "default");

        let conf = dir.path().join("client/u1/conf/0/client.json");
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&conf).unwrap()).unwrap();
        assert_eq!(written["volName"], "u1");
        assert_eq!(written["masterAddr"], "m1:17010");
        assert!(dir.path().join("client/u1/warnlog").is_dir());
        assert!(runner.called(&format!(
            "{} -c {}",
            dir.path().join("client/bin/cfs-client").display(),
            conf.display()
        )));

        let delete = DeleteFileShareOpts {
            id: "u1".into(),
            ..Default::default()
        };
        d.delete_file_share(&delete).await.unwrap();
        assert!(!master.has_volume("u1"));
        assert!(!dir.path().join("client/u1").exists());

        d.delete_file_share(&delete).await.unwrap();
    }

    #[tokio::test]
    async fn test_mount_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        runner.fail(
            &dir.path().join("client/bin/cfs-client").display().to_string(),
            "fuse: device not found",
        );
        let master = FakeMaster::new();
        let d = driver(&dir, runner.clone(), master.clone());

        let err = d.create_file_share(&create_opts()).await.unwrap_err();

        assert_matches!(err, Error::Internal(_));
        assert!(err.to_string().contains("mount"));
        assert!(err.to_string().contains("fuse: device not found"));
        assert!(!master.has_volume("u1"));
        assert!(!dir.path().join("client/u1").exists());
        assert!(runner.called("umount"));
    }

    #[tokio::test]
    async fn test_share_metadata() {
        let dir = TempDir::new().unwrap();
        let d = driver(&dir, ScriptedRunner::new(), FakeMaster::new());

        let share = d.create_file_share(&create_opts()).await.unwrap();

        assert_eq!(share.metadata["volName"], "u1");
        assert_eq!(share.metadata["owner"], "chubaofs");
        assert_eq!(
            share.metadata["clientPath"],
            dir.path().join("client/u1").display().to_string()
        );
        assert_eq!(
            share.metadata["mountPoint"],
            dir.path().join("mnt/u1").display().to_string()
        );
    }

    #[tokio::test]
    async fn test_one_client_config_per_export_location() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let master = FakeMaster::new();
        let d = driver(&dir, runner.clone(), master.clone());
        let locations: Vec<String> = ["exp-a", "exp-b"]
            .iter()
            .map(|n| dir.path().join(n).display().to_string())
            .collect();

        let share = d
            .create_file_share(&CreateFileShareOpts {
                export_locations: locations.clone(),
                ..create_opts()
            })
            .await
            .unwrap();
        assert_eq!(share.export_locations, locations);

        for (i, location) in locations.iter().enumerate() {
            let conf = dir.path().join(format!("client/u1/conf/{}/client.json", i));
            let written: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&conf).unwrap()).unwrap();
            assert_eq!(written["mountPoint"], location.as_str());
            assert!(runner.called(&format!("mountpoint -q {}", location)));
        }

        d.delete_file_share(&DeleteFileShareOpts {
            id: "u1".into(),
            export_locations: locations.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
        for location in &locations {
            assert!(runner.called(&format!("umount {}", location)));
        }
        assert!(!master.has_volume("u1"));
    }

    #[test]
    fn test_relative_locations_made_absolute() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let defaults = mount_points(&config, "u1", &[]).unwrap();
        assert_eq!(defaults, vec![dir.path().join("mnt/u1")]);

        let points = mount_points(&config, "u1", &["/srv/a".into(), "rel/b".into()]).unwrap();
        assert_eq!(points[0], PathBuf::from("/srv/a"));
        assert!(points[1].is_absolute());
        assert!(points[1].ends_with("rel/b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_mount_times_out_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        runner.fail("mountpoint", "is not a mountpoint");
        let master = FakeMaster::new();
        let d = driver(&dir, runner.clone(), master.clone());
        let started = tokio::time::Instant::now();

        assert_matches!(
            d.create_file_share(&create_opts()).await,
            Err(Error::Timeout { .. })
        );

        assert!(started.elapsed() <= Duration::from_secs(5) + MOUNT_POLL_INTERVAL);
        assert!(!master.has_volume("u1"));
        assert!(!dir.path().join("client/u1").exists());
        assert!(runner.called("umount"));
    }

    #[tokio::test]
    async fn test_snapshots_and_acls_not_implemented() {
        let dir = TempDir::new().unwrap();
        let d = driver(&dir, ScriptedRunner::new(), FakeMaster::new());

        assert_matches!(
            d.create_file_share_snapshot(&CreateFileShareSnapshotOpts::default())
                .await,
            Err(Error::NotImplemented { .. })
        );
        assert_matches!(
            d.create_file_share_acl(&CreateFileShareAclOpts::default()).await,
            Err(Error::NotImplemented { .. })
        );
    }

    #[tokio::test]
    async fn test_pools_use_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let d = driver(&dir, ScriptedRunner::new(), FakeMaster::new());

        let pools = d.list_pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].total_capacity, 200);
        assert_eq!(pools[0].free_capacity, 200);
        assert_eq!(pools[0].storage_type, StorageType::File);
        assert_eq!(pools[0].availability_zone, "default");
    }
}
