//! Host Replication Driver
//!
//! Replication performed by a host-resident task tool. A task pairs source
//! devices with target devices under one bandwidth cap; the tool does the
//! copying, the driver only creates, starts, stops and removes tasks.

use crate::config;
use crate::controlplane::jobs::Deadline;
use crate::controlplane::registry::DriverContext;
use crate::domain::model::ReplicationSpec;
use crate::domain::opts::ReplicationOpts;
use crate::domain::ports::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const DEVICE_NAME_KEY: &str = "device_name";
const MOUNTPOINT_KEY: &str = "Mountpoint";
const CDP_KEY: &str = "cdp";

// =============================================================================
// Replication Task
// =============================================================================

/// One side of a replicated pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationVolume {
    pub id: String,
    pub device_name: String,
}

impl ReplicationVolume {
    pub fn new(id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_name: device_name.into(),
        }
    }
}

/// Paired volumes replicated under one policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationTask {
    /// Bytes per second, 0 means unlimited
    pub bandwidth: u64,
    /// Journal every write for continuous data protection
    pub cdp: bool,
    /// source volume id -> target volume id
    pairs: IndexMap<String, String>,
    volumes: IndexMap<String, ReplicationVolume>,
}

impl ReplicationTask {
    pub fn new(bandwidth: u64, cdp: bool) -> Self {
        Self {
            bandwidth,
            cdp,
            ..Default::default()
        }
    }

    /// Pair `source` with `target`; neither may already be in the task
    pub fn add_volume(&mut self, source: ReplicationVolume, target: ReplicationVolume) -> Result<()> {
        if self.volumes.contains_key(&source.id) {
            return Err(Error::already_exists("source volume", &source.id));
        }
        if self.volumes.contains_key(&target.id) || source.id == target.id {
            return Err(Error::already_exists("target volume", &target.id));
        }

        self.pairs.insert(source.id.clone(), target.id.clone());
        self.volumes.insert(source.id.clone(), source);
        self.volumes.insert(target.id.clone(), target);
        Ok(())
    }

    pub fn contains(&self, volume_id: &str) -> bool {
        self.volumes.contains_key(volume_id)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Arguments of the tool's create subcommand
    fn create_args(&self, name: &str, journal_dir: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--bandwidth".to_string(),
            self.bandwidth.to_string(),
        ];
        if self.cdp {
            args.push("--cdp".to_string());
            if let Some(dir) = journal_dir {
                args.push("--journal-dir".to_string());
                args.push(dir.to_string());
            }
        }
        for (source, target) in &self.pairs {
            if let (Some(s), Some(t)) = (self.volumes.get(source), self.volumes.get(target)) {
                args.push("--pair".to_string());
                args.push(format!("{}:{}", s.device_name, t.device_name));
            }
        }
        args
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Driver config file for `host_replication`, optional
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HostReplicationConfig {
    pub tool_path: PathBuf,
    /// Journal location for CDP tasks
    pub journal_dir: Option<PathBuf>,
}

impl Default for HostReplicationConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("/usr/local/bin/hmtask"),
            journal_dir: None,
        }
    }
}

// =============================================================================
// Host Replication Driver
// =============================================================================

/// Replication driver backed by the host task tool
pub struct HostReplicationDriver {
    ctx: DriverContext,
    config: RwLock<Arc<HostReplicationConfig>>,
    /// Tasks created by this instance, by task name
    tasks: Mutex<BTreeMap<String, ReplicationTask>>,
}

impl HostReplicationDriver {
    pub const KIND: &'static str = "host_replication";

    pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/opensds/driver/host_replication.yaml";

    pub fn new(ctx: DriverContext) -> Arc<Self> {
        Self::with_config(ctx, HostReplicationConfig::default())
    }

    pub fn with_config(ctx: DriverContext, config: HostReplicationConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config: RwLock::new(Arc::new(config)),
            tasks: Mutex::new(BTreeMap::new()),
        })
    }

    /// Task name for a primary/secondary pair
    pub fn task_name(opts: &ReplicationOpts) -> String {
        format!("{}_{}", opts.primary_volume_id, opts.secondary_volume_id)
    }

    async fn tool(&self, args: &[&str]) -> Result<String> {
        let config = self.config.read().clone();
        let tool = config.tool_path.to_string_lossy();
        let output = self.ctx.runner.run(&tool, args).await?;
        Ok(output.stdout)
    }

    fn task_from(&self, opts: &ReplicationOpts) -> Result<ReplicationTask> {
        let source = device_name(&opts.primary_replication_driver_data, &opts.primary_volume_id)?;
        let target = device_name(
            &opts.secondary_replication_driver_data,
            &opts.secondary_volume_id,
        )?;
        let cdp = opts
            .primary_replication_driver_data
            .get(CDP_KEY)
            .is_some_and(|v| v == "true");

        let mut task = ReplicationTask::new(opts.bandwidth, cdp);
        task.add_volume(
            ReplicationVolume::new(&opts.primary_volume_id, source),
            ReplicationVolume::new(&opts.secondary_volume_id, target),
        )?;
        Ok(task)
    }
}

fn device_name(data: &BTreeMap<String, String>, volume_id: &str) -> Result<String> {
    data.get(DEVICE_NAME_KEY)
        .or_else(|| data.get(MOUNTPOINT_KEY))
        .filter(|d| !d.is_empty())
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "replication driver data of volume {} carries no {}",
                volume_id, DEVICE_NAME_KEY
            ))
        })
}

#[async_trait]
impl DriverLifecycle for HostReplicationDriver {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn setup(&self) -> Result<()> {
        let path = config::resolve_path(self.ctx.config_path.as_deref(), Self::DEFAULT_CONFIG_PATH);
        if path.exists() {
            let loaded: HostReplicationConfig = config::load_yaml(&path)?;
            *self.config.write() = Arc::new(loaded);
        } else {
            debug!("{} not found, using default tool path", path.display());
        }

        info!(
            "Host replication driver ready, tool {}",
            self.config.read().tool_path.display()
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.tasks.lock().await.clear();
        Ok(())
    }
}

#[async_trait]
impl ReplicationDriver for HostReplicationDriver {
    async fn create_replication(&self, opts: &ReplicationOpts) -> Result<ReplicationSpec> {
        let mut spec = opts.to_spec();
        if !opts.is_primary {
            debug!("Replication {} is handled by the primary side", opts.id);
            return Ok(spec);
        }

        let name = Self::task_name(opts);
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&name, &deadline).await?;
        let task = self.task_from(opts)?;

        {
            let tasks = self.tasks.lock().await;
            if tasks.contains_key(&name) {
                return Err(Error::already_exists("replication task", &name));
            }
            for volume in [&opts.primary_volume_id, &opts.secondary_volume_id] {
                if tasks.values().any(|t| t.contains(volume)) {
                    return Err(Error::already_exists("replicated volume", volume));
                }
            }
        }

        let journal_dir = self
            .config
            .read()
            .journal_dir
            .as_ref()
            .map(|d| d.to_string_lossy().into_owned());
        let args = task.create_args(&name, journal_dir.as_deref());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.tool(&args).await?;

        self.tasks.lock().await.insert(name.clone(), task);
        spec.metadata.insert("task_name".to_string(), name.clone());

        info!("Created replication task {}", name);
        Ok(spec)
    }

    async fn delete_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        if !opts.is_primary {
            return Ok(());
        }

        let name = Self::task_name(opts);
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&name, &deadline).await?;

        match self.tool(&["remove", "--name", &name]).await {
            Ok(_) => {}
            Err(Error::CommandFailed { output, .. }) if output.contains("no such task") => {
                debug!("Replication task {} already removed", name);
            }
            Err(e) => return Err(e),
        }

        self.tasks.lock().await.remove(&name);
        info!("Deleted replication task {}", name);
        Ok(())
    }

    async fn enable_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        if !opts.is_primary {
            return Ok(());
        }
        let name = Self::task_name(opts);
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&name, &deadline).await?;
        self.tool(&["start", "--name", &name]).await?;
        info!("Started replication task {}", name);
        Ok(())
    }

    async fn disable_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        if !opts.is_primary {
            return Ok(());
        }
        let name = Self::task_name(opts);
        let deadline = Deadline::after(self.ctx.op_timeout);
        let _guard = self.ctx.locks.lock_until(&name, &deadline).await?;
        self.tool(&["stop", "--name", &name]).await?;
        info!("Stopped replication task {}", name);
        Ok(())
    }

    async fn failover_replication(&self, opts: &ReplicationOpts) -> Result<()> {
        // The host plugin fails over on its own
        info!("Failover of replication {} left to the host plugin", opts.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::exec::fake::ScriptedRunner;
    use crate::domain::model::Metadata;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const TOOL: &str = "/usr/local/bin/hmtask";

    fn driver(runner: Arc<ScriptedRunner>) -> Arc<HostReplicationDriver> {
        let ctx = DriverContext::new("hostrep", Duration::from_secs(5)).with_runner(runner);
        HostReplicationDriver::new(ctx)
    }

    fn data(device: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert(DEVICE_NAME_KEY.to_string(), device.to_string());
        m
    }

    fn opts(primary: &str, secondary: &str, is_primary: bool) -> ReplicationOpts {
        ReplicationOpts {
            id: "r1".into(),
            primary_volume_id: primary.into(),
            secondary_volume_id: secondary.into(),
            primary_replication_driver_data: data(&format!("/dev/{}", primary)),
            secondary_replication_driver_data: data(&format!("/dev/{}", secondary)),
            bandwidth: 1_000_000,
            is_primary,
            ..Default::default()
        }
    }

    #[test]
    fn test_task_rejects_duplicate_source() {
        let mut task = ReplicationTask::new(1_000_000, false);
        task.add_volume(
            ReplicationVolume::new("A", "/dev/a"),
            ReplicationVolume::new("B", "/dev/b"),
        )
        .unwrap();
        let before = task.clone();

        let err = task
            .add_volume(
                ReplicationVolume::new("A", "/dev/a"),
                ReplicationVolume::new("C", "/dev/c"),
            )
            .unwrap_err();

        assert_eq!(err.to_string(), "source volume[A] already exists");
        assert_eq!(task, before);
        assert_eq!(task.pairs().collect::<Vec<_>>(), vec![("A", "B")]);
    }

    #[test]
    fn test_task_rejects_duplicate_target() {
        let mut task = ReplicationTask::new(0, false);
        task.add_volume(
            ReplicationVolume::new("A", "/dev/a"),
            ReplicationVolume::new("B", "/dev/b"),
        )
        .unwrap();

        let err = task
            .add_volume(
                ReplicationVolume::new("C", "/dev/c"),
                ReplicationVolume::new("B", "/dev/b"),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "target volume[B] already exists");
        assert_eq!(task.len(), 1);
    }

    #[test]
    fn test_create_args() {
        let mut task = ReplicationTask::new(500, true);
        task.add_volume(
            ReplicationVolume::new("A", "/dev/a"),
            ReplicationVolume::new("B", "/dev/b"),
        )
        .unwrap();

        assert_eq!(
            task.create_args("A_B", Some("/var/lib/journal")),
            vec![
                "create", "--name", "A_B", "--bandwidth", "500", "--cdp",
                "--journal-dir", "/var/lib/journal", "--pair", "/dev/a:/dev/b",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_runs_tool() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());

        let spec = d.create_replication(&opts("A", "B", true)).await.unwrap();
        assert_eq!(spec.metadata["task_name"], "A_B");
        assert!(runner.called(&format!(
            "{} create --name A_B --bandwidth 1000000 --pair /dev/A:/dev/B",
            TOOL
        )));

        d.enable_replication(&opts("A", "B", true)).await.unwrap();
        assert!(runner.called(&format!("{} start --name A_B", TOOL)));
    }

    #[tokio::test]
    async fn test_secondary_side_skips_tool() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());

        d.create_replication(&opts("A", "B", false)).await.unwrap();
        d.enable_replication(&opts("A", "B", false)).await.unwrap();
        d.delete_replication(&opts("A", "B", false)).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_paired_volume_is_refused() {
        let d = driver(ScriptedRunner::new());
        d.create_replication(&opts("A", "B", true)).await.unwrap();

        assert_matches!(
            d.create_replication(&opts("A", "C", true)).await,
            Err(Error::AlreadyExists { .. })
        );
    }

    #[tokio::test]
    async fn test_missing_device_name() {
        let d = driver(ScriptedRunner::new());
        let mut o = opts("A", "B", true);
        o.secondary_replication_driver_data.clear();
        assert_matches!(d.create_replication(&o).await, Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_mountpoint_fallback_and_cdp() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());

        let mut o = opts("A", "B", true);
        o.primary_replication_driver_data = Metadata::from([
            (MOUNTPOINT_KEY.to_string(), "/dev/mp".to_string()),
            (CDP_KEY.to_string(), "true".to_string()),
        ]);
        d.create_replication(&o).await.unwrap();
        assert!(runner.called(&format!(
            "{} create --name A_B --bandwidth 1000000 --cdp --pair /dev/mp:/dev/B",
            TOOL
        )));
    }

    #[tokio::test]
    async fn test_delete_ignores_missing_task() {
        let runner = ScriptedRunner::new();
        runner.fail(&format!("{} remove", TOOL), "error: no such task A_B");
        let d = driver(runner.clone());

        d.delete_replication(&opts("A", "B", true)).await.unwrap();
    }

    #[tokio::test]
    async fn test_tool_failure_surfaces_output() {
        let runner = ScriptedRunner::new();
        runner.fail(&format!("{} start", TOOL), "device busy");
        let d = driver(runner);

        let err = d.enable_replication(&opts("A", "B", true)).await.unwrap_err();
        assert_matches!(err, Error::CommandFailed { ref output, .. } if output == "device busy");
    }

    #[tokio::test]
    async fn test_failover_is_noop() {
        let runner = ScriptedRunner::new();
        let d = driver(runner.clone());
        d.failover_replication(&opts("A", "B", true)).await.unwrap();
        assert!(runner.calls().is_empty());
    }
}
