//! In-memory SVM for driver tests

use super::api::*;
use crate::controlplane::jobs::{JobSource, JobStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct FakeState {
    volumes: BTreeMap<String, FlexVol>,
    luns: BTreeMap<String, Lun>,
    igroups: BTreeMap<String, Vec<String>>,
    /// lun path -> (igroup, lun id)
    maps: BTreeMap<String, Vec<(String, u32)>>,
    snapshots: BTreeMap<(String, String), SnapshotInfo>,
    aggregates: Vec<Aggregate>,
    /// job id -> final state
    jobs: BTreeMap<String, &'static str>,
    next_job: u64,
    next_serial: u64,
    fail_jobs: bool,
    pending_jobs: bool,
}

impl FakeState {
    fn job(&mut self) -> String {
        self.next_job += 1;
        let id = format!("job-{}", self.next_job);
        let state = if self.pending_jobs {
            "running"
        } else if self.fail_jobs {
            "failure"
        } else {
            "success"
        };
        self.jobs.insert(id.clone(), state);
        id
    }
}

/// Fake SVM; jobs finish as soon as they are polled unless told otherwise
#[derive(Debug, Default)]
pub struct FakeOntap {
    state: Mutex<FakeState>,
}

impl FakeOntap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_aggregate(&self, name: &str, size_bytes: u64, allocated_bytes: u64) {
        self.state.lock().aggregates.push(Aggregate {
            name: name.to_string(),
            size_bytes,
            allocated_bytes,
        });
    }

    /// Make every job created from now on end in `failure`
    pub fn fail_jobs(&self) {
        self.state.lock().fail_jobs = true;
    }

    /// Leave every job created from now on running forever
    pub fn pending_jobs(&self) {
        self.state.lock().pending_jobs = true;
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn map_count(&self, path: &str) -> usize {
        self.state.lock().maps.get(path).map_or(0, |m| m.len())
    }
}

#[async_trait]
impl JobSource for FakeOntap {
    fn backend_name(&self) -> &str {
        "fake-ontap"
    }

    async fn job_state(&self, job_id: &str) -> Result<JobStatus> {
        let state = self.state.lock();
        let s = state
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;
        Ok(JobStatus::new(*s, ""))
    }
}

#[async_trait]
impl OntapApi for FakeOntap {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<FlexVol>> {
        Ok(self.state.lock().volumes.get(name).cloned())
    }

    async fn create_volume(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<String> {
        let mut state = self.state.lock();
        if state.volumes.contains_key(name) {
            return Err(Error::already_exists("volume", name));
        }
        state.volumes.insert(
            name.to_string(),
            FlexVol {
                name: name.to_string(),
                size_bytes,
                junction_path: Some(format!("/{}", name)),
                aggregate: Some(aggregate.to_string()),
            },
        );
        Ok(state.job())
    }

    async fn clone_volume(&self, name: &str, parent: &str, snapshot: &str) -> Result<String> {
        let mut state = self.state.lock();
        if !state
            .snapshots
            .contains_key(&(parent.to_string(), snapshot.to_string()))
        {
            return Err(Error::not_found("snapshot", snapshot));
        }
        let (size_bytes, aggregate) = state
            .volumes
            .get(parent)
            .map_or((0, None), |v| (v.size_bytes, v.aggregate.clone()));
        let parent_lun = state.luns.get(&format!("/vol/{}/lun0", parent)).cloned();

        state.volumes.insert(
            name.to_string(),
            FlexVol {
                name: name.to_string(),
                size_bytes,
                junction_path: Some(format!("/{}", name)),
                aggregate,
            },
        );
        if let Some(lun) = parent_lun {
            state.next_serial += 1;
            let path = format!("/vol/{}/lun0", name);
            let serial = format!("fakeserial{:02}", state.next_serial);
            state.luns.insert(
                path.clone(),
                Lun {
                    path,
                    serial_number: serial,
                    size_bytes: lun.size_bytes,
                },
            );
        }
        Ok(state.job())
    }

    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<String> {
        let mut state = self.state.lock();
        let vol = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| Error::not_found("volume", name))?;
        vol.size_bytes = size_bytes;
        Ok(state.job())
    }

    async fn delete_volume(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock();
        if state.volumes.remove(name).is_none() {
            return Err(Error::not_found("volume", name));
        }
        let prefix = format!("/vol/{}/", name);
        state.luns.retain(|path, _| !path.starts_with(&prefix));
        state.maps.retain(|path, _| !path.starts_with(&prefix));
        state.snapshots.retain(|(vol, _), _| vol != name);
        Ok(state.job())
    }

    async fn mount_volume(&self, name: &str, junction_path: &str) -> Result<()> {
        let mut state = self.state.lock();
        let vol = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| Error::not_found("volume", name))?;
        vol.junction_path = Some(junction_path.to_string());
        Ok(())
    }

    async fn unmount_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let vol = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| Error::not_found("volume", name))?;
        vol.junction_path = None;
        Ok(())
    }

    async fn create_lun(&self, path: &str, size_bytes: u64) -> Result<Lun> {
        let mut state = self.state.lock();
        state.next_serial += 1;
        let lun = Lun {
            path: path.to_string(),
            serial_number: format!("fakeserial{:02}", state.next_serial),
            size_bytes,
        };
        state.luns.insert(path.to_string(), lun.clone());
        Ok(lun)
    }

    async fn get_lun(&self, path: &str) -> Result<Option<Lun>> {
        Ok(self.state.lock().luns.get(path).cloned())
    }

    async fn resize_lun(&self, path: &str, size_bytes: u64) -> Result<()> {
        let mut state = self.state.lock();
        let lun = state
            .luns
            .get_mut(path)
            .ok_or_else(|| Error::not_found("lun", path))?;
        lun.size_bytes = size_bytes;
        Ok(())
    }

    async fn ensure_igroup(&self, igroup: &str, initiator: &str) -> Result<()> {
        let mut state = self.state.lock();
        let members = state.igroups.entry(igroup.to_string()).or_default();
        if !members.iter().any(|m| m == initiator) {
            members.push(initiator.to_string());
        }
        Ok(())
    }

    async fn lun_maps(&self, path: &str) -> Result<Vec<LunMap>> {
        let state = self.state.lock();
        Ok(state
            .maps
            .get(path)
            .map(|maps| {
                maps.iter()
                    .map(|(igroup, lun_id)| LunMap {
                        igroup: igroup.clone(),
                        lun_id: *lun_id,
                        initiators: state.igroups.get(igroup).cloned().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn map_lun(&self, path: &str, igroup: &str) -> Result<u32> {
        let mut state = self.state.lock();
        if !state.luns.contains_key(path) {
            return Err(Error::not_found("lun", path));
        }
        let lun_id = state.maps.values().map(|m| m.len() as u32).sum();
        state
            .maps
            .entry(path.to_string())
            .or_default()
            .push((igroup.to_string(), lun_id));
        Ok(lun_id)
    }

    async fn unmap_lun(&self, path: &str, igroup: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(maps) = state.maps.get_mut(path) {
            maps.retain(|(g, _)| g != igroup);
            if maps.is_empty() {
                state.maps.remove(path);
            }
        }
        Ok(())
    }

    async fn iscsi_target_name(&self) -> Result<String> {
        Ok("iqn.1992-08.com.netapp:sn.fake:vs.3".to_string())
    }

    async fn create_snapshot(&self, volume: &str, snapshot: &str) -> Result<String> {
        let mut state = self.state.lock();
        let size_bytes = state
            .volumes
            .get(volume)
            .map(|v| v.size_bytes)
            .ok_or_else(|| Error::not_found("volume", volume))?;
        state.snapshots.insert(
            (volume.to_string(), snapshot.to_string()),
            SnapshotInfo {
                name: snapshot.to_string(),
                create_time: "2020-01-01T00:00:00Z".to_string(),
                size_bytes,
            },
        );
        Ok(state.job())
    }

    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Option<SnapshotInfo>> {
        Ok(self
            .state
            .lock()
            .snapshots
            .get(&(volume.to_string(), snapshot.to_string()))
            .cloned())
    }

    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<String> {
        let mut state = self.state.lock();
        if state
            .snapshots
            .remove(&(volume.to_string(), snapshot.to_string()))
            .is_none()
        {
            return Err(Error::not_found("snapshot", snapshot));
        }
        Ok(state.job())
    }

    async fn aggregates(&self) -> Result<Vec<Aggregate>> {
        Ok(self.state.lock().aggregates.clone())
    }
}
