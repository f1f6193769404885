//! ONTAP management API
//!
//! [`OntapApi`] is the narrow surface the SAN driver needs from an SVM.
//! [`OntapRestClient`] implements it over the ONTAP REST API. Long-running
//! volume and snapshot calls return job ids that the driver joins.

use crate::controlplane::jobs::{JobSource, JobStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Records
// =============================================================================

/// A FlexVol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexVol {
    pub name: String,
    pub size_bytes: u64,
    /// Junction path, `None` when unmounted
    pub junction_path: Option<String>,
    /// Aggregate holding the volume
    pub aggregate: Option<String>,
}

/// A LUN inside a FlexVol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lun {
    pub path: String,
    pub serial_number: String,
    pub size_bytes: u64,
}

/// A LUN mapped to an initiator group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunMap {
    pub igroup: String,
    pub lun_id: u32,
    pub initiators: Vec<String>,
}

/// A volume snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub name: String,
    pub create_time: String,
    pub size_bytes: u64,
}

/// Aggregate capacity as committed on the SVM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub name: String,
    pub size_bytes: u64,
    pub allocated_bytes: u64,
}

// =============================================================================
// API Port
// =============================================================================

/// Operations the SAN driver performs against one SVM
#[async_trait]
pub trait OntapApi: JobSource {
    /// Check the session works
    async fn ping(&self) -> Result<()>;

    async fn get_volume(&self, name: &str) -> Result<Option<FlexVol>>;

    /// Returns a job id
    async fn create_volume(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<String>;

    /// FlexClone `name` from a snapshot of `parent`; returns a job id
    async fn clone_volume(&self, name: &str, parent: &str, snapshot: &str) -> Result<String>;

    /// Returns a job id
    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<String>;

    /// Returns a job id; `NotFound` when the volume is absent
    async fn delete_volume(&self, name: &str) -> Result<String>;

    async fn mount_volume(&self, name: &str, junction_path: &str) -> Result<()>;

    async fn unmount_volume(&self, name: &str) -> Result<()>;

    async fn create_lun(&self, path: &str, size_bytes: u64) -> Result<Lun>;

    async fn get_lun(&self, path: &str) -> Result<Option<Lun>>;

    async fn resize_lun(&self, path: &str, size_bytes: u64) -> Result<()>;

    /// Create the igroup if missing and make sure it holds `initiator`
    async fn ensure_igroup(&self, igroup: &str, initiator: &str) -> Result<()>;

    async fn lun_maps(&self, path: &str) -> Result<Vec<LunMap>>;

    /// Returns the LUN id assigned by the mapping
    async fn map_lun(&self, path: &str, igroup: &str) -> Result<u32>;

    async fn unmap_lun(&self, path: &str, igroup: &str) -> Result<()>;

    /// iSCSI target name of the SVM
    async fn iscsi_target_name(&self) -> Result<String>;

    /// Returns a job id
    async fn create_snapshot(&self, volume: &str, snapshot: &str) -> Result<String>;

    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Option<SnapshotInfo>>;

    /// Returns a job id; `NotFound` when the snapshot is absent
    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<String>;

    /// Aggregates assigned to the SVM
    async fn aggregates(&self) -> Result<Vec<Aggregate>>;
}

pub type OntapApiRef = Arc<dyn OntapApi>;

// =============================================================================
// REST Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Records<T> {
    #[serde(default = "Vec::new")]
    records: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct JobLink {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    job: JobLink,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NamedUuid {
    uuid: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct NasInfo {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VolumeRecord {
    uuid: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    nas: NasInfo,
    #[serde(default = "Vec::new")]
    aggregates: Vec<Named>,
}

#[derive(Debug, Default, Deserialize)]
struct LunSpace {
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct LunRecord {
    uuid: String,
    name: String,
    #[serde(default)]
    serial_number: String,
    #[serde(default)]
    space: LunSpace,
}

#[derive(Debug, Deserialize)]
struct IgroupRecord {
    uuid: String,
    #[serde(default = "Vec::new")]
    initiators: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct LunMapRecord {
    igroup: NamedUuid,
    lun: NamedUuid,
    logical_unit_number: u32,
}

#[derive(Debug, Deserialize)]
struct SnapshotRecord {
    uuid: String,
    name: String,
    #[serde(default)]
    create_time: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Default, Deserialize)]
struct BlockStorage {
    #[serde(default)]
    size: u64,
    #[serde(default)]
    used: u64,
}

#[derive(Debug, Default, Deserialize)]
struct AggregateSpace {
    #[serde(default)]
    block_storage: BlockStorage,
}

#[derive(Debug, Deserialize)]
struct AggregateRecord {
    name: String,
    #[serde(default)]
    space: AggregateSpace,
}

#[derive(Debug, Deserialize)]
struct SvmRecord {
    #[serde(default = "Vec::new")]
    aggregates: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct IscsiTarget {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IscsiServiceRecord {
    target: IscsiTarget,
}

#[derive(Debug, Deserialize)]
struct JobRecord {
    state: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

// =============================================================================
// REST Client
// =============================================================================

/// Connection settings for [`OntapRestClient`]
#[derive(Clone)]
pub struct OntapEndpoint {
    pub backend: String,
    pub management_lif: String,
    pub svm: String,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
    pub timeout: Duration,
}

impl std::fmt::Debug for OntapEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OntapEndpoint")
            .field("backend", &self.backend)
            .field("management_lif", &self.management_lif)
            .field("svm", &self.svm)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// ONTAP REST API client scoped to one SVM
pub struct OntapRestClient {
    endpoint: OntapEndpoint,
    base_url: String,
    http: reqwest::Client,
}

impl OntapRestClient {
    pub fn new(endpoint: OntapEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .danger_accept_invalid_certs(endpoint.insecure_skip_verify)
            .build()?;

        let base_url = format!("https://{}/api", endpoint.management_lif);

        Ok(Self {
            endpoint,
            base_url,
            http,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
    }

    async fn send<T: DeserializeOwned>(&self, op: &str, req: RequestBuilder) -> Result<T> {
        let response = req.send().await.map_err(|e| Error::BackendUnreachable {
            backend: self.endpoint.backend.clone(),
            reason: e.without_url().to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(serde_json::from_value(json!({}))?);
            }
            return Ok(response.json::<T>().await?);
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error.message)
            .unwrap_or_default();

        Err(match status {
            StatusCode::NOT_FOUND => Error::not_found("ontap object", op),
            StatusCode::CONFLICT => Error::already_exists("ontap object", op),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Error::rejected(&self.endpoint.backend, op, "not authorized")
            }
            _ => Error::rejected(
                &self.endpoint.backend,
                op,
                format!("{}: {}", status.as_u16(), message),
            ),
        })
    }

    async fn first<T: DeserializeOwned>(
        &self,
        op: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let records: Records<T> = self
            .send(op, self.request(Method::GET, path).query(query))
            .await?;
        Ok(records.records.into_iter().next())
    }

    async fn volume_record(&self, name: &str) -> Result<Option<VolumeRecord>> {
        self.first(
            "get volume",
            "/storage/volumes",
            &[
                ("name", name),
                ("svm.name", self.endpoint.svm.as_str()),
                ("fields", "uuid,name,size,nas.path,aggregates.name"),
            ],
        )
        .await
    }

    async fn volume_uuid(&self, name: &str) -> Result<String> {
        self.volume_record(name)
            .await?
            .map(|v| v.uuid)
            .ok_or_else(|| Error::not_found("volume", name))
    }

    async fn lun_record(&self, path: &str) -> Result<Option<LunRecord>> {
        self.first(
            "get lun",
            "/storage/luns",
            &[
                ("name", path),
                ("svm.name", self.endpoint.svm.as_str()),
                ("fields", "uuid,name,serial_number,space.size"),
            ],
        )
        .await
    }

    async fn snapshot_record(&self, volume_uuid: &str, snapshot: &str) -> Result<Option<SnapshotRecord>> {
        self.first(
            "get snapshot",
            &format!("/storage/volumes/{}/snapshots", volume_uuid),
            &[("name", snapshot), ("fields", "uuid,name,create_time,size")],
        )
        .await
    }

    async fn job(&self, op: &str, req: RequestBuilder) -> Result<String> {
        let response: JobResponse = self.send(op, req.query(&[("return_timeout", "0")])).await?;
        debug!("ONTAP {} started job {}", op, response.job.uuid);
        Ok(response.job.uuid)
    }
}

#[async_trait]
impl JobSource for OntapRestClient {
    fn backend_name(&self) -> &str {
        &self.endpoint.backend
    }

    async fn job_state(&self, job_id: &str) -> Result<JobStatus> {
        let job: JobRecord = self
            .send(
                "get job",
                self.request(Method::GET, &format!("/cluster/jobs/{}", job_id))
                    .query(&[("fields", "state,message")]),
            )
            .await?;
        Ok(JobStatus::new(job.state, job.message))
    }
}

#[async_trait]
impl OntapApi for OntapRestClient {
    async fn ping(&self) -> Result<()> {
        let _: serde_json::Value = self
            .send(
                "get svm",
                self.request(Method::GET, "/svm/svms")
                    .query(&[("name", self.endpoint.svm.as_str())]),
            )
            .await?;
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<FlexVol>> {
        Ok(self.volume_record(name).await?.map(|v| FlexVol {
            name: v.name,
            size_bytes: v.size,
            junction_path: v.nas.path.filter(|p| !p.is_empty()),
            aggregate: v.aggregates.into_iter().next().map(|a| a.name),
        }))
    }

    async fn create_volume(&self, name: &str, aggregate: &str, size_bytes: u64) -> Result<String> {
        let body = json!({
            "name": name,
            "svm": {"name": self.endpoint.svm},
            "aggregates": [{"name": aggregate}],
            "size": size_bytes,
            "guarantee": {"type": "none"},
            "nas": {"path": format!("/{}", name)},
        });
        self.job(
            "create volume",
            self.request(Method::POST, "/storage/volumes").json(&body),
        )
        .await
    }

    async fn clone_volume(&self, name: &str, parent: &str, snapshot: &str) -> Result<String> {
        let body = json!({
            "name": name,
            "svm": {"name": self.endpoint.svm},
            "nas": {"path": format!("/{}", name)},
            "clone": {
                "is_flexclone": true,
                "parent_volume": {"name": parent},
                "parent_snapshot": {"name": snapshot},
            },
        });
        self.job(
            "clone volume",
            self.request(Method::POST, "/storage/volumes").json(&body),
        )
        .await
    }

    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<String> {
        let uuid = self.volume_uuid(name).await?;
        self.job(
            "resize volume",
            self.request(Method::PATCH, &format!("/storage/volumes/{}", uuid))
                .json(&json!({"size": size_bytes})),
        )
        .await
    }

    async fn delete_volume(&self, name: &str) -> Result<String> {
        let uuid = self.volume_uuid(name).await?;
        self.job(
            "delete volume",
            self.request(Method::DELETE, &format!("/storage/volumes/{}", uuid)),
        )
        .await
    }

    async fn mount_volume(&self, name: &str, junction_path: &str) -> Result<()> {
        let uuid = self.volume_uuid(name).await?;
        let _: serde_json::Value = self
            .send(
                "mount volume",
                self.request(Method::PATCH, &format!("/storage/volumes/{}", uuid))
                    .json(&json!({"nas": {"path": junction_path}})),
            )
            .await?;
        Ok(())
    }

    async fn unmount_volume(&self, name: &str) -> Result<()> {
        self.mount_volume(name, "").await
    }

    async fn create_lun(&self, path: &str, size_bytes: u64) -> Result<Lun> {
        let body = json!({
            "name": path,
            "svm": {"name": self.endpoint.svm},
            "os_type": "linux",
            "space": {"size": size_bytes},
        });
        let _: serde_json::Value = self
            .send(
                "create lun",
                self.request(Method::POST, "/storage/luns").json(&body),
            )
            .await?;

        self.get_lun(path)
            .await?
            .ok_or_else(|| Error::not_found("lun", path))
    }

    async fn get_lun(&self, path: &str) -> Result<Option<Lun>> {
        Ok(self.lun_record(path).await?.map(|l| Lun {
            path: l.name,
            serial_number: l.serial_number,
            size_bytes: l.space.size,
        }))
    }

    async fn resize_lun(&self, path: &str, size_bytes: u64) -> Result<()> {
        let lun = self
            .lun_record(path)
            .await?
            .ok_or_else(|| Error::not_found("lun", path))?;
        let _: serde_json::Value = self
            .send(
                "resize lun",
                self.request(Method::PATCH, &format!("/storage/luns/{}", lun.uuid))
                    .json(&json!({"space": {"size": size_bytes}})),
            )
            .await?;
        Ok(())
    }

    async fn ensure_igroup(&self, igroup: &str, initiator: &str) -> Result<()> {
        let existing: Option<IgroupRecord> = self
            .first(
                "get igroup",
                "/protocols/san/igroups",
                &[
                    ("name", igroup),
                    ("svm.name", self.endpoint.svm.as_str()),
                    ("fields", "uuid,initiators"),
                ],
            )
            .await?;

        match existing {
            None => {
                let body = json!({
                    "name": igroup,
                    "svm": {"name": self.endpoint.svm},
                    "os_type": "linux",
                    "protocol": "iscsi",
                    "initiators": [{"name": initiator}],
                });
                let _: serde_json::Value = self
                    .send(
                        "create igroup",
                        self.request(Method::POST, "/protocols/san/igroups").json(&body),
                    )
                    .await?;
            }
            Some(group) if !group.initiators.iter().any(|i| i.name == initiator) => {
                let _: serde_json::Value = self
                    .send(
                        "add initiator",
                        self.request(
                            Method::POST,
                            &format!("/protocols/san/igroups/{}/initiators", group.uuid),
                        )
                        .json(&json!({"name": initiator})),
                    )
                    .await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn lun_maps(&self, path: &str) -> Result<Vec<LunMap>> {
        let maps: Records<LunMapRecord> = self
            .send(
                "get lun maps",
                self.request(Method::GET, "/protocols/san/lun-maps").query(&[
                    ("lun.name", path),
                    ("svm.name", self.endpoint.svm.as_str()),
                    ("fields", "igroup.name,igroup.uuid,lun.name,lun.uuid,logical_unit_number"),
                ]),
            )
            .await?;

        let mut out = Vec::with_capacity(maps.records.len());
        for map in maps.records {
            let group: IgroupRecord = self
                .send(
                    "get igroup",
                    self.request(
                        Method::GET,
                        &format!("/protocols/san/igroups/{}", map.igroup.uuid),
                    )
                    .query(&[("fields", "uuid,initiators")]),
                )
                .await?;
            out.push(LunMap {
                igroup: map.igroup.name,
                lun_id: map.logical_unit_number,
                initiators: group.initiators.into_iter().map(|i| i.name).collect(),
            });
        }
        Ok(out)
    }

    async fn map_lun(&self, path: &str, igroup: &str) -> Result<u32> {
        let body = json!({
            "svm": {"name": self.endpoint.svm},
            "lun": {"name": path},
            "igroup": {"name": igroup},
        });
        let created: Records<LunMapRecord> = self
            .send(
                "map lun",
                self.request(Method::POST, "/protocols/san/lun-maps")
                    .query(&[("return_records", "true")])
                    .json(&body),
            )
            .await?;

        created
            .records
            .first()
            .map(|m| m.logical_unit_number)
            .ok_or_else(|| Error::rejected(&self.endpoint.backend, "map lun", "no mapping returned"))
    }

    async fn unmap_lun(&self, path: &str, igroup: &str) -> Result<()> {
        let maps: Records<LunMapRecord> = self
            .send(
                "get lun maps",
                self.request(Method::GET, "/protocols/san/lun-maps").query(&[
                    ("lun.name", path),
                    ("igroup.name", igroup),
                    ("svm.name", self.endpoint.svm.as_str()),
                    ("fields", "igroup.uuid,igroup.name,lun.uuid,lun.name,logical_unit_number"),
                ]),
            )
            .await?;

        for map in maps.records {
            let _: serde_json::Value = self
                .send(
                    "unmap lun",
                    self.request(
                        Method::DELETE,
                        &format!("/protocols/san/lun-maps/{}/{}", map.lun.uuid, map.igroup.uuid),
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn iscsi_target_name(&self) -> Result<String> {
        let service: Option<IscsiServiceRecord> = self
            .first(
                "get iscsi service",
                "/protocols/san/iscsi/services",
                &[("svm.name", self.endpoint.svm.as_str()), ("fields", "target.name")],
            )
            .await?;
        service
            .map(|s| s.target.name)
            .ok_or_else(|| Error::not_found("iscsi service", &self.endpoint.svm))
    }

    async fn create_snapshot(&self, volume: &str, snapshot: &str) -> Result<String> {
        let uuid = self.volume_uuid(volume).await?;
        self.job(
            "create snapshot",
            self.request(Method::POST, &format!("/storage/volumes/{}/snapshots", uuid))
                .json(&json!({"name": snapshot})),
        )
        .await
    }

    async fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Option<SnapshotInfo>> {
        let Some(vol) = self.volume_record(volume).await? else {
            return Ok(None);
        };
        Ok(self
            .snapshot_record(&vol.uuid, snapshot)
            .await?
            .map(|s| SnapshotInfo {
                name: s.name,
                create_time: s.create_time,
                size_bytes: s.size,
            }))
    }

    async fn delete_snapshot(&self, volume: &str, snapshot: &str) -> Result<String> {
        let vol_uuid = self.volume_uuid(volume).await?;
        let snap = self
            .snapshot_record(&vol_uuid, snapshot)
            .await?
            .ok_or_else(|| Error::not_found("snapshot", snapshot))?;
        self.job(
            "delete snapshot",
            self.request(
                Method::DELETE,
                &format!("/storage/volumes/{}/snapshots/{}", vol_uuid, snap.uuid),
            ),
        )
        .await
    }

    async fn aggregates(&self) -> Result<Vec<Aggregate>> {
        let svm: Option<SvmRecord> = self
            .first(
                "get svm",
                "/svm/svms",
                &[("name", self.endpoint.svm.as_str()), ("fields", "aggregates")],
            )
            .await?;
        let names: Vec<String> = svm
            .map(|s| s.aggregates.into_iter().map(|a| a.name).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let record: Option<AggregateRecord> = self
                .first(
                    "get aggregate",
                    "/storage/aggregates",
                    &[
                        ("name", name.as_str()),
                        ("fields", "name,space.block_storage.size,space.block_storage.used"),
                    ],
                )
                .await?;
            if let Some(aggr) = record {
                out.push(Aggregate {
                    name: aggr.name,
                    size_bytes: aggr.space.block_storage.size,
                    allocated_bytes: aggr.space.block_storage.used,
                });
            }
        }
        Ok(out)
    }
}
