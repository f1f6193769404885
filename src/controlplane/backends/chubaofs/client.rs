//! ChubaoFS master admin API
//!
//! Only the raft leader accepts volume changes. The leader is looked up on
//! the first configured master and trusted as returned.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Volume operations against a ChubaoFS cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create volume `name` of `capacity_gib` owned by `owner`
    async fn create_volume(&self, name: &str, capacity_gib: u64, owner: &str) -> Result<()>;

    /// Delete volume `name`; `NotFound` when the cluster does not know it
    async fn delete_volume(&self, name: &str, owner: &str) -> Result<()>;
}

pub type ClusterClientRef = Arc<dyn ClusterClient>;

/// Authentication key the master expects for owner-scoped calls
pub fn auth_key(owner: &str) -> String {
    format!("{:x}", md5::compute(owner.as_bytes()))
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Reply<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ClusterView {
    #[serde(rename = "LeaderAddr")]
    leader_addr: String,
}

// =============================================================================
// HTTP Client
// =============================================================================

/// Talks to the master nodes over HTTP
#[derive(Debug)]
pub struct MasterClient {
    backend: String,
    masters: Vec<String>,
    http: reqwest::Client,
}

impl MasterClient {
    pub fn new(backend: &str, masters: Vec<String>, timeout: Duration) -> Result<Self> {
        if masters.is_empty() {
            return Err(Error::Configuration(
                "cluster_info.master_addr is empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            backend: backend.to_string(),
            masters,
            http,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        op: &str,
        host: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        debug!("ChubaoFS {} on {}{}", op, host, path);

        let response = self
            .http
            .get(format!("http://{}{}", host, path))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::BackendUnreachable {
                backend: self.backend.clone(),
                reason: e.without_url().to_string(),
            })?;

        let reply: Reply<T> = response.json().await?;
        if reply.code != 0 {
            if reply.msg.contains("not exist") {
                return Err(Error::not_found("chubaofs volume", op));
            }
            return Err(Error::rejected(
                &self.backend,
                op,
                format!("code {}: {}", reply.code, reply.msg),
            ));
        }
        Ok(reply.data)
    }

    /// Leader address as reported by the first master
    pub async fn leader(&self) -> Result<String> {
        let view: Option<ClusterView> = self
            .get("get cluster", &self.masters[0], "/admin/getCluster", &[])
            .await?;
        view.map(|v| v.leader_addr)
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| Error::rejected(&self.backend, "get cluster", "no leader reported"))
    }
}

#[async_trait]
impl ClusterClient for MasterClient {
    async fn create_volume(&self, name: &str, capacity_gib: u64, owner: &str) -> Result<()> {
        let leader = self.leader().await?;
        let capacity = capacity_gib.to_string();
        self.get::<serde_json::Value>(
            "create volume",
            &leader,
            "/admin/createVol",
            &[("name", name), ("capacity", &capacity), ("owner", owner)],
        )
        .await?;

        info!("ChubaoFS volume {} created on {}", name, leader);
        Ok(())
    }

    async fn delete_volume(&self, name: &str, owner: &str) -> Result<()> {
        let leader = self.leader().await?;
        let key = auth_key(owner);
        self.get::<serde_json::Value>(
            "delete volume",
            &leader,
            "/vol/delete",
            &[("name", name), ("authKey", &key)],
        )
        .await
        .map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found("chubaofs volume", name),
            other => other,
        })?;

        info!("ChubaoFS volume {} deleted", name);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// In-memory master holding volume name -> (capacity, owner)
    #[derive(Default)]
    pub struct FakeMaster {
        volumes: Mutex<BTreeMap<String, (u64, String)>>,
    }

    impl FakeMaster {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn has_volume(&self, name: &str) -> bool {
            self.volumes.lock().contains_key(name)
        }
    }

    #[async_trait]
    impl ClusterClient for FakeMaster {
        async fn create_volume(&self, name: &str, capacity_gib: u64, owner: &str) -> Result<()> {
            let mut volumes = self.volumes.lock();
            if volumes.contains_key(name) {
                return Err(Error::already_exists("chubaofs volume", name));
            }
            volumes.insert(name.to_string(), (capacity_gib, owner.to_string()));
            Ok(())
        }

        async fn delete_volume(&self, name: &str, owner: &str) -> Result<()> {
            let mut volumes = self.volumes.lock();
            match volumes.get(name) {
                None => Err(Error::not_found("chubaofs volume", name)),
                Some((_, o)) if o != owner => {
                    Err(Error::rejected("fake-master", "delete volume", "auth failed"))
                }
                Some(_) => {
                    volumes.remove(name);
                    Ok(())
                }
            }
        }
    }
}
