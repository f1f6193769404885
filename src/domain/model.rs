//! Resource records shared by every driver family
//!
//! Records serialise in camelCase; that shape is the body of a successful
//! reply. Metadata maps hold backend bookkeeping and stay string to string.

use crate::config::PoolProperties;
use crate::domain::naming;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Backend bookkeeping attached to a record
pub type Metadata = BTreeMap<String, String>;

/// Availability zone used when neither config nor backend names one
pub const DEFAULT_AVAILABILITY_ZONE: &str = "default";

// =============================================================================
// Enumerations
// =============================================================================

/// Storage types a pool or backend can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Block,
    File,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Block => write!(f, "block"),
            StorageType::File => write!(f, "file"),
        }
    }
}

/// Transport a host uses to reach a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessProtocol {
    Iscsi,
    FibreChannel,
    Nvmeof,
    Rbd,
    Nfs,
}

impl AccessProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessProtocol::Iscsi => "iscsi",
            AccessProtocol::FibreChannel => "fibre_channel",
            AccessProtocol::Nvmeof => "nvmeof",
            AccessProtocol::Rbd => "rbd",
            AccessProtocol::Nfs => "nfs",
        }
    }
}

impl std::fmt::Display for AccessProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AccessProtocol {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "iscsi" => Ok(AccessProtocol::Iscsi),
            "fibre_channel" | "fc" => Ok(AccessProtocol::FibreChannel),
            "nvmeof" => Ok(AccessProtocol::Nvmeof),
            "rbd" => Ok(AccessProtocol::Rbd),
            "nfs" => Ok(AccessProtocol::Nfs),
            other => Err(crate::error::Error::InvalidArgument(format!(
                "unknown access protocol: {}",
                other
            ))),
        }
    }
}

/// Format of a durable device name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DurableNameFormat {
    Naa,
    Iqn,
    Eui,
    Other(String),
}

impl From<String> for DurableNameFormat {
    fn from(s: String) -> Self {
        match s.as_str() {
            "NAA" => DurableNameFormat::Naa,
            "IQN" => DurableNameFormat::Iqn,
            "EUI" => DurableNameFormat::Eui,
            _ => DurableNameFormat::Other(s),
        }
    }
}

impl From<DurableNameFormat> for String {
    fn from(f: DurableNameFormat) -> Self {
        match f {
            DurableNameFormat::Naa => "NAA".to_string(),
            DurableNameFormat::Iqn => "IQN".to_string(),
            DurableNameFormat::Eui => "EUI".to_string(),
            DurableNameFormat::Other(s) => s,
        }
    }
}

// =============================================================================
// Pools
// =============================================================================

/// Capability declarations a pool offers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PoolExtras {
    /// Thin / Thick
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_policy: Option<String>,
    pub compression: bool,
    pub deduplication: bool,
    /// iscsi, fibre_channel, nvmeof, rbd, nfs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_protocol: Option<String>,
    /// Anything else the operator declares
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// A unit of provisionable capacity, capacities in GiB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    pub name: String,
    pub total_capacity: u64,
    pub free_capacity: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_capacity: Option<u64>,
    pub storage_type: StorageType,
    pub availability_zone: String,
    pub multi_attach: bool,
    pub extras: PoolExtras,
}

impl Pool {
    /// Build a pool from its declared properties
    ///
    /// The id is derived from the name, and an empty zone falls back to
    /// `default_az`, which each backend chooses.
    pub fn new(name: &str, props: &PoolProperties, default_az: &str) -> Self {
        let availability_zone = if props.availability_zone.is_empty() {
            default_az.to_string()
        } else {
            props.availability_zone.clone()
        };

        Self {
            id: naming::pool_id(name),
            name: name.to_string(),
            total_capacity: 0,
            free_capacity: 0,
            consumed_capacity: None,
            storage_type: props.storage_type,
            availability_zone,
            multi_attach: props.multi_attach,
            extras: props.extras.clone(),
        }
    }

    /// Set capacities; consumed is derived from total and free
    pub fn with_capacity(mut self, total: u64, free: u64) -> Self {
        self.total_capacity = total;
        self.free_capacity = free.min(total);
        self.consumed_capacity = Some(total - self.free_capacity);
        self
    }
}

// =============================================================================
// Volumes & Snapshots
// =============================================================================

/// Durable device identity of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
    pub durable_name: String,
    pub durable_name_format: DurableNameFormat,
}

/// A block volume, size in GiB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub size: u64,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A point-in-time image of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub volume_id: String,
    pub size: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A group of volumes managed together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub volume_ids: Vec<String>,
}

// =============================================================================
// Attachments
// =============================================================================

/// A host-side endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    /// IQN for iSCSI, WWPN for FC, NQN for NVMe-oF
    pub port_name: String,
    pub protocol: AccessProtocol,
}

/// Host that wants to consume a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostInfo {
    pub os_type: String,
    pub host: String,
    pub ip: String,
    pub initiators: Vec<Initiator>,
}

impl HostInfo {
    /// Pick the initiator speaking `protocol`
    pub fn initiator_for(&self, protocol: AccessProtocol) -> Option<&Initiator> {
        self.initiators.iter().find(|i| i.protocol == protocol)
    }
}

/// Transport parameters returned by `initialize_connection`
///
/// `data` is opaque to the dock; drivers fill it and callers read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionInfo {
    pub fn new(driver_volume_type: impl Into<String>) -> Self {
        Self {
            driver_volume_type: driver_volume_type.into(),
            data: serde_json::Map::new(),
        }
    }

    /// Add one transport parameter
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// String value of a parameter, if present
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

// =============================================================================
// File Shares
// =============================================================================

/// A file-protocol share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShare {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub size: u64,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    pub export_locations: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A point-in-time image of a file share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShareSnapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub file_share_id: String,
    pub snapshot_size: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// An access rule on a file share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShareAcl {
    pub id: String,
    pub file_share_id: String,
    /// ip, user or cert
    #[serde(rename = "type")]
    pub access_type: String,
    pub access_to: String,
    #[serde(default)]
    pub access_capability: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

// =============================================================================
// Replication
// =============================================================================

/// A paired-volume replication relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub primary_volume_id: String,
    pub secondary_volume_id: String,
    #[serde(default)]
    pub primary_replication_driver_data: Metadata,
    #[serde(default)]
    pub secondary_replication_driver_data: Metadata,
    /// Bytes per second, 0 means unlimited
    #[serde(default)]
    pub bandwidth: u64,
    pub is_primary: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

// =============================================================================
// Metrics
// =============================================================================

/// One collected measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub instance_id: String,
    pub name: String,
    pub unit: String,
    pub value: f64,
    /// Unix seconds
    pub timestamp: i64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_props(az: &str) -> PoolProperties {
        PoolProperties {
            storage_type: StorageType::Block,
            availability_zone: az.to_string(),
            multi_attach: false,
            extras: PoolExtras::default(),
        }
    }

    #[test]
    fn test_pool_default_zone() {
        let pool = Pool::new("pool-0", &block_props(""), DEFAULT_AVAILABILITY_ZONE);
        assert_eq!(pool.availability_zone, "default");

        let pool = Pool::new("pool-0", &block_props("az-9"), "ceph");
        assert_eq!(pool.availability_zone, "az-9");
    }

    #[test]
    fn test_pool_capacity() {
        let pool = Pool::new("pool-0", &block_props(""), "default").with_capacity(10, 10);
        assert_eq!(pool.total_capacity, 10);
        assert_eq!(pool.free_capacity, 10);
        assert_eq!(pool.consumed_capacity, Some(0));

        let pool = Pool::new("pool-0", &block_props(""), "default").with_capacity(10, 25);
        assert_eq!(pool.free_capacity, 10);
    }

    #[test]
    fn test_durable_name_format_serde() {
        let id = Identifier {
            durable_name: "600a0980abcd".into(),
            durable_name_format: DurableNameFormat::Naa,
        };
        let v = serde_json::to_value(&id).unwrap();
        assert_eq!(v, json!({"durableName": "600a0980abcd", "durableNameFormat": "NAA"}));

        let parsed: DurableNameFormat = serde_json::from_value(json!("WWN")).unwrap();
        assert_eq!(parsed, DurableNameFormat::Other("WWN".into()));
    }

    #[test]
    fn test_access_protocol() {
        assert_eq!(AccessProtocol::FibreChannel.to_string(), "fibre_channel");
        assert_eq!("ISCSI".parse::<AccessProtocol>().unwrap(), AccessProtocol::Iscsi);
        assert!("smb".parse::<AccessProtocol>().is_err());
    }

    #[test]
    fn test_initiator_selection() {
        let host = HostInfo {
            host: "node-1".into(),
            ip: "10.0.0.5".into(),
            initiators: vec![
                Initiator {
                    port_name: "21000024ff2a".into(),
                    protocol: AccessProtocol::FibreChannel,
                },
                Initiator {
                    port_name: "iqn.2020-01.io.opensds:example".into(),
                    protocol: AccessProtocol::Iscsi,
                },
            ],
            ..Default::default()
        };

        let iscsi = host.initiator_for(AccessProtocol::Iscsi).unwrap();
        assert_eq!(iscsi.port_name, "iqn.2020-01.io.opensds:example");
        assert!(host.initiator_for(AccessProtocol::Nvmeof).is_none());
    }

    #[test]
    fn test_connection_info_shape() {
        let info = ConnectionInfo::new("iscsi")
            .with("targetLun", 0)
            .with("volume", "opensds_x");
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["driver_volume_type"], "iscsi");
        assert_eq!(v["data"]["targetLun"], 0);
        assert_eq!(info.get_str("volume"), Some("opensds_x"));
    }
}
