//! Typed operation options
//!
//! These are the typed fields of a dispatched request. Each is parsed once
//! from the request params, validated at ingress, and handed to the driver.

use crate::domain::model::{AccessProtocol, HostInfo, Metadata, ReplicationSpec};
use serde::{Deserialize, Serialize};

// =============================================================================
// Volumes
// =============================================================================

/// Options for `create_volume`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateVolumeOpts {
    pub id: String,
    pub name: String,
    /// GiB
    pub size: u64,
    pub description: String,
    pub pool_name: String,
    pub snapshot_id: Option<String>,
    pub metadata: Metadata,
}

/// Options for `pull_volume`, `pull_snapshot` and other lookups by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PullOpts {
    pub id: String,
}

/// Options for `delete_volume`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteVolumeOpts {
    pub id: String,
    pub metadata: Metadata,
}

/// Options for `extend_volume`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtendVolumeOpts {
    pub id: String,
    /// New size, GiB
    pub size: u64,
    pub metadata: Metadata,
}

/// Options for `create_snapshot`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateSnapshotOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub volume_id: String,
    pub size: u64,
    pub metadata: Metadata,
}

/// Options for `delete_snapshot`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteSnapshotOpts {
    pub id: String,
    pub volume_id: String,
    pub metadata: Metadata,
}

// =============================================================================
// Attachments
// =============================================================================

/// Options for `initialize_connection` and `terminate_connection`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentOpts {
    #[serde(default)]
    pub id: String,
    pub volume_id: String,
    #[serde(default)]
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Options for the snapshot connection operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotAttachmentOpts {
    #[serde(default)]
    pub id: String,
    pub snapshot_id: String,
    #[serde(default)]
    pub host_info: HostInfo,
    pub access_protocol: AccessProtocol,
    #[serde(default)]
    pub metadata: Metadata,
}

// =============================================================================
// Volume Groups
// =============================================================================

/// Options for the volume group operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeGroupOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub pool_name: String,
    pub add_volumes: Vec<String>,
    pub remove_volumes: Vec<String>,
    pub metadata: Metadata,
}

// =============================================================================
// File Shares
// =============================================================================

/// Options for `create_file_share`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateFileShareOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    /// GiB
    pub size: u64,
    pub pool_name: String,
    pub protocols: Vec<String>,
    /// Mount paths requested by the caller, the driver default when empty
    pub export_locations: Vec<String>,
    pub metadata: Metadata,
}

/// Options for `delete_file_share`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteFileShareOpts {
    pub id: String,
    pub name: String,
    /// Export locations reported when the share was created
    pub export_locations: Vec<String>,
    pub metadata: Metadata,
}

/// Options for `create_file_share_snapshot`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateFileShareSnapshotOpts {
    pub id: String,
    pub name: String,
    pub description: String,
    pub file_share_id: String,
    pub size: u64,
    pub metadata: Metadata,
}

/// Options for `delete_file_share_snapshot`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteFileShareSnapshotOpts {
    pub id: String,
    pub file_share_id: String,
    pub metadata: Metadata,
}

/// Options for `create_file_share_acl`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateFileShareAclOpts {
    pub id: String,
    pub file_share_id: String,
    #[serde(rename = "type")]
    pub access_type: String,
    pub access_to: String,
    pub access_capability: Vec<String>,
    pub metadata: Metadata,
}

/// Options for `delete_file_share_acl`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteFileShareAclOpts {
    pub id: String,
    pub file_share_id: String,
    pub access_to: String,
    pub metadata: Metadata,
}

// =============================================================================
// Replication & Metrics
// =============================================================================

/// Options for every replication operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReplicationOpts {
    pub id: String,
    pub name: String,
    pub primary_volume_id: String,
    pub secondary_volume_id: String,
    pub primary_replication_driver_data: Metadata,
    pub secondary_replication_driver_data: Metadata,
    /// Bytes per second, 0 means unlimited
    pub bandwidth: u64,
    pub is_primary: bool,
    pub metadata: Metadata,
}

impl ReplicationOpts {
    /// The relationship record these options describe
    pub fn to_spec(&self) -> ReplicationSpec {
        ReplicationSpec {
            id: self.id.clone(),
            name: self.name.clone(),
            primary_volume_id: self.primary_volume_id.clone(),
            secondary_volume_id: self.secondary_volume_id.clone(),
            primary_replication_driver_data: self.primary_replication_driver_data.clone(),
            secondary_replication_driver_data: self.secondary_replication_driver_data.clone(),
            bandwidth: self.bandwidth,
            is_primary: self.is_primary,
            metadata: self.metadata.clone(),
        }
    }
}

/// Options for `collect_metrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectMetricsOpts {
    /// Backend instance the samples describe
    pub instance_id: String,
    /// Metric names to collect, all when empty
    pub metrics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_volume_opts_from_params() {
        let opts: CreateVolumeOpts = serde_json::from_value(json!({
            "id": "e1bb066c-5ce7-46eb-9336-25508cee9f71",
            "name": "t1",
            "size": 1,
            "poolName": "pool-0",
            "metadata": {"tier": "gold"}
        }))
        .unwrap();

        assert_eq!(opts.size, 1);
        assert_eq!(opts.pool_name, "pool-0");
        assert_eq!(opts.snapshot_id, None);
        assert_eq!(opts.metadata["tier"], "gold");
    }

    #[test]
    fn test_attachment_opts_requires_protocol() {
        let err = serde_json::from_value::<AttachmentOpts>(json!({"volumeId": "v"}));
        assert!(err.is_err());

        let opts: AttachmentOpts = serde_json::from_value(json!({
            "volumeId": "v",
            "accessProtocol": "iscsi",
            "hostInfo": {
                "host": "node-1",
                "ip": "127.0.0.1",
                "initiators": [{"portName": "iqn.x", "protocol": "iscsi"}]
            }
        }))
        .unwrap();
        assert_eq!(opts.access_protocol, AccessProtocol::Iscsi);
        assert_eq!(opts.host_info.initiators.len(), 1);
    }

    #[test]
    fn test_replication_opts_to_spec() {
        let opts = ReplicationOpts {
            id: "r1".into(),
            primary_volume_id: "A".into(),
            secondary_volume_id: "B".into(),
            bandwidth: 1_000_000,
            is_primary: true,
            ..Default::default()
        };
        let spec = opts.to_spec();
        assert_eq!(spec.primary_volume_id, "A");
        assert_eq!(spec.bandwidth, 1_000_000);
        assert!(spec.is_primary);
    }
}
