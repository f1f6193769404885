//! Ingress validation
//!
//! Checks applied to every request before a driver sees it.

use crate::domain::opts::*;
use crate::error::{Error, Result};
use uuid::Uuid;

/// Request options that can check themselves
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Ids are canonical hyphenated UUIDs
pub fn id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} is empty", field)));
    }

    match Uuid::parse_str(value) {
        Ok(parsed) if parsed.hyphenated().to_string() == value.to_ascii_lowercase() => Ok(()),
        _ => Err(Error::InvalidArgument(format!(
            "{} is not a canonical uuid: {}",
            field, value
        ))),
    }
}

/// Sizes are whole GiB, at least one
pub fn size(value: u64) -> Result<()> {
    if value < 1 {
        return Err(Error::InvalidArgument(format!(
            "size must be at least 1 GiB, got {}",
            value
        )));
    }
    Ok(())
}

/// Names are non-empty and limited to letters, digits, `_`, `-` and `.`
pub fn name(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument("name is empty".into()));
    }

    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::InvalidArgument(format!(
            "name {:?} contains invalid character {:?}",
            value, bad
        )));
    }
    Ok(())
}

/// The pool must be one the driver declares
pub fn pool(value: &str, declared: &[String]) -> Result<()> {
    if declared.iter().any(|p| p == value) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("unknown pool: {}", value)))
    }
}

/// Metadata in raw params must be a flat string map
pub fn metadata(params: &serde_json::Value) -> Result<()> {
    let Some(meta) = params.get("metadata") else {
        return Ok(());
    };

    match meta {
        serde_json::Value::Null => Ok(()),
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                if !value.is_string() {
                    return Err(Error::InvalidArgument(format!(
                        "metadata value for {} must be a string",
                        key
                    )));
                }
            }
            Ok(())
        }
        _ => Err(Error::InvalidArgument("metadata must be a map".into())),
    }
}

// =============================================================================
// Per-operation checks
// =============================================================================

impl Validate for CreateVolumeOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        name(&self.name)?;
        size(self.size)?;
        if let Some(snapshot_id) = &self.snapshot_id {
            id("snapshotId", snapshot_id)?;
        }
        Ok(())
    }
}

impl Validate for PullOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)
    }
}

impl Validate for DeleteVolumeOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)
    }
}

impl Validate for ExtendVolumeOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        size(self.size)
    }
}

impl Validate for CreateSnapshotOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        id("volumeId", &self.volume_id)?;
        name(&self.name)
    }
}

impl Validate for DeleteSnapshotOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)
    }
}

impl Validate for AttachmentOpts {
    fn validate(&self) -> Result<()> {
        id("volumeId", &self.volume_id)
    }
}

impl Validate for SnapshotAttachmentOpts {
    fn validate(&self) -> Result<()> {
        id("snapshotId", &self.snapshot_id)
    }
}

impl Validate for VolumeGroupOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        for v in self.add_volumes.iter().chain(&self.remove_volumes) {
            id("volume", v)?;
        }
        Ok(())
    }
}

impl Validate for CreateFileShareOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        name(&self.name)?;
        if self.export_locations.iter().any(|l| l.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "exportLocations must not contain empty paths".to_string(),
            ));
        }
        size(self.size)
    }
}

impl Validate for DeleteFileShareOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)
    }
}

impl Validate for CreateFileShareSnapshotOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        id("fileShareId", &self.file_share_id)?;
        name(&self.name)
    }
}

impl Validate for DeleteFileShareSnapshotOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)
    }
}

impl Validate for CreateFileShareAclOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        id("fileShareId", &self.file_share_id)?;
        if self.access_to.is_empty() {
            return Err(Error::InvalidArgument("accessTo is empty".into()));
        }
        Ok(())
    }
}

impl Validate for DeleteFileShareAclOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)
    }
}

impl Validate for ReplicationOpts {
    fn validate(&self) -> Result<()> {
        id("id", &self.id)?;
        id("primaryVolumeId", &self.primary_volume_id)?;
        id("secondaryVolumeId", &self.secondary_volume_id)?;
        if self.primary_volume_id == self.secondary_volume_id {
            return Err(Error::InvalidArgument(format!(
                "primary and secondary volume are both {}",
                self.primary_volume_id
            )));
        }
        Ok(())
    }
}

impl Validate for CollectMetricsOpts {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    const ID: &str = "e1bb066c-5ce7-46eb-9336-25508cee9f71";

    #[test]
    fn test_id_must_be_canonical() {
        assert!(id("id", ID).is_ok());
        assert!(id("id", &ID.to_uppercase()).is_ok());
        assert_matches!(id("id", ""), Err(Error::InvalidArgument(_)));
        assert_matches!(id("id", "e1bb066c5ce746eb933625508cee9f71"), Err(Error::InvalidArgument(_)));
        assert_matches!(id("id", "not-a-uuid"), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_size_and_name() {
        assert!(size(1).is_ok());
        assert_matches!(size(0), Err(Error::InvalidArgument(_)));

        assert!(name("vol-42_a.b").is_ok());
        assert_matches!(name(""), Err(Error::InvalidArgument(_)));
        assert_matches!(name("bad name"), Err(Error::InvalidArgument(_)));
        assert_matches!(name("a/b"), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_pool_resolution() {
        let declared = vec!["pool-0".to_string()];
        assert!(pool("pool-0", &declared).is_ok());
        assert_matches!(pool("pool-9", &declared), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_metadata_must_be_flat() {
        assert!(metadata(&json!({})).is_ok());
        assert!(metadata(&json!({"metadata": {"a": "b"}})).is_ok());
        assert_matches!(
            metadata(&json!({"metadata": {"a": {"nested": true}}})),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            metadata(&json!({"metadata": {"a": 1}})),
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(metadata(&json!({"metadata": [1]})), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_replication_pair_must_differ() {
        let opts = ReplicationOpts {
            id: ID.into(),
            primary_volume_id: ID.into(),
            secondary_volume_id: ID.into(),
            ..Default::default()
        };
        assert_matches!(opts.validate(), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_create_volume_validation() {
        let mut opts = CreateVolumeOpts {
            id: ID.into(),
            name: "t1".into(),
            size: 1,
            pool_name: "pool-0".into(),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());

        opts.size = 0;
        assert_matches!(opts.validate(), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_file_share_export_locations() {
        let mut opts = CreateFileShareOpts {
            id: ID.into(),
            name: "share1".into(),
            size: 1,
            export_locations: vec!["/mnt/a".into(), "/mnt/b".into()],
            ..Default::default()
        };
        assert!(opts.validate().is_ok());

        opts.export_locations.push(" ".into());
        assert_matches!(opts.validate(), Err(Error::InvalidArgument(_)));
    }
}
