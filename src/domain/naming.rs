//! Naming and identity
//!
//! Backends disagree on name grammar, so each driver maps a caller id to a
//! backend name through a [`NameScheme`] and maps it back when listing.
//! Pool ids and LUN durable names are derived here as well.

use uuid::Uuid;

/// Prefix every prefixed scheme starts with
pub const NAME_PREFIX: &str = "opensds_";

/// Prefix for backend snapshot names
pub const SNAPSHOT_PREFIX: &str = "opensds_snapshot_";

/// NAA registered prefix for ONTAP LUN serials
pub const NAA_PREFIX: &str = "600a0980";

/// Deterministic mapping between caller ids and backend names
pub trait NameScheme {
    /// Backend name for a caller id
    fn internal_name(&self, caller_id: &str) -> String;

    /// Caller id for a backend name this scheme emitted
    fn parse_internal_name(&self, backend_name: &str) -> Option<String>;
}

// =============================================================================
// Prefixed Names
// =============================================================================

/// `<prefix><id without hyphens>`, the scheme used by SAN volumes and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixedName {
    prefix: &'static str,
}

impl PrefixedName {
    pub const fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }

    /// Volume names: `opensds_<hex>`
    pub const fn volume() -> Self {
        Self::new(NAME_PREFIX)
    }

    /// Snapshot names: `opensds_snapshot_<hex>`
    pub const fn snapshot() -> Self {
        Self::new(SNAPSHOT_PREFIX)
    }
}

impl NameScheme for PrefixedName {
    fn internal_name(&self, caller_id: &str) -> String {
        let stripped: String = caller_id.chars().filter(|c| *c != '-').collect();
        format!("{}{}", self.prefix, stripped)
    }

    fn parse_internal_name(&self, backend_name: &str) -> Option<String> {
        let rest = backend_name.strip_prefix(self.prefix)?;
        if rest.is_empty() {
            return None;
        }

        if rest.len() == 32 && rest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(format!(
                "{}-{}-{}-{}-{}",
                &rest[0..8],
                &rest[8..12],
                &rest[12..16],
                &rest[16..20],
                &rest[20..32]
            ));
        }

        // Non-uuid ids only round-trip when they never carried a hyphen
        if rest.contains('-') {
            None
        } else {
            Some(rest.to_string())
        }
    }
}

// =============================================================================
// RBD Image Names
// =============================================================================

/// `OPENSDS:<name>:<uuid>` image names used on RBD pools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbdImageName {
    pub name: String,
    pub id: String,
}

impl RbdImageName {
    const PREFIX: &'static str = "OPENSDS";

    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    /// Parse an image name; anything not emitted by [`RbdImageName`] yields `None`
    pub fn parse(image: &str) -> Option<Self> {
        let mut parts = image.splitn(3, ':');
        let prefix = parts.next()?;
        let name = parts.next()?;
        let id = parts.next()?;

        if prefix != Self::PREFIX || name.is_empty() || id.is_empty() {
            return None;
        }
        if Uuid::parse_str(id).is_err() {
            return None;
        }

        Some(Self::new(name, id))
    }
}

impl std::fmt::Display for RbdImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", Self::PREFIX, self.name, self.id)
    }
}

// =============================================================================
// Derived Identities
// =============================================================================

/// Pool id: UUID v5 over the pool name in the OID namespace
pub fn pool_id(pool_name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, pool_name.as_bytes()).to_string()
}

/// NAA durable name from a LUN serial number
pub fn naa_from_serial(serial: &str) -> String {
    format!("{}{}", NAA_PREFIX, hex::encode(serial.as_bytes()))
}

/// LUN path inside a SAN volume
pub fn lun_path(volume_name: &str) -> String {
    format!("/vol/{}/lun0", volume_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "e1bb066c-5ce7-46eb-9336-25508cee9f71";

    #[test]
    fn test_prefixed_volume_name() {
        let scheme = PrefixedName::volume();
        let name = scheme.internal_name(ID);
        assert_eq!(name, "opensds_e1bb066c5ce746eb933625508cee9f71");
        assert_eq!(scheme.parse_internal_name(&name).as_deref(), Some(ID));
    }

    #[test]
    fn test_prefixed_round_trip() {
        let scheme = PrefixedName::snapshot();
        for n in [
            "opensds_snapshot_0123456789abcdef0123456789abcdef",
            "opensds_snapshot_legacy42",
        ] {
            let id = scheme.parse_internal_name(n).unwrap();
            assert_eq!(scheme.internal_name(&id), n);
        }
    }

    #[test]
    fn test_prefixed_rejects_foreign_names() {
        let scheme = PrefixedName::volume();
        assert_eq!(scheme.parse_internal_name("vol0"), None);
        assert_eq!(scheme.parse_internal_name("opensds_"), None);
        assert_eq!(scheme.parse_internal_name("opensds_a-b"), None);
    }

    #[test]
    fn test_rbd_image_name() {
        let image = RbdImageName::new("vol-42", ID);
        let text = image.to_string();
        assert_eq!(text, format!("OPENSDS:vol-42:{}", ID));

        let parsed = RbdImageName::parse(&text).unwrap();
        assert_eq!(parsed.name, "vol-42");
        assert_eq!(parsed.id, ID);

        assert_eq!(RbdImageName::parse("foo-bar"), None);
        assert_eq!(RbdImageName::parse("OPENSDS:vol-42:not-a-uuid"), None);
        assert_eq!(RbdImageName::parse("OTHER:vol-42:00000000-0000-0000-0000-000000000000"), None);
    }

    #[test]
    fn test_pool_id_is_stable() {
        assert_eq!(pool_id("pool-0"), pool_id("pool-0"));
        assert_ne!(pool_id("pool-0"), pool_id("pool-1"));
        assert_eq!(
            Uuid::parse_str(&pool_id("pool-0")).unwrap().get_version_num(),
            5
        );
    }

    #[test]
    fn test_naa_from_serial() {
        assert_eq!(naa_from_serial("AB"), "600a09804142");
        assert_eq!(lun_path("opensds_x"), "/vol/opensds_x/lun0");
    }
}
