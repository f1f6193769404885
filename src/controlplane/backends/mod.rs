//! Storage Backend Drivers
//!
//! - Sample: in-memory driver for every family, the registry fallback
//! - ONTAP SAN: block volumes on a NetApp SVM
//! - Ceph: block volumes as RBD images
//! - ChubaoFS: file shares on a ChubaoFS cluster
//! - Host replication: replication tasks run by a host tool

pub mod ceph;
pub mod chubaofs;
pub mod hostrep;
pub mod ontap;
pub mod sample;

pub use ceph::CephDriver;
pub use chubaofs::ChubaoFsDriver;
pub use hostrep::HostReplicationDriver;
pub use ontap::OntapSanDriver;
pub use sample::SampleDriver;
