//! This crate is the seam between the CSI control plane and a Ceph cluster.
//! The operator only ever talks to Ceph through the [`CephClient`] capability
//! trait; loading cluster info, generating keys and running commands are all
//! behind it so the reconcilers stay testable without a live cluster.

mod client;
mod cluster_info;
mod error;
mod shell;

pub use client::{
    CephClient, MirrorPoolStatus, MirroredImages, PoolMirrorInfo, RadosNamespaceMirroring,
    SnapshotSchedule,
};
pub use cluster_info::{CephFsOptions, ClusterInfo, CsiDriverOptions, MonInfo, ReadAffinity};
pub use error::{CephError, Result};
pub use shell::CephShellClient;
