//! The custom resources this control plane watches and produces.

pub mod cluster;
pub mod csiop;
pub mod radosnamespace;
pub mod rbdmirror;
pub mod subvolumegroup;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cluster::{CephCluster, CephClusterSpec};
pub use csiop::{
    CephConnection, CephConnectionSpec, ClientProfile, ClientProfileSpec, Driver, DriverSpec,
    OperatorConfig, OperatorConfigSpec,
};
pub use radosnamespace::{
    CephBlockPoolRadosNamespace, CephBlockPoolRadosNamespaceSpec,
    CephBlockPoolRadosNamespaceStatus, MirroringSpec,
};
pub use rbdmirror::{CephRBDMirror, CephRBDMirrorSpec};
pub use subvolumegroup::{
    CephFilesystemSubVolumeGroup, CephFilesystemSubVolumeGroupSpec,
    CephFilesystemSubVolumeGroupStatus,
};

/// Phase of a reconciled tenant resource.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    strum_macros::Display,
)]
pub enum Phase {
    /// The resource was observed and work is under way.
    #[default]
    Progressing,
    /// The Ceph object exists and the config document entry is published.
    Ready,
    /// The last reconcile failed; `observed_generation` keeps its old value.
    Failure,
}
