use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ClusterInfo, Result};

/// Mirroring mode of a pool or rados namespace.
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
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RadosNamespaceMirroring {
    /// Mirroring is off.
    #[default]
    Disabled,
    /// Individual images are mirrored on request.
    Image,
    /// Every image in the pool/namespace is mirrored.
    Pool,
}

/// Mirroring state of a pool as reported by Ceph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMirrorInfo {
    /// The mode the pool is mirrored with.
    pub mode: RadosNamespaceMirroring,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

impl PoolMirrorInfo {
    /// True when the owning pool has mirroring off.
    pub fn disabled(&self) -> bool {
        self.mode == RadosNamespaceMirroring::Disabled
    }
}

/// The mirrored images of a pool/namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredImages {
    #[serde(default)]
    pub images: Vec<String>,
}

impl MirroredImages {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// One snapshot schedule entry: an interval and an optional start time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSchedule {
    /// Schedule interval, e.g. "4h".
    pub interval: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

/// Mirror status summary for one pool/namespace, written into CR status by
/// the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MirrorPoolStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub health: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub daemon_health: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_health: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub states: std::collections::BTreeMap<String, u32>,
}

/// The Ceph capability consumed by the CSI control plane.
///
/// Implementations run the actual `ceph`/`rbd` commands; the reconcilers only
/// depend on this trait.
#[async_trait::async_trait]
pub trait CephClient: Send + Sync {
    /// Load the connection details of the cluster in `namespace`.
    /// Fails with `UninitializedConfig` while the mons have no quorum.
    async fn load_cluster_info(&self, namespace: &str) -> Result<ClusterInfo>;

    /// Get or create the key for `user` with the given capability pairs,
    /// e.g. `[("mon", "profile rbd"), ("osd", "profile rbd")]`.
    async fn auth_get_or_create_key(
        &self,
        user: &str,
        caps: &[(String, String)],
    ) -> Result<String>;

    /// Create a cephfs subvolume group in the named filesystem.
    async fn create_cephfs_subvolume_group(&self, fs_name: &str, group_name: &str) -> Result<()>;

    /// Delete a cephfs subvolume group. `NotEmpty` when subvolumes remain.
    async fn delete_cephfs_subvolume_group(&self, fs_name: &str, group_name: &str) -> Result<()>;

    /// Apply a pinning policy, e.g. "distributed=1", to a subvolume group.
    async fn pin_cephfs_subvolume_group(
        &self,
        fs_name: &str,
        group_name: &str,
        pinning: &str,
    ) -> Result<()>;

    /// Create a rados namespace in the named pool. The empty string is the
    /// implicit namespace and is never created explicitly.
    async fn create_rados_namespace(&self, pool: &str, namespace: &str) -> Result<()>;

    /// Delete a rados namespace. `NotEmpty` when images remain.
    async fn delete_rados_namespace(&self, pool: &str, namespace: &str) -> Result<()>;

    /// Mirroring state of the owning pool.
    async fn get_pool_mirroring_info(&self, pool: &str) -> Result<PoolMirrorInfo>;

    /// The images currently mirrored in the pool/namespace.
    async fn get_mirrored_pool_images(&self, pool: &str, namespace: &str)
        -> Result<MirroredImages>;

    /// Enable rbd mirroring on a rados namespace.
    async fn enable_rbd_rados_namespace_mirroring(
        &self,
        pool: &str,
        namespace: &str,
        remote_namespace: Option<&str>,
        mode: RadosNamespaceMirroring,
    ) -> Result<()>;

    /// Disable rbd mirroring on a rados namespace.
    async fn disable_rbd_rados_namespace_mirroring(&self, pool: &str, namespace: &str)
        -> Result<()>;

    /// Program the given snapshot schedules. Overwrites unconditionally;
    /// the operation is idempotent on the Ceph side.
    async fn enable_snapshot_schedules(
        &self,
        pool: &str,
        namespace: &str,
        schedules: &[SnapshotSchedule],
    ) -> Result<()>;

    /// Poll the mirror status summary of a pool/namespace.
    async fn get_mirror_status(&self, pool: &str, namespace: &str) -> Result<MirrorPoolStatus>;
}
