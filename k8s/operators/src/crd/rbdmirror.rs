use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The rbd-mirror daemon deployment request; this control plane only reads
/// the daemon count of the first item in a namespace.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephRBDMirror",
    plural = "cephrbdmirrors",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct CephRBDMirrorSpec {
    /// Number of rbd-mirror daemons.
    pub count: i32,
}
