use std::collections::BTreeMap;

use ceph_port::{MirrorPoolStatus, RadosNamespaceMirroring, SnapshotSchedule};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utils::IMPLICIT_RADOS_NAMESPACE;

use super::Phase;

/// A rados namespace inside a block pool: the rbd flavour of a tenant.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephBlockPoolRadosNamespace",
    plural = "cephblockpoolradosnamespaces",
    namespaced,
    status = "CephBlockPoolRadosNamespaceStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{ "name":"pool", "type":"string", "description":"pool the namespace lives in", "jsonPath":".spec.blockPoolName"}"#,
    printcolumn = r#"{ "name":"phase", "type":"string", "description":"reconcile phase", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolRadosNamespaceSpec {
    /// The block pool the namespace is created in.
    pub block_pool_name: String,
    /// The namespace name inside Ceph; defaults to the CR name. The token
    /// "<implicit>" selects the pool's implicit (top-level) namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Rbd mirroring of this namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirroring: Option<MirroringSpec>,
    /// External-mode override of the derived cluster ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MirroringSpec {
    pub mode: RadosNamespaceMirroring,
    /// Namespace name on the remote site; defaults to the local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_schedules: Vec<SnapshotSchedule>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolRadosNamespaceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Mirror health, written by the status monitor while mirroring is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorHealthStatus>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MirrorHealthStatus {
    #[serde(default)]
    pub summary: MirrorPoolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<String>,
}

impl CephBlockPoolRadosNamespace {
    /// The Ceph-side namespace name: `spec.name` when set ("<implicit>" maps
    /// to the empty string), the CR name otherwise.
    pub fn rados_namespace_name(&self) -> String {
        match self.spec.name.as_deref() {
            Some(IMPLICIT_RADOS_NAMESPACE) => String::new(),
            Some(name) => name.to_string(),
            None => self.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Mirroring is requested by the spec.
    pub fn mirroring_enabled(&self) -> bool {
        self.spec.mirroring.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cr(spec_name: Option<&str>) -> CephBlockPoolRadosNamespace {
        let mut cr = CephBlockPoolRadosNamespace::new(
            "cr-name1",
            CephBlockPoolRadosNamespaceSpec {
                block_pool_name: "replicapool".into(),
                name: spec_name.map(String::from),
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("test".into());
        cr
    }

    #[test]
    fn name_defaults_to_cr_name() {
        assert_eq!(cr(None).rados_namespace_name(), "cr-name1");
    }

    #[test]
    fn explicit_name_wins() {
        assert_eq!(cr(Some("ns-a")).rados_namespace_name(), "ns-a");
    }

    #[test]
    fn implicit_token_maps_to_empty() {
        assert_eq!(cr(Some("<implicit>")).rados_namespace_name(), "");
    }
}
