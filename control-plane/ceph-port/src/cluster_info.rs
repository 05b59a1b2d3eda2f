use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utils::{MSGR1_PORT, MSGR2_PORT};

/// A single monitor of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonInfo {
    /// The mon daemon name, e.g. "a".
    pub name: String,
    /// The mon endpoint as `ip:port`.
    pub endpoint: String,
}

impl MonInfo {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Read affinity options advertised to the csi drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadAffinity {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crush_location_labels: Vec<String>,
}

/// CephFS mount options advertised to the csi drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephFsOptions {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_mount_options: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fuse_mount_options: String,
}

/// Per-cluster csi driver options carried on the cluster CR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CsiDriverOptions {
    #[serde(default)]
    pub read_affinity: ReadAffinity,
    #[serde(default)]
    pub cephfs: CephFsOptions,
}

/// Connection details of one Ceph cluster, loaded by the collaborator that
/// owns cluster bootstrap. The control plane consumes this read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Name of the owning cluster CR.
    pub name: String,
    /// Namespace the cluster runs in.
    pub namespace: String,
    /// The Ceph cluster fsid.
    pub fsid: String,
    /// Monitors in insertion order; order is preserved so that repeated
    /// reconciles render identical endpoint lists.
    pub monitors: IndexMap<String, MonInfo>,
    /// Csi driver options from the cluster spec.
    pub csi_driver_options: CsiDriverOptions,
    /// The cluster only accepts msgr2 connections.
    pub requires_msgr2: bool,
}

impl ClusterInfo {
    /// Monitor endpoints in insertion order. When the cluster requires msgr2,
    /// endpoints on the msgr1 port are rewritten to the msgr2 port.
    pub fn mon_endpoints(&self) -> Vec<String> {
        self.monitors
            .values()
            .map(|m| {
                let msgr1_suffix = format!(":{MSGR1_PORT}");
                match (self.requires_msgr2, m.endpoint.strip_suffix(&msgr1_suffix)) {
                    (true, Some(address)) => format!("{address}:{MSGR2_PORT}"),
                    _ => m.endpoint.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(requires_msgr2: bool) -> ClusterInfo {
        let mut monitors = IndexMap::new();
        monitors.insert("a".to_string(), MonInfo::new("a", "10.0.0.1:6789"));
        monitors.insert("b".to_string(), MonInfo::new("b", "10.0.0.2:3300"));
        ClusterInfo {
            name: "testCluster".into(),
            namespace: "test".into(),
            fsid: "5f1d3d7c-88cb-4b1c-b9fe-5b0b4f0e5a3c".into(),
            monitors,
            requires_msgr2,
            ..Default::default()
        }
    }

    #[test]
    fn endpoints_keep_insertion_order() {
        assert_eq!(
            info(false).mon_endpoints(),
            vec!["10.0.0.1:6789", "10.0.0.2:3300"]
        );
    }

    #[test]
    fn msgr1_ports_rewritten_when_msgr2_required() {
        assert_eq!(
            info(true).mon_endpoints(),
            vec!["10.0.0.1:3300", "10.0.0.2:3300"]
        );
    }
}
