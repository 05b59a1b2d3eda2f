use std::collections::BTreeMap;

use ceph_port::CsiDriverOptions;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The declarative description of one Ceph cluster. Only the fields this
/// control plane reads are modelled; the daemon topology belongs to the
/// cluster operator proper.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephCluster",
    plural = "cephclusters",
    namespaced,
    status = "CephClusterStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterSpec {
    /// Per-cluster csi driver options.
    #[serde(default)]
    pub csi: CsiDriverOptions,
    /// Cluster network configuration.
    #[serde(default)]
    pub network: NetworkSpec,
    /// Consume an externally managed Ceph cluster.
    #[serde(default)]
    pub external: ExternalSpec,
    /// Confirmation-gated data cleanup on cluster deletion.
    #[serde(default)]
    pub cleanup_policy: CleanupPolicySpec,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// The network provider, e.g. "multus". Empty means the default pod
    /// network.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    /// Selector per network role; the "public" selector names the attachment
    /// the csi drivers must reach the mons through.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selectors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<ConnectionsSpec>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionSpec>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalSpec {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPolicySpec {
    /// Must be set to "yes-really-destroy-data" for the cleanup to run.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub confirmation: String,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl NetworkSpec {
    /// True when the cluster attaches to a multus-provided network.
    pub fn is_multus(&self) -> bool {
        self.provider == "multus"
    }

    /// The public network selector; an empty string counts as unset.
    pub fn public_selector(&self) -> Option<&str> {
        self.selectors
            .get("public")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// True when encryption is requested on cluster connections.
    pub fn encryption_enabled(&self) -> bool {
        self.connections
            .as_ref()
            .and_then(|c| c.encryption.as_ref())
            .map(|e| e.enabled)
            .unwrap_or(false)
    }
}

impl CleanupPolicySpec {
    /// The cleanup only runs with the literal confirmation value.
    pub fn has_data_dir_clean_policy(&self) -> bool {
        self.confirmation == "yes-really-destroy-data"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_selector_empty_is_unset() {
        let mut network = NetworkSpec {
            provider: "multus".into(),
            ..Default::default()
        };
        assert!(network.is_multus());
        assert_eq!(network.public_selector(), None);

        network
            .selectors
            .insert("public".into(), "rook-ceph/pub".into());
        assert_eq!(network.public_selector(), Some("rook-ceph/pub"));
    }

    #[test]
    fn cleanup_needs_the_exact_confirmation() {
        let policy = CleanupPolicySpec {
            confirmation: "yes".into(),
        };
        assert!(!policy.has_data_dir_clean_policy());
        let policy = CleanupPolicySpec {
            confirmation: "yes-really-destroy-data".into(),
        };
        assert!(policy.has_data_dir_clean_policy());
    }
}
