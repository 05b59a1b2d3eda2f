use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Phase;

/// A cephfs subvolume group: the cephfs flavour of a tenant.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephFilesystemSubVolumeGroup",
    plural = "cephfilesystemsubvolumegroups",
    namespaced,
    status = "CephFilesystemSubVolumeGroupStatus",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{ "name":"filesystem", "type":"string", "description":"filesystem the group lives in", "jsonPath":".spec.filesystemName"}"#,
    printcolumn = r#"{ "name":"phase", "type":"string", "description":"reconcile phase", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CephFilesystemSubVolumeGroupSpec {
    /// The filesystem the group is created in.
    pub filesystem_name: String,
    /// The group name inside Ceph; defaults to the CR name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MDS pinning policy; at most one flavour may be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinning: Option<SubVolumeGroupPinning>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubVolumeGroupPinning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random: Option<f64>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephFilesystemSubVolumeGroupStatus {
    #[serde(default)]
    pub phase: Phase,
    /// Derived values surfaced to consumers: the clusterID and the applied
    /// pinning string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub info: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CephFilesystemSubVolumeGroup {
    /// The Ceph-side group name: `spec.name` when set, the CR name otherwise.
    pub fn group_name(&self) -> String {
        match &self.spec.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl SubVolumeGroupPinning {
    /// More than one pinning flavour is a user error.
    pub fn validate(&self) -> Result<(), String> {
        let set = [
            self.export.is_some(),
            self.distributed.is_some(),
            self.random.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set > 1 {
            return Err("only one of export, distributed and random may be set".to_string());
        }
        Ok(())
    }

    /// The pinning expression passed to Ceph, e.g. "distributed=1".
    pub fn format(pinning: Option<&SubVolumeGroupPinning>) -> String {
        match pinning {
            Some(SubVolumeGroupPinning {
                export: Some(export),
                ..
            }) => format!("export={export}"),
            Some(SubVolumeGroupPinning {
                distributed: Some(distributed),
                ..
            }) => format!("distributed={distributed}"),
            Some(SubVolumeGroupPinning {
                random: Some(random),
                ..
            }) => format!("random={random:.2}"),
            _ => "distributed=1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinning_defaults_to_distributed() {
        assert_eq!(SubVolumeGroupPinning::format(None), "distributed=1");
        assert_eq!(
            SubVolumeGroupPinning::format(Some(&SubVolumeGroupPinning::default())),
            "distributed=1"
        );
    }

    #[test]
    fn pinning_formats() {
        let export = SubVolumeGroupPinning {
            export: Some(2),
            ..Default::default()
        };
        assert_eq!(SubVolumeGroupPinning::format(Some(&export)), "export=2");

        let random = SubVolumeGroupPinning {
            random: Some(0.5),
            ..Default::default()
        };
        assert_eq!(SubVolumeGroupPinning::format(Some(&random)), "random=0.50");
    }

    #[test]
    fn at_most_one_pinning_flavour() {
        let both = SubVolumeGroupPinning {
            export: Some(1),
            distributed: Some(1),
            random: None,
        };
        assert!(both.validate().is_err());
        assert!(SubVolumeGroupPinning::default().validate().is_ok());
    }
}
