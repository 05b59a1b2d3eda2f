//! The resources handed to the external CSI operator in delegated mode, plus
//! the per-cluster connection CR. Group `csi.ceph.io`.

use std::collections::BTreeMap;

use ceph_port::ReadAffinity;
use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Summary of how to reach one Ceph cluster: monitor endpoints, the mirror
/// daemon count and read affinity.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "csi.ceph.io",
    version = "v1alpha1",
    kind = "CephConnection",
    plural = "cephconnections",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct CephConnectionSpec {
    /// Monitor endpoints in cluster-info insertion order.
    pub monitors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbd_mirror_daemon_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_affinity: Option<ReadAffinity>,
}

/// Defaults applied by the external CSI operator to every driver it manages.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "csi.ceph.io",
    version = "v1alpha1",
    kind = "OperatorConfig",
    plural = "operatorconfigs",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_spec_defaults: Option<DriverSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<OperatorLogSpec>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorLogSpec {
    #[serde(default)]
    pub verbosity: u8,
}

/// One managed csi driver; name is `<ns>.<driver>.csi.ceph.com`.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "csi.ceph.io",
    version = "v1alpha1",
    kind = "Driver",
    plural = "drivers",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSpec>,
    /// Reference to the image-set config map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_set: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cephfs_client_type: Option<CephFsClientType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<DriverEncryptionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_metadata: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_omap_info: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_plugin: Option<NodePluginSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_plugin: Option<ControllerPluginSpec>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSpec {
    #[serde(default)]
    pub verbosity: u8,
}

#[derive(
    Serialize, Deserialize, Debug, PartialEq, Clone, Copy, JsonSchema, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CephFsClientType {
    /// Always use the kernel client.
    Kernel,
    /// Let the driver choose between kernel and fuse.
    Autodetect,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverEncryptionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<LocalObjectReference>,
}

/// Pod attributes shared by node and controller plugins.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodCommonSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePluginSpec {
    #[serde(flatten)]
    pub common: PodCommonSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_selinux_host_mount: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControllerPluginSpec {
    #[serde(flatten)]
    pub common: PodCommonSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
}

/// Maps a tenant (cluster ID) to its connection and per-driver options in
/// delegated mode; external-mode tenants are published through this CR.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "csi.ceph.io",
    version = "v1alpha1",
    kind = "ClientProfile",
    plural = "clientprofiles",
    namespaced,
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfileSpec {
    pub ceph_connection_ref: LocalObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cephfs: Option<ClientProfileCephFs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbd: Option<ClientProfileRbd>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfileCephFs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subvolume_group: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfileRbd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rados_namespace: Option<String>,
}
