//! Parsing of the operator settings map into one immutable [`Settings`]
//! value. Every key parses with a default: a bad value is a logged warning,
//! never a failed reconcile.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeAffinity, ResourceRequirements, Toleration};
use serde::Deserialize;
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::warn;
use utils::{
    DEFAULT_ADDONS_IMAGE, DEFAULT_ATTACHER_IMAGE, DEFAULT_CEPHFS_GRPC_METRICS_PORT,
    DEFAULT_CEPHFS_LIVENESS_METRICS_PORT, DEFAULT_CSI_PLUGIN_IMAGE, DEFAULT_PROVISIONER_IMAGE,
    DEFAULT_RBD_GRPC_METRICS_PORT, DEFAULT_RBD_LIVENESS_METRICS_PORT, DEFAULT_REGISTRAR_IMAGE,
    DEFAULT_RESIZER_IMAGE, DEFAULT_SNAPSHOTTER_IMAGE,
};

/// The default multus pause image planted into the host network namespace.
const DEFAULT_MULTUS_PAUSE_IMAGE: &str = "registry.k8s.io/pause:3.9";

/// The recognised settings-map keys.
#[derive(AsRefStr, EnumString, Display, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    #[strum(serialize = "ROOK_CSI_ENABLE_RBD")]
    EnableRbd,
    #[strum(serialize = "ROOK_CSI_ENABLE_CEPHFS")]
    EnableCephFs,
    #[strum(serialize = "ROOK_CSI_ENABLE_NFS")]
    EnableNfs,
    #[strum(serialize = "ROOK_CSI_ALLOW_UNSUPPORTED_VERSION")]
    AllowUnsupportedVersion,
    #[strum(serialize = "ROOK_USE_CSI_OPERATOR")]
    UseCsiOperator,
    #[strum(serialize = "ROOK_CSI_CEPH_IMAGE")]
    PluginImage,
    #[strum(serialize = "ROOK_CSI_REGISTRAR_IMAGE")]
    RegistrarImage,
    #[strum(serialize = "ROOK_CSI_PROVISIONER_IMAGE")]
    ProvisionerImage,
    #[strum(serialize = "ROOK_CSI_ATTACHER_IMAGE")]
    AttacherImage,
    #[strum(serialize = "ROOK_CSI_SNAPSHOTTER_IMAGE")]
    SnapshotterImage,
    #[strum(serialize = "ROOK_CSI_RESIZER_IMAGE")]
    ResizerImage,
    #[strum(serialize = "ROOK_CSIADDONS_IMAGE")]
    AddonsImage,
    #[strum(serialize = "ROOK_CSI_MULTUS_PAUSE_IMAGE")]
    MultusPauseImage,
    #[strum(serialize = "CSI_PROVISIONER_REPLICAS")]
    ProvisionerReplicas,
    #[strum(serialize = "CSI_RBD_GRPC_METRICS_PORT")]
    RbdGrpcMetricsPort,
    #[strum(serialize = "CSI_RBD_LIVENESS_METRICS_PORT")]
    RbdLivenessMetricsPort,
    #[strum(serialize = "CSI_CEPHFS_GRPC_METRICS_PORT")]
    CephFsGrpcMetricsPort,
    #[strum(serialize = "CSI_CEPHFS_LIVENESS_METRICS_PORT")]
    CephFsLivenessMetricsPort,
    #[strum(serialize = "CSI_FORCE_CEPHFS_KERNEL_CLIENT")]
    ForceCephFsKernelClient,
    #[strum(serialize = "CSI_LOG_LEVEL")]
    LogLevel,
    #[strum(serialize = "CSI_PLUGIN_TOLERATIONS")]
    PluginTolerations,
    #[strum(serialize = "CSI_PLUGIN_NODE_AFFINITY")]
    PluginNodeAffinity,
    #[strum(serialize = "CSI_PROVISIONER_TOLERATIONS")]
    ProvisionerTolerations,
    #[strum(serialize = "CSI_PROVISIONER_NODE_AFFINITY")]
    ProvisionerNodeAffinity,
    #[strum(serialize = "CSI_PLUGIN_PRIORITY_CLASSNAME")]
    PluginPriorityClassName,
    #[strum(serialize = "CSI_PROVISIONER_PRIORITY_CLASSNAME")]
    ProvisionerPriorityClassName,
    #[strum(serialize = "CSI_RBD_POD_LABELS")]
    RbdPodLabels,
    #[strum(serialize = "CSI_CEPHFS_POD_LABELS")]
    CephFsPodLabels,
    #[strum(serialize = "CSI_NFS_POD_LABELS")]
    NfsPodLabels,
    #[strum(serialize = "CSI_RBD_PLUGIN_RESOURCE")]
    RbdPluginResource,
    #[strum(serialize = "CSI_CEPHFS_PLUGIN_RESOURCE")]
    CephFsPluginResource,
    #[strum(serialize = "CSI_NFS_PLUGIN_RESOURCE")]
    NfsPluginResource,
    #[strum(serialize = "CSI_ENABLE_HOST_NETWORK")]
    EnableHostNetwork,
    #[strum(serialize = "CSI_ENABLE_CSI_ENCRYPTION")]
    EnableEncryption,
    #[strum(serialize = "CSI_ENABLE_OMAP_GENERATOR")]
    EnableOmapGenerator,
    #[strum(serialize = "CSI_ENABLE_METADATA")]
    EnableMetadata,
    #[strum(serialize = "CSI_RBD_ATTACH_REQUIRED")]
    RbdAttachRequired,
    #[strum(serialize = "CSI_CEPHFS_ATTACH_REQUIRED")]
    CephFsAttachRequired,
    #[strum(serialize = "CSI_NFS_ATTACH_REQUIRED")]
    NfsAttachRequired,
    #[strum(serialize = "CSI_RBD_FSGROUPPOLICY")]
    RbdFsGroupPolicy,
    #[strum(serialize = "CSI_CEPHFS_FSGROUPPOLICY")]
    CephFsFsGroupPolicy,
    #[strum(serialize = "CSI_NFS_FSGROUPPOLICY")]
    NfsFsGroupPolicy,
}

impl Setting {
    fn raw<'a>(&self, data: &'a BTreeMap<String, String>) -> Option<&'a str> {
        data.get(self.as_ref()).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn string(&self, data: &BTreeMap<String, String>, default: &str) -> String {
        self.raw(data).unwrap_or(default).to_string()
    }

    fn bool(&self, data: &BTreeMap<String, String>, default: bool) -> bool {
        match self.raw(data) {
            None => default,
            Some(value) => value.parse::<bool>().unwrap_or_else(|_| {
                warn!(key = %self, %value, "not a boolean, using default {default}");
                default
            }),
        }
    }

    fn u8(&self, data: &BTreeMap<String, String>, default: u8) -> u8 {
        match self.raw(data) {
            None => default,
            Some(value) => value.parse::<u8>().unwrap_or_else(|_| {
                warn!(key = %self, %value, "not a number in 0-255, using default {default}");
                default
            }),
        }
    }

    /// Ports above 65535 and non-numeric values fall back to the default.
    fn port(&self, data: &BTreeMap<String, String>, default: u16) -> u16 {
        match self.raw(data) {
            None => default,
            Some(value) => match value.parse::<u64>() {
                Ok(port) if port <= u16::MAX as u64 => port as u16,
                _ => {
                    warn!(key = %self, %value, "not a valid port, using default {default}");
                    default
                }
            },
        }
    }

    /// A YAML fragment; a parse error yields the provided default.
    fn yaml<T>(&self, data: &BTreeMap<String, String>, default: T) -> T
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.raw(data) {
            None => default,
            Some(value) => match serde_yaml::from_str(value) {
                Ok(parsed) => parsed,
                Err(error) => {
                    warn!(key = %self, %error, "failed to parse yaml fragment, using default");
                    default
                }
            },
        }
    }

    /// Comma-separated `key=value` pairs; malformed pairs are skipped.
    fn labels(&self, data: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        for pair in self.raw(data).unwrap_or_default().split(',') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((key, value)) => {
                    labels.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => warn!(key = %self, %pair, "label is not a key=value pair, skipping"),
            }
        }
        labels
    }
}

/// A named container resource fragment from `CSI_<DRIVER>_PLUGIN_RESOURCE`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContainerResource {
    pub name: String,
    #[serde(default)]
    pub resource: ResourceRequirements,
}

/// The images rendered into the driver workloads and the image-set map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentImages {
    pub plugin: String,
    pub registrar: String,
    pub provisioner: String,
    pub attacher: String,
    pub snapshotter: String,
    pub resizer: String,
    pub addons: String,
}

/// All operator settings, assembled once per reconcile and passed by
/// reference. Nothing mutates this after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub enable_rbd: bool,
    pub enable_cephfs: bool,
    pub enable_nfs: bool,
    pub allow_unsupported_version: bool,
    /// Delegate driver management to the external csi operator.
    pub csi_operator: bool,
    pub images: ComponentImages,
    pub multus_pause_image: String,
    pub provisioner_replicas: u8,
    pub rbd_grpc_metrics_port: u16,
    pub rbd_liveness_metrics_port: u16,
    pub cephfs_grpc_metrics_port: u16,
    pub cephfs_liveness_metrics_port: u16,
    pub force_cephfs_kernel_client: bool,
    pub log_level: u8,
    pub plugin_tolerations: Vec<Toleration>,
    pub plugin_node_affinity: Option<NodeAffinity>,
    pub provisioner_tolerations: Vec<Toleration>,
    pub provisioner_node_affinity: Option<NodeAffinity>,
    pub plugin_priority_class_name: Option<String>,
    pub provisioner_priority_class_name: Option<String>,
    pub rbd_pod_labels: BTreeMap<String, String>,
    pub cephfs_pod_labels: BTreeMap<String, String>,
    pub nfs_pod_labels: BTreeMap<String, String>,
    pub rbd_plugin_resources: Vec<ContainerResource>,
    pub cephfs_plugin_resources: Vec<ContainerResource>,
    pub nfs_plugin_resources: Vec<ContainerResource>,
    pub enable_host_network: bool,
    pub enable_encryption: bool,
    pub enable_omap_generator: bool,
    pub enable_metadata: bool,
    pub rbd_attach_required: bool,
    pub cephfs_attach_required: bool,
    pub nfs_attach_required: bool,
    pub rbd_fs_group_policy: String,
    pub cephfs_fs_group_policy: String,
    pub nfs_fs_group_policy: String,
}

impl Settings {
    /// Parse the settings map. `data` is the operator config map's data; an
    /// absent map parses the same as an empty one.
    pub fn from_map(data: &BTreeMap<String, String>) -> Settings {
        Settings {
            enable_rbd: Setting::EnableRbd.bool(data, true),
            enable_cephfs: Setting::EnableCephFs.bool(data, true),
            enable_nfs: Setting::EnableNfs.bool(data, false),
            allow_unsupported_version: Setting::AllowUnsupportedVersion.bool(data, false),
            csi_operator: Setting::UseCsiOperator.bool(data, false),
            images: ComponentImages {
                plugin: Setting::PluginImage.string(data, DEFAULT_CSI_PLUGIN_IMAGE),
                registrar: Setting::RegistrarImage.string(data, DEFAULT_REGISTRAR_IMAGE),
                provisioner: Setting::ProvisionerImage.string(data, DEFAULT_PROVISIONER_IMAGE),
                attacher: Setting::AttacherImage.string(data, DEFAULT_ATTACHER_IMAGE),
                snapshotter: Setting::SnapshotterImage.string(data, DEFAULT_SNAPSHOTTER_IMAGE),
                resizer: Setting::ResizerImage.string(data, DEFAULT_RESIZER_IMAGE),
                addons: Setting::AddonsImage.string(data, DEFAULT_ADDONS_IMAGE),
            },
            multus_pause_image: Setting::MultusPauseImage
                .string(data, DEFAULT_MULTUS_PAUSE_IMAGE),
            provisioner_replicas: Setting::ProvisionerReplicas.u8(data, 2),
            rbd_grpc_metrics_port: Setting::RbdGrpcMetricsPort
                .port(data, DEFAULT_RBD_GRPC_METRICS_PORT),
            rbd_liveness_metrics_port: Setting::RbdLivenessMetricsPort
                .port(data, DEFAULT_RBD_LIVENESS_METRICS_PORT),
            cephfs_grpc_metrics_port: Setting::CephFsGrpcMetricsPort
                .port(data, DEFAULT_CEPHFS_GRPC_METRICS_PORT),
            cephfs_liveness_metrics_port: Setting::CephFsLivenessMetricsPort
                .port(data, DEFAULT_CEPHFS_LIVENESS_METRICS_PORT),
            // only the literal "false" selects the auto client
            force_cephfs_kernel_client: Setting::ForceCephFsKernelClient
                .string(data, "true")
                != "false",
            log_level: Setting::LogLevel.u8(data, 0),
            plugin_tolerations: Setting::PluginTolerations.yaml(data, Vec::new()),
            plugin_node_affinity: Setting::PluginNodeAffinity.yaml(data, None),
            provisioner_tolerations: Setting::ProvisionerTolerations.yaml(data, Vec::new()),
            provisioner_node_affinity: Setting::ProvisionerNodeAffinity.yaml(data, None),
            plugin_priority_class_name: Setting::PluginPriorityClassName
                .raw(data)
                .map(String::from),
            provisioner_priority_class_name: Setting::ProvisionerPriorityClassName
                .raw(data)
                .map(String::from),
            rbd_pod_labels: Setting::RbdPodLabels.labels(data),
            cephfs_pod_labels: Setting::CephFsPodLabels.labels(data),
            nfs_pod_labels: Setting::NfsPodLabels.labels(data),
            rbd_plugin_resources: Setting::RbdPluginResource.yaml(data, Vec::new()),
            cephfs_plugin_resources: Setting::CephFsPluginResource.yaml(data, Vec::new()),
            nfs_plugin_resources: Setting::NfsPluginResource.yaml(data, Vec::new()),
            enable_host_network: Setting::EnableHostNetwork.bool(data, true),
            enable_encryption: Setting::EnableEncryption.bool(data, false),
            enable_omap_generator: Setting::EnableOmapGenerator.bool(data, false),
            enable_metadata: Setting::EnableMetadata.bool(data, false),
            rbd_attach_required: Setting::RbdAttachRequired.bool(data, true),
            cephfs_attach_required: Setting::CephFsAttachRequired.bool(data, true),
            nfs_attach_required: Setting::NfsAttachRequired.bool(data, true),
            rbd_fs_group_policy: Setting::RbdFsGroupPolicy.string(data, "File"),
            cephfs_fs_group_policy: Setting::CephFsFsGroupPolicy.string(data, "File"),
            nfs_fs_group_policy: Setting::NfsFsGroupPolicy.string(data, "File"),
        }
    }
}

/// Load the operator settings map and parse it. A missing map yields the
/// defaults; the settings are not required for the operator to run.
pub async fn load_settings(
    client: &kube::Client,
    operator_namespace: &str,
) -> crate::error::Result<Settings> {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::Api;

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), operator_namespace);
    let data = match api.get(utils::OPERATOR_SETTING_CONFIGMAP_NAME).await {
        Ok(config_map) => config_map.data.unwrap_or_default(),
        Err(error) if crate::k8sutil::is_not_found(&error) => {
            tracing::debug!("operator settings map not found, using defaults");
            BTreeMap::new()
        }
        Err(error) => return Err(error.into()),
    };
    Ok(Settings::from_map(&data))
}

/// True for keys that feed the csi machinery; the settings-map watch admits
/// an event only when one of these changed.
pub fn is_csi_setting(key: &str) -> bool {
    key.starts_with("ROOK_CSI_") || key.starts_with("CSI_") || key == Setting::UseCsiOperator.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_from_empty_map() {
        let settings = Settings::from_map(&BTreeMap::new());
        assert!(settings.enable_rbd);
        assert!(settings.enable_cephfs);
        assert!(!settings.enable_nfs);
        assert!(!settings.allow_unsupported_version);
        assert!(!settings.csi_operator);
        assert_eq!(settings.provisioner_replicas, 2);
        assert_eq!(settings.rbd_grpc_metrics_port, 9090);
        assert!(settings.force_cephfs_kernel_client);
        assert_eq!(settings.rbd_fs_group_policy, "File");
    }

    #[test]
    fn port_above_u16_falls_back() {
        let settings = Settings::from_map(&map(&[
            ("CSI_RBD_GRPC_METRICS_PORT", "70000"),
            ("CSI_CEPHFS_GRPC_METRICS_PORT", "not-a-port"),
            ("CSI_RBD_LIVENESS_METRICS_PORT", "9999"),
        ]));
        assert_eq!(settings.rbd_grpc_metrics_port, 9090);
        assert_eq!(settings.cephfs_grpc_metrics_port, 9091);
        assert_eq!(settings.rbd_liveness_metrics_port, 9999);
    }

    #[test]
    fn only_literal_false_selects_auto_client() {
        let auto = Settings::from_map(&map(&[("CSI_FORCE_CEPHFS_KERNEL_CLIENT", "false")]));
        assert!(!auto.force_cephfs_kernel_client);
        let kernel = Settings::from_map(&map(&[("CSI_FORCE_CEPHFS_KERNEL_CLIENT", "no")]));
        assert!(kernel.force_cephfs_kernel_client);
    }

    #[test]
    fn pod_labels_parse_as_pairs() {
        let settings =
            Settings::from_map(&map(&[("CSI_RBD_POD_LABELS", "rbd-label=rbd-value, a=b")]));
        assert_eq!(
            settings.rbd_pod_labels.get("rbd-label"),
            Some(&"rbd-value".to_string())
        );
        assert_eq!(settings.rbd_pod_labels.get("a"), Some(&"b".to_string()));
        assert!(settings.cephfs_pod_labels.is_empty());
    }

    #[test]
    fn tolerations_parse_from_yaml() {
        let yaml = "- key: storage\n  operator: Exists\n  effect: NoSchedule\n";
        let settings = Settings::from_map(&map(&[("CSI_PLUGIN_TOLERATIONS", yaml)]));
        assert_eq!(settings.plugin_tolerations.len(), 1);
        assert_eq!(
            settings.plugin_tolerations[0].key.as_deref(),
            Some("storage")
        );
    }

    #[test]
    fn malformed_yaml_keeps_default() {
        let settings = Settings::from_map(&map(&[("CSI_PLUGIN_TOLERATIONS", ": not yaml [")]));
        assert!(settings.plugin_tolerations.is_empty());
    }

    #[test]
    fn csi_setting_prefixes() {
        assert!(is_csi_setting("ROOK_CSI_ENABLE_RBD"));
        assert!(is_csi_setting("CSI_LOG_LEVEL"));
        assert!(is_csi_setting("ROOK_USE_CSI_OPERATOR"));
        assert!(!is_csi_setting("ROOK_LOG_LEVEL"));
    }
}
