//! Delegated mode: one OperatorConfig CR with the shared driver defaults and
//! one Driver CR per enabled driver kind, consumed by the external csi
//! operator.

use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference};
use kube::{api::Api, Client, ResourceExt};
use tracing::debug;
use utils::{CSI_IMAGE_SET_CONFIGMAP_NAME, CSI_OPERATOR_CONFIG_CR_NAME};

use super::CsiDriverType;
use crate::{
    crd::{
        csiop::{
            CephFsClientType, ControllerPluginSpec, DriverEncryptionSpec, LogSpec, NodePluginSpec,
            OperatorLogSpec, PodCommonSpec,
        },
        CephCluster, Driver, DriverSpec, OperatorConfig, OperatorConfigSpec,
    },
    csi::config::Settings,
    error::Result,
    k8sutil,
};

/// The pod annotation multus reads to attach the secondary network.
const MULTUS_NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

fn affinity(settings_affinity: Option<&k8s_openapi::api::core::v1::NodeAffinity>) -> Option<Affinity> {
    settings_affinity.map(|node_affinity| Affinity {
        node_affinity: Some(node_affinity.clone()),
        ..Default::default()
    })
}

/// The driver defaults shared by every driver CR.
pub fn render_operator_config(
    operator_namespace: &str,
    settings: &Settings,
    cluster: &CephCluster,
) -> OperatorConfig {
    let cephfs_client_type = if settings.force_cephfs_kernel_client {
        CephFsClientType::Kernel
    } else {
        CephFsClientType::Autodetect
    };

    let defaults = DriverSpec {
        log: Some(LogSpec {
            verbosity: settings.log_level,
        }),
        image_set: Some(LocalObjectReference {
            name: Some(CSI_IMAGE_SET_CONFIGMAP_NAME.to_string()),
        }),
        cluster_name: Some(cluster.name_any()),
        cephfs_client_type: Some(cephfs_client_type),
        encryption: cluster
            .spec
            .network
            .encryption_enabled()
            .then(DriverEncryptionSpec::default),
        enable_metadata: Some(settings.enable_metadata),
        generate_omap_info: Some(settings.enable_omap_generator),
        node_plugin: Some(NodePluginSpec {
            common: PodCommonSpec {
                priority_class_name: settings.plugin_priority_class_name.clone(),
                affinity: affinity(settings.plugin_node_affinity.as_ref()),
                tolerations: settings.plugin_tolerations.clone(),
                ..Default::default()
            },
            enable_selinux_host_mount: Some(false),
            host_network: None,
        }),
        controller_plugin: Some(ControllerPluginSpec {
            common: PodCommonSpec {
                priority_class_name: settings.provisioner_priority_class_name.clone(),
                affinity: affinity(settings.provisioner_node_affinity.as_ref()),
                tolerations: settings.provisioner_tolerations.clone(),
                ..Default::default()
            },
            replicas: Some(settings.provisioner_replicas as i32),
            host_network: None,
        }),
        ..Default::default()
    };

    let mut operator_config = OperatorConfig::new(
        CSI_OPERATOR_CONFIG_CR_NAME,
        OperatorConfigSpec {
            driver_spec_defaults: Some(defaults),
            log: Some(OperatorLogSpec {
                verbosity: settings.log_level,
            }),
        },
    );
    operator_config.metadata.namespace = Some(operator_namespace.to_string());
    operator_config
}

/// One Driver CR. The multus annotation goes on the controller plugin only:
/// the node plugin enters the planted host namespace and needs no attachment
/// of its own.
pub fn render_driver(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
    cluster: &CephCluster,
) -> Driver {
    let labels = driver.pod_labels(settings).clone();

    let mut controller_annotations = std::collections::BTreeMap::new();
    if cluster.spec.network.is_multus() {
        if let Some(public_selector) = cluster.spec.network.public_selector() {
            controller_annotations
                .insert(MULTUS_NETWORKS_ANNOTATION.to_string(), public_selector.to_string());
        }
    }

    let spec = DriverSpec {
        attach_required: Some(driver.attach_required(settings)),
        fs_group_policy: Some(driver.fs_group_policy(settings).to_string()),
        node_plugin: Some(NodePluginSpec {
            common: PodCommonSpec {
                labels: labels.clone(),
                ..Default::default()
            },
            enable_selinux_host_mount: None,
            host_network: settings.enable_host_network.then_some(true),
        }),
        controller_plugin: Some(ControllerPluginSpec {
            common: PodCommonSpec {
                labels,
                annotations: controller_annotations,
                ..Default::default()
            },
            replicas: None,
            host_network: None,
        }),
        ..Default::default()
    };

    let mut cr = Driver::new(&driver.full_name(operator_namespace), spec);
    cr.metadata.namespace = Some(operator_namespace.to_string());
    cr
}

/// Create or update the OperatorConfig and every enabled Driver CR, and
/// remove the Driver CRs of disabled kinds.
pub async fn configure_drivers(
    client: &Client,
    operator_namespace: &str,
    settings: &Settings,
    cluster: &CephCluster,
) -> Result<()> {
    let operator_configs: Api<OperatorConfig> =
        Api::namespaced(client.clone(), operator_namespace);
    let operator_config = render_operator_config(operator_namespace, settings, cluster);
    k8sutil::apply(&operator_configs, CSI_OPERATOR_CONFIG_CR_NAME, &operator_config).await?;

    let drivers: Api<Driver> = Api::namespaced(client.clone(), operator_namespace);
    for driver in CsiDriverType::ALL {
        let name = driver.full_name(operator_namespace);
        if driver.enabled(settings) {
            debug!(driver = %name, "configuring delegated csi driver");
            let cr = render_driver(driver, operator_namespace, settings, cluster);
            k8sutil::apply(&drivers, &name, &cr).await?;
        } else {
            k8sutil::delete_ignore_not_found(&drivers, &name).await?;
        }
    }
    Ok(())
}

/// Remove every delegated-mode object; used when no cluster exists any more.
pub async fn teardown_drivers(client: &Client, operator_namespace: &str) -> Result<()> {
    let drivers: Api<Driver> = Api::namespaced(client.clone(), operator_namespace);
    for driver in CsiDriverType::ALL {
        k8sutil::delete_ignore_not_found(&drivers, &driver.full_name(operator_namespace)).await?;
    }
    let operator_configs: Api<OperatorConfig> =
        Api::namespaced(client.clone(), operator_namespace);
    k8sutil::delete_ignore_not_found(&operator_configs, CSI_OPERATOR_CONFIG_CR_NAME).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CephClusterSpec;
    use std::collections::BTreeMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_map(
            &pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn cluster(multus: bool) -> CephCluster {
        let mut spec = CephClusterSpec::default();
        if multus {
            spec.network.provider = "multus".into();
            spec.network
                .selectors
                .insert("public".into(), "rook-ceph/pub".into());
        }
        let mut cluster = CephCluster::new("testCluster", spec);
        cluster.metadata.namespace = Some("test".into());
        cluster
    }

    #[test]
    fn driver_labels_propagate_to_both_plugins() {
        let settings = settings(&[
            ("CSI_RBD_POD_LABELS", "rbd-label=rbd-value"),
            ("CSI_CEPHFS_POD_LABELS", "cephfs-label=cephfs-value"),
        ]);
        let driver = render_driver(CsiDriverType::Rbd, "test", &settings, &cluster(false));
        assert_eq!(driver.metadata.name.as_deref(), Some("test.rbd.csi.ceph.com"));

        let node_labels = &driver.spec.node_plugin.as_ref().unwrap().common.labels;
        let controller_labels = &driver.spec.controller_plugin.as_ref().unwrap().common.labels;
        for labels in [node_labels, controller_labels] {
            assert_eq!(labels.get("rbd-label").map(String::as_str), Some("rbd-value"));
            assert!(!labels.contains_key("cephfs-label"));
        }
    }

    #[test]
    fn multus_annotation_only_on_controller_plugin() {
        let driver = render_driver(CsiDriverType::Rbd, "test", &settings(&[]), &cluster(true));
        let controller = driver.spec.controller_plugin.as_ref().unwrap();
        assert_eq!(
            controller.common.annotations.get(MULTUS_NETWORKS_ANNOTATION).map(String::as_str),
            Some("rook-ceph/pub")
        );
        let node = driver.spec.node_plugin.as_ref().unwrap();
        assert!(node.common.annotations.is_empty());
    }

    #[test]
    fn operator_config_encodes_the_shared_defaults() {
        let settings = settings(&[
            ("CSI_LOG_LEVEL", "5"),
            ("CSI_FORCE_CEPHFS_KERNEL_CLIENT", "false"),
            ("CSI_PROVISIONER_REPLICAS", "1"),
        ]);
        let config = render_operator_config("rook-ceph", &settings, &cluster(false));
        let defaults = config.spec.driver_spec_defaults.unwrap();
        assert_eq!(defaults.log.unwrap().verbosity, 5);
        assert_eq!(
            defaults.image_set.unwrap().name.as_deref(),
            Some(utils::CSI_IMAGE_SET_CONFIGMAP_NAME)
        );
        assert_eq!(defaults.cluster_name.as_deref(), Some("testCluster"));
        assert!(matches!(
            defaults.cephfs_client_type,
            Some(CephFsClientType::Autodetect)
        ));
        assert_eq!(
            defaults.controller_plugin.unwrap().replicas,
            Some(1)
        );
    }

    #[test]
    fn encryption_follows_the_cluster_spec() {
        let mut encrypted = cluster(false);
        encrypted.spec.network.connections = Some(crate::crd::cluster::ConnectionsSpec {
            encryption: Some(crate::crd::cluster::EncryptionSpec { enabled: true }),
        });
        let config = render_operator_config("rook-ceph", &settings(&[]), &encrypted);
        assert!(config.spec.driver_spec_defaults.unwrap().encryption.is_some());

        let config = render_operator_config("rook-ceph", &settings(&[]), &cluster(false));
        assert!(config.spec.driver_spec_defaults.unwrap().encryption.is_none());
    }

    #[test]
    fn disabled_settings_fall_back_to_defaults() {
        let config = render_operator_config("rook-ceph", &Settings::from_map(&BTreeMap::new()), &cluster(false));
        let defaults = config.spec.driver_spec_defaults.unwrap();
        assert!(matches!(
            defaults.cephfs_client_type,
            Some(CephFsClientType::Kernel)
        ));
        assert_eq!(defaults.enable_metadata, Some(false));
    }
}
