//! Multus plumbing: a host-network daemonset per public network that plants
//! the secondary interface's network namespace into a well-known host file,
//! which the csi drivers enter via nsenter before mounting.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ExecAction, HostPathVolumeSource, PodSpec, PodTemplateSpec, Probe,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{api::Api, Client, ResourceExt};
use tracing::{debug, info};
use utils::{net_namespace_file_path, sanitize_metadata_name, MULTUS_FINALIZER, MULTUS_HOLDER_PREFIX};

use crate::{
    crd::CephCluster,
    csi::config::Settings,
    csi::driver::CsiDriverType,
    error::Result,
    k8sutil,
};

/// The pod annotation multus reads to attach the secondary network.
const MULTUS_NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// Where the kubelet plugin directory lives on the host.
const PLUGINS_HOST_PATH: &str = "/var/lib/kubelet/plugins";

/// The expected net namespace file paths, one per driver; reconcilers write
/// these into the tenant entries of a multus cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNamespacePaths {
    pub rbd: String,
    pub cephfs: String,
    pub nfs: String,
}

impl NetNamespacePaths {
    pub fn expected() -> Self {
        Self {
            rbd: net_namespace_file_path(CsiDriverType::Rbd.short_name()),
            cephfs: net_namespace_file_path(CsiDriverType::CephFs.short_name()),
            nfs: net_namespace_file_path(CsiDriverType::Nfs.short_name()),
        }
    }
}

/// The daemonset name derived from the public network selector. Namespaced
/// selectors like "rook-ceph/pub" are sanitised into a valid object name.
pub fn holder_daemonset_name(public_selector: &str) -> String {
    format!(
        "{MULTUS_HOLDER_PREFIX}-{}",
        sanitize_metadata_name(public_selector)
    )
}

/// Ensure the holder daemonset of a multus cluster and report the per-driver
/// net namespace file paths. Returns `None` when the cluster does not need
/// the holder (no multus, or no public network selector).
pub async fn plant(
    client: &Client,
    operator_namespace: &str,
    cluster: &CephCluster,
    settings: &Settings,
) -> Result<Option<NetNamespacePaths>> {
    if !cluster.spec.network.is_multus() {
        debug!("multus networking is not used, no network configuration necessary");
        return Ok(None);
    }
    let Some(public_selector) = cluster.spec.network.public_selector() else {
        info!("not performing multus configuration, public network not provided");
        return Ok(None);
    };

    let name = holder_daemonset_name(public_selector);
    let daemonset = holder_daemonset(&name, operator_namespace, public_selector, settings);

    let api: Api<DaemonSet> = Api::namespaced(client.clone(), operator_namespace);
    k8sutil::apply(&api, &name, &daemonset).await?;

    // hold the cluster until the daemonset is cleaned up
    if let Some(cluster_namespace) = cluster.metadata.namespace.as_deref() {
        let clusters: Api<CephCluster> = Api::namespaced(client.clone(), cluster_namespace);
        k8sutil::ensure_finalizer(&clusters, cluster, MULTUS_FINALIZER).await?;
    }

    Ok(Some(NetNamespacePaths::expected()))
}

/// Remove the holder daemonset of a cluster and release the multus finalizer.
/// Also used when multus is disabled after having been enabled.
pub async fn teardown(
    client: &Client,
    operator_namespace: &str,
    cluster: &CephCluster,
) -> Result<()> {
    if let Some(public_selector) = cluster.spec.network.public_selector() {
        let api: Api<DaemonSet> = Api::namespaced(client.clone(), operator_namespace);
        k8sutil::delete_ignore_not_found(&api, &holder_daemonset_name(public_selector)).await?;
    }

    if let Some(cluster_namespace) = cluster.metadata.namespace.as_deref() {
        let clusters: Api<CephCluster> = Api::namespaced(client.clone(), cluster_namespace);
        k8sutil::remove_finalizer(&clusters, &cluster.name_any(), MULTUS_FINALIZER).await?;
    }
    Ok(())
}

/// The holder pod joins the secondary network through the multus annotation
/// and bind-mounts its own network namespace onto the per-driver files. The
/// readiness probe gates on the files existing, so the csi drivers never see
/// a half-planted namespace.
fn holder_daemonset(
    name: &str,
    namespace: &str,
    public_selector: &str,
    settings: &Settings,
) -> DaemonSet {
    let paths = NetNamespacePaths::expected();
    let plant_script = format!(
        "set -e\n\
         for f in {rbd} {cephfs} {nfs}; do\n\
           touch \"$f\"\n\
           mount --bind /proc/self/ns/net \"$f\"\n\
         done\n\
         exec sleep infinity\n",
        rbd = paths.rbd,
        cephfs = paths.cephfs,
        nfs = paths.nfs,
    );
    let readiness_script = format!("mountpoint -q {}", paths.rbd);

    let mut labels = BTreeMap::new();
    labels.insert(utils::APP_ATTR.to_string(), name.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        MULTUS_NETWORKS_ANNOTATION.to_string(),
        public_selector.to_string(),
    );

    let container = Container {
        name: "holder".to_string(),
        image: Some(settings.multus_pause_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), plant_script]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    readiness_script,
                ]),
            }),
            period_seconds: Some(5),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "plugins".to_string(),
            mount_path: PLUGINS_HOST_PATH.to_string(),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        host_network: Some(true),
        containers: vec![container],
        tolerations: (!settings.plugin_tolerations.is_empty())
            .then(|| settings.plugin_tolerations.clone()),
        affinity: settings.plugin_node_affinity.clone().map(|node_affinity| Affinity {
            node_affinity: Some(node_affinity),
            ..Default::default()
        }),
        volumes: Some(vec![Volume {
            name: "plugins".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: PLUGINS_HOST_PATH.to_string(),
                type_: Some("Directory".to_string()),
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    DaemonSet {
        metadata: {
            let mut meta = k8sutil::object_meta(name, namespace, None);
            meta.labels.get_or_insert_with(Default::default).extend(labels.clone());
            meta
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(kube::core::ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn multus_settings() -> Settings {
        Settings::from_map(&Map::new())
    }

    #[test]
    fn daemonset_name_is_sanitised() {
        assert_eq!(
            holder_daemonset_name("rook-ceph/pub"),
            "csi-multus-rook-ceph-pub"
        );
    }

    #[test]
    fn holder_pod_attaches_the_public_network() {
        let ds = holder_daemonset(
            "csi-multus-rook-ceph-pub",
            "rook-ceph",
            "rook-ceph/pub",
            &multus_settings(),
        );
        let template = ds.spec.as_ref().unwrap().template.clone();
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get(MULTUS_NETWORKS_ANNOTATION).map(String::as_str),
            Some("rook-ceph/pub")
        );
        let spec = template.spec.unwrap();
        assert_eq!(spec.host_network, Some(true));
        // the plant script writes every driver's namespace file
        let script = &spec.containers[0].command.as_ref().unwrap()[2];
        assert!(script.contains("/var/lib/kubelet/plugins/ns-rbd.ns"));
        assert!(script.contains("/var/lib/kubelet/plugins/ns-cephfs.ns"));
        assert!(script.contains("/var/lib/kubelet/plugins/ns-nfs.ns"));
    }

    #[test]
    fn expected_paths_match_the_plant_script() {
        let paths = NetNamespacePaths::expected();
        assert_eq!(paths.cephfs, "/var/lib/kubelet/plugins/ns-cephfs.ns");
    }
}
