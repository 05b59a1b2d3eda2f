//! Direct mode: the operator renders the driver workloads itself. Rendering
//! is deterministic: containers, volumes and env vars are emitted in a fixed
//! order so equal inputs produce byte-identical manifests.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, DeploymentStrategy, StatefulSet,
    StatefulSetSpec,
};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource,
    ObjectFieldSelector, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{api::Api, Client};
use tracing::{debug, info};

use super::CsiDriverType;
use crate::{
    csi::{config::Settings, version::CsiCapabilities},
    error::Result,
    k8sutil,
};

/// A user-provided ceph.conf overlay, mounted when the csi image supports it.
const CEPH_CONF_OVERRIDE_CONFIGMAP: &str = "csi-ceph-conf-override";

/// Kubernetes minor version from which the provisioner is a Deployment; older
/// servers get a StatefulSet.
const PROVISIONER_DEPLOYMENT_MIN_K8S_MINOR: u32 = 14;

/// The provisioner workload flavour for a server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerKind {
    Deployment,
    StatefulSet,
}

impl ProvisionerKind {
    pub fn for_k8s_minor(minor: u32) -> Self {
        if minor >= PROVISIONER_DEPLOYMENT_MIN_K8S_MINOR {
            ProvisionerKind::Deployment
        } else {
            ProvisionerKind::StatefulSet
        }
    }
}

fn pod_labels(driver: CsiDriverType, app: &str, settings: &Settings) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(utils::APP_ATTR.to_string(), app.to_string());
    labels.extend(driver.pod_labels(settings).clone());
    labels
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn value_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// The per-container resource requests configured for this driver.
fn resources_for(
    driver: CsiDriverType,
    container: &str,
    settings: &Settings,
) -> Option<ResourceRequirements> {
    driver
        .plugin_resources(settings)
        .iter()
        .find(|r| r.name == container)
        .map(|r| r.resource.clone())
}

fn registrar_container(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
) -> Container {
    let registration_path = format!(
        "/var/lib/kubelet/plugins/{}/csi.sock",
        driver.full_name(operator_namespace)
    );
    Container {
        name: "driver-registrar".to_string(),
        image: Some(settings.images.registrar.clone()),
        args: Some(vec![
            format!("--v={}", settings.log_level),
            "--csi-address=$(ADDRESS)".to_string(),
            format!("--kubelet-registration-path={registration_path}"),
        ]),
        env: Some(vec![
            value_env("ADDRESS", "/csi/csi.sock"),
            field_env("KUBE_NODE_NAME", "spec.nodeName"),
        ]),
        resources: resources_for(driver, "driver-registrar", settings),
        volume_mounts: Some(vec![
            mount("plugin-dir", "/csi"),
            mount("registration-dir", "/registration"),
        ]),
        ..Default::default()
    }
}

fn plugin_container(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
    node_server: bool,
    custom_ceph_conf: bool,
) -> Container {
    let mut args = vec![
        format!("--v={}", settings.log_level),
        format!("--type={}", driver.short_name()),
        format!("--drivername={}", driver.full_name(operator_namespace)),
        "--endpoint=$(CSI_ENDPOINT)".to_string(),
    ];
    if node_server {
        args.push("--nodeid=$(NODE_ID)".to_string());
        args.push("--nodeserver=true".to_string());
    } else {
        args.push("--controllerserver=true".to_string());
    }
    if driver == CsiDriverType::CephFs && !settings.force_cephfs_kernel_client {
        args.push("--forcecephkernelclient=false".to_string());
    }

    let mut env = vec![
        field_env("POD_IP", "status.podIP"),
        value_env("CSI_ENDPOINT", "unix:///csi/csi.sock"),
    ];
    let mut volume_mounts = vec![mount("plugin-dir", "/csi")];
    if custom_ceph_conf {
        let mut conf = mount("ceph-conf-override", "/etc/ceph");
        conf.read_only = Some(true);
        volume_mounts.push(conf);
    }
    if node_server {
        env.insert(0, field_env("NODE_ID", "spec.nodeName"));
        let mut pods_mount = mount("pods-mount-dir", "/var/lib/kubelet/pods");
        pods_mount.mount_propagation = Some("Bidirectional".to_string());
        volume_mounts.push(pods_mount);
        volume_mounts.push(mount("host-dev", "/dev"));
        volume_mounts.push(mount("host-sys", "/sys"));
        let mut modules = mount("lib-modules", "/lib/modules");
        modules.read_only = Some(true);
        volume_mounts.push(modules);
    }

    Container {
        name: driver.plugin_name().to_string(),
        image: Some(settings.images.plugin.clone()),
        args: Some(args),
        env: Some(env),
        resources: resources_for(driver, driver.plugin_name(), settings),
        security_context: node_server.then(|| SecurityContext {
            privileged: Some(true),
            allow_privilege_escalation: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn liveness_container(driver: CsiDriverType, settings: &Settings) -> Container {
    let port = match driver {
        CsiDriverType::Rbd => settings.rbd_liveness_metrics_port,
        CsiDriverType::CephFs => settings.cephfs_liveness_metrics_port,
        // nfs reuses the cephfs liveness port range
        CsiDriverType::Nfs => settings.cephfs_liveness_metrics_port,
    };
    Container {
        name: "liveness-prometheus".to_string(),
        image: Some(settings.images.plugin.clone()),
        args: Some(vec![
            "--type=liveness".to_string(),
            "--endpoint=$(CSI_ENDPOINT)".to_string(),
            format!("--metricsport={port}"),
            "--metricspath=/metrics".to_string(),
            "--polltime=60s".to_string(),
        ]),
        env: Some(vec![value_env("CSI_ENDPOINT", "unix:///csi/csi.sock")]),
        ports: Some(vec![ContainerPort {
            name: Some("metrics".to_string()),
            container_port: port as i32,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: resources_for(driver, "liveness-prometheus", settings),
        volume_mounts: Some(vec![mount("plugin-dir", "/csi")]),
        ..Default::default()
    }
}

/// The per-node plugin daemonset of one driver.
pub fn render_plugin_daemonset(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
    custom_ceph_conf: bool,
) -> DaemonSet {
    let name = driver.plugin_name();
    let labels = pod_labels(driver, name, settings);
    let plugin_dir = format!(
        "/var/lib/kubelet/plugins/{}",
        driver.full_name(operator_namespace)
    );

    let pod_spec = PodSpec {
        containers: vec![
            registrar_container(driver, operator_namespace, settings),
            plugin_container(driver, operator_namespace, settings, true, custom_ceph_conf),
            liveness_container(driver, settings),
        ],
        host_network: Some(settings.enable_host_network),
        priority_class_name: settings.plugin_priority_class_name.clone(),
        tolerations: (!settings.plugin_tolerations.is_empty())
            .then(|| settings.plugin_tolerations.clone()),
        affinity: settings
            .plugin_node_affinity
            .clone()
            .map(|node_affinity| Affinity {
                node_affinity: Some(node_affinity),
                ..Default::default()
            }),
        volumes: Some({
            let mut volumes = vec![
                host_path_volume("plugin-dir", &plugin_dir),
                host_path_volume("registration-dir", "/var/lib/kubelet/plugins_registry"),
                host_path_volume("pods-mount-dir", "/var/lib/kubelet/pods"),
                host_path_volume("host-dev", "/dev"),
                host_path_volume("host-sys", "/sys"),
                host_path_volume("lib-modules", "/lib/modules"),
            ];
            if custom_ceph_conf {
                volumes.push(ceph_conf_volume());
            }
            volumes
        }),
        ..Default::default()
    };

    DaemonSet {
        metadata: meta_with_labels(name, operator_namespace, &labels),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(
                    [(utils::APP_ATTR.to_string(), name.to_string())].into_iter().collect(),
                ),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn meta_with_labels(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    let mut meta = k8sutil::object_meta(name, namespace, None);
    meta.labels
        .get_or_insert_with(Default::default)
        .extend(labels.clone());
    meta
}

fn provisioner_pod_template(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
    custom_ceph_conf: bool,
) -> PodTemplateSpec {
    let name = driver.provisioner_name();
    let labels = pod_labels(driver, name, settings);

    let mut containers = vec![Container {
        name: "csi-provisioner".to_string(),
        image: Some(settings.images.provisioner.clone()),
        args: Some(vec![
            format!("--v={}", settings.log_level),
            "--csi-address=$(ADDRESS)".to_string(),
            "--timeout=150s".to_string(),
            "--retry-interval-start=500ms".to_string(),
            "--leader-election=true".to_string(),
        ]),
        env: Some(vec![value_env("ADDRESS", "/csi/csi-provisioner.sock")]),
        resources: resources_for(driver, "csi-provisioner", settings),
        volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
        ..Default::default()
    }];

    containers.push(Container {
        name: "csi-resizer".to_string(),
        image: Some(settings.images.resizer.clone()),
        args: Some(vec![
            format!("--v={}", settings.log_level),
            "--csi-address=$(ADDRESS)".to_string(),
            "--leader-election=true".to_string(),
        ]),
        env: Some(vec![value_env("ADDRESS", "/csi/csi-provisioner.sock")]),
        resources: resources_for(driver, "csi-resizer", settings),
        volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
        ..Default::default()
    });

    if driver.attach_required(settings) {
        containers.push(Container {
            name: "csi-attacher".to_string(),
            image: Some(settings.images.attacher.clone()),
            args: Some(vec![
                format!("--v={}", settings.log_level),
                "--csi-address=$(ADDRESS)".to_string(),
                "--leader-election=true".to_string(),
            ]),
            env: Some(vec![value_env("ADDRESS", "/csi/csi-provisioner.sock")]),
            resources: resources_for(driver, "csi-attacher", settings),
            volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
            ..Default::default()
        });
    }

    if driver != CsiDriverType::Nfs {
        containers.push(Container {
            name: "csi-snapshotter".to_string(),
            image: Some(settings.images.snapshotter.clone()),
            args: Some(vec![
                format!("--v={}", settings.log_level),
                "--csi-address=$(ADDRESS)".to_string(),
                "--leader-election=true".to_string(),
            ]),
            env: Some(vec![value_env("ADDRESS", "/csi/csi-provisioner.sock")]),
            resources: resources_for(driver, "csi-snapshotter", settings),
            volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
            ..Default::default()
        });
    }

    if driver == CsiDriverType::Rbd && settings.enable_omap_generator {
        containers.push(Container {
            name: "csi-omap-generator".to_string(),
            image: Some(settings.images.plugin.clone()),
            args: Some(vec![
                format!("--v={}", settings.log_level),
                "--type=controller".to_string(),
                format!("--drivernamespace={operator_namespace}"),
            ]),
            env: Some(vec![field_env("POD_NAMESPACE", "metadata.namespace")]),
            resources: resources_for(driver, "csi-omap-generator", settings),
            volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
            ..Default::default()
        });
    }

    let mut controller_plugin =
        plugin_container(driver, operator_namespace, settings, false, custom_ceph_conf);
    controller_plugin.env = Some(vec![
        field_env("POD_IP", "status.podIP"),
        value_env("CSI_ENDPOINT", "unix:///csi/csi-provisioner.sock"),
    ]);
    let mut controller_mounts = vec![mount("socket-dir", "/csi")];
    if custom_ceph_conf {
        let mut conf = mount("ceph-conf-override", "/etc/ceph");
        conf.read_only = Some(true);
        controller_mounts.push(conf);
    }
    controller_plugin.volume_mounts = Some(controller_mounts);
    containers.push(controller_plugin);

    let mut liveness = liveness_container(driver, settings);
    liveness.env = Some(vec![value_env(
        "CSI_ENDPOINT",
        "unix:///csi/csi-provisioner.sock",
    )]);
    liveness.volume_mounts = Some(vec![mount("socket-dir", "/csi")]);
    containers.push(liveness);

    // one provisioner pod per node
    let anti_affinity = PodAntiAffinity {
        required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    [(utils::APP_ATTR.to_string(), name.to_string())].into_iter().collect(),
                ),
                ..Default::default()
            }),
            topology_key: "kubernetes.io/hostname".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            priority_class_name: settings.provisioner_priority_class_name.clone(),
            tolerations: (!settings.provisioner_tolerations.is_empty())
                .then(|| settings.provisioner_tolerations.clone()),
            affinity: Some(Affinity {
                node_affinity: settings.provisioner_node_affinity.clone(),
                pod_anti_affinity: Some(anti_affinity),
                ..Default::default()
            }),
            volumes: Some({
                let mut volumes = vec![Volume {
                    name: "socket-dir".to_string(),
                    empty_dir: Some(Default::default()),
                    ..Default::default()
                }];
                if custom_ceph_conf {
                    volumes.push(ceph_conf_volume());
                }
                volumes
            }),
            ..Default::default()
        }),
    }
}

/// The provisioner as a Deployment (servers at or above 1.14). The Recreate
/// strategy plus the anti-affinity keep a single active provisioner per node.
pub fn render_provisioner_deployment(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
    custom_ceph_conf: bool,
) -> Deployment {
    let name = driver.provisioner_name();
    let labels = pod_labels(driver, name, settings);
    Deployment {
        metadata: meta_with_labels(name, operator_namespace, &labels),
        spec: Some(DeploymentSpec {
            replicas: Some(settings.provisioner_replicas as i32),
            selector: LabelSelector {
                match_labels: Some(
                    [(utils::APP_ATTR.to_string(), name.to_string())].into_iter().collect(),
                ),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: provisioner_pod_template(driver, operator_namespace, settings, custom_ceph_conf),
            ..Default::default()
        }),
        status: None,
    }
}

/// The provisioner as a StatefulSet, for servers older than 1.14.
pub fn render_provisioner_statefulset(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
    custom_ceph_conf: bool,
) -> StatefulSet {
    let name = driver.provisioner_name();
    let labels = pod_labels(driver, name, settings);
    StatefulSet {
        metadata: meta_with_labels(name, operator_namespace, &labels),
        spec: Some(StatefulSetSpec {
            replicas: Some(settings.provisioner_replicas as i32),
            selector: LabelSelector {
                match_labels: Some(
                    [(utils::APP_ATTR.to_string(), name.to_string())].into_iter().collect(),
                ),
                ..Default::default()
            },
            service_name: name.to_string(),
            template: provisioner_pod_template(driver, operator_namespace, settings, custom_ceph_conf),
            ..Default::default()
        }),
        status: None,
    }
}

/// The CSIDriver registration object.
pub fn render_csi_driver(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
) -> CSIDriver {
    CSIDriver {
        metadata: ObjectMeta {
            name: Some(driver.full_name(operator_namespace)),
            ..Default::default()
        },
        spec: CSIDriverSpec {
            attach_required: Some(driver.attach_required(settings)),
            pod_info_on_mount: Some(false),
            fs_group_policy: Some(driver.fs_group_policy(settings).to_string()),
            ..Default::default()
        },
    }
}

/// The liveness/metrics service of a driver; only rbd and cephfs expose one.
pub fn render_metrics_service(
    driver: CsiDriverType,
    operator_namespace: &str,
    settings: &Settings,
) -> Option<Service> {
    let (grpc_port, liveness_port) = match driver {
        CsiDriverType::Rbd => (
            settings.rbd_grpc_metrics_port,
            settings.rbd_liveness_metrics_port,
        ),
        CsiDriverType::CephFs => (
            settings.cephfs_grpc_metrics_port,
            settings.cephfs_liveness_metrics_port,
        ),
        CsiDriverType::Nfs => return None,
    };
    let name = driver.plugin_name();
    Some(Service {
        metadata: k8sutil::object_meta(name, operator_namespace, None),
        spec: Some(ServiceSpec {
            selector: Some([(utils::APP_ATTR.to_string(), name.to_string())].into_iter().collect()),
            ports: Some(vec![
                ServicePort {
                    name: Some("csi-grpc-metrics".to_string()),
                    port: grpc_port as i32,
                    target_port: Some(IntOrString::Int(grpc_port as i32)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("csi-http-metrics".to_string()),
                    port: liveness_port as i32,
                    target_port: Some(IntOrString::Int(liveness_port as i32)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    })
}

/// The optional ceph.conf overlay volume.
fn ceph_conf_volume() -> Volume {
    Volume {
        name: "ceph-conf-override".to_string(),
        config_map: Some(k8s_openapi::api::core::v1::ConfigMapVolumeSource {
            name: Some(CEPH_CONF_OVERRIDE_CONFIGMAP.to_string()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `FSGroupPolicy` is immutable: a changed value forces a delete followed by
/// a create within the same reconcile.
pub fn csi_driver_needs_recreate(live: &CSIDriver, desired: &CSIDriver) -> bool {
    live.spec.fs_group_policy != desired.spec.fs_group_policy
}

/// Create or update the CSIDriver object, recreating it when an immutable
/// field changed.
pub async fn apply_csi_driver(client: &Client, desired: &CSIDriver) -> Result<()> {
    let api: Api<CSIDriver> = Api::all(client.clone());
    let name = desired
        .metadata
        .name
        .clone()
        .unwrap_or_default();

    match api.get(&name).await {
        Ok(live) if csi_driver_needs_recreate(&live, desired) => {
            info!(driver = %name, "FSGroupPolicy changed, recreating the CSIDriver");
            k8sutil::delete_ignore_not_found(&api, &name).await?;
            api.create(&Default::default(), desired).await?;
        }
        Ok(_) | Err(_) => {
            k8sutil::apply(&api, &name, desired).await?;
        }
    }
    Ok(())
}

/// Create or update the workloads of every enabled driver, in the fixed
/// rbd, cephfs, nfs order, and remove the workloads of disabled drivers.
pub async fn start_drivers(
    client: &Client,
    operator_namespace: &str,
    settings: &Settings,
    capabilities: &CsiCapabilities,
    provisioner_kind: ProvisionerKind,
) -> Result<()> {
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), operator_namespace);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), operator_namespace);
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), operator_namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), operator_namespace);
    let custom_ceph_conf = capabilities.supports_custom_ceph_conf();

    for driver in CsiDriverType::ALL {
        if !driver.enabled(settings) {
            stop_driver(client, operator_namespace, driver).await?;
            continue;
        }
        debug!(driver = driver.short_name(), "configuring csi driver");

        let daemonset =
            render_plugin_daemonset(driver, operator_namespace, settings, custom_ceph_conf);
        k8sutil::apply(&daemonsets, driver.plugin_name(), &daemonset).await?;

        match provisioner_kind {
            ProvisionerKind::Deployment => {
                // remove a statefulset provisioner left behind by an old server
                k8sutil::delete_ignore_not_found(&statefulsets, driver.provisioner_name()).await?;
                let deployment = render_provisioner_deployment(
                    driver,
                    operator_namespace,
                    settings,
                    custom_ceph_conf,
                );
                k8sutil::apply(&deployments, driver.provisioner_name(), &deployment).await?;
            }
            ProvisionerKind::StatefulSet => {
                k8sutil::delete_ignore_not_found(&deployments, driver.provisioner_name()).await?;
                let statefulset = render_provisioner_statefulset(
                    driver,
                    operator_namespace,
                    settings,
                    custom_ceph_conf,
                );
                k8sutil::apply(&statefulsets, driver.provisioner_name(), &statefulset).await?;
            }
        }

        if let Some(service) = render_metrics_service(driver, operator_namespace, settings) {
            k8sutil::apply(&services, driver.plugin_name(), &service).await?;
        }

        let csi_driver = render_csi_driver(driver, operator_namespace, settings);
        apply_csi_driver(client, &csi_driver).await?;
    }
    Ok(())
}

/// Remove the workloads and registration of one driver.
pub async fn stop_driver(
    client: &Client,
    operator_namespace: &str,
    driver: CsiDriverType,
) -> Result<()> {
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), operator_namespace);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), operator_namespace);
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), operator_namespace);
    let services: Api<Service> = Api::namespaced(client.clone(), operator_namespace);
    let csi_drivers: Api<CSIDriver> = Api::all(client.clone());

    k8sutil::delete_ignore_not_found(&daemonsets, driver.plugin_name()).await?;
    k8sutil::delete_ignore_not_found(&deployments, driver.provisioner_name()).await?;
    k8sutil::delete_ignore_not_found(&statefulsets, driver.provisioner_name()).await?;
    k8sutil::delete_ignore_not_found(&services, driver.plugin_name()).await?;
    k8sutil::delete_ignore_not_found(&csi_drivers, &driver.full_name(operator_namespace)).await?;
    Ok(())
}

/// Remove every driver; used when no cluster exists any more.
pub async fn stop_drivers(client: &Client, operator_namespace: &str) -> Result<()> {
    for driver in CsiDriverType::ALL {
        stop_driver(client, operator_namespace, driver).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        Settings::from_map(
            &pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn rendering_is_deterministic() {
        let settings = settings(&[("CSI_RBD_POD_LABELS", "rbd-label=rbd-value")]);
        for driver in CsiDriverType::ALL {
            let a = render_plugin_daemonset(driver, "rook-ceph", &settings, false);
            let b = render_plugin_daemonset(driver, "rook-ceph", &settings, false);
            assert_eq!(
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            );

            let a = render_provisioner_deployment(driver, "rook-ceph", &settings, false);
            let b = render_provisioner_deployment(driver, "rook-ceph", &settings, false);
            assert_eq!(
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            );
        }
    }

    #[test]
    fn provisioner_kind_tracks_server_minor() {
        assert_eq!(
            ProvisionerKind::for_k8s_minor(13),
            ProvisionerKind::StatefulSet
        );
        assert_eq!(
            ProvisionerKind::for_k8s_minor(14),
            ProvisionerKind::Deployment
        );
        assert_eq!(
            ProvisionerKind::for_k8s_minor(27),
            ProvisionerKind::Deployment
        );
    }

    #[test]
    fn provisioner_uses_recreate_and_anti_affinity() {
        let deployment =
            render_provisioner_deployment(CsiDriverType::Rbd, "rook-ceph", &settings(&[]), false);
        let spec = deployment.spec.unwrap();
        assert_eq!(
            spec.strategy.unwrap().type_.as_deref(),
            Some("Recreate")
        );
        let affinity = spec.template.spec.unwrap().affinity.unwrap();
        let anti = affinity.pod_anti_affinity.unwrap();
        let terms = anti.required_during_scheduling_ignored_during_execution.unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");
    }

    #[test]
    fn csi_driver_registration_defaults() {
        let csi_driver = render_csi_driver(CsiDriverType::CephFs, "rook-ceph", &settings(&[]));
        assert_eq!(
            csi_driver.metadata.name.as_deref(),
            Some("rook-ceph.cephfs.csi.ceph.com")
        );
        assert_eq!(csi_driver.spec.pod_info_on_mount, Some(false));
        assert_eq!(csi_driver.spec.attach_required, Some(true));
        assert_eq!(csi_driver.spec.fs_group_policy.as_deref(), Some("File"));
    }

    #[test]
    fn fs_group_policy_change_forces_recreate() {
        let live = render_csi_driver(CsiDriverType::Rbd, "rook-ceph", &settings(&[]));
        let desired = render_csi_driver(
            CsiDriverType::Rbd,
            "rook-ceph",
            &settings(&[("CSI_RBD_FSGROUPPOLICY", "None")]),
        );
        assert!(csi_driver_needs_recreate(&live, &desired));
        assert!(!csi_driver_needs_recreate(&live, &live));
    }

    #[test]
    fn attacher_only_rendered_when_attach_required() {
        let template = provisioner_pod_template(
            CsiDriverType::Rbd,
            "rook-ceph",
            &settings(&[("CSI_RBD_ATTACH_REQUIRED", "false")]),
            false,
        );
        let names: Vec<String> = template
            .spec
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert!(!names.contains(&"csi-attacher".to_string()));
        assert!(names.contains(&"csi-provisioner".to_string()));
    }

    #[test]
    fn pod_labels_only_apply_to_their_driver() {
        let settings = settings(&[("CSI_RBD_POD_LABELS", "rbd-label=rbd-value")]);
        let rbd = render_plugin_daemonset(CsiDriverType::Rbd, "rook-ceph", &settings, false);
        let cephfs = render_plugin_daemonset(CsiDriverType::CephFs, "rook-ceph", &settings, false);
        let labels = |ds: &DaemonSet| {
            ds.spec
                .as_ref()
                .unwrap()
                .template
                .metadata
                .as_ref()
                .unwrap()
                .labels
                .clone()
                .unwrap()
        };
        assert_eq!(labels(&rbd).get("rbd-label").map(String::as_str), Some("rbd-value"));
        assert!(!labels(&cephfs).contains_key("rbd-label"));
    }

    #[test]
    fn ceph_conf_overlay_only_mounted_when_supported() {
        let with = render_plugin_daemonset(CsiDriverType::Rbd, "rook-ceph", &settings(&[]), true);
        let without =
            render_plugin_daemonset(CsiDriverType::Rbd, "rook-ceph", &settings(&[]), false);
        let volume_names = |ds: &DaemonSet| -> Vec<String> {
            ds.spec
                .as_ref()
                .unwrap()
                .template
                .spec
                .as_ref()
                .unwrap()
                .volumes
                .as_ref()
                .unwrap()
                .iter()
                .map(|v| v.name.clone())
                .collect()
        };
        assert!(volume_names(&with).contains(&"ceph-conf-override".to_string()));
        assert!(!volume_names(&without).contains(&"ceph-conf-override".to_string()));
    }

    #[test]
    fn metrics_service_ports_follow_settings() {
        let service = render_metrics_service(
            CsiDriverType::Rbd,
            "rook-ceph",
            &settings(&[("CSI_RBD_GRPC_METRICS_PORT", "9999")]),
        )
        .unwrap();
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, 9999);
        assert_eq!(ports[1].port, 9080);
        assert!(render_metrics_service(CsiDriverType::Nfs, "rook-ceph", &settings(&[])).is_none());
    }
}
