/// Various common constants used by the CSI control plane.

/// Domain name for the product.
pub const PRODUCT_DOMAIN_NAME: &str = "ceph.rook.io";

/// Name of the product.
pub const PRODUCT_NAME: &str = "rook-ceph";

/// The operator settings config map.
pub const OPERATOR_SETTING_CONFIGMAP_NAME: &str = "rook-ceph-operator-config";

/// The shared CSI cluster config map and the key its document lives under.
pub const CSI_CONFIG_NAME: &str = "rook-ceph-csi-config";
/// The config map key holding the JSON document.
pub const CSI_CONFIG_KEY: &str = "csi-cluster-config-json";

/// The image-set config map consumed by the external CSI operator.
pub const CSI_IMAGE_SET_CONFIGMAP_NAME: &str = "rook-csi-operator-image-set-configmap";

/// The name of the delegated-mode operator config CR.
pub const CSI_OPERATOR_CONFIG_CR_NAME: &str = "ceph-csi-operator-config";

/// Secrets holding the capability-scoped CSI Ceph keys.
pub const CSI_RBD_NODE_SECRET: &str = "rook-csi-rbd-node";
pub const CSI_RBD_PROVISIONER_SECRET: &str = "rook-csi-rbd-provisioner";
pub const CSI_CEPHFS_NODE_SECRET: &str = "rook-csi-cephfs-node";
pub const CSI_CEPHFS_PROVISIONER_SECRET: &str = "rook-csi-cephfs-provisioner";

/// The finalizer protecting tenant CRs until their Ceph objects and config
/// document entries are gone.
pub fn tenant_finalizer(kind_plural: &str) -> String {
    format!("{kind_plural}.{PRODUCT_DOMAIN_NAME}")
}

/// The finalizer held on a CephCluster while its multus holder daemonset runs.
pub const MULTUS_FINALIZER: &str = "multus.ceph.rook.io";

/// Name prefix of the per-network holder daemonset.
pub const MULTUS_HOLDER_PREFIX: &str = "csi-multus";

/// The app label key shared by all workloads this operator owns.
pub const APP_ATTR: &str = "app";

/// The key to mark the creation source of an object in labels.
pub fn created_by_key() -> String {
    format!("{PRODUCT_DOMAIN_NAME}/created-by")
}

/// The value to mark the creation source to be the csi operator in labels.
pub const CSI_OPERATOR: &str = "operator-csi";

/// Well known file path pattern entered via nsenter by the csi drivers.
pub fn net_namespace_file_path(driver_short_name: &str) -> String {
    format!("/var/lib/kubelet/plugins/ns-{driver_short_name}.ns")
}

/// Default liveness/metrics ports per driver.
pub const DEFAULT_RBD_GRPC_METRICS_PORT: u16 = 9090;
pub const DEFAULT_RBD_LIVENESS_METRICS_PORT: u16 = 9080;
pub const DEFAULT_CEPHFS_GRPC_METRICS_PORT: u16 = 9091;
pub const DEFAULT_CEPHFS_LIVENESS_METRICS_PORT: u16 = 9081;

/// Default images for each logical CSI component.
pub const DEFAULT_CSI_PLUGIN_IMAGE: &str = "quay.io/cephcsi/cephcsi:v3.9.0";
pub const DEFAULT_REGISTRAR_IMAGE: &str =
    "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.8.0";
pub const DEFAULT_PROVISIONER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-provisioner:v3.5.0";
pub const DEFAULT_ATTACHER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-attacher:v4.3.0";
pub const DEFAULT_SNAPSHOTTER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-snapshotter:v6.2.2";
pub const DEFAULT_RESIZER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-resizer:v1.8.0";
pub const DEFAULT_ADDONS_IMAGE: &str = "quay.io/csiaddons/k8s-sidecar:v0.7.0";

/// Monitor ports; endpoints on the msgr1 port are rewritten to msgr2 when the
/// cluster requires msgr2.
pub const MSGR1_PORT: u16 = 6789;
pub const MSGR2_PORT: u16 = 3300;

/// The period at which a mirror health monitor polls mirror status.
pub const MIRROR_STATUS_CHECK_PERIOD: &str = "60s";

/// Hard timeout for the CSI version detection job.
pub const CSI_VERSION_PROBE_TIMEOUT: &str = "15m";

/// Requeue delay when the operator is not yet initialized (mons not ready).
pub const OPERATOR_NOT_INITIALIZED_REQUEUE: &str = "60s";

/// Requeue delay for an immediate retry.
pub const IMMEDIATE_RETRY_REQUEUE: &str = "10s";

/// The annotation authorising a cleanup job for non-empty Ceph objects.
pub fn force_delete_annotation() -> String {
    format!("{PRODUCT_DOMAIN_NAME}/force-delete")
}

/// The token selecting the implicit (top-level) rados namespace.
pub const IMPLICIT_RADOS_NAMESPACE: &str = "<implicit>";

/// Object names must be valid DNS-1123 subdomains; network selectors may
/// carry a namespace prefix like "rook-ceph/pub" whose slash is invalid.
pub fn sanitize_metadata_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_namespaced_selector() {
        assert_eq!(sanitize_metadata_name("rook-ceph/pub"), "rook-ceph-pub");
        assert_eq!(sanitize_metadata_name("Public_Net"), "public-net");
        assert_eq!(sanitize_metadata_name("-edge-"), "edge");
    }

    #[test]
    fn net_namespace_paths_are_per_driver() {
        assert_eq!(
            net_namespace_file_path("rbd"),
            "/var/lib/kubelet/plugins/ns-rbd.ns"
        );
        assert_ne!(
            net_namespace_file_path("rbd"),
            net_namespace_file_path("cephfs")
        );
    }
}
