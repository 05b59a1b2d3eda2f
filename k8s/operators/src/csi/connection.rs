//! The per-cluster "ceph-connection" CR: monitor endpoints, the rbd-mirror
//! daemon count and read affinity, summarised for the external csi operator.

use ceph_port::ClusterInfo;
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use tracing::debug;

use crate::{
    crd::{CephCluster, CephConnection, CephConnectionSpec, CephRBDMirror},
    error::Result,
    k8sutil,
};

/// Build the connection spec from cluster info and the first mirror CR.
pub fn build_connection_spec(
    cluster: &CephCluster,
    cluster_info: &ClusterInfo,
    rbd_mirror_daemon_count: Option<i32>,
) -> CephConnectionSpec {
    let read_affinity = cluster
        .spec
        .csi
        .read_affinity
        .enabled
        .then(|| cluster.spec.csi.read_affinity.clone());

    CephConnectionSpec {
        monitors: cluster_info.mon_endpoints(),
        rbd_mirror_daemon_count,
        read_affinity,
    }
}

/// Create or update the CephConnection CR of a cluster. The daemon count is
/// read from the first CephRBDMirror in the cluster namespace, zero daemons
/// when none exists.
pub async fn reconcile_connection(
    client: &Client,
    operator_namespace: &str,
    cluster: &CephCluster,
    cluster_info: &ClusterInfo,
) -> Result<()> {
    let cluster_namespace = cluster.metadata.namespace.clone().unwrap_or_default();

    let mirrors: Api<CephRBDMirror> = Api::namespaced(client.clone(), &cluster_namespace);
    let daemon_count = mirrors
        .list(&ListParams::default())
        .await?
        .items
        .first()
        .map(|mirror| mirror.spec.count);

    let name = cluster.name_any();
    let mut connection =
        CephConnection::new(&name, build_connection_spec(cluster, cluster_info, daemon_count));
    connection.metadata.namespace = Some(operator_namespace.to_string());

    let connections: Api<CephConnection> = Api::namespaced(client.clone(), operator_namespace);
    k8sutil::apply(&connections, &name, &connection).await?;
    debug!(cluster = %name, "updated ceph connection");
    Ok(())
}

/// Remove the connection CR of a cluster.
pub async fn delete_connection(
    client: &Client,
    operator_namespace: &str,
    cluster_name: &str,
) -> Result<()> {
    let connections: Api<CephConnection> = Api::namespaced(client.clone(), operator_namespace);
    k8sutil::delete_ignore_not_found(&connections, cluster_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CephClusterSpec;
    use ceph_port::{MonInfo, ReadAffinity};
    use indexmap::IndexMap;

    fn cluster_info() -> ClusterInfo {
        let mut monitors = IndexMap::new();
        monitors.insert("a".to_string(), MonInfo::new("a", "10.0.0.1:3300"));
        monitors.insert("b".to_string(), MonInfo::new("b", "10.0.0.2:3300"));
        ClusterInfo {
            name: "testCluster".into(),
            namespace: "test".into(),
            monitors,
            ..Default::default()
        }
    }

    #[test]
    fn monitors_in_insertion_order() {
        let cluster = CephCluster::new("testCluster", CephClusterSpec::default());
        let spec = build_connection_spec(&cluster, &cluster_info(), Some(1));
        assert_eq!(spec.monitors, vec!["10.0.0.1:3300", "10.0.0.2:3300"]);
        assert_eq!(spec.rbd_mirror_daemon_count, Some(1));
        assert!(spec.read_affinity.is_none());
    }

    #[test]
    fn read_affinity_only_when_enabled() {
        let mut cluster = CephCluster::new("testCluster", CephClusterSpec::default());
        cluster.spec.csi.read_affinity = ReadAffinity {
            enabled: true,
            crush_location_labels: vec!["topology.kubernetes.io/zone".into()],
        };
        let spec = build_connection_spec(&cluster, &cluster_info(), None);
        let affinity = spec.read_affinity.unwrap();
        assert!(affinity.enabled);
        assert_eq!(affinity.crush_location_labels.len(), 1);
    }
}
