//! The capabilities shared by all reconcilers. Reconcilers hold these
//! handles; none holds a pointer into another reconciler.

use std::sync::Arc;

use ceph_port::CephClient;
use kube::Client;

use crate::{
    csi::{cluster_config::ClusterConfigStore, version::VersionProbe},
    mirror::MonitorSet,
};

pub struct OperatorContext {
    /// Reference to our k8s client.
    pub client: Client,
    /// The Ceph capability.
    pub ceph: Arc<dyn CephClient>,
    /// Single writer of the shared csi config document.
    pub config_store: Arc<ClusterConfigStore>,
    /// The mirror status monitors, keyed per rados namespace.
    pub monitors: Arc<MonitorSet>,
    /// Cached csi version detection.
    pub version_probe: VersionProbe,
    /// The namespace the operator (and the csi machinery) runs in.
    pub operator_namespace: String,
}

impl OperatorContext {
    pub fn new(
        client: Client,
        ceph: Arc<dyn CephClient>,
        config_store: Arc<ClusterConfigStore>,
        monitors: Arc<MonitorSet>,
        operator_namespace: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            ceph,
            config_store,
            monitors,
            version_probe: VersionProbe::new(),
            operator_namespace: operator_namespace.to_string(),
        })
    }
}
