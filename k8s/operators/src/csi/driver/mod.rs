//! Deterministic rendering of the csi driver resources, in two modes: the
//! operator renders the workloads itself (direct), or hands one CR per driver
//! to the external csi operator (delegated).

pub mod delegated;
pub mod direct;
pub mod images;

use std::collections::BTreeMap;

use crate::csi::config::{ContainerResource, Settings};

/// The csi driver kinds, in the fixed rendering order rbd, cephfs, nfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiDriverType {
    Rbd,
    CephFs,
    Nfs,
}

impl CsiDriverType {
    /// Iteration order is pinned so that status reporting is deterministic
    /// when several driver kinds become enabled in the same reconcile.
    pub const ALL: [CsiDriverType; 3] = [CsiDriverType::Rbd, CsiDriverType::CephFs, CsiDriverType::Nfs];

    pub fn short_name(&self) -> &'static str {
        match self {
            CsiDriverType::Rbd => "rbd",
            CsiDriverType::CephFs => "cephfs",
            CsiDriverType::Nfs => "nfs",
        }
    }

    /// The driver registration name, namespaced per operator instance.
    pub fn full_name(&self, operator_namespace: &str) -> String {
        format!("{operator_namespace}.{}.csi.ceph.com", self.short_name())
    }

    /// The plugin daemonset name.
    pub fn plugin_name(&self) -> &'static str {
        match self {
            CsiDriverType::Rbd => "csi-rbdplugin",
            CsiDriverType::CephFs => "csi-cephfsplugin",
            CsiDriverType::Nfs => "csi-nfsplugin",
        }
    }

    /// The provisioner workload name.
    pub fn provisioner_name(&self) -> &'static str {
        match self {
            CsiDriverType::Rbd => "csi-rbdplugin-provisioner",
            CsiDriverType::CephFs => "csi-cephfsplugin-provisioner",
            CsiDriverType::Nfs => "csi-nfsplugin-provisioner",
        }
    }

    pub fn enabled(&self, settings: &Settings) -> bool {
        match self {
            CsiDriverType::Rbd => settings.enable_rbd,
            CsiDriverType::CephFs => settings.enable_cephfs,
            CsiDriverType::Nfs => settings.enable_nfs,
        }
    }

    pub fn pod_labels<'a>(&self, settings: &'a Settings) -> &'a BTreeMap<String, String> {
        match self {
            CsiDriverType::Rbd => &settings.rbd_pod_labels,
            CsiDriverType::CephFs => &settings.cephfs_pod_labels,
            CsiDriverType::Nfs => &settings.nfs_pod_labels,
        }
    }

    pub fn plugin_resources<'a>(&self, settings: &'a Settings) -> &'a [ContainerResource] {
        match self {
            CsiDriverType::Rbd => &settings.rbd_plugin_resources,
            CsiDriverType::CephFs => &settings.cephfs_plugin_resources,
            CsiDriverType::Nfs => &settings.nfs_plugin_resources,
        }
    }

    pub fn attach_required(&self, settings: &Settings) -> bool {
        match self {
            CsiDriverType::Rbd => settings.rbd_attach_required,
            CsiDriverType::CephFs => settings.cephfs_attach_required,
            CsiDriverType::Nfs => settings.nfs_attach_required,
        }
    }

    pub fn fs_group_policy<'a>(&self, settings: &'a Settings) -> &'a str {
        match self {
            CsiDriverType::Rbd => &settings.rbd_fs_group_policy,
            CsiDriverType::CephFs => &settings.cephfs_fs_group_policy,
            CsiDriverType::Nfs => &settings.nfs_fs_group_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_names() {
        assert_eq!(
            CsiDriverType::Rbd.full_name("rook-ceph"),
            "rook-ceph.rbd.csi.ceph.com"
        );
        assert_eq!(CsiDriverType::CephFs.plugin_name(), "csi-cephfsplugin");
        assert_eq!(
            CsiDriverType::Nfs.provisioner_name(),
            "csi-nfsplugin-provisioner"
        );
    }

    #[test]
    fn rendering_order_is_fixed() {
        let order: Vec<&str> = CsiDriverType::ALL.iter().map(|d| d.short_name()).collect();
        assert_eq!(order, vec!["rbd", "cephfs", "nfs"]);
    }
}
