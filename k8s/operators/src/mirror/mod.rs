//! Rbd mirroring of rados namespaces: the enable/disable state machine,
//! snapshot schedule programming and the per-namespace health monitors.

pub mod monitor;

pub use monitor::{MirrorMonitor, MonitorKey, MonitorSet};

use ceph_port::{CephClient, RadosNamespaceMirroring};
use tracing::info;

use crate::{
    crd::MirroringSpec,
    error::{Error, Result},
};

/// The pool spec addressing a rados namespace, `pool` or `pool/namespace`.
pub fn pool_spec(pool: &str, rados_namespace: &str) -> String {
    if rados_namespace.is_empty() {
        pool.to_string()
    } else {
        format!("{pool}/{rados_namespace}")
    }
}

/// Enable mirroring on a rados namespace per its spec and program the
/// snapshot schedules. The owning pool must itself be mirrored: the operator
/// never elevates pool mirroring on behalf of a namespace.
pub async fn ensure_mirroring(
    ceph: &dyn CephClient,
    pool: &str,
    rados_namespace: &str,
    mirroring: &MirroringSpec,
) -> Result<()> {
    let pool_info = ceph.get_pool_mirroring_info(pool).await?;
    if pool_info.disabled() {
        return Err(Error::PoolMirroringDisabled {
            pool: pool.to_string(),
            namespace: rados_namespace.to_string(),
        });
    }

    ceph.enable_rbd_rados_namespace_mirroring(
        pool,
        rados_namespace,
        mirroring.remote_namespace.as_deref(),
        mirroring.mode,
    )
    .await?;

    // reprogrammed on every reconcile; the operation is idempotent
    if !mirroring.snapshot_schedules.is_empty() {
        ceph.enable_snapshot_schedules(pool, rados_namespace, &mirroring.snapshot_schedules)
            .await?;
    }

    info!(pool, rados_namespace, mode = %mirroring.mode, "rbd mirroring enabled");
    Ok(())
}

/// Disable mirroring on a rados namespace whose spec no longer asks for it.
/// In image mode the namespace must hold no mirrored images any more; in pool
/// mode the namespace is disabled directly. Already-disabled is a success.
pub async fn disable_mirroring(
    ceph: &dyn CephClient,
    pool: &str,
    rados_namespace: &str,
) -> Result<()> {
    let info = ceph
        .get_pool_mirroring_info(&pool_spec(pool, rados_namespace))
        .await?;

    match info.mode {
        RadosNamespaceMirroring::Disabled => Ok(()),
        RadosNamespaceMirroring::Image => {
            let images = ceph.get_mirrored_pool_images(pool, rados_namespace).await?;
            if !images.is_empty() {
                return Err(Error::Generic {
                    message: format!(
                        "mirroring on {}/{} cannot be disabled, {} image(s) are still mirrored",
                        pool,
                        rados_namespace,
                        images.images.len()
                    ),
                });
            }
            ceph.disable_rbd_rados_namespace_mirroring(pool, rados_namespace)
                .await?;
            info!(pool, rados_namespace, "rbd mirroring disabled");
            Ok(())
        }
        RadosNamespaceMirroring::Pool => {
            ceph.disable_rbd_rados_namespace_mirroring(pool, rados_namespace)
                .await?;
            info!(pool, rados_namespace, "rbd mirroring disabled");
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ceph_port::{
        ClusterInfo, MirrorPoolStatus, MirroredImages, PoolMirrorInfo, SnapshotSchedule,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every call; programmable pool info and mirrored images.
    #[derive(Default)]
    pub(crate) struct MockCeph {
        pub calls: Mutex<Vec<String>>,
        pub pool_mode: Mutex<RadosNamespaceMirroring>,
        pub mirrored_images: Mutex<Vec<String>>,
    }

    impl MockCeph {
        pub fn new(mode: RadosNamespaceMirroring) -> Arc<Self> {
            let mock = Self::default();
            *mock.pool_mode.lock() = mode;
            Arc::new(mock)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    #[async_trait::async_trait]
    impl CephClient for MockCeph {
        async fn load_cluster_info(&self, _namespace: &str) -> ceph_port::Result<ClusterInfo> {
            Ok(ClusterInfo::default())
        }

        async fn auth_get_or_create_key(
            &self,
            user: &str,
            _caps: &[(String, String)],
        ) -> ceph_port::Result<String> {
            self.record(format!("auth_get_or_create_key {user}"));
            Ok("AQBsupersecret==".to_string())
        }

        async fn create_cephfs_subvolume_group(
            &self,
            fs_name: &str,
            group_name: &str,
        ) -> ceph_port::Result<()> {
            self.record(format!("create_svg {fs_name}/{group_name}"));
            Ok(())
        }

        async fn delete_cephfs_subvolume_group(
            &self,
            fs_name: &str,
            group_name: &str,
        ) -> ceph_port::Result<()> {
            self.record(format!("delete_svg {fs_name}/{group_name}"));
            Ok(())
        }

        async fn pin_cephfs_subvolume_group(
            &self,
            fs_name: &str,
            group_name: &str,
            pinning: &str,
        ) -> ceph_port::Result<()> {
            self.record(format!("pin_svg {fs_name}/{group_name} {pinning}"));
            Ok(())
        }

        async fn create_rados_namespace(
            &self,
            pool: &str,
            namespace: &str,
        ) -> ceph_port::Result<()> {
            self.record(format!("create_rns {pool}/{namespace}"));
            Ok(())
        }

        async fn delete_rados_namespace(
            &self,
            pool: &str,
            namespace: &str,
        ) -> ceph_port::Result<()> {
            self.record(format!("delete_rns {pool}/{namespace}"));
            Ok(())
        }

        async fn get_pool_mirroring_info(&self, pool: &str) -> ceph_port::Result<PoolMirrorInfo> {
            self.record(format!("get_pool_mirroring_info {pool}"));
            Ok(PoolMirrorInfo {
                mode: *self.pool_mode.lock(),
                site_name: None,
            })
        }

        async fn get_mirrored_pool_images(
            &self,
            pool: &str,
            namespace: &str,
        ) -> ceph_port::Result<MirroredImages> {
            self.record(format!("get_mirrored_pool_images {pool}/{namespace}"));
            Ok(MirroredImages {
                images: self.mirrored_images.lock().clone(),
            })
        }

        async fn enable_rbd_rados_namespace_mirroring(
            &self,
            pool: &str,
            namespace: &str,
            _remote_namespace: Option<&str>,
            mode: RadosNamespaceMirroring,
        ) -> ceph_port::Result<()> {
            self.record(format!("enable_mirroring {pool}/{namespace} {mode}"));
            Ok(())
        }

        async fn disable_rbd_rados_namespace_mirroring(
            &self,
            pool: &str,
            namespace: &str,
        ) -> ceph_port::Result<()> {
            self.record(format!("disable_mirroring {pool}/{namespace}"));
            Ok(())
        }

        async fn enable_snapshot_schedules(
            &self,
            pool: &str,
            namespace: &str,
            schedules: &[SnapshotSchedule],
        ) -> ceph_port::Result<()> {
            self.record(format!(
                "enable_snapshot_schedules {pool}/{namespace} x{}",
                schedules.len()
            ));
            Ok(())
        }

        async fn get_mirror_status(
            &self,
            pool: &str,
            namespace: &str,
        ) -> ceph_port::Result<MirrorPoolStatus> {
            self.record(format!("get_mirror_status {pool}/{namespace}"));
            Ok(MirrorPoolStatus {
                health: "OK".into(),
                ..Default::default()
            })
        }
    }

    fn image_mirroring() -> MirroringSpec {
        MirroringSpec {
            mode: RadosNamespaceMirroring::Image,
            remote_namespace: None,
            snapshot_schedules: vec![SnapshotSchedule {
                interval: "4h".into(),
                start_time: None,
            }],
        }
    }

    #[tokio::test]
    async fn enable_programs_mirroring_and_schedules() {
        let ceph = MockCeph::new(RadosNamespaceMirroring::Image);
        ensure_mirroring(ceph.as_ref(), "replicapool", "ns-a", &image_mirroring())
            .await
            .unwrap();
        assert_eq!(
            ceph.calls(),
            vec![
                "get_pool_mirroring_info replicapool",
                "enable_mirroring replicapool/ns-a image",
                "enable_snapshot_schedules replicapool/ns-a x1",
            ]
        );
    }

    #[tokio::test]
    async fn pool_mirroring_disabled_is_an_error_not_an_elevation() {
        let ceph = MockCeph::new(RadosNamespaceMirroring::Disabled);
        let error = ensure_mirroring(ceph.as_ref(), "replicapool", "ns-a", &image_mirroring())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::PoolMirroringDisabled { .. }));
        // nothing was enabled
        assert_eq!(ceph.calls(), vec!["get_pool_mirroring_info replicapool"]);
    }

    #[tokio::test]
    async fn disable_in_image_mode_requires_no_mirrored_images() {
        let ceph = MockCeph::new(RadosNamespaceMirroring::Image);
        *ceph.mirrored_images.lock() = vec!["img-1".into()];
        let error = disable_mirroring(ceph.as_ref(), "replicapool", "ns-a")
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Generic { .. }));

        ceph.mirrored_images.lock().clear();
        disable_mirroring(ceph.as_ref(), "replicapool", "ns-a")
            .await
            .unwrap();
        assert!(ceph
            .calls()
            .contains(&"disable_mirroring replicapool/ns-a".to_string()));
    }

    #[tokio::test]
    async fn disable_in_pool_mode_is_direct() {
        let ceph = MockCeph::new(RadosNamespaceMirroring::Pool);
        disable_mirroring(ceph.as_ref(), "replicapool", "ns-a")
            .await
            .unwrap();
        assert_eq!(
            ceph.calls(),
            vec![
                "get_pool_mirroring_info replicapool/ns-a",
                "disable_mirroring replicapool/ns-a",
            ]
        );
    }

    #[tokio::test]
    async fn disable_when_already_disabled_is_a_noop() {
        let ceph = MockCeph::new(RadosNamespaceMirroring::Disabled);
        disable_mirroring(ceph.as_ref(), "replicapool", "ns-a")
            .await
            .unwrap();
        assert_eq!(
            ceph.calls(),
            vec!["get_pool_mirroring_info replicapool/ns-a"]
        );
    }
}
