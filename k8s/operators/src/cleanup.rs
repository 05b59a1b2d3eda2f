//! Best-effort cleanup jobs for force-deleted tenants whose Ceph objects are
//! not empty. The reconcile keeps failing retryably until the job completes;
//! only then is the finalizer released.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::{api::Api, Client, ResourceExt};
use tracing::info;
use utils::sanitize_metadata_name;

use crate::{error::Result, k8sutil};

/// Whether the cleanup job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupJobStatus {
    Running,
    Completed,
}

/// The user opted into best-effort cleanup via the force-delete annotation.
pub fn force_delete_requested<K: ResourceExt>(cr: &K) -> bool {
    cr.annotations()
        .get(&utils::force_delete_annotation())
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Cleanup job name for a subvolume group.
pub fn subvolume_group_job_name(fs_name: &str, group_name: &str) -> String {
    sanitize_metadata_name(&format!("cleanup-svg-{fs_name}-{group_name}"))
}

/// Cleanup job name for a rados namespace.
pub fn rados_namespace_job_name(pool: &str, rados_namespace: &str) -> String {
    sanitize_metadata_name(&format!("cleanup-rns-{pool}-{rados_namespace}"))
}

/// Launch the cleanup job if it is not running yet and report its state. The
/// job is left in place until it succeeds so failures stay inspectable; a
/// succeeded job is removed by its owner reference on CR deletion.
pub async fn ensure_cleanup_job(
    client: &Client,
    namespace: &str,
    name: &str,
    image: &str,
    args: Vec<String>,
) -> Result<CleanupJobStatus> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);

    match jobs.get(name).await {
        Ok(job) => {
            let succeeded = job
                .status
                .as_ref()
                .and_then(|s| s.succeeded)
                .unwrap_or(0);
            if succeeded > 0 {
                info!(job = name, "cleanup job completed");
                return Ok(CleanupJobStatus::Completed);
            }
            Ok(CleanupJobStatus::Running)
        }
        Err(error) if k8sutil::is_not_found(&error) => {
            let job = cleanup_job(name, namespace, image, args);
            jobs.create(&Default::default(), &job).await?;
            info!(job = name, "started cleanup job");
            Ok(CleanupJobStatus::Running)
        }
        Err(error) => Err(error.into()),
    }
}

/// Remove the cleanup job after the finalizer was released.
pub async fn delete_cleanup_job(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    k8sutil::delete_ignore_not_found(&jobs, name).await
}

fn cleanup_job(name: &str, namespace: &str, image: &str, args: Vec<String>) -> Job {
    Job {
        metadata: k8sutil::object_meta(name, namespace, None),
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "cleanup".to_string(),
                        image: Some(image.to_string()),
                        args: Some(args),
                        ..Default::default()
                    }],
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CephFilesystemSubVolumeGroup, CephFilesystemSubVolumeGroupSpec};

    #[test]
    fn job_names_are_valid_object_names() {
        assert_eq!(
            subvolume_group_job_name("myfs", "group-a"),
            "cleanup-svg-myfs-group-a"
        );
        // the implicit rados namespace leaves a trailing separator to trim
        assert_eq!(
            rados_namespace_job_name("replicapool", ""),
            "cleanup-rns-replicapool"
        );
    }

    #[test]
    fn force_delete_needs_the_literal_true() {
        let mut cr = CephFilesystemSubVolumeGroup::new(
            "group-a",
            CephFilesystemSubVolumeGroupSpec::default(),
        );
        assert!(!force_delete_requested(&cr));

        cr.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(utils::force_delete_annotation(), "yes".to_string());
        assert!(!force_delete_requested(&cr));

        cr.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(utils::force_delete_annotation(), "true".to_string());
        assert!(force_delete_requested(&cr));
    }
}
