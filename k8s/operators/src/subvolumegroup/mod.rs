//! The subvolume-group reconciler: turns a CephFilesystemSubVolumeGroup CR
//! into a Ceph subvolume group, a tenant entry in the shared config document
//! and, in delegated mode, a ClientProfile CR.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::controller::Action,
    ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    cleanup::{self, CleanupJobStatus},
    context::OperatorContext,
    crd::{
        subvolumegroup::SubVolumeGroupPinning, CephCluster, CephFilesystemSubVolumeGroup,
        ClientProfile, ClientProfileSpec, Phase,
    },
    csi::{
        cluster_config::{build_cluster_id, CephFsConfig, DriverKind, TenantEntry},
        config,
        network::NetNamespacePaths,
    },
    error::{Error, InvalidCRFieldSnafu, Result},
    k8sutil,
};

fn finalizer_name() -> String {
    utils::tenant_finalizer("cephfilesystemsubvolumegroup")
}

fn requeue(period: &str) -> Duration {
    period
        .parse::<humantime::Duration>()
        .expect("a valid requeue period")
        .into()
}

/// Determine what we want to do when dealing with errors from the
/// reconciliation loop.
pub fn error_policy(
    _svg: Arc<CephFilesystemSubVolumeGroup>,
    error: &Error,
    _ctx: Arc<OperatorContext>,
) -> Action {
    match error {
        Error::OperatorNotInitialized => Action::requeue(requeue(
            utils::OPERATOR_NOT_INITIALIZED_REQUEUE,
        )),
        Error::CleanupRunning { .. } => {
            Action::requeue(requeue(utils::IMMEDIATE_RETRY_REQUEUE))
        }
        error => {
            warn!(%error, "subvolume group reconcile failed, retrying");
            Action::requeue(requeue(utils::IMMEDIATE_RETRY_REQUEUE))
        }
    }
}

/// The first cluster in the CR namespace, if any.
async fn find_cluster(
    ctx: &OperatorContext,
    namespace: &str,
) -> Result<Option<CephCluster>> {
    let clusters: Api<CephCluster> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(clusters
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .next())
}

/// Write the CR phase and info. `observed_generation` moves only when the
/// reconcile reached Ready; a Failure keeps the previous value so clients can
/// detect staleness.
async fn update_status(
    ctx: &OperatorContext,
    svg: &CephFilesystemSubVolumeGroup,
    phase: Phase,
    info: BTreeMap<String, String>,
) {
    let namespace = svg.metadata.namespace.clone().unwrap_or_default();
    let api: Api<CephFilesystemSubVolumeGroup> =
        Api::namespaced(ctx.client.clone(), &namespace);

    let mut status = json!({ "phase": phase, "info": info });
    if phase == Phase::Ready {
        status["observedGeneration"] = json!(svg.metadata.generation);
    }
    let patch = json!({ "status": status });
    if let Err(error) = api
        .patch_status(&svg.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(%error, "failed to update subvolume group status");
    }
}

fn build_tenant_entry(
    svg: &CephFilesystemSubVolumeGroup,
    cluster: &CephCluster,
    cluster_id: &str,
    monitors: Vec<String>,
) -> TenantEntry {
    let csi = &cluster.spec.csi;
    let net_namespace_file_path = (cluster.spec.network.is_multus()
        && cluster.spec.network.public_selector().is_some())
    .then(|| NetNamespacePaths::expected().cephfs)
    .unwrap_or_default();

    TenantEntry {
        cluster_id: cluster_id.to_string(),
        namespace: cluster.metadata.namespace.clone().unwrap_or_default(),
        monitors,
        cephfs: Some(CephFsConfig {
            subvolume_group: svg.group_name(),
            kernel_mount_options: csi.cephfs.kernel_mount_options.clone(),
            fuse_mount_options: csi.cephfs.fuse_mount_options.clone(),
            net_namespace_file_path,
        }),
        read_affinity: csi.read_affinity.enabled.then(|| {
            crate::csi::cluster_config::ReadAffinityConfig {
                enabled: true,
                crush_location_labels: csi.read_affinity.crush_location_labels.clone(),
            }
        }),
        ..Default::default()
    }
}

/// Create or update the delegated-mode ClientProfile of this tenant.
async fn apply_client_profile(
    ctx: &OperatorContext,
    cluster: &CephCluster,
    cluster_id: &str,
    group_name: &str,
) -> Result<()> {
    let mut profile = ClientProfile::new(
        cluster_id,
        ClientProfileSpec {
            ceph_connection_ref: LocalObjectReference {
                name: Some(cluster.name_any()),
            },
            cephfs: Some(crate::crd::csiop::ClientProfileCephFs {
                subvolume_group: Some(group_name.to_string()),
            }),
            rbd: None,
        },
    );
    profile.metadata.namespace = Some(ctx.operator_namespace.clone());
    let profiles: Api<ClientProfile> =
        Api::namespaced(ctx.client.clone(), &ctx.operator_namespace);
    k8sutil::apply(&profiles, cluster_id, &profile).await?;
    Ok(())
}

async fn delete_client_profile(ctx: &OperatorContext, cluster_id: &str) -> Result<()> {
    let profiles: Api<ClientProfile> =
        Api::namespaced(ctx.client.clone(), &ctx.operator_namespace);
    k8sutil::delete_ignore_not_found(&profiles, cluster_id).await
}

/// The main work horse.
pub async fn reconcile(
    svg: Arc<CephFilesystemSubVolumeGroup>,
    ctx: Arc<OperatorContext>,
) -> Result<Action> {
    let name = svg.name_any();
    let namespace = svg
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| InvalidCRFieldSnafu { field: "metadata.namespace".to_string() }.build())?;
    let api: Api<CephFilesystemSubVolumeGroup> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let deleting = svg.metadata.deletion_timestamp.is_some();

    if !deleting {
        k8sutil::ensure_finalizer(&api, svg.as_ref(), &finalizer_name()).await?;
        if svg.status.is_none() {
            update_status(&ctx, &svg, Phase::Progressing, BTreeMap::new()).await;
        }
    }

    // make sure a cluster is present, otherwise do nothing
    let Some(cluster) = find_cluster(&ctx, &namespace).await? else {
        if deleting {
            // the cluster is gone, everything ceph-side went with it
            k8sutil::remove_finalizer(&api, &name, &finalizer_name()).await?;
            return Ok(Action::await_change());
        }
        debug!(%name, "no ceph cluster in namespace yet, waiting");
        return Ok(Action::requeue(requeue(utils::OPERATOR_NOT_INITIALIZED_REQUEUE)));
    };

    let group_name = svg.group_name();
    let fs_name = &svg.spec.filesystem_name;
    if fs_name.is_empty() {
        return Err(InvalidCRFieldSnafu { field: "spec.filesystemName".to_string() }.build());
    }
    let cluster_id = build_cluster_id(&namespace, fs_name, DriverKind::File, &group_name);

    // a cluster on its way out with data cleanup takes the ceph objects with
    // it; only the csi artefacts need tearing down
    let cluster_going_away = cluster.metadata.deletion_timestamp.is_some()
        && cluster.spec.cleanup_policy.has_data_dir_clean_policy();
    if cluster_going_away {
        if deleting {
            ctx.config_store.remove(&cluster_id).await?;
            delete_client_profile(&ctx, &cluster_id).await?;
            k8sutil::remove_finalizer(&api, &name, &finalizer_name()).await?;
        }
        return Ok(Action::await_change());
    }

    let external = cluster.spec.external.enable;
    let cluster_info = ctx.ceph.load_cluster_info(&namespace).await?;
    let settings = config::load_settings(&ctx.client, &ctx.operator_namespace).await?;

    if deleting {
        debug!(%name, "deleting subvolume group");
        if !external {
            match ctx.ceph.delete_cephfs_subvolume_group(fs_name, &group_name).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {
                    debug!(%name, "subvolume group already removed");
                }
                Err(error) if error.is_not_empty() => {
                    if !cleanup::force_delete_requested(svg.as_ref()) {
                        update_status(&ctx, &svg, Phase::Failure, BTreeMap::new()).await;
                        return Err(error.into());
                    }
                    let job = cleanup::subvolume_group_job_name(fs_name, &group_name);
                    let status = cleanup::ensure_cleanup_job(
                        &ctx.client,
                        &namespace,
                        &job,
                        &settings.images.plugin,
                        vec![
                            "--type=cleanup".to_string(),
                            "--kind=subvolumegroup".to_string(),
                            format!("--filesystem={fs_name}"),
                            format!("--group={group_name}"),
                        ],
                    )
                    .await?;
                    if status == CleanupJobStatus::Running {
                        return Err(Error::CleanupRunning { job });
                    }
                    cleanup::delete_cleanup_job(&ctx.client, &namespace, &job).await?;
                }
                Err(error) => return Err(error.into()),
            }
        } else {
            warn!(%name, "external subvolume group is not deleted from ceph, delete it manually");
        }

        ctx.config_store.remove(&cluster_id).await?;
        delete_client_profile(&ctx, &cluster_id).await?;
        k8sutil::remove_finalizer(&api, &name, &finalizer_name()).await?;
        info!(%name, "subvolume group deleted");
        return Ok(Action::await_change());
    }

    // the pinning default applies when nothing (valid) was specified
    if let Some(pinning) = &svg.spec.pinning {
        if let Err(reason) = pinning.validate() {
            warn!(%name, %reason, "invalid pinning, applying the first set flavour");
        }
    }
    let pinning = SubVolumeGroupPinning::format(svg.spec.pinning.as_ref());

    // external tenants exist already, only the config document is updated
    if !external {
        let created = async {
            ctx.ceph
                .create_cephfs_subvolume_group(fs_name, &group_name)
                .await?;
            ctx.ceph
                .pin_cephfs_subvolume_group(fs_name, &group_name, &pinning)
                .await
        }
        .await;
        match created {
            Ok(()) => {}
            // not-ready clusters requeue without a Failure phase
            Err(error) if error.is_uninitialized() => return Err(error.into()),
            Err(error) => {
                update_status(&ctx, &svg, Phase::Failure, BTreeMap::new()).await;
                return Err(error.into());
            }
        }
    }

    let entry = build_tenant_entry(&svg, &cluster, &cluster_id, cluster_info.mon_endpoints());
    ctx.config_store.upsert(entry).await?;

    if settings.csi_operator {
        apply_client_profile(&ctx, &cluster, &cluster_id, &group_name).await?;
    }

    let mut status_info = BTreeMap::new();
    status_info.insert("clusterID".to_string(), cluster_id);
    status_info.insert("pinning".to_string(), pinning);
    update_status(&ctx, &svg, Phase::Ready, status_info).await;

    debug!(%name, "done reconciling subvolume group");
    Ok(Action::await_change())
}
