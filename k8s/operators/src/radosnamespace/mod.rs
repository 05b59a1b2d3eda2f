//! The rados-namespace reconciler: turns a CephBlockPoolRadosNamespace CR
//! into a Ceph rados namespace, a tenant entry in the shared config document,
//! and drives rbd mirroring with its per-namespace health monitor.

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
        CephBlockPoolRadosNamespace, CephCluster, ClientProfile, ClientProfileSpec, Phase,
    },
    csi::{
        cluster_config::{build_cluster_id, DriverKind, RbdConfig, TenantEntry},
        config,
        network::NetNamespacePaths,
    },
    error::{Error, InvalidCRFieldSnafu, Result},
    k8sutil,
    mirror::{self, MirrorMonitor, MonitorKey},
};

fn finalizer_name() -> String {
    utils::tenant_finalizer("cephblockpoolradosnamespace")
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
    _rns: Arc<CephBlockPoolRadosNamespace>,
    error: &Error,
    _ctx: Arc<OperatorContext>,
) -> Action {
    match error {
        Error::OperatorNotInitialized => Action::requeue(requeue(
            utils::OPERATOR_NOT_INITIALIZED_REQUEUE,
        )),
        Error::CleanupRunning { .. } | Error::PoolNotReady { .. } => {
            Action::requeue(requeue(utils::IMMEDIATE_RETRY_REQUEUE))
        }
        error => {
            warn!(%error, "rados namespace reconcile failed, retrying");
            Action::requeue(requeue(utils::IMMEDIATE_RETRY_REQUEUE))
        }
    }
}

async fn find_cluster(ctx: &OperatorContext, namespace: &str) -> Result<Option<CephCluster>> {
    let clusters: Api<CephCluster> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(clusters
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .next())
}

/// Write the CR phase and info; `observed_generation` moves only on Ready.
async fn update_status(
    ctx: &OperatorContext,
    rns: &CephBlockPoolRadosNamespace,
    phase: Phase,
    info: BTreeMap<String, String>,
) {
    let namespace = rns.metadata.namespace.clone().unwrap_or_default();
    let api: Api<CephBlockPoolRadosNamespace> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut status = json!({ "phase": phase, "info": info });
    if phase == Phase::Ready {
        status["observedGeneration"] = json!(rns.metadata.generation);
    }
    let patch = json!({ "status": status });
    if let Err(error) = api
        .patch_status(&rns.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(%error, "failed to update rados namespace status");
    }
}

/// The derived tenant identity of this CR: the spec-supplied cluster ID in
/// external mode, the md5 of the namespaced name otherwise.
pub fn cluster_id(rns: &CephBlockPoolRadosNamespace) -> String {
    if let Some(explicit) = rns.spec.cluster_id.as_deref().filter(|id| !id.is_empty()) {
        return explicit.to_string();
    }
    build_cluster_id(
        &rns.metadata.namespace.clone().unwrap_or_default(),
        &rns.spec.block_pool_name,
        DriverKind::Block,
        &rns.rados_namespace_name(),
    )
}

fn monitor_key(rns: &CephBlockPoolRadosNamespace) -> MonitorKey {
    MonitorKey {
        namespace: rns.metadata.namespace.clone().unwrap_or_default(),
        pool: rns.spec.block_pool_name.clone(),
        rados_namespace: rns.rados_namespace_name(),
    }
}

fn build_tenant_entry(
    rns: &CephBlockPoolRadosNamespace,
    cluster: &CephCluster,
    cluster_id: &str,
    monitors: Vec<String>,
) -> TenantEntry {
    let csi = &cluster.spec.csi;
    let net_namespace_file_path = (cluster.spec.network.is_multus()
        && cluster.spec.network.public_selector().is_some())
    .then(|| NetNamespacePaths::expected().rbd)
    .unwrap_or_default();

    TenantEntry {
        cluster_id: cluster_id.to_string(),
        namespace: cluster.metadata.namespace.clone().unwrap_or_default(),
        monitors,
        rbd: Some(RbdConfig {
            rados_namespace: rns.rados_namespace_name(),
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

async fn apply_client_profile(
    ctx: &OperatorContext,
    cluster: &CephCluster,
    cluster_id: &str,
    rados_namespace: &str,
) -> Result<()> {
    let mut profile = ClientProfile::new(
        cluster_id,
        ClientProfileSpec {
            ceph_connection_ref: LocalObjectReference {
                name: Some(cluster.name_any()),
            },
            cephfs: None,
            rbd: Some(crate::crd::csiop::ClientProfileRbd {
                rados_namespace: Some(rados_namespace.to_string()),
            }),
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

/// Drive the mirroring state machine for a live CR: enable with schedules
/// and a health monitor when the spec asks for mirroring, disable and cancel
/// the monitor when it stopped asking.
async fn reconcile_mirroring(
    ctx: &OperatorContext,
    rns: &CephBlockPoolRadosNamespace,
) -> Result<()> {
    let pool = &rns.spec.block_pool_name;
    let rados_namespace = rns.rados_namespace_name();
    let key = monitor_key(rns);

    match &rns.spec.mirroring {
        Some(mirroring) => {
            mirror::ensure_mirroring(ctx.ceph.as_ref(), pool, &rados_namespace, mirroring).await?;

            let monitor = MirrorMonitor::new(
                ctx.client.clone(),
                ctx.ceph.clone(),
                key.clone(),
                &rns.name_any(),
            );
            ctx.monitors.start(&key, |shutdown| monitor.run(shutdown));
        }
        None => {
            ctx.monitors.stop(&key);
            mirror::disable_mirroring(ctx.ceph.as_ref(), pool, &rados_namespace).await?;
        }
    }
    Ok(())
}

/// The main work horse.
pub async fn reconcile(
    rns: Arc<CephBlockPoolRadosNamespace>,
    ctx: Arc<OperatorContext>,
) -> Result<Action> {
    let name = rns.name_any();
    let namespace = rns
        .metadata
        .namespace
        .clone()
        .ok_or_else(|| InvalidCRFieldSnafu { field: "metadata.namespace".to_string() }.build())?;
    let api: Api<CephBlockPoolRadosNamespace> = Api::namespaced(ctx.client.clone(), &namespace);
    let deleting = rns.metadata.deletion_timestamp.is_some();

    if rns.spec.block_pool_name.is_empty() {
        return Err(InvalidCRFieldSnafu { field: "spec.blockPoolName".to_string() }.build());
    }

    if !deleting {
        k8sutil::ensure_finalizer(&api, rns.as_ref(), &finalizer_name()).await?;
        if rns.status.is_none() {
            update_status(&ctx, &rns, Phase::Progressing, BTreeMap::new()).await;
        }
    }

    let Some(cluster) = find_cluster(&ctx, &namespace).await? else {
        if deleting {
            ctx.monitors.stop(&monitor_key(&rns));
            k8sutil::remove_finalizer(&api, &name, &finalizer_name()).await?;
            return Ok(Action::await_change());
        }
        debug!(%name, "no ceph cluster in namespace yet, waiting");
        return Ok(Action::requeue(requeue(utils::OPERATOR_NOT_INITIALIZED_REQUEUE)));
    };

    let pool = rns.spec.block_pool_name.clone();
    let rados_namespace = rns.rados_namespace_name();
    let id = cluster_id(&rns);

    let cluster_going_away = cluster.metadata.deletion_timestamp.is_some()
        && cluster.spec.cleanup_policy.has_data_dir_clean_policy();
    if cluster_going_away {
        if deleting {
            ctx.monitors.stop(&monitor_key(&rns));
            ctx.config_store.remove(&id).await?;
            delete_client_profile(&ctx, &id).await?;
            k8sutil::remove_finalizer(&api, &name, &finalizer_name()).await?;
        }
        return Ok(Action::await_change());
    }

    let external = cluster.spec.external.enable;
    let cluster_info = ctx.ceph.load_cluster_info(&namespace).await?;
    let settings = config::load_settings(&ctx.client, &ctx.operator_namespace).await?;

    if deleting {
        debug!(%name, "deleting rados namespace");
        // monitors must not write status for a CR on its way out
        ctx.monitors.stop(&monitor_key(&rns));

        if !external {
            // the implicit namespace is the pool itself and is never removed
            if !rados_namespace.is_empty() {
                match ctx.ceph.delete_rados_namespace(&pool, &rados_namespace).await {
                    Ok(()) => {}
                    Err(error) if error.is_not_found() => {
                        debug!(%name, "rados namespace already removed");
                    }
                    Err(error) if error.is_not_empty() => {
                        if !cleanup::force_delete_requested(rns.as_ref()) {
                            update_status(&ctx, &rns, Phase::Failure, BTreeMap::new()).await;
                            return Err(error.into());
                        }
                        let job = cleanup::rados_namespace_job_name(&pool, &rados_namespace);
                        let status = cleanup::ensure_cleanup_job(
                            &ctx.client,
                            &namespace,
                            &job,
                            &settings.images.plugin,
                            vec![
                                "--type=cleanup".to_string(),
                                "--kind=radosnamespace".to_string(),
                                format!("--pool={pool}"),
                                format!("--namespace={rados_namespace}"),
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
            }
        } else {
            warn!(%name, "external rados namespace is not deleted from ceph, delete it manually");
        }

        ctx.config_store.remove(&id).await?;
        delete_client_profile(&ctx, &id).await?;
        k8sutil::remove_finalizer(&api, &name, &finalizer_name()).await?;
        info!(%name, "rados namespace deleted");
        return Ok(Action::await_change());
    }

    if external {
        // no ceph commands in external mode; the namespace is assumed there
        let entry = build_tenant_entry(&rns, &cluster, &id, cluster_info.mon_endpoints());
        ctx.config_store.upsert(entry).await?;
        if settings.csi_operator {
            apply_client_profile(&ctx, &cluster, &id, &rados_namespace).await?;
        }
        let mut status_info = BTreeMap::new();
        status_info.insert("clusterID".to_string(), id);
        update_status(&ctx, &rns, Phase::Ready, status_info).await;
        return Ok(Action::await_change());
    }

    // the implicit namespace exists by definition
    if !rados_namespace.is_empty() {
        match ctx.ceph.create_rados_namespace(&pool, &rados_namespace).await {
            Ok(()) => {}
            // not-ready clusters requeue without a Failure phase
            Err(error) if error.is_uninitialized() => return Err(error.into()),
            Err(error) => {
                update_status(&ctx, &rns, Phase::Failure, BTreeMap::new()).await;
                return Err(error.into());
            }
        }
    }

    if let Err(error) = reconcile_mirroring(&ctx, &rns).await {
        if !matches!(error, Error::OperatorNotInitialized) {
            update_status(&ctx, &rns, Phase::Failure, BTreeMap::new()).await;
        }
        return Err(error);
    }

    let entry = build_tenant_entry(&rns, &cluster, &id, cluster_info.mon_endpoints());
    ctx.config_store.upsert(entry).await?;

    if settings.csi_operator {
        apply_client_profile(&ctx, &cluster, &id, &rados_namespace).await?;
    }

    let mut status_info = BTreeMap::new();
    status_info.insert("clusterID".to_string(), id);
    update_status(&ctx, &rns, Phase::Ready, status_info).await;

    debug!(%name, "done reconciling rados namespace");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CephBlockPoolRadosNamespaceSpec;

    fn rns(spec_name: Option<&str>, explicit_id: Option<&str>) -> CephBlockPoolRadosNamespace {
        let mut cr = CephBlockPoolRadosNamespace::new(
            "cr-name1",
            CephBlockPoolRadosNamespaceSpec {
                block_pool_name: "replicapool".into(),
                name: spec_name.map(String::from),
                cluster_id: explicit_id.map(String::from),
                ..Default::default()
            },
        );
        cr.metadata.namespace = Some("test".into());
        cr
    }

    #[test]
    fn implicit_namespace_derives_the_documented_id() {
        // md5 of "test-replicapool-block-"
        assert_eq!(
            cluster_id(&rns(Some("<implicit>"), None)),
            "44b724d96835561d352ea4dec408e8f8"
        );
    }

    #[test]
    fn explicit_cluster_id_wins_in_external_mode() {
        assert_eq!(cluster_id(&rns(None, Some("external-id-1"))), "external-id-1");
        // an empty override falls back to the derived hash
        assert_eq!(cluster_id(&rns(None, Some(""))).len(), 32);
    }

    #[test]
    fn monitor_keys_follow_the_ceph_name() {
        let key = monitor_key(&rns(Some("<implicit>"), None));
        assert_eq!(key.to_string(), "test/replicapool/");
        let key = monitor_key(&rns(Some("ns-a"), None));
        assert_eq!(key.to_string(), "test/replicapool/ns-a");
    }
}
