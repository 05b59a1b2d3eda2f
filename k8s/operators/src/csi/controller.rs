//! The cluster-wide csi reconciler: a single worker woken by filtered events
//! on the operator settings map and on clusters. Each run probes the csi
//! version, keeps the shared config document alive, plants the multus
//! holders, renders the drivers and refreshes the secrets.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::{
    api::{Api, ListParams},
    ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::{
    context::OperatorContext,
    crd::CephCluster,
    csi::{
        config::{self, Settings},
        connection,
        driver::{delegated, direct, images},
        network, secrets,
    },
    error::{Error, Result},
    k8sutil,
};

fn period(value: &str) -> Duration {
    value
        .parse::<humantime::Duration>()
        .expect("a valid requeue period")
        .into()
}

/// The csi reconcile worker. Polls once at startup, then on every admitted
/// trigger; failed runs are retried on a timer whose period depends on the
/// error class. Returns when the trigger stream ends (operator shutdown).
pub async fn run(
    ctx: Arc<OperatorContext>,
    mut triggers: impl Stream<Item = ()> + Unpin,
) {
    // kick-off the first run
    let mut retry = Some(Duration::ZERO);
    loop {
        tokio::select! {
            event = triggers.next() => {
                if event.is_none() {
                    warn!("csi trigger stream closed, stopping the csi reconciler");
                    return;
                }
            }
            _ = tokio::time::sleep(retry.unwrap_or_default()), if retry.is_some() => {}
        }

        retry = match reconcile(&ctx).await {
            Ok(()) => None,
            Err(Error::OperatorNotInitialized) => {
                info!("cluster is not initialized yet, will retry the csi configuration");
                Some(period(utils::OPERATOR_NOT_INITIALIZED_REQUEUE))
            }
            Err(error) => {
                warn!(%error, "csi reconcile failed, retrying");
                Some(period(utils::IMMEDIATE_RETRY_REQUEUE))
            }
        };
    }
}

/// One full pass over the shared csi machinery.
pub async fn reconcile(ctx: &OperatorContext) -> Result<()> {
    let client = &ctx.client;
    let operator_namespace = &ctx.operator_namespace;

    let clusters_api: Api<CephCluster> = Api::all(client.clone());
    let clusters = clusters_api.list(&ListParams::default()).await?.items;

    let settings = config::load_settings(client, operator_namespace).await?;

    // tear the drivers down when nothing needs them any more
    let usable: Vec<&CephCluster> = clusters
        .iter()
        .filter(|cluster| cluster.metadata.deletion_timestamp.is_none())
        .filter(|cluster| {
            cluster.spec.external.enable
                || !cluster.spec.cleanup_policy.has_data_dir_clean_policy()
        })
        .collect();
    if usable.is_empty() {
        debug!("no ceph cluster found, not deploying the csi drivers");
        for cluster in &clusters {
            network::teardown(client, operator_namespace, cluster).await?;
            connection::delete_connection(client, operator_namespace, &cluster.name_any()).await?;
        }
        direct::stop_drivers(client, operator_namespace).await?;
        delegated::teardown_drivers(client, operator_namespace).await?;
        // the shared config document only goes away on a confirmed teardown
        if clusters.iter().any(|cluster| {
            cluster.metadata.deletion_timestamp.is_some()
                && cluster.spec.cleanup_policy.has_data_dir_clean_policy()
        }) {
            ctx.config_store.delete().await?;
        }
        return Ok(());
    }

    // the version gate applies before any driver is rendered
    let capabilities = ctx
        .version_probe
        .detect(client, operator_namespace, &settings)
        .await?;
    debug!(?capabilities, "csi capabilities decided");

    ctx.config_store.ensure().await?;

    // multus holders are per cluster; deleted clusters lose theirs here
    for cluster in &clusters {
        if cluster.metadata.deletion_timestamp.is_some() {
            network::teardown(client, operator_namespace, cluster).await?;
        } else if capabilities.supports_nsenter() {
            network::plant(client, operator_namespace, cluster, &settings).await?;
        } else if cluster.spec.network.is_multus() {
            warn!(
                cluster = %cluster.name_any(),
                "csi image does not support nsenter, skipping the multus holder"
            );
        }
    }

    let cluster = usable[0];
    let cluster_namespace = cluster.metadata.namespace.clone().unwrap_or_default();

    if settings.csi_operator {
        images::apply_image_set(client, operator_namespace, &settings).await?;
        delegated::configure_drivers(client, operator_namespace, &settings, cluster).await?;
    } else {
        let provisioner_kind = provisioner_kind(client).await;
        direct::start_drivers(
            client,
            operator_namespace,
            &settings,
            &capabilities,
            provisioner_kind,
        )
        .await?;
    }

    // connection, secrets and driver options need cluster info; drivers above
    // are already in place when the mons are still forming quorum
    match ctx.ceph.load_cluster_info(&cluster_namespace).await {
        Ok(cluster_info) => {
            connection::reconcile_connection(client, operator_namespace, cluster, &cluster_info)
                .await?;

            if !cluster.spec.external.enable {
                let owner = k8sutil::owner_reference_to(cluster);
                secrets::create_csi_secrets(client, ctx.ceph.as_ref(), &cluster_namespace, owner)
                    .await?;
            }

            ctx.config_store
                .update_driver_options(&cluster_namespace, &cluster.spec.csi)
                .await?;
        }
        Err(error) if error.is_uninitialized() => {
            return Err(Error::OperatorNotInitialized);
        }
        Err(error) => return Err(error.into()),
    }

    record_enabled_drivers(&settings);
    Ok(())
}

/// The provisioner workload flavour supported by this server.
async fn provisioner_kind(client: &kube::Client) -> direct::ProvisionerKind {
    match client.apiserver_version().await {
        Ok(version) => {
            // GKE style minors carry a trailing '+'
            let minor: u32 = version.minor.trim_end_matches('+').parse().unwrap_or(14);
            direct::ProvisionerKind::for_k8s_minor(minor)
        }
        Err(error) => {
            error!(%error, "failed to get the server version, assuming a recent server");
            direct::ProvisionerKind::Deployment
        }
    }
}

fn record_enabled_drivers(settings: &Settings) {
    let enabled: Vec<&str> = crate::csi::driver::CsiDriverType::ALL
        .iter()
        .filter(|driver| driver.enabled(settings))
        .map(|driver| driver.short_name())
        .collect();
    info!(drivers = ?enabled, "csi drivers configured");
}
