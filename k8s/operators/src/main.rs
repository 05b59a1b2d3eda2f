//! K8S csi operator: watches the declarative cluster, subvolume-group and
//! rados-namespace resources plus the operator settings map, and keeps the
//! in-cluster csi drivers convergent with them.

use std::str::FromStr;
use std::sync::Arc;

use clap::{Arg, ArgMatches};
use futures::{future, stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::Api,
    runtime::{controller::Controller, watcher, WatchStreamExt},
    Client,
};
use tracing::{info, trace, warn};

use k8s_operators::{
    context::OperatorContext,
    crd::{CephBlockPoolRadosNamespace, CephCluster, CephFilesystemSubVolumeGroup},
    csi::{self, cluster_config::ClusterConfigStore, predicate},
    k8sutil,
    mirror::MonitorSet,
    radosnamespace, subvolumegroup,
};
use utils::tracing_telemetry::{FmtStyle, TracingTelemetry};

async fn operator(args: ArgMatches) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    let namespace = args
        .get_one::<String>("namespace")
        .expect("namespace has a default")
        .clone();
    let data_dir = args
        .get_one::<String>("data-dir")
        .expect("data-dir has a default")
        .clone();

    let owner = match k8sutil::operator_owner_reference(&client).await {
        Ok(owner) => owner,
        Err(error) => {
            warn!(%error, "could not find the operator deployment owner reference");
            None
        }
    };

    let ceph = Arc::new(ceph_port::CephShellClient::new(&data_dir, &namespace));
    let config_store = ClusterConfigStore::new(client.clone(), &namespace, owner);
    let monitors = MonitorSet::new();
    let ctx = OperatorContext::new(
        client.clone(),
        ceph,
        config_store,
        monitors.clone(),
        &namespace,
    );

    info!(%namespace, "starting csi operator");

    // the cluster-wide csi worker wakes on filtered settings-map and cluster
    // events
    let settings_cache = Arc::new(predicate::SettingsChangeCache::new());
    let settings_api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    let settings_trigger = watcher(settings_api, watcher::Config::default())
        .applied_objects()
        .filter_map(move |event| {
            let cache = settings_cache.clone();
            future::ready(match event {
                Ok(config_map) if cache.admit(&config_map) => Some(()),
                _ => None,
            })
        });

    let clusters_api: Api<CephCluster> = Api::all(client.clone());
    let cluster_trigger = watcher(clusters_api, watcher::Config::default())
        .touched_objects()
        .filter_map(|event| {
            future::ready(match event {
                Ok(cluster)
                    if cluster.metadata.deletion_timestamp.is_some()
                        || predicate::admit_cluster_create(&cluster) =>
                {
                    Some(())
                }
                _ => None,
            })
        });

    let csi_worker = csi::controller::run(
        ctx.clone(),
        Box::pin(stream::select(settings_trigger, cluster_trigger)),
    );

    let svg_api: Api<CephFilesystemSubVolumeGroup> = Api::all(client.clone());
    let svg_controller = Controller::new(svg_api, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            subvolumegroup::reconcile,
            subvolumegroup::error_policy,
            ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok(o) => trace!(?o),
                Err(e) => trace!(?e),
            }
        });

    let rns_api: Api<CephBlockPoolRadosNamespace> = Api::all(client.clone());
    let rns_controller = Controller::new(rns_api, watcher::Config::default())
        .shutdown_on_signal()
        .run(
            radosnamespace::reconcile,
            radosnamespace::error_policy,
            ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok(o) => trace!(?o),
                Err(e) => trace!(?e),
            }
        });

    // the tenant controllers stop on the shutdown signal; the csi worker is
    // dropped with them
    tokio::select! {
        _ = csi_worker => {}
        _ = future::join(svg_controller, rns_controller) => {}
    }

    monitors.stop_all();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = clap::Command::new("operator-csi")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .short('n')
                .env(k8s_operators::k8sutil::POD_NAMESPACE_ENV)
                .default_value(utils::PRODUCT_NAME)
                .help("the namespace the operator and the csi machinery run in"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .env("ROOK_DATA_DIR")
                .default_value("/var/lib/rook")
                .help("the directory holding the generated ceph config files"),
        )
        .arg(
            Arg::new("fmt-style")
                .long("fmt-style")
                .env("LOG_FORMAT")
                .default_value(FmtStyle::Pretty.as_ref())
                .help("formatting style of the logs: compact, pretty or json"),
        )
        .arg(
            Arg::new("ansi-colours")
                .long("ansi-colours")
                .env("LOG_COLOURS")
                .default_value("true")
                .help("enable ansi colour codes in the logs"),
        )
        .get_matches();

    let style = matches
        .get_one::<String>("fmt-style")
        .map(|s| FmtStyle::from_str(s).unwrap_or(FmtStyle::Pretty))
        .unwrap_or(FmtStyle::Pretty);
    let colours = matches
        .get_one::<String>("ansi-colours")
        .map(|v| v.parse::<bool>().unwrap_or(true))
        .unwrap_or(true);
    TracingTelemetry::builder()
        .with_style(style)
        .with_colours(colours)
        .init();

    utils::print_package_info!();

    operator(matches).await
}
