//! The single shared csi cluster config document: a JSON array with one entry
//! per derived cluster ID, stored in one config map and read by every csi
//! driver pod. This module is its only writer.

use std::sync::Arc;

use ceph_port::CsiDriverOptions;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use utils::{CSI_CONFIG_KEY, CSI_CONFIG_NAME};

use crate::{
    error::{MalformedConfigDocumentSnafu, Result, SerializeSnafu},
    k8sutil,
};

/// The driver flavour a tenant belongs to, as it appears inside the derived
/// cluster ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DriverKind {
    Block,
    File,
}

/// The stable ID identifying a tenant in the config document: the md5 hex of
/// `"<ns>-<pool-or-fs>-<block|file>-<subname>"`. External-mode tenants may
/// supply their own opaque ID instead.
pub fn build_cluster_id(
    namespace: &str,
    pool_or_fs: &str,
    kind: DriverKind,
    subname: &str,
) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{namespace}-{pool_or_fs}-{kind}-{subname}"))
    )
}

/// Rbd attributes of a tenant entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbdConfig {
    /// The rados namespace; the empty string is the implicit namespace and is
    /// serialised as such.
    #[serde(rename = "radosNamespace", default)]
    pub rados_namespace: String,
    #[serde(
        rename = "netNamespaceFilePath",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub net_namespace_file_path: String,
}

/// CephFS attributes of a tenant entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CephFsConfig {
    #[serde(
        rename = "subvolumeGroup",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub subvolume_group: String,
    #[serde(
        rename = "kernelMountOptions",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub kernel_mount_options: String,
    #[serde(
        rename = "fuseMountOptions",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub fuse_mount_options: String,
    #[serde(
        rename = "netNamespaceFilePath",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub net_namespace_file_path: String,
}

/// NFS attributes of a tenant entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsConfig {
    #[serde(
        rename = "netNamespaceFilePath",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub net_namespace_file_path: String,
}

/// Read affinity attributes of a tenant entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAffinityConfig {
    pub enabled: bool,
    #[serde(
        rename = "crushLocationLabels",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub crush_location_labels: Vec<String>,
}

/// One entry of the config document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEntry {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// The owning cluster namespace; used to refresh sibling entries.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub monitors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbd: Option<RbdConfig>,
    #[serde(rename = "cephFS", default, skip_serializing_if = "Option::is_none")]
    pub cephfs: Option<CephFsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsConfig>,
    #[serde(
        rename = "readAffinity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub read_affinity: Option<ReadAffinityConfig>,
}

impl TenantEntry {
    fn has_rbd(&self) -> bool {
        self.rbd.as_ref().is_some_and(|r| {
            !r.rados_namespace.is_empty() || !r.net_namespace_file_path.is_empty()
        })
    }

    fn has_cephfs(&self) -> bool {
        self.cephfs
            .as_ref()
            .is_some_and(|c| !c.subvolume_group.is_empty() || !c.net_namespace_file_path.is_empty())
    }

    fn has_nfs(&self) -> bool {
        self.nfs
            .as_ref()
            .is_some_and(|n| !n.net_namespace_file_path.is_empty())
    }
}

/// Parse the serialised document; a malformed document is a hard error so
/// user data is never overwritten blindly.
pub fn parse_document(raw: &str) -> Result<Vec<TenantEntry>, serde_json::Error> {
    let raw = if raw.is_empty() { "[]" } else { raw };
    serde_json::from_str(raw)
}

/// Serialise the document; entries keep their insertion order so external
/// diffs stay readable.
pub fn format_document(entries: &[TenantEntry]) -> Result<String> {
    serde_json::to_string(entries).context(SerializeSnafu {
        what: "csi cluster config".to_string(),
    })
}

/// Merge one entry into the document: replace the entry with the matching
/// cluster ID or append it, and refresh the monitor list of every entry that
/// belongs to the same cluster (the mons may have moved since those entries
/// were written). Sub-structs only overwrite when the new entry carries
/// content for them.
pub fn upsert_entry(entries: &mut Vec<TenantEntry>, new: TenantEntry) {
    for entry in entries.iter_mut() {
        if entry.namespace == new.namespace && entry.cluster_id != new.cluster_id {
            entry.monitors = new.monitors.clone();
        }
    }

    let (has_rbd, has_cephfs, has_nfs) = (new.has_rbd(), new.has_cephfs(), new.has_nfs());
    match entries.iter_mut().find(|e| e.cluster_id == new.cluster_id) {
        Some(entry) => {
            entry.namespace = new.namespace;
            entry.monitors = new.monitors;
            if has_rbd {
                entry.rbd = new.rbd;
            }
            if has_cephfs {
                entry.cephfs = new.cephfs;
            }
            if has_nfs {
                entry.nfs = new.nfs;
            }
            if new.read_affinity.is_some() {
                entry.read_affinity = new.read_affinity;
            }
        }
        None => entries.push(new),
    }
}

/// Drop the entry with the given cluster ID, if present.
pub fn remove_entry(entries: &mut Vec<TenantEntry>, cluster_id: &str) {
    entries.retain(|e| e.cluster_id != cluster_id);
}

/// Rewrite the driver options of every entry belonging to the cluster in
/// `cluster_namespace`. Tenant identities (subvolume group, rados namespace,
/// net namespace paths) are preserved.
pub fn update_driver_options(
    entries: &mut [TenantEntry],
    cluster_namespace: &str,
    options: &CsiDriverOptions,
) {
    for entry in entries.iter_mut().filter(|e| e.namespace == cluster_namespace) {
        entry.read_affinity = Some(ReadAffinityConfig {
            enabled: options.read_affinity.enabled,
            crush_location_labels: options.read_affinity.crush_location_labels.clone(),
        });
        let cephfs = entry.cephfs.get_or_insert_with(Default::default);
        cephfs.kernel_mount_options = options.cephfs.kernel_mount_options.clone();
        cephfs.fuse_mount_options = options.cephfs.fuse_mount_options.clone();
    }
}

/// The single writer of the shared config document. All reconcilers share one
/// instance; the mutex spans each full read-modify-write so concurrent
/// reconciles cannot lose updates.
pub struct ClusterConfigStore {
    client: Client,
    namespace: String,
    owner: Option<OwnerReference>,
    lock: Mutex<()>,
}

impl ClusterConfigStore {
    /// A store writing to the config map in `namespace` (the operator
    /// namespace; csi runs next to the operator).
    pub fn new(client: Client, namespace: &str, owner: Option<OwnerReference>) -> Arc<Self> {
        Arc::new(Self {
            client,
            namespace: namespace.to_string(),
            owner,
            lock: Mutex::new(()),
        })
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Create the backing map with an empty document if missing. Idempotent.
    pub async fn ensure(&self) -> Result<()> {
        let mut config_map = ConfigMap {
            metadata: k8sutil::object_meta(CSI_CONFIG_NAME, &self.namespace, self.owner.clone()),
            ..Default::default()
        };
        config_map.data = Some(
            [(CSI_CONFIG_KEY.to_string(), "[]".to_string())]
                .into_iter()
                .collect(),
        );

        match self.api().create(&PostParams::default(), &config_map).await {
            Ok(_) => {
                info!(name = CSI_CONFIG_NAME, "created csi config map");
                Ok(())
            }
            Err(error) if k8sutil::is_conflict(&error) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Read-modify-write under the store mutex; returns the new serialised
    /// document when the mutation changed it.
    async fn read_modify_write<F>(&self, mutate: F) -> Result<String>
    where
        F: FnOnce(&mut Vec<TenantEntry>),
    {
        let _guard = self.lock.lock().await;

        let api = self.api();
        let config_map = match api.get(CSI_CONFIG_NAME).await {
            Ok(cm) => cm,
            Err(error) if k8sutil::is_not_found(&error) => {
                self.ensure().await?;
                api.get(CSI_CONFIG_NAME).await?
            }
            Err(error) => return Err(error.into()),
        };

        let current = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(CSI_CONFIG_KEY))
            .cloned()
            .unwrap_or_default();

        let mut entries = parse_document(&current).context(MalformedConfigDocumentSnafu {
            name: CSI_CONFIG_NAME.to_string(),
        })?;
        mutate(&mut entries);
        let updated = format_document(&entries)?;

        if updated != current {
            let patch = json!({ "data": { CSI_CONFIG_KEY: updated } });
            api.patch(
                CSI_CONFIG_NAME,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        }
        Ok(updated)
    }

    /// Insert or update the tenant entry; returns the serialised document for
    /// logging.
    pub async fn upsert(&self, entry: TenantEntry) -> Result<String> {
        let document = self
            .read_modify_write(|entries| upsert_entry(entries, entry))
            .await?;
        debug!(%document, "csi cluster config updated");
        Ok(document)
    }

    /// Remove the entry with the given cluster ID.
    pub async fn remove(&self, cluster_id: &str) -> Result<()> {
        self.read_modify_write(|entries| remove_entry(entries, cluster_id))
            .await?;
        Ok(())
    }

    /// Rewrite read affinity and cephfs mount options of a cluster's entries.
    pub async fn update_driver_options(
        &self,
        cluster_namespace: &str,
        options: &CsiDriverOptions,
    ) -> Result<()> {
        self.read_modify_write(|entries| {
            update_driver_options(entries, cluster_namespace, options)
        })
        .await?;
        Ok(())
    }

    /// Remove the whole backing map; only called on operator teardown with
    /// cleanup enabled.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        k8sutil::delete_ignore_not_found(&self.api(), CSI_CONFIG_NAME).await
    }
}

impl std::fmt::Debug for ClusterConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConfigStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cluster_id: &str, namespace: &str) -> TenantEntry {
        TenantEntry {
            cluster_id: cluster_id.to_string(),
            namespace: namespace.to_string(),
            monitors: vec!["10.0.0.1:3300".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn cluster_id_is_md5_hex() {
        assert_eq!(
            build_cluster_id("test", "myfs", DriverKind::File, "group-a"),
            "b962284b004b11e7e098c2f2c2471c16"
        );
        assert_eq!(
            build_cluster_id("test", "replicapool", DriverKind::Block, ""),
            "44b724d96835561d352ea4dec408e8f8"
        );
    }

    #[test]
    fn upsert_appends_then_replaces() {
        let mut entries = Vec::new();
        let mut first = entry("id-1", "test");
        first.cephfs = Some(CephFsConfig {
            subvolume_group: "group-a".into(),
            ..Default::default()
        });
        upsert_entry(&mut entries, first);
        assert_eq!(entries.len(), 1);

        let mut update = entry("id-1", "test");
        update.monitors = vec!["10.0.0.2:3300".to_string()];
        upsert_entry(&mut entries, update);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].monitors, vec!["10.0.0.2:3300"]);
        // cephfs survives an update without cephfs content
        assert_eq!(
            entries[0].cephfs.as_ref().unwrap().subvolume_group,
            "group-a"
        );
    }

    #[test]
    fn upsert_refreshes_sibling_monitors() {
        let mut entries = vec![entry("id-1", "test"), entry("other", "elsewhere")];
        let mut new = entry("id-2", "test");
        new.monitors = vec!["10.0.0.9:3300".to_string()];
        upsert_entry(&mut entries, new);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].monitors, vec!["10.0.0.9:3300"]);
        assert_eq!(entries[1].monitors, vec!["10.0.0.1:3300"]);
    }

    #[test]
    fn remove_is_exact_and_idempotent() {
        let mut entries = vec![entry("id-1", "test"), entry("id-2", "test")];
        remove_entry(&mut entries, "id-1");
        assert_eq!(entries.len(), 1);
        remove_entry(&mut entries, "id-1");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cluster_id, "id-2");
    }

    #[test]
    fn document_round_trips_in_order() {
        let entries = vec![entry("id-b", "test"), entry("id-a", "test")];
        let raw = format_document(&entries).unwrap();
        let parsed = parse_document(&raw).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn implicit_rados_namespace_serialises_empty() {
        let mut e = entry("id-1", "test");
        e.rbd = Some(RbdConfig::default());
        let raw = format_document(&[e]).unwrap();
        assert!(raw.contains(r#""rbd":{"radosNamespace":""}"#), "{raw}");
    }

    #[test]
    fn empty_and_missing_document_parse_as_empty() {
        assert!(parse_document("").unwrap().is_empty());
        assert!(parse_document("[]").unwrap().is_empty());
        assert!(parse_document("not json").is_err());
    }

    #[test]
    fn driver_options_rewrite_preserves_identity() {
        let mut entries = vec![entry("id-1", "test"), entry("id-2", "other")];
        entries[0].cephfs = Some(CephFsConfig {
            subvolume_group: "group-a".into(),
            ..Default::default()
        });

        let options = CsiDriverOptions {
            read_affinity: ceph_port::ReadAffinity {
                enabled: true,
                crush_location_labels: vec!["topology.kubernetes.io/zone".into()],
            },
            cephfs: ceph_port::CephFsOptions {
                kernel_mount_options: "ms_mode=crc".into(),
                fuse_mount_options: String::new(),
            },
        };
        update_driver_options(&mut entries, "test", &options);

        let cephfs = entries[0].cephfs.as_ref().unwrap();
        assert_eq!(cephfs.subvolume_group, "group-a");
        assert_eq!(cephfs.kernel_mount_options, "ms_mode=crc");
        assert!(entries[0].read_affinity.as_ref().unwrap().enabled);
        // the other cluster is untouched
        assert!(entries[1].read_affinity.is_none());
    }
}
