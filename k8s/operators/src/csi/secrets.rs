//! Capability-scoped Ceph keys for each csi identity, stored in well-known
//! opaque secrets next to the owning cluster.

use std::collections::BTreeMap;

use ceph_port::CephClient;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::Api, Client};
use tracing::info;
use utils::{
    CSI_CEPHFS_NODE_SECRET, CSI_CEPHFS_PROVISIONER_SECRET, CSI_RBD_NODE_SECRET,
    CSI_RBD_PROVISIONER_SECRET,
};

use crate::{error::Result, k8sutil};

const SECRET_TYPE: &str = "kubernetes.io/rook";

/// The csi identities a key is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsiIdentity {
    RbdProvisioner,
    RbdNode,
    CephFsProvisioner,
    CephFsNode,
}

impl CsiIdentity {
    pub const ALL: [CsiIdentity; 4] = [
        CsiIdentity::RbdProvisioner,
        CsiIdentity::RbdNode,
        CsiIdentity::CephFsProvisioner,
        CsiIdentity::CephFsNode,
    ];

    /// The Ceph user the key belongs to.
    pub fn user_name(&self) -> &'static str {
        match self {
            CsiIdentity::RbdProvisioner => "client.csi-rbd-provisioner",
            CsiIdentity::RbdNode => "client.csi-rbd-node",
            CsiIdentity::CephFsProvisioner => "client.csi-cephfs-provisioner",
            CsiIdentity::CephFsNode => "client.csi-cephfs-node",
        }
    }

    /// The user name as the csi drivers expect it in the secret, without the
    /// "client." prefix.
    pub fn short_user_name(&self) -> &'static str {
        self.user_name()
            .strip_prefix("client.")
            .expect("csi users are client.* entities")
    }

    /// The secret the key is stored in.
    pub fn secret_name(&self) -> &'static str {
        match self {
            CsiIdentity::RbdProvisioner => CSI_RBD_PROVISIONER_SECRET,
            CsiIdentity::RbdNode => CSI_RBD_NODE_SECRET,
            CsiIdentity::CephFsProvisioner => CSI_CEPHFS_PROVISIONER_SECRET,
            CsiIdentity::CephFsNode => CSI_CEPHFS_NODE_SECRET,
        }
    }

    /// The secret field prefix: the rbd driver expects `userID`/`userKey`,
    /// the cephfs driver `adminID`/`adminKey`.
    pub fn field_prefix(&self) -> &'static str {
        match self {
            CsiIdentity::RbdProvisioner | CsiIdentity::RbdNode => "user",
            CsiIdentity::CephFsProvisioner | CsiIdentity::CephFsNode => "admin",
        }
    }

    /// The capability list granted to the identity. This table is ABI: the
    /// strings must not drift, the drivers and existing clusters depend on
    /// them verbatim.
    pub fn caps(&self) -> Vec<(String, String)> {
        let caps: &[(&str, &str)] = match self {
            CsiIdentity::RbdNode => &[
                ("mon", "profile rbd"),
                ("mgr", "allow rw"),
                ("osd", "profile rbd"),
            ],
            CsiIdentity::RbdProvisioner => &[
                ("mon", "profile rbd, allow command 'osd blocklist'"),
                ("mgr", "allow rw"),
                ("osd", "profile rbd"),
            ],
            CsiIdentity::CephFsNode => &[
                ("mon", "allow r, allow command 'osd blocklist'"),
                ("mgr", "allow rw"),
                ("osd", "allow rw tag cephfs *=*"),
                ("mds", "allow rw"),
            ],
            CsiIdentity::CephFsProvisioner => &[
                ("mon", "allow r, allow command 'osd blocklist'"),
                ("mgr", "allow rw"),
                ("osd", "allow rw tag cephfs metadata=*"),
            ],
        };
        caps.iter()
            .map(|(who, what)| (who.to_string(), what.to_string()))
            .collect()
    }
}

/// The caps list as a single auth expression, for logging and tests.
pub fn format_caps(caps: &[(String, String)]) -> String {
    caps.iter()
        .map(|(who, what)| format!("{who} \"{what}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generate (or fetch) the key for every csi identity and store each in its
/// secret in the cluster namespace. Keys are never rotated here; a get on an
/// existing user returns the existing key.
pub async fn create_csi_secrets(
    client: &Client,
    ceph: &dyn CephClient,
    cluster_namespace: &str,
    owner: Option<OwnerReference>,
) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), cluster_namespace);

    for identity in CsiIdentity::ALL {
        let key = ceph
            .auth_get_or_create_key(identity.user_name(), &identity.caps())
            .await?;

        let prefix = identity.field_prefix();
        let mut string_data = BTreeMap::new();
        string_data.insert(
            format!("{prefix}ID"),
            identity.short_user_name().to_string(),
        );
        string_data.insert(format!("{prefix}Key"), key);

        let secret = Secret {
            metadata: k8sutil::object_meta(
                identity.secret_name(),
                cluster_namespace,
                owner.clone(),
            ),
            string_data: Some(string_data),
            type_: Some(SECRET_TYPE.to_string()),
            ..Default::default()
        };
        k8sutil::apply(&secrets, identity.secret_name(), &secret).await?;
    }

    info!(namespace = cluster_namespace, "created csi secrets");
    Ok(())
}

/// Remove the csi secrets of a cluster; used on teardown with cleanup.
pub async fn delete_csi_secrets(client: &Client, cluster_namespace: &str) -> Result<()> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), cluster_namespace);
    for identity in CsiIdentity::ALL {
        k8sutil::delete_ignore_not_found(&secrets, identity.secret_name()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_lists_are_pinned() {
        assert_eq!(
            format_caps(&CsiIdentity::RbdNode.caps()),
            r#"mon "profile rbd", mgr "allow rw", osd "profile rbd""#
        );
        assert_eq!(
            format_caps(&CsiIdentity::RbdProvisioner.caps()),
            r#"mon "profile rbd, allow command 'osd blocklist'", mgr "allow rw", osd "profile rbd""#
        );
        assert_eq!(
            format_caps(&CsiIdentity::CephFsNode.caps()),
            r#"mon "allow r, allow command 'osd blocklist'", mgr "allow rw", osd "allow rw tag cephfs *=*", mds "allow rw""#
        );
        assert_eq!(
            format_caps(&CsiIdentity::CephFsProvisioner.caps()),
            r#"mon "allow r, allow command 'osd blocklist'", mgr "allow rw", osd "allow rw tag cephfs metadata=*""#
        );
    }

    #[test]
    fn secret_field_prefixes() {
        assert_eq!(CsiIdentity::RbdNode.field_prefix(), "user");
        assert_eq!(CsiIdentity::RbdProvisioner.field_prefix(), "user");
        assert_eq!(CsiIdentity::CephFsNode.field_prefix(), "admin");
        assert_eq!(CsiIdentity::CephFsProvisioner.field_prefix(), "admin");
    }

    #[test]
    fn short_user_names_drop_the_client_prefix() {
        assert_eq!(
            CsiIdentity::RbdProvisioner.short_user_name(),
            "csi-rbd-provisioner"
        );
        assert_eq!(CsiIdentity::CephFsNode.short_user_name(), "csi-cephfs-node");
    }
}
