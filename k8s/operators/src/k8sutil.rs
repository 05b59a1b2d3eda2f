//! Small helpers shared by all reconcilers: server-side apply, owner
//! references and the operator's own identity.

use k8s_openapi::{
    api::apps::v1::Deployment, apimachinery::pkg::apis::meta::v1::OwnerReference,
    NamespaceResourceScope,
};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ObjectMeta, Resource as KubeResource},
    Client, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Environment variable carrying the operator pod namespace.
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Environment variable carrying the operator pod name.
pub const POD_NAME_ENV: &str = "POD_NAME";

/// The namespace the operator itself (and thus the csi machinery) runs in.
pub fn operator_namespace() -> String {
    std::env::var(POD_NAMESPACE_ENV).unwrap_or_else(|_| utils::PRODUCT_NAME.to_string())
}

/// True when the error is a 404 from the API server.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the error is a conflict (409) from the API server.
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 409)
}

/// Server-side apply with this operator as the field manager.
pub async fn apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<K>
where
    K: KubeResource + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    let params = PatchParams::apply(utils::CSI_OPERATOR).force();
    Ok(api.patch(name, &params, &Patch::Apply(object)).await?)
}

/// Delete an object, treating 404 as success.
pub async fn delete_ignore_not_found<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: KubeResource + Clone + std::fmt::Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// An owner reference to the operator's own deployment, so that everything the
/// csi machinery creates is collected when the operator is uninstalled.
/// `block_owner_deletion` stays false: the drivers must not block teardown.
pub async fn operator_owner_reference(client: &Client) -> Result<Option<OwnerReference>> {
    let pod_name = match std::env::var(POD_NAME_ENV) {
        Ok(name) => name,
        Err(_) => return Ok(None),
    };
    // the pod name is `<deployment>-<replicaset hash>-<pod hash>`
    let deployment_name = pod_name.rsplitn(3, '-').nth(2).unwrap_or(&pod_name);

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &operator_namespace());
    let deployment = match deployments.get(deployment_name).await {
        Ok(d) => d,
        Err(error) if is_not_found(&error) => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    Ok(Some(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: deployment.name_any(),
        uid: deployment.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(false),
    }))
}

/// An owner reference to a namespaced CR, used where created objects are
/// one-to-one with the owning resource.
pub fn owner_reference_to<K>(owner: &K) -> Option<OwnerReference>
where
    K: KubeResource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

/// Add a finalizer to an object if not yet present.
pub async fn ensure_finalizer<K>(api: &Api<K>, object: &K, finalizer: &str) -> Result<()>
where
    K: KubeResource + Clone + std::fmt::Debug + DeserializeOwned + ResourceExt,
{
    if object.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let mut finalizers: Vec<String> = object.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(
        &object.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Remove a finalizer from an object, if present. A 404 is a success: the
/// object is already gone.
pub async fn remove_finalizer<K>(api: &Api<K>, name: &str, finalizer: &str) -> Result<()>
where
    K: KubeResource + Clone + std::fmt::Debug + DeserializeOwned + ResourceExt,
{
    let object = match api.get(name).await {
        Ok(object) => object,
        Err(error) if is_not_found(&error) => return Ok(()),
        Err(error) => return Err(error.into()),
    };
    let finalizers: Vec<String> = object
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    if finalizers.len() == object.finalizers().len() {
        return Ok(());
    }
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    match api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Object meta with our standard labels and optional owner.
pub fn object_meta(
    name: &str,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> ObjectMeta {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(utils::created_by_key(), utils::CSI_OPERATOR.to_string());
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o]),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn deployment_name_from_pod_name() {
        let pod_name = "operator-csi-5f6d8b9c4d-x2x7q";
        let deployment = pod_name.rsplitn(3, '-').nth(2).unwrap();
        assert_eq!(deployment, "operator-csi");
    }
}
