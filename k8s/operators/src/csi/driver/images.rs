//! The image-set map: logical component name to fully-qualified image, read
//! by the external csi operator in delegated mode.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client};
use utils::CSI_IMAGE_SET_CONFIGMAP_NAME;

use crate::{csi::config::Settings, error::Result, k8sutil};

/// The image-set config map contents.
pub fn image_set(settings: &Settings) -> BTreeMap<String, String> {
    let images = &settings.images;
    [
        ("provisioner", &images.provisioner),
        ("attacher", &images.attacher),
        ("resizer", &images.resizer),
        ("snapshotter", &images.snapshotter),
        ("registrar", &images.registrar),
        ("plugin", &images.plugin),
        ("addons", &images.addons),
    ]
    .into_iter()
    .map(|(component, image)| (component.to_string(), image.clone()))
    .collect()
}

/// Render the image-set config map.
pub fn render_image_set_configmap(operator_namespace: &str, settings: &Settings) -> ConfigMap {
    ConfigMap {
        metadata: k8sutil::object_meta(CSI_IMAGE_SET_CONFIGMAP_NAME, operator_namespace, None),
        data: Some(image_set(settings)),
        ..Default::default()
    }
}

/// Create or update the image-set config map.
pub async fn apply_image_set(
    client: &Client,
    operator_namespace: &str,
    settings: &Settings,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), operator_namespace);
    let config_map = render_image_set_configmap(operator_namespace, settings);
    k8sutil::apply(&api, CSI_IMAGE_SET_CONFIGMAP_NAME, &config_map).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_set_covers_every_component() {
        let settings = Settings::from_map(&BTreeMap::new());
        let set = image_set(&settings);
        for component in [
            "provisioner",
            "attacher",
            "resizer",
            "snapshotter",
            "registrar",
            "plugin",
            "addons",
        ] {
            assert!(set.contains_key(component), "missing {component}");
        }
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut data = BTreeMap::new();
        data.insert(
            "ROOK_CSI_PROVISIONER_IMAGE".to_string(),
            "example.com/provisioner:v9".to_string(),
        );
        let set = image_set(&Settings::from_map(&data));
        assert_eq!(
            set.get("provisioner").map(String::as_str),
            Some("example.com/provisioner:v9")
        );
        assert_eq!(
            set.get("plugin").map(String::as_str),
            Some(utils::DEFAULT_CSI_PLUGIN_IMAGE)
        );
    }
}
