//! Watch filters. A kube watcher delivers no "old" object with an update, so
//! the settings-map filter keeps the previously seen csi key set and admits
//! an event only when that set changed.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use parking_lot::Mutex;
use utils::OPERATOR_SETTING_CONFIGMAP_NAME;

use super::config::is_csi_setting;
use crate::crd::CephCluster;

/// Remembers the csi-relevant contents of the operator settings map between
/// watch events.
#[derive(Default)]
pub struct SettingsChangeCache {
    last_seen: Mutex<Option<BTreeMap<String, String>>>,
}

impl SettingsChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an event on the operator settings map only when a csi-prefixed
    /// key changed. Events on other config maps are dropped.
    pub fn admit(&self, config_map: &ConfigMap) -> bool {
        if config_map.name_any() != OPERATOR_SETTING_CONFIGMAP_NAME {
            return false;
        }

        let csi_settings: BTreeMap<String, String> = config_map
            .data
            .iter()
            .flatten()
            .filter(|(key, _)| is_csi_setting(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut last_seen = self.last_seen.lock();
        let changed = last_seen.as_ref() != Some(&csi_settings);
        *last_seen = Some(csi_settings);
        changed
    }
}

/// CephCluster creations are admitted on their first generation only; later
/// generations arrive as updates and carry no new information for the csi
/// machinery beyond what the settings map already triggers.
pub fn admit_cluster_create(cluster: &CephCluster) -> bool {
    cluster.metadata.generation.unwrap_or(0) <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_map(pairs: &[(&str, &str)]) -> ConfigMap {
        let mut config_map = ConfigMap {
            data: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        };
        config_map.metadata.name = Some(OPERATOR_SETTING_CONFIGMAP_NAME.to_string());
        config_map.metadata.namespace = Some("rook-ceph".to_string());
        config_map
    }

    #[test]
    fn first_observation_is_admitted() {
        let cache = SettingsChangeCache::new();
        assert!(cache.admit(&settings_map(&[("ROOK_CSI_ENABLE_RBD", "true")])));
    }

    #[test]
    fn unchanged_settings_are_dropped() {
        let cache = SettingsChangeCache::new();
        let cm = settings_map(&[("ROOK_CSI_ENABLE_RBD", "true")]);
        assert!(cache.admit(&cm));
        assert!(!cache.admit(&cm));
    }

    #[test]
    fn non_csi_key_changes_are_dropped() {
        let cache = SettingsChangeCache::new();
        assert!(cache.admit(&settings_map(&[
            ("ROOK_CSI_ENABLE_RBD", "true"),
            ("ROOK_LOG_LEVEL", "INFO"),
        ])));
        // only the non-csi key changed
        assert!(!cache.admit(&settings_map(&[
            ("ROOK_CSI_ENABLE_RBD", "true"),
            ("ROOK_LOG_LEVEL", "DEBUG"),
        ])));
        // a csi key changed
        assert!(cache.admit(&settings_map(&[
            ("ROOK_CSI_ENABLE_RBD", "false"),
            ("ROOK_LOG_LEVEL", "DEBUG"),
        ])));
    }

    #[test]
    fn other_config_maps_are_dropped() {
        let cache = SettingsChangeCache::new();
        let mut cm = settings_map(&[("ROOK_CSI_ENABLE_RBD", "true")]);
        cm.metadata.name = Some("some-other-map".to_string());
        assert!(!cache.admit(&cm));
    }

    #[test]
    fn cluster_creates_admitted_on_first_generation() {
        use crate::crd::CephClusterSpec;
        let mut cluster = CephCluster::new("testCluster", CephClusterSpec::default());
        cluster.metadata.generation = Some(1);
        assert!(admit_cluster_create(&cluster));
        cluster.metadata.generation = Some(2);
        assert!(!admit_cluster_create(&cluster));
    }
}
