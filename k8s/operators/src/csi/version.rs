//! Detection of the running csi component version: a short-lived job prints
//! the image's `--version` banner, and feature availability is decided from
//! the parsed version.

use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use kube::{
    api::{Api, ListParams, LogParams, PostParams},
    Client, ResourceExt,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tracing::{info, warn};

use crate::{
    csi::config::Settings,
    error::{Error, Result},
    k8sutil,
};

/// Name of the short-lived detection job.
const DETECT_VERSION_JOB_NAME: &str = "rook-ceph-csi-detect-version";

/// How often the job's pod is polled for completion.
const POLL_PERIOD: Duration = Duration::from_secs(5);

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"v(\d+)\.(\d+)\.(\d+)").expect("a valid version regex"));

/// A csi component version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CephCsiVersion {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
}

/// The minimum version the operator drives.
pub const MINIMUM: CephCsiVersion = CephCsiVersion::new(3, 4, 0);
/// Custom ceph.conf overlays need at least this version.
const CUSTOM_CEPH_CONF: CephCsiVersion = CephCsiVersion::new(3, 5, 0);
/// Entering the multus net namespace via nsenter needs at least this version.
const NSENTER: CephCsiVersion = CephCsiVersion::new(3, 6, 1);

impl CephCsiVersion {
    pub const fn new(major: u32, minor: u32, bugfix: u32) -> Self {
        Self {
            major,
            minor,
            bugfix,
        }
    }

    /// Versions at or above the minimum are accepted, known or not.
    pub fn supported(&self) -> bool {
        *self >= MINIMUM
    }
}

impl std::fmt::Display for CephCsiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.bugfix)
    }
}

/// Parse a `--version` banner.
pub fn extract_version(stdout: &str) -> Result<CephCsiVersion> {
    let captures = VERSION_RE
        .captures(stdout)
        .ok_or_else(|| Error::InvalidCsiVersion {
            reason: format!("no version found in {stdout:?}"),
        })?;
    let part = |i: usize| {
        captures[i]
            .parse::<u32>()
            .map_err(|_| Error::InvalidCsiVersion {
                reason: format!("version part {:?} is not a number", &captures[i]),
            })
    };
    Ok(CephCsiVersion::new(part(1)?, part(2)?, part(3)?))
}

/// The feature set decided by the detected version. With `allow_unsupported`
/// every capability is forced on and `version` may be unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsiCapabilities {
    pub version: Option<CephCsiVersion>,
    pub allow_unsupported: bool,
}

impl CsiCapabilities {
    /// Mount a user-provided ceph.conf into the driver pods.
    pub fn supports_custom_ceph_conf(&self) -> bool {
        self.allow_unsupported || self.version.is_some_and(|v| v >= CUSTOM_CEPH_CONF)
    }

    /// Enter the multus net namespace file via nsenter.
    pub fn supports_nsenter(&self) -> bool {
        self.allow_unsupported || self.version.is_some_and(|v| v >= NSENTER)
    }
}

/// Probes the configured csi image and caches the result until the image
/// name changes.
#[derive(Debug, Default)]
pub struct VersionProbe {
    cache: Mutex<Option<(String, CephCsiVersion)>>,
}

impl VersionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detect the version of the configured image, reusing the cached result
    /// for an unchanged image name. Honors the 15 minute probe timeout.
    pub async fn detect(
        &self,
        client: &Client,
        namespace: &str,
        settings: &Settings,
    ) -> Result<CsiCapabilities> {
        let image = settings.images.plugin.clone();

        if let Some((cached_image, version)) = self.cache.lock().as_ref() {
            if *cached_image == image {
                return Ok(CsiCapabilities {
                    version: Some(*version),
                    allow_unsupported: settings.allow_unsupported_version,
                });
            }
        }

        info!(%image, "detecting the ceph csi image version");
        let version = match self.run_probe(client, namespace, settings).await {
            Ok(stdout) => match extract_version(&stdout) {
                Ok(version) => Some(version),
                Err(error) if settings.allow_unsupported_version => {
                    warn!(%error, "failed to parse csi version, continuing with unsupported image");
                    None
                }
                Err(error) => return Err(error),
            },
            Err(error) if settings.allow_unsupported_version => {
                warn!(%error, "csi version probe failed, continuing with unsupported image");
                None
            }
            Err(error) => return Err(error),
        };

        if let Some(version) = version {
            info!(%version, "detected ceph csi image version");
            if !version.supported() && !settings.allow_unsupported_version {
                return Err(Error::InvalidCsiVersion {
                    reason: format!("ceph csi image needs to be at least version {MINIMUM}"),
                });
            }
            *self.cache.lock() = Some((image, version));
        }

        Ok(CsiCapabilities {
            version,
            allow_unsupported: settings.allow_unsupported_version,
        })
    }

    /// Run the `--version` job and return its stdout.
    async fn run_probe(
        &self,
        client: &Client,
        namespace: &str,
        settings: &Settings,
    ) -> Result<String> {
        let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

        // a leftover job from an interrupted reconcile would make the create
        // fail, remove it first
        k8sutil::delete_ignore_not_found(&jobs, DETECT_VERSION_JOB_NAME).await?;

        let job = detect_version_job(namespace, settings);
        jobs.create(&PostParams::default(), &job).await?;

        let timeout: Duration = utils::CSI_VERSION_PROBE_TIMEOUT
            .parse::<humantime::Duration>()
            .expect("a valid probe timeout")
            .into();

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let selector = format!("job-name={DETECT_VERSION_JOB_NAME}");
                let pod_list = pods.list(&ListParams::default().labels(&selector)).await?;
                for pod in pod_list {
                    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                        Some("Succeeded") => {
                            let logs = pods.logs(&pod.name_any(), &LogParams::default()).await?;
                            return Ok(logs);
                        }
                        Some("Failed") => {
                            return Err(Error::VersionProbe {
                                job: DETECT_VERSION_JOB_NAME.to_string(),
                                reason: "job pod failed".to_string(),
                            })
                        }
                        _ => {}
                    }
                }
                tokio::time::sleep(POLL_PERIOD).await;
            }
        })
        .await;

        // best effort cleanup, a stale job is removed on the next probe anyway
        let _ = k8sutil::delete_ignore_not_found(&jobs, DETECT_VERSION_JOB_NAME).await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::VersionProbe {
                job: DETECT_VERSION_JOB_NAME.to_string(),
                reason: format!("did not complete within {}", utils::CSI_VERSION_PROBE_TIMEOUT),
            }),
        }
    }
}

/// The job spec: one container running the csi image with `--version`.
fn detect_version_job(namespace: &str, settings: &Settings) -> Job {
    Job {
        metadata: k8sutil::object_meta(DETECT_VERSION_JOB_NAME, namespace, None),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "csi-version".to_string(),
                        image: Some(settings.images.plugin.clone()),
                        args: Some(vec!["--version".to_string()]),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    // the probe must run wherever the provisioner can run
                    tolerations: (!settings.provisioner_tolerations.is_empty())
                        .then(|| settings.provisioner_tolerations.clone()),
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

    #[test]
    fn banner_parses() {
        let stdout = "cephcsi 2023\nversion: v3.9.0 (release)\n";
        assert_eq!(
            extract_version(stdout).unwrap(),
            CephCsiVersion::new(3, 9, 0)
        );
    }

    #[test]
    fn malformed_banner_is_an_error() {
        assert!(extract_version("no version here").is_err());
        assert!(extract_version("v3.9").is_err());
    }

    #[test]
    fn minimum_version_is_enforced() {
        assert!(!CephCsiVersion::new(3, 3, 9).supported());
        assert!(CephCsiVersion::new(3, 4, 0).supported());
        // unknown future versions above the minimum are accepted
        assert!(CephCsiVersion::new(9, 0, 0).supported());
    }

    #[test]
    fn capability_cutoffs() {
        let caps = |v| CsiCapabilities {
            version: Some(v),
            allow_unsupported: false,
        };
        assert!(!caps(CephCsiVersion::new(3, 4, 9)).supports_custom_ceph_conf());
        assert!(caps(CephCsiVersion::new(3, 5, 0)).supports_custom_ceph_conf());
        assert!(!caps(CephCsiVersion::new(3, 6, 0)).supports_nsenter());
        assert!(caps(CephCsiVersion::new(3, 6, 1)).supports_nsenter());
    }

    #[test]
    fn allow_unsupported_forces_capabilities() {
        let caps = CsiCapabilities {
            version: None,
            allow_unsupported: true,
        };
        assert!(caps.supports_custom_ceph_conf());
        assert!(caps.supports_nsenter());
    }
}
