use ceph_port::CephError;
use snafu::Snafu;

/// Errors generated during the reconciliation loops.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Kubernetes client error: {}", source))]
    /// k8s client error
    Kube { source: kube::Error },

    #[snafu(display("Ceph error: {}", source))]
    /// Error returned by the Ceph capability.
    Ceph { source: CephError },

    #[snafu(display("csi cluster config in map {} is malformed: {}", name, source))]
    /// The shared config document no longer parses; never overwritten blindly.
    MalformedConfigDocument {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("failed to serialize {}: {}", what, source))]
    Serialize {
        what: String,
        source: serde_json::Error,
    },

    #[snafu(display("invalid csi version: {}", reason))]
    /// The detected csi image version is unusable or below the minimum.
    InvalidCsiVersion { reason: String },

    #[snafu(display("csi version detection job {} did not complete: {}", job, reason))]
    VersionProbe { job: String, reason: String },

    #[snafu(display("Invalid cr field : {}", field))]
    InvalidCRField { field: String },

    #[snafu(display(
        "mirroring is disabled on pool {} but requested on namespace {}",
        pool,
        namespace
    ))]
    /// The reconcile never silently elevates pool mirroring.
    PoolMirroringDisabled { pool: String, namespace: String },

    #[snafu(display("pool {} is not ready", pool))]
    PoolNotReady { pool: String },

    #[snafu(display("operator is not initialized yet"))]
    /// The mons are not ready; retried on a fixed 60s requeue.
    OperatorNotInitialized,

    #[snafu(display("cleanup job {} is still running", job))]
    /// Force-delete cleanup has been launched; retry until it finishes.
    CleanupRunning { job: String },

    Generic { message: String },
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        Self::Kube { source }
    }
}

impl From<CephError> for Error {
    fn from(source: CephError) -> Self {
        if source.is_uninitialized() {
            return Self::OperatorNotInitialized;
        }
        Self::Ceph { source }
    }
}

/// Result type of the reconcilers.
pub type Result<T, E = Error> = std::result::Result<T, E>;
