use snafu::Snafu;

/// Result type used throughout the Ceph port.
pub type Result<T, E = CephError> = std::result::Result<T, E>;

/// Errors surfaced by a [`crate::CephClient`] implementation.
///
/// The variants mirror the error classes the reconcilers dispatch on: an
/// already-absent object on delete is a success, a non-empty object on delete
/// needs the force-delete path, and an uninitialized cluster config means the
/// mons are not ready yet so the reconcile should requeue rather than fail.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CephError {
    #[snafu(display("{} does not exist", object))]
    /// The Ceph object was not found (ENOENT).
    NotFound { object: String },

    #[snafu(display("{} is not empty", object))]
    /// The Ceph object still holds data (ENOTEMPTY).
    NotEmpty { object: String },

    #[snafu(display("ceph config is not initialized yet"))]
    /// The mon quorum is not formed; commands cannot run yet.
    UninitializedConfig,

    #[snafu(display("mon endpoint {} is not of the form ip:port", endpoint))]
    /// A monitor endpoint could not be parsed.
    InvalidMonEndpoint { endpoint: String },

    #[snafu(display("ceph command failed with code {}: {}", code, stderr))]
    /// A command ran and returned a non-zero exit code.
    Command { code: i32, stderr: String },

    #[snafu(display("{}", message))]
    Generic { message: String },
}

impl CephError {
    /// True when a delete found nothing to delete.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CephError::NotFound { .. })
    }

    /// True when a delete was refused because the object still holds data.
    pub fn is_not_empty(&self) -> bool {
        matches!(self, CephError::NotEmpty { .. })
    }

    /// True when the cluster cannot accept commands yet.
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, CephError::UninitializedConfig)
    }
}
