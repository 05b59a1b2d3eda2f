//! The csi machinery: settings, the shared cluster config document, driver
//! secrets, version detection, multus network plumbing, driver rendering and
//! the cluster-wide reconciler.

pub mod cluster_config;
pub mod config;
pub mod connection;
pub mod controller;
pub mod driver;
pub mod network;
pub mod predicate;
pub mod secrets;
pub mod version;
