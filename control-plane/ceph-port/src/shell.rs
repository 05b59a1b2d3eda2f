//! A [`CephClient`] that shells out to the `ceph`/`rbd` command line tools,
//! addressing each cluster through its generated config file under the
//! operator data dir.

use std::path::{Path, PathBuf};
use std::process::Output;

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::{
    CephClient, CephError, ClusterInfo, MirrorPoolStatus, MirroredImages, MonInfo, PoolMirrorInfo,
    RadosNamespaceMirroring, Result, SnapshotSchedule,
};

/// errno values surfaced by the ceph tools as process exit codes.
const ENOENT: i32 = 2;
const ENOTEMPTY: i32 = 39;

/// Runs ceph commands against the cluster whose config lives under
/// `<data_dir>/<namespace>/<namespace>.config`.
#[derive(Debug, Clone)]
pub struct CephShellClient {
    data_dir: PathBuf,
    /// The namespace of the cluster this client addresses by default.
    cluster_namespace: String,
}

#[derive(Deserialize)]
struct MonDumpEntry {
    name: String,
    public_addr: String,
}

#[derive(Deserialize)]
struct MonDump {
    fsid: String,
    #[serde(default)]
    mons: Vec<MonDumpEntry>,
}

#[derive(Deserialize)]
struct AuthKey {
    key: String,
}

#[derive(Deserialize)]
struct MirrorPoolInfoOutput {
    mode: String,
    #[serde(default)]
    site_name: Option<String>,
}

#[derive(Deserialize, Default)]
struct MirrorImageEntry {
    name: String,
}

#[derive(Deserialize, Default)]
struct MirrorPoolStatusOutput {
    #[serde(default)]
    summary: MirrorStatusSummaryOutput,
    #[serde(default)]
    images: Vec<MirrorImageEntry>,
}

#[derive(Deserialize, Default)]
struct MirrorStatusSummaryOutput {
    #[serde(default)]
    health: String,
    #[serde(default)]
    daemon_health: String,
    #[serde(default)]
    image_health: String,
    #[serde(default)]
    states: std::collections::BTreeMap<String, u32>,
}

impl CephShellClient {
    pub fn new(data_dir: impl Into<PathBuf>, cluster_namespace: &str) -> Self {
        Self {
            data_dir: data_dir.into(),
            cluster_namespace: cluster_namespace.to_string(),
        }
    }

    fn conf(&self) -> PathBuf {
        self.conf_path(&self.cluster_namespace)
    }

    fn conf_path(&self, namespace: &str) -> PathBuf {
        self.data_dir.join(namespace).join(format!("{namespace}.config"))
    }

    async fn run(&self, program: &str, conf: &Path, args: &[&str]) -> Result<String> {
        debug!(%program, ?args, "running ceph command");
        let output = tokio::process::Command::new(program)
            .arg("--conf")
            .arg(conf)
            .args(args)
            .output()
            .await
            .map_err(|error| CephError::Generic {
                message: format!("failed to spawn {program}: {error}"),
            })?;
        Self::map_output(output)
    }

    fn map_output(output: Output) -> Result<String> {
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        match output.status.code() {
            Some(ENOENT) => Err(CephError::NotFound { object: stderr }),
            Some(ENOTEMPTY) => Err(CephError::NotEmpty { object: stderr }),
            Some(code) => Err(CephError::Command { code, stderr }),
            None => Err(CephError::Generic {
                message: format!("command terminated by signal: {stderr}"),
            }),
        }
    }

    fn pool_spec(pool: &str, namespace: &str) -> String {
        if namespace.is_empty() {
            pool.to_string()
        } else {
            format!("{pool}/{namespace}")
        }
    }

    fn parse_json<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<T> {
        serde_json::from_str(stdout).map_err(|error| CephError::Generic {
            message: format!("unexpected command output: {error}"),
        })
    }
}

#[async_trait::async_trait]
impl CephClient for CephShellClient {
    async fn load_cluster_info(&self, namespace: &str) -> Result<ClusterInfo> {
        let conf = self.conf_path(namespace);
        // the config file appears once the mons have formed quorum
        if !conf.exists() {
            return Err(CephError::UninitializedConfig);
        }

        let stdout = self
            .run("ceph", &conf, &["mon", "dump", "--format", "json"])
            .await?;
        let dump: MonDump = Self::parse_json(&stdout)?;

        let mut monitors = IndexMap::new();
        for mon in dump.mons {
            // public_addr carries a nonce suffix like "10.0.0.1:3300/0"
            let endpoint = mon
                .public_addr
                .split('/')
                .next()
                .unwrap_or(&mon.public_addr)
                .to_string();
            monitors.insert(mon.name.clone(), MonInfo::new(mon.name, endpoint));
        }

        Ok(ClusterInfo {
            name: namespace.to_string(),
            namespace: namespace.to_string(),
            fsid: dump.fsid,
            monitors,
            ..Default::default()
        })
    }

    async fn auth_get_or_create_key(
        &self,
        user: &str,
        caps: &[(String, String)],
    ) -> Result<String> {
        let conf = self.conf();
        let mut args = vec![
            "auth".to_string(),
            "get-or-create-key".to_string(),
            user.to_string(),
        ];
        for (who, what) in caps {
            args.push(who.clone());
            args.push(what.clone());
        }
        args.push("--format".to_string());
        args.push("json".to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let stdout = self.run("ceph", &conf, &arg_refs).await?;
        let key: AuthKey = Self::parse_json(&stdout)?;
        Ok(key.key)
    }

    async fn create_cephfs_subvolume_group(&self, fs_name: &str, group_name: &str) -> Result<()> {
        let conf = self.conf();
        self.run(
            "ceph",
            &conf,
            &["fs", "subvolumegroup", "create", fs_name, group_name],
        )
        .await
        .map(|_| ())
    }

    async fn delete_cephfs_subvolume_group(&self, fs_name: &str, group_name: &str) -> Result<()> {
        let conf = self.conf();
        self.run(
            "ceph",
            &conf,
            &["fs", "subvolumegroup", "rm", fs_name, group_name],
        )
        .await
        .map(|_| ())
    }

    async fn pin_cephfs_subvolume_group(
        &self,
        fs_name: &str,
        group_name: &str,
        pinning: &str,
    ) -> Result<()> {
        let conf = self.conf();
        let (pin_type, pin_setting) =
            pinning.split_once('=').ok_or_else(|| CephError::Generic {
                message: format!("pinning {pinning:?} is not of the form type=value"),
            })?;
        self.run(
            "ceph",
            &conf,
            &[
                "fs",
                "subvolumegroup",
                "pin",
                fs_name,
                group_name,
                pin_type,
                pin_setting,
            ],
        )
        .await
        .map(|_| ())
    }

    async fn create_rados_namespace(&self, pool: &str, namespace: &str) -> Result<()> {
        let conf = self.conf();
        self.run(
            "rbd",
            &conf,
            &["namespace", "create", "--pool", pool, "--namespace", namespace],
        )
        .await
        .map(|_| ())
    }

    async fn delete_rados_namespace(&self, pool: &str, namespace: &str) -> Result<()> {
        let conf = self.conf();
        self.run(
            "rbd",
            &conf,
            &["namespace", "remove", "--pool", pool, "--namespace", namespace],
        )
        .await
        .map(|_| ())
    }

    async fn get_pool_mirroring_info(&self, pool: &str) -> Result<PoolMirrorInfo> {
        let conf = self.conf();
        let stdout = self
            .run("rbd", &conf, &["mirror", "pool", "info", pool, "--format", "json"])
            .await?;
        let info: MirrorPoolInfoOutput = Self::parse_json(&stdout)?;
        let mode = info
            .mode
            .parse::<RadosNamespaceMirroring>()
            .unwrap_or(RadosNamespaceMirroring::Disabled);
        Ok(PoolMirrorInfo {
            mode,
            site_name: info.site_name,
        })
    }

    async fn get_mirrored_pool_images(
        &self,
        pool: &str,
        namespace: &str,
    ) -> Result<MirroredImages> {
        let conf = self.conf();
        let spec = Self::pool_spec(pool, namespace);
        let stdout = self
            .run(
                "rbd",
                &conf,
                &["mirror", "pool", "status", &spec, "--verbose", "--format", "json"],
            )
            .await?;
        let status: MirrorPoolStatusOutput = Self::parse_json(&stdout)?;
        Ok(MirroredImages {
            images: status.images.into_iter().map(|i| i.name).collect(),
        })
    }

    async fn enable_rbd_rados_namespace_mirroring(
        &self,
        pool: &str,
        namespace: &str,
        remote_namespace: Option<&str>,
        mode: RadosNamespaceMirroring,
    ) -> Result<()> {
        let conf = self.conf();
        let spec = Self::pool_spec(pool, namespace);
        let mode = mode.to_string();
        let mut args: Vec<&str> = vec!["mirror", "pool", "enable", spec.as_str(), mode.as_str()];
        if let Some(remote_namespace) = remote_namespace {
            args.push("--remote-namespace");
            args.push(remote_namespace);
        }
        self.run("rbd", &conf, &args).await.map(|_| ())
    }

    async fn disable_rbd_rados_namespace_mirroring(
        &self,
        pool: &str,
        namespace: &str,
    ) -> Result<()> {
        let conf = self.conf();
        let spec = Self::pool_spec(pool, namespace);
        self.run("rbd", &conf, &["mirror", "pool", "disable", &spec])
            .await
            .map(|_| ())
    }

    async fn enable_snapshot_schedules(
        &self,
        pool: &str,
        namespace: &str,
        schedules: &[SnapshotSchedule],
    ) -> Result<()> {
        let conf = self.conf();
        for schedule in schedules {
            let mut args = vec![
                "mirror",
                "snapshot",
                "schedule",
                "add",
                "--pool",
                pool,
            ];
            if !namespace.is_empty() {
                args.push("--namespace");
                args.push(namespace);
            }
            args.push(&schedule.interval);
            if let Some(start_time) = &schedule.start_time {
                args.push(start_time);
            }
            self.run("rbd", &conf, &args).await?;
        }
        Ok(())
    }

    async fn get_mirror_status(&self, pool: &str, namespace: &str) -> Result<MirrorPoolStatus> {
        let conf = self.conf();
        let spec = Self::pool_spec(pool, namespace);
        let stdout = self
            .run("rbd", &conf, &["mirror", "pool", "status", &spec, "--format", "json"])
            .await?;
        let status: MirrorPoolStatusOutput = Self::parse_json(&stdout)?;
        Ok(MirrorPoolStatus {
            health: status.summary.health,
            daemon_health: status.summary.daemon_health,
            image_health: status.summary.image_health,
            states: status.summary.states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw((code & 0xff) << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn exit_codes_classify() {
        assert!(CephShellClient::map_output(output(0, "ok", "")).is_ok());
        assert!(matches!(
            CephShellClient::map_output(output(ENOENT, "", "missing")),
            Err(CephError::NotFound { .. })
        ));
        assert!(matches!(
            CephShellClient::map_output(output(ENOTEMPTY, "", "busy")),
            Err(CephError::NotEmpty { .. })
        ));
        assert!(matches!(
            CephShellClient::map_output(output(1, "", "boom")),
            Err(CephError::Command { code: 1, .. })
        ));
    }

    #[test]
    fn mon_dump_parses_and_strips_nonce() {
        let stdout = r#"{"fsid":"5f1d3d7c","mons":[{"name":"a","public_addr":"10.0.0.1:3300/0"}]}"#;
        let dump: MonDump = CephShellClient::parse_json(stdout).unwrap();
        assert_eq!(dump.fsid, "5f1d3d7c");
        let endpoint = dump.mons[0].public_addr.split('/').next().unwrap();
        assert_eq!(endpoint, "10.0.0.1:3300");
    }

    #[test]
    fn pool_specs() {
        assert_eq!(CephShellClient::pool_spec("replicapool", ""), "replicapool");
        assert_eq!(
            CephShellClient::pool_spec("replicapool", "ns-a"),
            "replicapool/ns-a"
        );
    }
}
