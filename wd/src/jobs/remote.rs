//! Remote init and file install, deduplicated by install target
//!
//! Before the first job lands on a remote platform, its install target
//! needs the run directory tree, authentication material, and any
//! configured included files. Both steps run as helpers through the
//! subprocess pool; this manager tracks one state per install target.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::platform::Platform;
use crate::procpool::{ProcJob, ProcJobKind, ProcResult, SubProcPool};

/// Per-install-target progress of remote setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    InitPending,
    InitDone,
    FileInstallPending,
    FileInstallDone,
    InitFailed,
    FileInstallFailed,
    /// SSH exit 255: the host is unreachable.
    Unreachable,
}

impl RemoteState {
    /// Terminal failure states: the submission attempt fails.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            RemoteState::InitFailed | RemoteState::FileInstallFailed | RemoteState::Unreachable
        )
    }
}

#[derive(Debug, Default)]
pub struct RemoteManager {
    map: HashMap<String, RemoteState>,
    /// Service directory holding credential files to push to targets.
    service_dir: String,
}

impl RemoteManager {
    pub fn new(service_dir: impl Into<String>) -> Self {
        Self {
            map: HashMap::new(),
            service_dir: service_dir.into(),
        }
    }

    pub fn state(&self, install_target: &str) -> Option<RemoteState> {
        self.map.get(install_target).copied()
    }

    /// Reset all targets, e.g. on reload, to force fresh file installation.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Forget one target so a later submission attempt re-inits it.
    pub fn clear_target(&mut self, install_target: &str) {
        self.map.remove(install_target);
    }

    /// Kick off remote init for the platform's install target. A no-op if
    /// already in progress or done.
    pub fn remote_init(&mut self, platform: &Platform, pool: &mut SubProcPool) {
        let target = platform.install_target().to_string();
        if platform.is_local() || self.map.contains_key(&target) {
            return;
        }
        let host = platform.hosts.first().cloned().unwrap_or_else(|| target.clone());
        // Directory tree, then authentication material.
        let command = format!(
            "{ssh} {host} 'mkdir -p {run_dir} {work_dir} {share_dir} {run_dir}/.service' \
             && scp -pqr {service_dir}/client_keys {host}:{run_dir}/.service/",
            ssh = platform.ssh_command,
            host = host,
            run_dir = platform.run_dir,
            work_dir = platform.work_dir,
            share_dir = platform.share_dir,
            service_dir = self.service_dir,
        );
        info!(install_target = %target, "remote init started");
        self.map.insert(target.clone(), RemoteState::InitPending);
        pool.submit(ProcJob {
            kind: ProcJobKind::RemoteInit { install_target: target },
            command,
        });
    }

    /// Rsync included files to an init-done target.
    pub fn file_install(&mut self, platform: &Platform, pool: &mut SubProcPool) {
        let target = platform.install_target().to_string();
        if self.map.get(&target) != Some(&RemoteState::InitDone) {
            return;
        }
        let host = platform.hosts.first().cloned().unwrap_or_else(|| target.clone());
        let includes = if platform.install_includes.is_empty() {
            ".".to_string()
        } else {
            platform.install_includes.join(" ")
        };
        let command = format!(
            "rsync -a --rsh='{ssh}' {includes} {host}:{run_dir}/",
            ssh = platform.ssh_command,
            includes = includes,
            host = host,
            run_dir = platform.run_dir,
        );
        info!(install_target = %target, "file install started");
        self.map.insert(target.clone(), RemoteState::FileInstallPending);
        pool.submit(ProcJob {
            kind: ProcJobKind::FileInstall { install_target: target },
            command,
        });
    }

    /// Apply a finished helper result from the subprocess pool.
    pub fn handle_result(&mut self, result: &ProcResult) {
        match &result.kind {
            ProcJobKind::RemoteInit { install_target } => {
                let state = if result.succeeded() {
                    info!(install_target = %install_target, "remote init done");
                    RemoteState::InitDone
                } else if result.unreachable() {
                    warn!(install_target = %install_target, "remote init: host unreachable");
                    RemoteState::Unreachable
                } else {
                    warn!(install_target = %install_target, stderr = %result.stderr.trim(), "remote init failed");
                    RemoteState::InitFailed
                };
                self.map.insert(install_target.clone(), state);
            }
            ProcJobKind::FileInstall { install_target } => {
                let state = if result.succeeded() {
                    info!(install_target = %install_target, "file install done");
                    RemoteState::FileInstallDone
                } else if result.unreachable() {
                    warn!(install_target = %install_target, "file install: host unreachable");
                    RemoteState::Unreachable
                } else {
                    warn!(install_target = %install_target, stderr = %result.stderr.trim(), "file install failed");
                    RemoteState::FileInstallFailed
                };
                self.map.insert(install_target.clone(), state);
            }
            _ => debug!("result is not a remote setup job"),
        }
    }

    /// Whether jobs may be submitted to this platform yet.
    /// Local platforms never need remote setup.
    pub fn ready_for(&self, platform: &Platform) -> bool {
        platform.is_local() || self.state(platform.install_target()) == Some(RemoteState::FileInstallDone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_platform() -> Platform {
        Platform {
            install_target: "hpc".into(),
            hosts: vec!["hpc-login1".into()],
            ..Default::default()
        }
    }

    fn result(kind: ProcJobKind, exit_code: i32) -> ProcResult {
        ProcResult {
            kind,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_local_platform_always_ready() {
        let mgr = RemoteManager::new("/run/.service");
        assert!(mgr.ready_for(&Platform::localhost()));
        assert!(!mgr.ready_for(&remote_platform()));
    }

    #[tokio::test]
    async fn test_init_dedup_by_install_target() {
        let mut mgr = RemoteManager::new("/run/.service");
        let mut pool = SubProcPool::new(1);
        let platform = remote_platform();
        mgr.remote_init(&platform, &mut pool);
        mgr.remote_init(&platform, &mut pool);
        assert_eq!(mgr.state("hpc"), Some(RemoteState::InitPending));
        // Only one init job queued.
        pool.process();
        assert!(pool.is_not_done());
    }

    #[test]
    fn test_init_then_install_flow() {
        let mut mgr = RemoteManager::new("/run/.service");
        let mut pool = SubProcPool::new(1);
        let platform = remote_platform();
        mgr.remote_init(&platform, &mut pool);
        mgr.handle_result(&result(
            ProcJobKind::RemoteInit {
                install_target: "hpc".into(),
            },
            0,
        ));
        assert_eq!(mgr.state("hpc"), Some(RemoteState::InitDone));
        mgr.file_install(&platform, &mut pool);
        assert_eq!(mgr.state("hpc"), Some(RemoteState::FileInstallPending));
        mgr.handle_result(&result(
            ProcJobKind::FileInstall {
                install_target: "hpc".into(),
            },
            0,
        ));
        assert!(mgr.ready_for(&platform));
    }

    #[test]
    fn test_ssh_255_is_unreachable() {
        let mut mgr = RemoteManager::new("/run/.service");
        let mut pool = SubProcPool::new(1);
        mgr.remote_init(&remote_platform(), &mut pool);
        mgr.handle_result(&result(
            ProcJobKind::RemoteInit {
                install_target: "hpc".into(),
            },
            255,
        ));
        assert_eq!(mgr.state("hpc"), Some(RemoteState::Unreachable));
        assert!(mgr.state("hpc").unwrap().is_failed());
    }
}
