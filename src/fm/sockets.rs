use crate::fm::config::BindTarget;
use crate::fm::fm_event;
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Filesystem listening addresses reported by workers.
///
/// Entries are never removed individually; the whole set is unlinked once at
/// shutdown. Permission repair runs after every (re)bind because the inode may
/// have just been recreated with restrictive default bits.
#[derive(Debug)]
pub struct SocketRegistry {
    paths: BTreeSet<PathBuf>,
    mode: u32,
}

impl SocketRegistry {
    pub fn new(mode: u32) -> Self {
        Self {
            paths: BTreeSet::new(),
            mode,
        }
    }

    /// Unlink a stale socket file left behind by a previous, uncleanly
    /// terminated instance. Must run before the first worker spawn.
    pub fn clear_stale_bind_path(bind: Option<&BindTarget>) -> anyhow::Result<()> {
        let Some(BindTarget::Path(p)) = bind else {
            return Ok(());
        };
        match std::fs::remove_file(p) {
            Ok(()) => {
                fm_event("socket", None, format!("removed_stale path={}", p.display()));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => anyhow::bail!("failed to remove stale socket {}: {e}", p.display()),
        }
    }

    /// Record a bound path and kick off an async permission repair.
    /// Returns false if the path was already registered (repair still runs).
    pub fn register(&mut self, path: PathBuf) -> bool {
        let added = self.paths.insert(path.clone());
        if added {
            fm_event("socket", None, format!("registered path={}", path.display()));
        }
        let mode = self.mode;
        tokio::spawn(async move {
            repair_permissions(&path, mode).await;
        });
        added
    }

    /// Unlink every registered path. Missing files are fine; anything else is
    /// logged and skipped (shutdown must not fail on cleanup).
    pub fn cleanup(&self) {
        for p in &self.paths {
            match std::fs::remove_file(p) {
                Ok(()) => fm_event("socket", None, format!("cleaned path={}", p.display())),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => fm_event(
                    "socket",
                    None,
                    format!("clean_failed path={} err={e}", p.display()),
                ),
            }
        }
    }
}

pub(crate) async fn repair_permissions(path: &Path, mode: u32) {
    let perms = PermissionsExt::from_mode(mode);
    if let Err(e) = tokio::fs::set_permissions(path, perms).await {
        fm_event(
            "socket",
            None,
            format!("chmod_failed path={} mode={mode:o} err={e}", path.display()),
        );
    }
}
