use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Guard against forking workers from a stale image.
///
/// Captures a fingerprint of the supervisor's own executable at boot and
/// re-reads it before every spawn. After an in-place upgrade the bytes on disk
/// no longer match the running image, and forking from them would produce
/// workers of a different version than their master.
#[derive(Debug, Clone)]
pub struct VersionGuard {
    exe: PathBuf,
    fingerprint: String,
}

impl VersionGuard {
    pub fn capture() -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        let fingerprint = fingerprint(&exe)?;
        Ok(Self { exe, fingerprint })
    }

    #[cfg(test)]
    pub(crate) fn for_path(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            exe: path.to_path_buf(),
            fingerprint: fingerprint(path)?,
        })
    }

    /// Errors when the on-disk executable no longer matches the captured
    /// fingerprint (or can no longer be read). Callers treat this as fatal.
    pub fn ensure_current(&self) -> anyhow::Result<()> {
        let now = fingerprint(&self.exe)
            .with_context(|| format!("re-read executable {}", self.exe.display()))?;
        anyhow::ensure!(
            now == self.fingerprint,
            "executable {} changed on disk (was {}, now {now}); refusing to fork from a stale image",
            self.exe.display(),
            self.fingerprint
        );
        Ok(())
    }
}

fn fingerprint(path: &Path) -> anyhow::Result<String> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("stat executable {}", path.display()))?;
    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);
    Ok(format!("len={}/mtime={mtime_ms}", meta.len()))
}
