// ── Host radio availability ──
//
// On Linux the kernel exposes Bluetooth controllers under
// `/sys/class/bluetooth` and their kill switches under `/sys/class/rfkill`.
// Other platforms gate access inside the OS radio stack itself, so the
// probe reports ready and lets the first scan surface any refusal.

use std::io;
use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::RadioUnavailable;
use crate::hal::PermissionProbe;
use crate::types::RadioStatus;

/// Probe backed by sysfs.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    class_root: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new("/sys/class")
    }
}

impl SysfsProbe {
    pub fn new(class_root: impl Into<PathBuf>) -> Self {
        Self {
            class_root: class_root.into(),
        }
    }

    /// Synchronous probe; sysfs reads never block meaningfully.
    pub fn check(&self) -> RadioStatus {
        if !cfg!(target_os = "linux") {
            return RadioStatus::Ready;
        }
        match probe_sysfs(&self.class_root) {
            Ok(status) => status,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                RadioStatus::Unavailable(RadioUnavailable::PermissionDenied)
            }
            Err(e) => {
                debug!(error = %e, root = %self.class_root.display(), "sysfs probe failed");
                RadioStatus::Unavailable(RadioUnavailable::NoRadioPresent)
            }
        }
    }
}

impl PermissionProbe for SysfsProbe {
    fn probe(&self) -> BoxFuture<'_, RadioStatus> {
        Box::pin(async move { self.check() })
    }
}

fn probe_sysfs(root: &Path) -> io::Result<RadioStatus> {
    let controllers = root.join("bluetooth");
    if !controllers.is_dir() || std::fs::read_dir(&controllers)?.next().is_none() {
        return Ok(RadioStatus::Unavailable(RadioUnavailable::NoRadioPresent));
    }

    let rfkill = root.join("rfkill");
    if !rfkill.is_dir() {
        return Ok(RadioStatus::Ready);
    }
    for entry in std::fs::read_dir(&rfkill)? {
        let switch = entry?.path();
        if read_trimmed(&switch.join("type"))?.as_deref() != Some("bluetooth") {
            continue;
        }
        let hard = read_trimmed(&switch.join("hard"))?;
        let soft = read_trimmed(&switch.join("soft"))?;
        if hard.as_deref() == Some("1") || soft.as_deref() == Some("1") {
            return Ok(RadioStatus::Unavailable(RadioUnavailable::RadioDisabled));
        }
    }
    Ok(RadioStatus::Ready)
}

fn read_trimmed(path: &Path) -> io::Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
