/// Moving a finished scan to its owner's home directory, or to quarantine.
///
/// The owner is the name of the directory the scan landed in. Destination
/// names are freshly generated UUIDs with the original extension, so nothing
/// of the original file name leaks and collisions cannot happen:
///
///   home:       `<home>/<users_subdir>/<uuid>.<ext>`
///   quarantine: `<quarantine>/<owner>-<uuid>.<ext>`
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::directory::HomeDirectoryResolver;
use crate::stability::{wait_until_unlocked, Stability, StabilityPolicy};

const UNKNOWN_OWNER: &str = "unknown";

/// Where a scan ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relocation {
    Home(PathBuf),
    Quarantined(PathBuf),
}

#[derive(Clone)]
pub struct Relocator {
    users_subdir: String,
    quarantine: PathBuf,
    directory: Arc<dyn HomeDirectoryResolver>,
}

impl Relocator {
    pub fn new(
        users_subdir: impl Into<String>,
        quarantine: impl Into<PathBuf>,
        directory: Arc<dyn HomeDirectoryResolver>,
    ) -> Self {
        Self {
            users_subdir: users_subdir.into(),
            quarantine: quarantine.into(),
            directory,
        }
    }

    pub fn quarantine(&self) -> &Path {
        &self.quarantine
    }

    /// Moves `path` to its owner's home directory, falling back to quarantine
    /// when the home is unknown, missing, or the move fails. Only a failure of
    /// the quarantine move itself is returned as an error.
    pub fn relocate(&self, path: &Path) -> Result<Relocation> {
        let owner = owner_of(path);
        let generated = generated_name(path);

        match self.valid_home(&owner) {
            Some(home) => match self.move_home(path, &home, &generated) {
                Ok(dest) => return Ok(Relocation::Home(dest)),
                Err(e) => error!("{e:#}"),
            },
            None => error!("Home directory for '{owner}' is invalid"),
        }

        self.move_to_quarantine(path, &owner, &generated)
            .map(Relocation::Quarantined)
    }

    fn valid_home(&self, owner: &str) -> Option<PathBuf> {
        self.directory
            .resolve_home_directory(owner)
            .filter(|home| !home.as_os_str().is_empty() && home.is_dir())
    }

    fn move_home(&self, path: &Path, home: &Path, generated: &str) -> Result<PathBuf> {
        let scan_dir = home.join(&self.users_subdir);
        fs::create_dir_all(&scan_dir)
            .with_context(|| format!("Failed to create {}", scan_dir.display()))?;
        let dest = scan_dir.join(generated);
        move_file(path, &dest)
            .with_context(|| format!("Failed to move {} to {}", path.display(), dest.display()))?;
        info!("Scan copy moved to {}", dest.display());
        Ok(dest)
    }

    fn move_to_quarantine(&self, path: &Path, owner: &str, generated: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.quarantine)
            .with_context(|| format!("Failed to create {}", self.quarantine.display()))?;
        let dest = self.quarantine.join(format!("{owner}-{generated}"));
        move_file(path, &dest).with_context(|| {
            format!("Failed to quarantine {} to {}", path.display(), dest.display())
        })?;
        info!("Scan copy moved to {}", dest.display());
        Ok(dest)
    }
}

/// One unit of work: wait for the writer to let go of `path`, then relocate
/// it. Blocks the calling thread; run it on the blocking pool.
pub fn settle_and_relocate(
    relocator: &Relocator,
    policy: &StabilityPolicy,
    path: &Path,
) -> Option<Relocation> {
    let span = info_span!("relocate", unit = %Uuid::new_v4());
    let _entered = span.enter();

    match wait_until_unlocked(path, policy) {
        Stability::Ready => {}
        Stability::Vanished => {
            debug!("{} disappeared before it could be moved", path.display());
            return None;
        }
        Stability::TimedOut => {
            warn!("Gave up waiting for {} to be released", path.display());
            return None;
        }
        Stability::Inaccessible(e) => {
            error!("Cannot open {}: {e}", path.display());
            return None;
        }
    }

    match relocator.relocate(path) {
        Ok(relocation) => Some(relocation),
        Err(e) => {
            error!("{e:#}");
            None
        }
    }
}

/// Name of the directory containing `path`, which identifies the scan's owner.
pub fn owner_of(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| UNKNOWN_OWNER.to_string())
}

/// A fresh `<uuid>.<ext>` name, or just `<uuid>` when `path` has no extension.
pub fn generated_name(path: &Path) -> String {
    let id = Uuid::new_v4();
    match path.extension() {
        Some(ext) => format!("{id}.{}", ext.to_string_lossy()),
        None => id.to_string(),
    }
}

/// Renames `from` to `to`, copying and deleting when a rename is not possible
/// (typically across filesystems).
fn move_file(from: &Path, to: &Path) -> Result<()> {
    let rename_err = match fs::rename(from, to) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(e.into()),
        Err(e) => e,
    };
    debug!(
        "Rename of {} failed ({rename_err}); falling back to copy",
        from.display()
    );
    copy_then_remove(from, to, |f, t| fs::copy(f, t))
        .with_context(|| format!("Copy after failed rename ({rename_err}) did not complete"))
}

/// Copies `from` to `to` and deletes `from`. Whatever reached `to` is removed
/// again if either step fails, so no partial file is left behind.
fn copy_then_remove<C>(from: &Path, to: &Path, copy: C) -> io::Result<()>
where
    C: FnOnce(&Path, &Path) -> io::Result<u64>,
{
    if let Err(e) = copy(from, to) {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    if let Err(e) = fs::remove_file(from) {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    Ok(())
}
