//! Scoped on-disk copy of the Ceph secret key.
//!
//! The key is handed to `rbd` through `--keyfile=<path>` so it never shows
//! up in the process list. Each file gets a random `keyfile-` name and
//! owner-only permissions inside an owner-only directory, and is removed by
//! [`CredentialFile::close`] or, failing that, when the guard is dropped.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::TempPath;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const KEY_FILE_PREFIX: &str = "keyfile-";

#[derive(Debug)]
pub struct CredentialFile {
    path: TempPath,
}

impl CredentialFile {
    /// Writes `key` to a new, uniquely named file under `dir`.
    ///
    /// `dir` is created with mode 0700 when missing. An existing directory
    /// must belong to the current user and is narrowed to 0700 if group or
    /// other bits are set. The key is only written once that holds.
    pub fn create(dir: &Path, key: &str) -> Result<Self> {
        ensure_dir(dir).map_err(Error::CredentialWriteFailed)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix(KEY_FILE_PREFIX);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(fs::Permissions::from_mode(0o600));
        }

        // Dropping `file` on any error below removes it.
        let mut file = builder.tempfile_in(dir).map_err(Error::CredentialWriteFailed)?;
        restrict_dir(dir, file.as_file()).map_err(Error::CredentialWriteFailed)?;
        file.write_all(key.as_bytes())
            .and_then(|_| file.as_file().sync_all())
            .map_err(Error::CredentialWriteFailed)?;

        let path = file.into_temp_path();
        debug!("Stored credential in {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file, reporting failure to the caller.
    pub fn close(self) -> Result<()> {
        self.path.close().map_err(Error::CredentialCleanupFailed)
    }
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", dir.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder.create(dir)
        }
        Err(e) => Err(e),
    }
}

/// `created` is a file this process just made in `dir`, so its owner is
/// the effective user.
#[cfg(unix)]
fn restrict_dir(dir: &Path, created: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let meta = fs::metadata(dir)?;
    let uid = created.metadata()?.uid();
    if meta.uid() != uid {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "{} is owned by uid {}, not {}",
                dir.display(),
                meta.uid(),
                uid
            ),
        ));
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        warn!(
            "Key directory {} has mode {:o}, restricting to 700",
            dir.display(),
            mode
        );
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path, _created: &fs::File) -> io::Result<()> {
    Ok(())
}
