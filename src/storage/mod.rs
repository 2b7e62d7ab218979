//! Backing-Storage Client
//!
//! Issues the two mutations the migration needs against a Ceph pool (image
//! removal and image rename) through the `rbd` command line, authenticating
//! with a scoped [`CredentialFile`].
//!
//! A client must be closed on every path that opened it. [`RbdClient::close`]
//! reports cleanup failure; dropping an unclosed client still removes the
//! key file and logs instead.

mod keyfile;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{CommandRunner, Credential};
use crate::error::{Error, Result};

pub use keyfile::CredentialFile;

/// Default location for credential files.
pub const DEFAULT_KEY_DIR: &str = "/tmp/csi/keys";

// =============================================================================
// Configuration
// =============================================================================

/// How storage commands are launched
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// `rbd` executable
    pub program: String,

    /// Directory holding credential files
    pub key_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            program: "rbd".to_string(),
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
        }
    }
}

/// Where and as whom storage commands run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConnection {
    /// Comma separated monitor endpoints
    pub monitors: String,
    pub user_id: String,
    pub pool: String,
    pub data_pool: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

pub struct RbdClient {
    runner: Arc<dyn CommandRunner>,
    program: String,
    connection: ClusterConnection,
    key_file: CredentialFile,
}

impl std::fmt::Debug for RbdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbdClient")
            .field("program", &self.program)
            .field("connection", &self.connection)
            .field("key_file", &self.key_file.path())
            .finish()
    }
}

impl RbdClient {
    /// Materialises the credential and returns a ready client.
    pub fn open(
        runner: Arc<dyn CommandRunner>,
        config: &StorageConfig,
        connection: ClusterConnection,
        credential: &Credential,
    ) -> Result<Self> {
        let key_file = CredentialFile::create(&config.key_dir, &credential.key)?;
        info!(
            "New connection monitors: {}, id: {}, keyfile: {}, pool: {}, datapool: {:?}",
            connection.monitors,
            connection.user_id,
            key_file.path().display(),
            connection.pool,
            connection.data_pool
        );

        Ok(Self {
            runner,
            program: config.program.clone(),
            connection,
            key_file,
        })
    }

    pub fn connection(&self) -> &ClusterConnection {
        &self.connection
    }

    pub fn key_file(&self) -> &Path {
        self.key_file.path()
    }

    /// Deletes `image` from `pool`. A missing image is an error.
    pub async fn remove_image(&self, pool: &str, image: &str) -> Result<()> {
        let mut args = vec!["rm".to_string(), image.to_string()];
        args.extend(self.common_args(pool));
        self.exec(&format!("rm {}", image), args).await
    }

    /// Renames `old_name` to `new_name` inside the connection's pool.
    pub async fn rename_image(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut args = vec![
            "rename".to_string(),
            old_name.to_string(),
            new_name.to_string(),
        ];
        args.extend(self.common_args(&self.connection.pool));
        self.exec(&format!("rename {} {}", old_name, new_name), args)
            .await
    }

    /// Deletes the credential file.
    pub fn close(self) -> Result<()> {
        debug!("Removing credential file {}", self.key_file.path().display());
        self.key_file.close()
    }

    fn common_args(&self, pool: &str) -> Vec<String> {
        let mut args = vec![
            "--pool".to_string(),
            pool.to_string(),
            "--id".to_string(),
            self.connection.user_id.clone(),
            "-m".to_string(),
            self.connection.monitors.clone(),
            format!("--keyfile={}", self.key_file.path().display()),
        ];
        if let Some(data_pool) = &self.connection.data_pool {
            args.push("--data-pool".to_string());
            args.push(data_pool.clone());
        }
        args
    }

    async fn exec(&self, description: &str, args: Vec<String>) -> Result<()> {
        let command = format!("{} {}", self.program, description);
        debug!("Running {}", command);

        let output = self.runner.run(&self.program, &args).await?;
        if !output.success {
            return Err(Error::StorageCommandFailed {
                command,
                output: output.output,
            });
        }
        Ok(())
    }
}
