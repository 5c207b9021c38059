//! Credentials handed to the Mountpoint Pod.
//!
//! The node plugin never talks to object storage itself.  It decides which
//! identity the filesystem client should use and materializes it as files and
//! environment variables the Mountpoint Pod consumes:
//!
//! * **driver** (default): the Mountpoint Pod uses its own identity; only the
//!   region is forwarded.
//! * **pod**: the workload's service account token, passed by the node agent
//!   in the volume context, is written to `{podID}-{volumeID}.token` and
//!   advertised through `AWS_WEB_IDENTITY_TOKEN_FILE`.
//!
//! Every token written by [`CredentialProvider::provide`] is removed by the
//! matching [`CredentialProvider::cleanup`].

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::CsiError;
use crate::mount::args::{MountArgs, REGION};

/// Volume context key selecting the [`AuthenticationSource`].
pub const VOLUME_CONTEXT_AUTHENTICATION_SOURCE: &str = "authenticationSource";
/// Volume context key holding the service account tokens JSON.
pub const VOLUME_CONTEXT_SERVICE_ACCOUNT_TOKENS: &str = "csi.storage.k8s.io/serviceAccount.tokens";
/// Volume context key overriding the token audience.
pub const VOLUME_CONTEXT_STS_AUDIENCE: &str = "stsAudience";

const DEFAULT_STS_AUDIENCE: &str = "sts.amazonaws.com";

pub const ENV_REGION: &str = "AWS_REGION";
pub const ENV_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const ENV_WEB_IDENTITY_TOKEN_FILE: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";

/// File name of the token issued for `(pod_id, volume_id)`.
pub fn token_file_name(pod_id: &str, volume_id: &str) -> String {
    format!("{pod_id}-{volume_id}.token")
}

/// Whose identity the filesystem client authenticates as.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationSource {
    #[default]
    Driver,
    Pod,
}

impl AuthenticationSource {
    fn from_context(context: &HashMap<String, String>) -> Result<Self, CsiError> {
        match context
            .get(VOLUME_CONTEXT_AUTHENTICATION_SOURCE)
            .map(String::as_str)
        {
            None | Some("") | Some("driver") => Ok(Self::Driver),
            Some("pod") => Ok(Self::Pod),
            Some(other) => Err(CsiError::InvalidArgument(format!(
                "unsupported authentication source {other:?}"
            ))),
        }
    }
}

/// Credentials resolved for one mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountCredentials {
    pub authentication_source: AuthenticationSource,
    pub region: Option<String>,
    /// Token file written for pod-level credentials.
    pub token_path: Option<PathBuf>,
}

impl MountCredentials {
    /// Environment the filesystem client should run with.
    ///
    /// `token_path` is the token location as the client will see it, which
    /// differs from [`Self::token_path`] once the token is copied into a
    /// Mountpoint Pod.
    pub fn env(&self, token_path: Option<&Path>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(region) = &self.region {
            env.insert(ENV_REGION.to_owned(), region.clone());
            env.insert(ENV_DEFAULT_REGION.to_owned(), region.clone());
        }
        if let Some(path) = token_path.or(self.token_path.as_deref()) {
            env.insert(
                ENV_WEB_IDENTITY_TOKEN_FILE.to_owned(),
                path.to_string_lossy().into_owned(),
            );
        }
        env
    }
}

/// Input to [`CredentialProvider::provide`].
#[derive(Debug, Clone, Copy)]
pub struct ProvideContext<'a> {
    /// Workload pod the credentials are issued for, when known.
    pub pod_id: Option<&'a str>,
    pub volume_id: &'a str,
    pub volume_context: &'a HashMap<String, String>,
    pub mount_args: &'a MountArgs,
    /// Directory to write token files to, the provider default when `None`.
    pub write_path: Option<&'a Path>,
}

/// Input to [`CredentialProvider::cleanup`].
#[derive(Debug, Clone, Copy)]
pub struct CleanupContext<'a> {
    pub pod_id: &'a str,
    pub volume_id: &'a str,
    /// Directory the token was written to, the provider default when `None`.
    pub write_path: Option<&'a Path>,
}

/// Issues and revokes filesystem-visible credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Resolve credentials for a mount, writing any token file they need.
    async fn provide(&self, ctx: &ProvideContext<'_>) -> Result<MountCredentials, CsiError>;

    /// Remove everything `provide` wrote for `(pod_id, volume_id)`.  Absent
    /// files are not an error.
    async fn cleanup(&self, ctx: &CleanupContext<'_>) -> Result<(), CsiError>;
}

/// Fallback region lookup, used when the mount flags do not name one.
pub type RegionResolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Region from `AWS_REGION`, then `AWS_DEFAULT_REGION`.
pub fn region_from_env() -> Option<String> {
    [ENV_REGION, ENV_DEFAULT_REGION]
        .into_iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

#[derive(Debug, Deserialize)]
struct ServiceAccountToken {
    token: String,
    #[serde(default, rename = "expirationTimestamp")]
    _expiration_timestamp: Option<String>,
}

/// [`CredentialProvider`] that writes tokens as files.
pub struct FileCredentialProvider {
    token_dir: PathBuf,
    region: RegionResolver,
}

impl FileCredentialProvider {
    /// * `token_dir`: default directory for token files
    /// * `region`: fallback region lookup
    pub fn new(token_dir: impl Into<PathBuf>, region: RegionResolver) -> Self {
        Self {
            token_dir: token_dir.into(),
            region,
        }
    }

    fn resolve_region(&self, args: &MountArgs) -> Option<String> {
        args.value(REGION)
            .map(str::to_owned)
            .or_else(|| (self.region)())
    }

    fn dir<'a>(&'a self, write_path: Option<&'a Path>) -> &'a Path {
        write_path.unwrap_or(&self.token_dir)
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn provide(&self, ctx: &ProvideContext<'_>) -> Result<MountCredentials, CsiError> {
        let source = AuthenticationSource::from_context(ctx.volume_context)?;
        let region = self.resolve_region(ctx.mount_args);

        if source == AuthenticationSource::Driver {
            return Ok(MountCredentials {
                authentication_source: source,
                region,
                token_path: None,
            });
        }

        let pod_id = ctx.pod_id.ok_or_else(|| {
            CsiError::InvalidArgument("pod-level credentials need the workload pod id".into())
        })?;
        let token = service_account_token(ctx.volume_context)?;
        let path = self
            .dir(ctx.write_path)
            .join(token_file_name(pod_id, ctx.volume_id));
        write_token(&path, &token)
            .await
            .map_err(|e| CsiError::Credential(format!("write {}: {e}", path.display())))?;

        info!(pod_id, volume_id = ctx.volume_id, "pod-level credentials provided");
        Ok(MountCredentials {
            authentication_source: source,
            region,
            token_path: Some(path),
        })
    }

    async fn cleanup(&self, ctx: &CleanupContext<'_>) -> Result<(), CsiError> {
        let path = self
            .dir(ctx.write_path)
            .join(token_file_name(ctx.pod_id, ctx.volume_id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "token removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::Credential(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}

fn service_account_token(context: &HashMap<String, String>) -> Result<String, CsiError> {
    let raw = context
        .get(VOLUME_CONTEXT_SERVICE_ACCOUNT_TOKENS)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| {
            CsiError::InvalidArgument(
                "pod-level credentials need service account tokens in the volume context".into(),
            )
        })?;
    let tokens: HashMap<String, ServiceAccountToken> = serde_json::from_str(raw)
        .map_err(|e| CsiError::InvalidArgument(format!("malformed service account tokens: {e}")))?;

    let audience = context
        .get(VOLUME_CONTEXT_STS_AUDIENCE)
        .map(String::as_str)
        .unwrap_or(DEFAULT_STS_AUDIENCE);
    tokens
        .get(audience)
        .map(|t| t.token.clone())
        .ok_or_else(|| {
            CsiError::InvalidArgument(format!("no service account token for audience {audience}"))
        })
}

/// Write `token` to `path` with mode 0600, replacing any previous token
/// atomically.
pub(crate) async fn write_token(path: &Path, token: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("token.tmp");
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .await?;
    file.write_all(token.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}
