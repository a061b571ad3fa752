//! On-demand download of the isolate binary and its config file
//!
//! Hosts that ship without isolate can fetch a prebuilt release the first
//! time a box is initialized. Files already on disk are never replaced.

use std::path::Path;

use tokio::sync::OnceCell;
use tracing::{info, instrument};

use crate::config::ProvisionConfig;
use crate::isolate::IsolateError;

static PROVISIONED: OnceCell<()> = OnceCell::const_new();

/// Make sure isolate and its config file exist, downloading them if needed.
///
/// Concurrent callers wait on the first download; once it has succeeded
/// later calls return immediately. A failed attempt may be retried.
pub async fn ensure_isolate(
    settings: &ProvisionConfig,
    isolate_path: &Path,
) -> Result<(), IsolateError> {
    if !settings.enabled {
        return Ok(());
    }
    PROVISIONED
        .get_or_try_init(|| provision(settings, isolate_path))
        .await
        .map(|_| ())
}

#[instrument(skip(settings))]
async fn provision(settings: &ProvisionConfig, isolate_path: &Path) -> Result<(), IsolateError> {
    let client = reqwest::Client::new();

    if !exists(isolate_path).await {
        download(&client, &settings.isolate_url, isolate_path, 0o755).await?;
    }
    if !exists(&settings.config_path).await {
        download(&client, &settings.config_url, &settings.config_path, 0o644).await?;
    }
    Ok(())
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Fetch `url` into `dest` through a sibling temp file so a torn download
/// never leaves a truncated binary behind.
async fn download(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    mode: u32,
) -> Result<(), IsolateError> {
    use std::os::unix::fs::PermissionsExt;

    info!(url, dest = %dest.display(), "downloading");
    let failed = |source| IsolateError::ProvisionFailed {
        url: url.to_owned(),
        source,
    };
    let body = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(failed)?
        .bytes()
        .await
        .map_err(failed)?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = dest.with_extension("partial");
    tokio::fs::write(&partial, &body).await?;
    tokio::fs::set_permissions(&partial, std::fs::Permissions::from_mode(mode)).await?;
    tokio::fs::rename(&partial, dest).await?;
    info!(dest = %dest.display(), bytes = body.len(), "download complete");
    Ok(())
}
