//! The URL variant: stream an arbitrary URL's bytes straight into the
//! workspace and zip it up.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::TaskEnv;
use crate::error::PackageError;
use crate::prelude::*;
use crate::request::{Format, UrlRequest};
use crate::workspace::{self, Workspace};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[instrument(skip_all, level = "debug", fields(resource_id = %req.common.resource_id))]
pub async fn create_zip(
    req: &UrlRequest,
    workspace: &mut Workspace,
    env: &TaskEnv,
    fingerprint: &str,
) -> Result<PathBuf> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .context("could not build url-fetch client")?;

    let mut request = client.get(&req.resource_url);
    if let Some(key) = &req.key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("could not fetch {}", req.resource_url))?;
    if !response.status().is_success() {
        return Err(PackageError::UpstreamTransport(format!(
            "{} returned status {}",
            req.resource_url,
            response.status()
        ))
        .into());
    }

    let name = workspace::default_writer_name(
        Some(&req.resource_url),
        &req.common.resource_id,
        Format::Csv,
    );
    let path = workspace.path().join(&name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("could not create {}", path.display()))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("error while streaming resource body")?;
        file.write_all(&chunk)
            .await
            .context("could not write resource chunk to disk")?;
    }
    file.flush().await.context("could not flush resource file")?;
    drop(file);

    // The streamed write above bypasses `Workspace`'s own writer table
    // (async bytes, not a sync CSV row), so register it for the zip step.
    workspace.register_external_file(&name);

    workspace
        .create_zip(&env.config.store_directory, fingerprint, &env.config.zip_command)
        .await
}
