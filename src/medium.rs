use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::ProvisionError;

/// Stream a response body to a file, advancing the progress bar per chunk.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), ProvisionError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ProvisionError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProvisionError::Download {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| ProvisionError::Io {
                context: "writing medium data".into(),
                source: e,
            })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| ProvisionError::Io {
        context: "flushing medium file".into(),
        source: e,
    })?;

    Ok(())
}

/// File name the medium is stored under: the URL's basename.
pub fn medium_filename(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match without_scheme.trim_end_matches('/').rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name,
        _ => "install.iso",
    }
}

/// Ensure the installation medium is present under `dest_dir`, downloading
/// it if absent. Idempotent: when the file already exists it is returned
/// unchanged with no transfer. A failed transfer is fatal here; retry
/// policy belongs to the caller re-running the whole provisioning.
pub async fn ensure_medium(url: &str, dest_dir: &Path) -> Result<PathBuf, ProvisionError> {
    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|e| ProvisionError::Io {
            context: format!("creating directory {}", dest_dir.display()),
            source: e,
        })?;

    let dest = dest_dir.join(medium_filename(url));
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using existing installation medium");
        return Ok(dest);
    }

    tracing::info!(url, "downloading installation medium");

    let response = reqwest::get(url).await.map_err(|e| ProvisionError::Download {
        message: format!("request to {url} failed"),
        source: Box::new(e),
    })?;

    if !response.status().is_success() {
        return Err(ProvisionError::Download {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    // Download into a .part file and rename on success, so an interrupted
    // transfer never leaves a truncated file that a later run would trust.
    let tmp_path = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| ProvisionError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "installation medium ready");

    Ok(dest)
}
