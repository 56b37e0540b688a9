//! Containerd registry mirror configuration.
//!
//! Writes a `hosts.toml` per upstream registry into the runtime's
//! configuration directory so image pulls are dispatched through the local
//! mirror first, then through the other listed peers, before falling back
//! to the upstream itself.

use std::path::Path;

use url::Url;

use crate::error::{Error, Result};
use crate::registry::{EXTERNAL_HEADER, MIRRORED_HEADER, REGISTRY_HEADER};

/// Write mirror configuration for every registry into `config_root`.
///
/// The first mirror URL is taken to be this node; all subsequent mirrors
/// are marked external.
pub async fn add_mirror_configuration(
    config_root: &Path,
    registry_urls: &[Url],
    mirror_urls: &[Url],
) -> Result<()> {
    validate(registry_urls)?;
    for registry_url in registry_urls {
        let content = hosts_file_content(registry_url, mirror_urls);
        let dir = config_root.join(host_directory(registry_url));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("hosts.toml");
        tokio::fs::write(&path, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        tracing::info!(registry = %registry_url, path = %path.display(), "added registry mirror configuration");
    }
    Ok(())
}

/// Remove mirror configuration for every registry in the list.
pub async fn remove_mirror_configuration(
    config_root: &Path,
    registry_urls: &[Url],
) -> Result<()> {
    for registry_url in registry_urls {
        let dir = config_root.join(host_directory(registry_url));
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
            tracing::info!(registry = %registry_url, path = %dir.display(), "removed registry mirror configuration");
        }
    }
    Ok(())
}

fn hosts_file_content(registry_url: &Url, mirror_urls: &[Url]) -> String {
    let server = if is_docker_hub(registry_url) {
        "https://registry-1.docker.io".to_owned()
    } else {
        format_url(registry_url)
    };
    let mut content = format!("server = \"{server}\"");
    for (i, mirror_url) in mirror_urls.iter().enumerate() {
        let mirror = format_url(mirror_url);
        content.push_str(&format!(
            "\n\n[host.\"{mirror}\"]\n  capabilities = [\"pull\", \"resolve\"]\n[host.\"{mirror}\".header]\n  {REGISTRY_HEADER} = [\"{}\"]\n  {MIRRORED_HEADER} = [\"true\"]",
            format_url(registry_url),
        ));
        // The first mirror is this node; everyone else is external.
        if i != 0 {
            content.push_str(&format!("\n  {EXTERNAL_HEADER} = [\"true\"]"));
        }
    }
    content
}

fn is_docker_hub(registry_url: &Url) -> bool {
    format_url(registry_url) == "https://docker.io"
}

/// Directory name for a registry host, keeping any explicit port.
fn host_directory(registry_url: &Url) -> String {
    let host = registry_url.host_str().unwrap_or_default();
    match registry_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// Render a URL without the canonical trailing slash on an empty path.
fn format_url(url: &Url) -> String {
    let s = url.as_str();
    if url.path() == "/" {
        s.trim_end_matches('/').to_owned()
    } else {
        s.to_owned()
    }
}

fn validate(urls: &[Url]) -> Result<()> {
    for url in urls {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::other(format!(
                "invalid registry url scheme must be http or https: {url}"
            )));
        }
        if url.path() != "/" && !url.path().is_empty() {
            return Err(Error::other(format!(
                "invalid registry url path has to be empty: {url}"
            )));
        }
        if url.query().is_some() {
            return Err(Error::other(format!(
                "invalid registry url query has to be empty: {url}"
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::other(format!(
                "invalid registry url user has to be empty: {url}"
            )));
        }
    }
    Ok(())
}
