//! Streaming HTTP fetch with manual redirects and atomic publication.
//!
//! The body is streamed to a `<destination>.download` sibling and renamed
//! onto the destination only after the byte count checks out, so a reader of
//! the destination path sees either nothing or a complete file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::{Client, Response, Url, header, redirect};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::Config;

/// Build the client the download workers share. Redirects are handled in
/// [`fetch_to_file`], not by the client.
pub(crate) fn build_client(config: &Config) -> Client {
    Client::builder()
        .redirect(redirect::Policy::none())
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .read_timeout(Duration::from_millis(config.read_timeout_ms))
        .user_agent(config.user_agent.clone())
        .build()
        .unwrap_or_default()
}

/// Download `url` into `destination`, following up to `max_redirects` hops.
///
/// On any failure the temp file is removed and the destination is left as it
/// was; it is never visible in a partially written state.
pub(crate) async fn fetch_to_file(
    client: &Client,
    url: &str,
    destination: &Path,
    max_redirects: usize,
) -> Result<()> {
    let response = follow_redirects(client, url, max_redirects).await?;
    let status = response.status();
    if !status.is_success() {
        bail!("expected success status for {url}, got {status}");
    }

    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("could not create {}", parent.display()))?;
    }

    // Declared length must be captured before the body is consumed.
    let declared = response.content_length();
    let temp = temp_path(destination);

    let written = match stream_body(response, &temp).await {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
    };

    if let Some(expected) = declared
        && expected != written
    {
        let _ = fs::remove_file(&temp).await;
        bail!("size mismatch for {url}: declared {expected} bytes, wrote {written}");
    }

    fs::rename(&temp, destination).await.with_context(|| {
        format!(
            "could not publish {} to {}",
            temp.display(),
            destination.display()
        )
    })?;
    Ok(())
}

async fn follow_redirects(client: &Client, url: &str, max_redirects: usize) -> Result<Response> {
    let mut target = Url::parse(url).with_context(|| format!("invalid url: {url}"))?;
    let mut response = send(client, &target).await?;
    let mut hops = 0;
    while response.status().is_redirection() {
        if hops == max_redirects {
            bail!("more than {max_redirects} redirects for {url}");
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .with_context(|| format!("redirect from {target} without a location header"))?;
        target = target
            .join(location)
            .with_context(|| format!("invalid redirect location: {location}"))?;
        tracing::debug!("following redirect {hops} to {target}");
        response = send(client, &target).await?;
        hops += 1;
    }
    Ok(response)
}

async fn send(client: &Client, target: &Url) -> Result<Response> {
    client
        .get(target.clone())
        .send()
        .await
        .with_context(|| format!("request to {target} failed"))
}

async fn stream_body(mut response: Response, path: &Path) -> Result<u64> {
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("could not create {}", path.display()))?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("error while reading response body")?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("could not write to {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("could not flush download")?;
    Ok(written)
}

fn temp_path(destination: &Path) -> PathBuf {
    let mut path = destination.as_os_str().to_os_string();
    path.push(".download");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testserver;
    use std::io::Write;
    use std::thread;
    use tempfile::tempdir;

    fn client() -> Client {
        build_client(&Config::default())
    }

    #[tokio::test]
    async fn downloads_and_publishes_atomically() {
        let body = vec![7u8; 1500];
        let server = {
            let body = body.clone();
            testserver::serve(move |_path, stream| {
                // dribble the body out so a partial write would be observable
                testserver::write_head(stream, 200, body.len());
                for chunk in body.chunks(500) {
                    stream.write_all(chunk).unwrap();
                    stream.flush().unwrap();
                    thread::sleep(Duration::from_millis(40));
                }
            })
        };

        let dir = tempdir().unwrap();
        let dest = dir.path().join("asset.bin");
        let url = format!("{}/asset.bin", server.addr);

        let handle = {
            let dest = dest.clone();
            let client = client();
            tokio::spawn(async move { fetch_to_file(&client, &url, &dest, 5).await })
        };

        // The destination must never be visible with a partial size.
        while !handle.is_finished() {
            if dest.exists() {
                assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1500);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn length_mismatch_discards_the_download() {
        let server = testserver::serve(|_path, stream| {
            // declare more than is sent
            testserver::write_head(stream, 200, 100);
            stream.write_all(&[1u8; 40]).unwrap();
        });

        let dir = tempdir().unwrap();
        let dest = dir.path().join("short.bin");
        let url = format!("{}/short.bin", server.addr);

        let result = fetch_to_file(&client(), &url, &dest, 5).await;
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn follows_redirect_chains() {
        let server = testserver::serve(|path, stream| match path {
            "/start" => testserver::write_redirect(stream, "/middle"),
            "/middle" => testserver::write_redirect(stream, "/end"),
            "/end" => testserver::write_ok(stream, b"made it"),
            _ => testserver::write_status(stream, 404),
        });

        let dir = tempdir().unwrap();
        let dest = dir.path().join("redirected.bin");
        let url = format!("{}/start", server.addr);

        fetch_to_file(&client(), &url, &dest, 5).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"made it");
    }

    #[tokio::test]
    async fn gives_up_after_the_redirect_cap() {
        let server = testserver::serve(|_path, stream| {
            testserver::write_redirect(stream, "/again");
        });

        let dir = tempdir().unwrap();
        let dest = dir.path().join("loop.bin");
        let url = format!("{}/again", server.addr);

        let result = fetch_to_file(&client(), &url, &dest, 5).await;
        assert!(result.is_err());
        assert!(!dest.exists());
        // the original request plus five followed hops
        assert_eq!(server.hits.load(std::sync::atomic::Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn non_success_status_fails() {
        let server = testserver::serve(|_path, stream| {
            testserver::write_status(stream, 404);
        });

        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.bin");
        let url = format!("{}/missing", server.addr);

        assert!(fetch_to_file(&client(), &url, &dest, 5).await.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let server = testserver::serve(|_path, stream| {
            testserver::write_ok(stream, b"nested");
        });

        let dir = tempdir().unwrap();
        let dest = dir.path().join("a").join("b").join("deep.bin");
        let url = format!("{}/deep", server.addr);

        fetch_to_file(&client(), &url, &dest, 5).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"nested");
    }
}
