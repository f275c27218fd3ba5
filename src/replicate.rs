//! Opportunistic replication of content referenced by accepted events.
//!
//! Accepted events are scanned for `url` and `imeta` tags. Content-addressed
//! references (a `blossom://` URL or a 64-hex path segment) are
//! reference-counted under `blobs/refs/` so hosting decisions can be made
//! from observed demand. Other http(s) URLs are mirrored best-effort into
//! `blobs/mirror/` — only for allow-listed authors and only when replication
//! is enabled. Nothing here ever blocks the relay loop.

use std::{fs, path::PathBuf, time::Duration};

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::event::Event;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Background replicator owned by the relay engine.
#[derive(Clone)]
pub struct Replicator {
    root: PathBuf,
    client: reqwest::Client,
    enabled: bool,
}

impl Replicator {
    /// Build a replicator writing under `root` (the event store root).
    pub fn new(root: PathBuf, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            root,
            client,
            enabled,
        }
    }

    /// Inspect an accepted event and kick off any replication work.
    ///
    /// Hash references are counted synchronously; mirror fetches are spawned
    /// and their failures logged, never surfaced.
    pub fn trigger(&self, ev: &Event, author_allowed: bool) {
        for url in referenced_urls(ev) {
            if let Some(hash) = blob_reference(&url) {
                if let Err(e) = self.bump_ref(&hash) {
                    log::warn!("blob refcount update failed for {hash}: {e}");
                }
            } else if url.starts_with("http://") || url.starts_with("https://") {
                if self.enabled && author_allowed {
                    self.spawn_fetch(url);
                }
            }
        }
    }

    /// Current reference count for a blob hash.
    pub fn ref_count(&self, hash: &str) -> u64 {
        let path = self.root.join("blobs/refs").join(hash);
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Path a mirrored URL would be stored at.
    pub fn mirror_path(&self, url: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(url.as_bytes()));
        self.root.join("blobs/mirror").join(name)
    }

    fn bump_ref(&self, hash: &str) -> Result<()> {
        let dir = self.root.join("blobs/refs");
        fs::create_dir_all(&dir)?;
        let path = dir.join(hash);
        let current: u64 = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        fs::write(tmp.path(), (current + 1).to_string())?;
        tmp.persist(path)?;
        Ok(())
    }

    fn spawn_fetch(&self, url: String) {
        let client = self.client.clone();
        let target = self.mirror_path(&url);
        tokio::spawn(async move {
            if target.exists() {
                return;
            }
            match fetch_to(&client, &url, &target).await {
                Ok(bytes) => log::debug!("mirrored {url} ({bytes} bytes)"),
                Err(e) => log::warn!("mirror fetch failed for {url}: {e}"),
            }
        });
    }
}

async fn fetch_to(client: &reqwest::Client, url: &str, target: &PathBuf) -> Result<usize> {
    let body = client.get(url).send().await?.error_for_status()?.bytes().await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        fs::write(tmp.path(), &body)?;
        tmp.persist(target)?;
    }
    Ok(body.len())
}

/// URLs referenced by an event's `url` and `imeta` tags.
fn referenced_urls(ev: &Event) -> Vec<String> {
    let mut urls = vec![];
    for tag in &ev.tags {
        match tag.name() {
            Some("url") => {
                if let Some(v) = tag.value() {
                    urls.push(v.to_string());
                }
            }
            Some("imeta") => {
                // imeta fields are space-separated "key value" strings.
                for field in tag.0.iter().skip(1) {
                    if let Some(rest) = field.strip_prefix("url ") {
                        urls.push(rest.trim().to_string());
                    }
                }
            }
            _ => {}
        }
    }
    urls
}

/// Extract a content-addressed hash from a URL, if it carries one.
fn blob_reference(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("blossom://") {
        let hash = rest.trim_end_matches('/');
        if is_hex64(hash) {
            return Some(hash.to_lowercase());
        }
        return None;
    }
    let path = url.splitn(2, "://").nth(1)?;
    for segment in path.split('/') {
        let stem = segment.split('.').next().unwrap_or(segment);
        if is_hex64(stem) {
            return Some(stem.to_lowercase());
        }
    }
    None
}

fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use tempfile::TempDir;

    fn event_with_tags(tags: Vec<Tag>) -> Event {
        Event {
            id: "aa11".into(),
            pubkey: "p1".into(),
            kind: 1,
            created_at: 1,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    fn hash() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn extracts_blob_references() {
        assert_eq!(
            blob_reference(&format!("blossom://{}", hash())),
            Some(hash())
        );
        assert_eq!(
            blob_reference(&format!("https://host/{}.png", hash())),
            Some(hash())
        );
        assert_eq!(
            blob_reference(&format!("https://host/files/{}", hash().to_uppercase())),
            Some(hash())
        );
        assert_eq!(blob_reference("https://host/page.html"), None);
        assert_eq!(blob_reference("blossom://short"), None);
    }

    #[test]
    fn collects_urls_from_tags() {
        let ev = event_with_tags(vec![
            Tag(vec!["url".into(), "https://a/x".into()]),
            Tag(vec![
                "imeta".into(),
                "url https://b/y".into(),
                "m image/png".into(),
            ]),
            Tag(vec!["room".into(), "alpha".into()]),
        ]);
        assert_eq!(referenced_urls(&ev), vec!["https://a/x", "https://b/y"]);
    }

    #[tokio::test]
    async fn counts_hash_references() {
        let dir = TempDir::new().unwrap();
        let rep = Replicator::new(dir.path().to_path_buf(), false);
        let ev = event_with_tags(vec![Tag(vec![
            "url".into(),
            format!("blossom://{}", hash()),
        ])]);
        rep.trigger(&ev, false);
        rep.trigger(&ev, true);
        assert_eq!(rep.ref_count(&hash()), 2);
    }

    #[tokio::test]
    async fn mirrors_allowed_authors_only() {
        use axum::{routing::get, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/blob", get(|| async { "payload" }));
        let server = axum::serve(listener, app.into_make_service());
        let handle = tokio::spawn(async move {
            server.await.unwrap();
        });

        let dir = TempDir::new().unwrap();
        let rep = Replicator::new(dir.path().to_path_buf(), true);
        let url = format!("http://{}/blob", addr);
        let ev = event_with_tags(vec![Tag(vec!["url".into(), url.clone()])]);

        rep.trigger(&ev, false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rep.mirror_path(&url).exists());

        rep.trigger(&ev, true);
        let mut waited = 0;
        while !rep.mirror_path(&url).exists() && waited < 2000 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 20;
        }
        assert_eq!(fs::read_to_string(rep.mirror_path(&url)).unwrap(), "payload");
        handle.abort();
    }

    #[tokio::test]
    async fn disabled_replicator_never_fetches() {
        let dir = TempDir::new().unwrap();
        let rep = Replicator::new(dir.path().to_path_buf(), false);
        let url = "http://127.0.0.1:9/blob".to_string();
        let ev = event_with_tags(vec![Tag(vec!["url".into(), url.clone()])]);
        rep.trigger(&ev, true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!rep.mirror_path(&url).exists());
    }
}
