//! Asset Cache (C7): content-addressed local cache for downloaded upstream
//! assets.
//!
//! Grounded on `src/upstream/assets.rs::download_asset_to` (streamed,
//! authenticated download) and the storage layout pattern in
//! `token_pool/storage.rs` (data-dir-relative files, atomic-ish write path),
//! generalized per spec.md §4.7: separate image/video directories, each with
//! an independently configured size cap evicted in ascending-mtime order.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    fn dir_name(self) -> &'static str {
        match self {
            MediaType::Image => "images",
            MediaType::Video => "videos",
        }
    }
}

/// Turns an upstream asset URL's path into a flat, collision-resistant
/// filename: the path with `/` replaced by `-` (spec.md §4.7).
pub fn cache_filename(asset_url: &str) -> String {
    let path = asset_url
        .split_once("://")
        .map(|(_, rest)| rest.splitn(2, '/').nth(1).unwrap_or(""))
        .unwrap_or(asset_url);
    let cleaned = path.trim_start_matches('/');
    if cleaned.is_empty() {
        "asset".to_string()
    } else {
        cleaned.replace('/', "-")
    }
}

pub struct AssetCache {
    root: PathBuf,
    image_cap_bytes: u64,
    video_cap_bytes: u64,
}

impl AssetCache {
    pub fn new(root: impl Into<PathBuf>, image_cap_mb: u64, video_cap_mb: u64) -> Self {
        Self {
            root: root.into(),
            image_cap_bytes: image_cap_mb * 1_000_000,
            video_cap_bytes: video_cap_mb * 1_000_000,
        }
    }

    fn dir(&self, media_type: MediaType) -> PathBuf {
        self.root.join(media_type.dir_name())
    }

    fn cap_bytes(&self, media_type: MediaType) -> u64 {
        match media_type {
            MediaType::Image => self.image_cap_bytes,
            MediaType::Video => self.video_cap_bytes,
        }
    }

    /// Local path an asset would live at, whether or not it has been
    /// downloaded yet.
    pub fn path_for(&self, media_type: MediaType, asset_url: &str) -> PathBuf {
        self.dir(media_type).join(cache_filename(asset_url))
    }

    /// Returns the local path if already cached, else `None`; the caller
    /// decides whether to download.
    pub async fn lookup(&self, media_type: MediaType, asset_url: &str) -> Option<PathBuf> {
        let path = self.path_for(media_type, asset_url);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            Some(path)
        } else {
            None
        }
    }

    /// Downloads `asset_url` to its cache path via `downloader`, then
    /// opportunistically evicts oldest entries over the configured cap.
    /// Returns the final local path.
    pub async fn download<F, Fut>(
        &self,
        media_type: MediaType,
        asset_url: &str,
        downloader: F,
    ) -> anyhow::Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let dir = self.dir(media_type);
        tokio::fs::create_dir_all(&dir).await?;
        let dest = self.path_for(media_type, asset_url);
        downloader(dest.clone()).await?;
        self.evict_over_cap(media_type).await?;
        Ok(dest)
    }

    /// Downloads to disk, reads and base64-encodes the bytes, then deletes
    /// the temporary file — the inline-response convenience path.
    pub async fn download_to_base64<F, Fut>(
        &self,
        media_type: MediaType,
        asset_url: &str,
        downloader: F,
    ) -> anyhow::Result<String>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let path = self.download(media_type, asset_url, downloader).await?;
        let bytes = tokio::fs::read(&path).await?;
        tokio::fs::remove_file(&path).await.ok();
        Ok(BASE64.encode(bytes))
    }

    /// Removes entries in ascending last-modified order until the directory
    /// is under its configured cap.
    pub async fn evict_over_cap(&self, media_type: MediaType) -> anyhow::Result<()> {
        let dir = self.dir(media_type);
        let cap = self.cap_bytes(media_type);
        let mut entries = read_entries(&dir).await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= cap {
            return Ok(());
        }
        entries.sort_by_key(|e| e.modified);
        for entry in entries {
            if total <= cap {
                break;
            }
            if tokio::fs::remove_file(&entry.path).await.is_ok() {
                total = total.saturating_sub(entry.size);
            }
        }
        Ok(())
    }
}

struct DirEntry {
    path: PathBuf,
    size: u64,
    modified: std::time::SystemTime,
}

async fn read_entries(dir: &Path) -> anyhow::Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        out.push(DirEntry {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified()?,
        });
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn cache_filename_replaces_slashes() {
        assert_eq!(
            cache_filename("https://assets.grok.com/users/u1/images/a.png"),
            "users-u1-images-a.png"
        );
    }

    #[tokio::test]
    async fn lookup_returns_none_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path(), 10, 10);
        assert!(cache.lookup(MediaType::Image, "https://x/a.png").await.is_none());
    }

    #[tokio::test]
    async fn download_writes_file_then_lookup_finds_it() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path(), 10, 10);
        let path = cache
            .download(MediaType::Image, "https://x/a.png", |dest| async move {
                tokio::fs::write(dest, b"hello").await?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(tokio::fs::try_exists(&path).await.unwrap());
        assert!(cache.lookup(MediaType::Image, "https://x/a.png").await.is_some());
    }

    #[tokio::test]
    async fn download_to_base64_deletes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AssetCache::new(dir.path(), 10, 10);
        let encoded = cache
            .download_to_base64(MediaType::Image, "https://x/a.png", |dest| async move {
                tokio::fs::write(dest, b"hello").await?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(encoded, BASE64.encode(b"hello"));
        assert!(cache.lookup(MediaType::Image, "https://x/a.png").await.is_none());
    }

    #[tokio::test]
    async fn eviction_removes_oldest_entries_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        // 1MB cap, two ~0.6MB files: only the newer one should survive.
        let cache = AssetCache::new(dir.path(), 1, 10);
        let image_dir = dir.path().join("images");
        tokio::fs::create_dir_all(&image_dir).await.unwrap();

        let old_path = image_dir.join("old.png");
        tokio::fs::write(&old_path, vec![0u8; 600_000]).await.unwrap();
        let old_time = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        filetime_set(&old_path, old_time);

        cache
            .download(MediaType::Image, "https://x/new.png", |dest| async move {
                tokio::fs::write(dest, vec![0u8; 600_000]).await?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(!tokio::fs::try_exists(&old_path).await.unwrap());
        assert!(cache.lookup(MediaType::Image, "https://x/new.png").await.is_some());
    }

    fn filetime_set(path: &Path, time: std::time::SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}
