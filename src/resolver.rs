//! Local file loading with caching and single-flight reads.
//!
//! Cache entries are served only while the on-disk mtime still matches and the
//! entry is younger than the TTL. Concurrent resolves of one path share a
//! single read; the read runs on its own task so an abandoned exchange does
//! not cancel it for the others.

use crate::config::CacheSettings;
use crate::error::FileError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// A loaded local file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub content: Bytes,
    pub mime_type: String,
    /// Set for pre-compressed files (`.gz`, `.br`)
    pub content_encoding: Option<String>,
    pub size: u64,
    pub last_loaded_at: DateTime<Utc>,
    pub source_mtime: SystemTime,
    loaded: Instant,
}

impl FileEntry {
    fn new(path: &Path, content: Vec<u8>, source_mtime: SystemTime) -> Self {
        let (mime_type, content_encoding) = infer_content_type(path);
        Self {
            path: path.to_path_buf(),
            size: content.len() as u64,
            content: Bytes::from(content),
            mime_type,
            content_encoding,
            last_loaded_at: Utc::now(),
            source_mtime,
            loaded: Instant::now(),
        }
    }
}

type ReadResult = Result<Arc<FileEntry>, FileError>;
type SharedRead = Shared<BoxFuture<'static, ReadResult>>;

struct Inner {
    max_file_size: u64,
    read_timeout: Duration,
    ttl: Option<Duration>,
    cache: Mutex<LruCache<PathBuf, Arc<FileEntry>>>,
    in_flight: Mutex<HashMap<PathBuf, SharedRead>>,
    disk_reads: AtomicU64,
}

/// Loads mapped files. Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct FileResolver {
    inner: Arc<Inner>,
}

impl FileResolver {
    pub fn new(settings: &CacheSettings) -> Self {
        Self::build(settings, settings.ttl())
    }

    fn build(settings: &CacheSettings, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(settings.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                max_file_size: settings.max_file_size,
                read_timeout: settings.read_timeout(),
                ttl,
                cache: Mutex::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashMap::new()),
                disk_reads: AtomicU64::new(0),
            }),
        }
    }

    /// Load a file, from the cache when it is still fresh.
    pub async fn resolve(&self, path: &Path) -> ReadResult {
        let seen = self.cached(path).await;
        if let Some(entry) = &seen {
            match self.inner.current_mtime(path).await {
                Ok(mtime) if mtime == entry.source_mtime => {
                    trace!(path = %path.display(), "File cache hit");
                    return Ok(Arc::clone(entry));
                }
                Ok(_) => {
                    debug!(path = %path.display(), "File changed on disk, reloading");
                }
                Err(e) => {
                    self.inner.cache.lock().await.pop(path);
                    return Err(e);
                }
            }
        }

        self.read_shared(path, seen.as_ref()).await
    }

    /// Number of file reads performed so far.
    pub fn disk_reads(&self) -> u64 {
        self.inner.disk_reads.load(Ordering::Relaxed)
    }

    pub async fn cached_entries(&self) -> usize {
        self.inner.cache.lock().await.len()
    }

    /// Drop every cache entry. In-flight reads still complete for their callers.
    pub async fn clear(&self) {
        self.inner.cache.lock().await.clear();
    }

    async fn cached(&self, path: &Path) -> Option<Arc<FileEntry>> {
        let mut cache = self.inner.cache.lock().await;
        let entry = cache.get(path).cloned()?;
        if let Some(ttl) = self.inner.ttl {
            if entry.loaded.elapsed() >= ttl {
                debug!(path = %path.display(), "File cache entry expired");
                cache.pop(path);
                return None;
            }
        }
        Some(entry)
    }

    /// Join or start the read for `path`. `stale` is the cache entry the
    /// caller already rejected, if any.
    async fn read_shared(&self, path: &Path, stale: Option<&Arc<FileEntry>>) -> ReadResult {
        let shared = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(path) {
                Some(existing) => {
                    trace!(path = %path.display(), "Joining in-flight read");
                    existing.clone()
                }
                None => {
                    // A read may have finished between our cache lookup and
                    // taking the lock; its entry lands in the cache first.
                    if let Some(entry) = self.inner.fresh_entry(path, stale).await {
                        trace!(path = %path.display(), "Read finished while waiting");
                        return Ok(entry);
                    }

                    let inner = Arc::clone(&self.inner);
                    let key = path.to_path_buf();
                    // The task cannot remove its entry before we insert it:
                    // we hold the in-flight lock until the end of this block.
                    let handle = tokio::spawn(async move {
                        let result = inner.load(&key).await;
                        inner.in_flight.lock().await.remove(&key);
                        result
                    });
                    let error_path = path.to_path_buf();
                    let read = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(FileError::Io {
                                path: error_path,
                                message: format!("read task failed: {}", e),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(path.to_path_buf(), read.clone());
                    read
                }
            }
        };

        shared.await
    }
}

impl Inner {
    async fn fresh_entry(
        &self,
        path: &Path,
        stale: Option<&Arc<FileEntry>>,
    ) -> Option<Arc<FileEntry>> {
        let cache = self.cache.lock().await;
        let entry = cache.peek(path)?;
        let replaced = stale.map_or(true, |old| !Arc::ptr_eq(old, entry));
        let live = self.ttl.map_or(true, |ttl| entry.loaded.elapsed() < ttl);
        (replaced && live).then(|| Arc::clone(entry))
    }

    async fn current_mtime(&self, path: &Path) -> Result<SystemTime, FileError> {
        let stat = async {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| FileError::from_io(path.to_path_buf(), &e))?;
            meta.modified()
                .map_err(|e| FileError::from_io(path.to_path_buf(), &e))
        };
        tokio::time::timeout(self.read_timeout, stat)
            .await
            .map_err(|_| FileError::Timeout(path.to_path_buf()))?
    }

    async fn load(&self, path: &Path) -> ReadResult {
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        let limit = self.max_file_size;

        let read = async {
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|e| FileError::from_io(path.to_path_buf(), &e))?;
            if !meta.is_file() {
                return Err(FileError::Io {
                    path: path.to_path_buf(),
                    message: "not a regular file".to_string(),
                });
            }
            if meta.len() > limit {
                return Err(FileError::TooLarge {
                    path: path.to_path_buf(),
                    size: meta.len(),
                    limit,
                });
            }
            let mtime = meta
                .modified()
                .map_err(|e| FileError::from_io(path.to_path_buf(), &e))?;

            let content = tokio::fs::read(path)
                .await
                .map_err(|e| FileError::from_io(path.to_path_buf(), &e))?;
            // The file may have grown between stat and read
            if content.len() as u64 > limit {
                return Err(FileError::TooLarge {
                    path: path.to_path_buf(),
                    size: content.len() as u64,
                    limit,
                });
            }
            Ok((content, mtime))
        };

        let (content, mtime) = tokio::time::timeout(self.read_timeout, read)
            .await
            .map_err(|_| FileError::Timeout(path.to_path_buf()))??;

        let entry = Arc::new(FileEntry::new(path, content, mtime));
        debug!(
            path = %path.display(),
            size = entry.size,
            mime_type = %entry.mime_type,
            "Loaded local file"
        );
        self.cache
            .lock()
            .await
            .put(path.to_path_buf(), Arc::clone(&entry));
        Ok(entry)
    }
}

/// Mime type from the extension, plus the encoding of pre-compressed files.
///
/// `app.js.gz` is served as `gzip`-encoded javascript; a bare `dump.gz` is an
/// opaque gzip file.
fn infer_content_type(path: &Path) -> (String, Option<String>) {
    let encoding = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
            "gz" => Some("gzip"),
            "br" => Some("br"),
            _ => None,
        });

    if let Some(encoding) = encoding {
        if let Some(inner) = path.file_stem().map(Path::new) {
            if inner.extension().is_some() {
                let mime = mime_guess::from_path(inner).first_or_octet_stream();
                return (mime.to_string(), Some(encoding.to_string()));
            }
        }
    }

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    (mime.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn settings() -> CacheSettings {
        CacheSettings::default()
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_resolve_reads_file_and_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "users.json", br#"[{"id":1}]"#);

        let resolver = FileResolver::new(&settings());
        let entry = resolver.resolve(&path).await.unwrap();

        assert_eq!(&entry.content[..], br#"[{"id":1}]"#);
        assert_eq!(entry.mime_type, "application/json");
        assert_eq!(entry.size, 10);
        assert!(entry.content_encoding.is_none());
    }

    #[tokio::test]
    async fn test_unknown_extension_falls_back_to_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "blob.zzunknown", b"\x00\x01");

        let entry = FileResolver::new(&settings()).resolve(&path).await.unwrap();
        assert_eq!(entry.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_disk_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"hello");

        let resolver = FileResolver::new(&settings());
        let first = resolver.resolve(&path).await.unwrap();
        let second = resolver.resolve(&path).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.disk_reads(), 1);
        assert_eq!(resolver.cached_entries().await, 1);
    }

    #[tokio::test]
    async fn test_mtime_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"v1");

        let resolver = FileResolver::new(&settings());
        assert_eq!(&resolver.resolve(&path).await.unwrap().content[..], b"v1");

        let file = File::create(&path).unwrap();
        (&file).write_all(b"version two").unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        drop(file);

        let entry = resolver.resolve(&path).await.unwrap();
        assert_eq!(&entry.content[..], b"version two");
        assert_eq!(resolver.disk_reads(), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_forces_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"same");

        let resolver = FileResolver::build(&settings(), Some(Duration::from_millis(20)));
        resolver.resolve(&path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        resolver.resolve(&path).await.unwrap();

        assert_eq!(resolver.disk_reads(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        let err = FileResolver::new(&settings()).resolve(&path).await.unwrap_err();
        assert_eq!(err, FileError::NotFound(path));
    }

    #[tokio::test]
    async fn test_removed_file_evicted_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"soon gone");

        let resolver = FileResolver::new(&settings());
        resolver.resolve(&path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let err = resolver.resolve(&path).await.unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
        assert_eq!(resolver.cached_entries().await, 0);
    }

    #[tokio::test]
    async fn test_too_large_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "big.bin", &[0u8; 64]);

        let mut settings = settings();
        settings.max_file_size = 16;
        let err = FileResolver::new(&settings).resolve(&path).await.unwrap_err();
        assert_eq!(
            err,
            FileError::TooLarge {
                path,
                size: 64,
                limit: 16
            }
        );
    }

    #[tokio::test]
    async fn test_directory_is_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileResolver::new(&settings())
            .resolve(dir.path())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[tokio::test]
    async fn test_zero_timeout_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"x");

        let mut settings = settings();
        settings.read_timeout_ms = 0;
        let err = FileResolver::new(&settings).resolve(&path).await.unwrap_err();
        assert_eq!(err, FileError::Timeout(path));
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "empty.json", b"");

        let entry = FileResolver::new(&settings()).resolve(&path).await.unwrap();
        assert!(entry.content.is_empty());
        assert_eq!(entry.size, 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "shared.json", b"{}");

        let resolver = FileResolver::new(&settings());
        let results =
            futures::future::join_all((0..16).map(|_| resolver.resolve(&path))).await;

        assert_eq!(resolver.disk_reads(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_late_caller_reuses_finished_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "late.json", b"{}");

        let resolver = FileResolver::new(&settings());
        let first = resolver.resolve(&path).await.unwrap();

        // Missed the cache before the read landed; must not read again
        let late = resolver.read_shared(&path, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &late));
        assert_eq!(resolver.disk_reads(), 1);

        // A caller that rejected this very entry does read again
        let fresh = resolver.read_shared(&path, Some(&first)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(resolver.disk_reads(), 2);
    }

    #[tokio::test]
    async fn test_distinct_paths_read_independently() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.txt", b"a");
        let b = write_file(dir.path(), "b.txt", b"b");

        let resolver = FileResolver::new(&settings());
        let (ra, rb) = tokio::join!(resolver.resolve(&a), resolver.resolve(&b));

        assert_eq!(&ra.unwrap().content[..], b"a");
        assert_eq!(&rb.unwrap().content[..], b"b");
        assert_eq!(resolver.disk_reads(), 2);
    }

    #[tokio::test]
    async fn test_clear_drops_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.txt", b"a");

        let resolver = FileResolver::new(&settings());
        resolver.resolve(&path).await.unwrap();
        resolver.clear().await;

        assert_eq!(resolver.cached_entries().await, 0);
        resolver.resolve(&path).await.unwrap();
        assert_eq!(resolver.disk_reads(), 2);
    }

    #[test]
    fn test_precompressed_detection() {
        let (mime, encoding) = infer_content_type(Path::new("/srv/data.json.gz"));
        assert_eq!(mime, "application/json");
        assert_eq!(encoding.as_deref(), Some("gzip"));

        let (_, encoding) = infer_content_type(Path::new("/srv/app.css.br"));
        assert_eq!(encoding.as_deref(), Some("br"));

        let (mime, encoding) = infer_content_type(Path::new("/srv/dump.gz"));
        assert_eq!(mime, "application/gzip");
        assert!(encoding.is_none());
    }
}
