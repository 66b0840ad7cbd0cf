//! Chunked blob storage on the local filesystem

use crate::error::{BlobStoreError, Result};
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, info, warn};

/// Number of lock stripes guarding finalize/remove per id
const LOCK_STRIPES: usize = 64;

/// Directory (under the root) holding in-flight upload chunks
const CHUNK_DIR: &str = "tmp";

/// Blob storage addressed by cache id
pub struct BlobStore {
    /// Root directory for blobs and chunks
    root: PathBuf,
    /// Serialises finalize and remove for ids sharing a stripe
    locks: Vec<Mutex<()>>,
    /// Suffix counter for temp files
    temp_seq: AtomicU64,
}

impl BlobStore {
    /// Create a blob store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            temp_seq: AtomicU64::new(0),
        }
    }

    /// Ensure the storage directories exist
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(CHUNK_DIR)).await?;
        info!(root = ?self.root, "Blob store initialized");
        Ok(())
    }

    /// Location of the finalized blob for `id`
    pub fn path(&self, id: i64) -> PathBuf {
        self.root
            .join(format!("{:02x}", id.rem_euclid(0xff)))
            .join(id.to_string())
    }

    fn chunk_dir(&self, id: i64) -> PathBuf {
        self.root.join(CHUNK_DIR).join(id.to_string())
    }

    fn chunk_path(&self, id: i64, offset: u64) -> PathBuf {
        self.chunk_dir(id).join(format!("{:016x}", offset))
    }

    fn lock_for(&self, id: i64) -> &Mutex<()> {
        &self.locks[id.rem_euclid(LOCK_STRIPES as i64) as usize]
    }

    fn temp_suffix(&self) -> String {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", std::process::id(), seq)
    }

    /// Store `data` at byte `offset` of blob `id`.
    ///
    /// Each chunk is written to its own file and renamed into place, so
    /// concurrent uploads of different ranges never touch the same file and a
    /// retried chunk replaces the earlier attempt whole.
    pub async fn write(&self, id: i64, offset: u64, data: &[u8]) -> Result<()> {
        let dir = self.chunk_dir(id);
        fs::create_dir_all(&dir).await?;

        let temp_path = dir.join(format!(".{:016x}.{}", offset, self.temp_suffix()));
        if let Err(e) = write_file(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        let chunk_path = self.chunk_path(id, offset);
        if let Err(e) = fs::rename(&temp_path, &chunk_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(id, offset, size = data.len(), "Stored chunk");
        Ok(())
    }

    /// Uploaded chunks for `id`, ordered by offset
    async fn chunks(&self, id: i64) -> Result<Vec<(u64, PathBuf)>> {
        let mut entries = match fs::read_dir(self.chunk_dir(id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // In-flight temp files
            if name.starts_with('.') {
                continue;
            }
            let offset = u64::from_str_radix(&name, 16)
                .map_err(|_| BlobStoreError::InvalidChunk(name.clone()))?;
            chunks.push((offset, entry.path()));
        }
        chunks.sort_by_key(|(offset, _)| *offset);
        Ok(chunks)
    }

    /// Assemble the uploaded chunks of `id` into its blob and return the
    /// number of bytes the blob holds.
    ///
    /// The returned size is authoritative; `declared` is only compared
    /// against it for logging. Finalizing an already finalized blob with no
    /// pending chunks returns the existing size.
    pub async fn finalize(&self, id: i64, declared: Option<u64>) -> Result<u64> {
        let _guard = self.lock_for(id).lock().await;

        let chunks = self.chunks(id).await?;
        let path = self.path(id);

        if chunks.is_empty() {
            match fs::metadata(&path).await {
                Ok(meta) => return Ok(meta.len()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = path.with_file_name(format!("{}.{}.partial", id, self.temp_suffix()));

        let size = match assemble(&partial, &chunks).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }

        if let Err(e) = fs::remove_dir_all(self.chunk_dir(id)).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(id, error = %e, "Failed to remove chunk directory");
            }
        }

        match declared {
            Some(declared) if declared != size => {
                debug!(id, declared, size, "Declared size differs from stored bytes");
            }
            _ => {}
        }
        info!(id, size, chunks = chunks.len(), "Finalized blob");
        Ok(size)
    }

    /// Whether a finalized blob exists for `id`
    pub async fn exists(&self, id: i64) -> Result<bool> {
        Ok(fs::try_exists(self.path(id)).await?)
    }

    /// Remove the blob and any pending chunks for `id`. Missing files are
    /// not an error.
    pub async fn remove(&self, id: i64) -> Result<()> {
        let _guard = self.lock_for(id).lock().await;

        match fs::remove_file(self.path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_dir_all(self.chunk_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!(id, "Removed blob");
        Ok(())
    }

    /// Serve the blob for `id` as an HTTP response.
    ///
    /// Range and conditional request headers are honoured; a missing blob
    /// produces `404 Not Found`.
    pub async fn serve(&self, id: i64, request: Request<Body>) -> Response {
        match ServeFile::new(self.path(id)).oneshot(request).await {
            Ok(response) => response.map(Body::new),
            Err(never) => match never {},
        }
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Copy each chunk to its offset in `target`, returning the furthest byte
/// written. Overlapping chunks are applied in offset order.
async fn assemble(target: &Path, chunks: &[(u64, PathBuf)]) -> Result<u64> {
    let mut file = fs::File::create(target).await?;
    let mut size = 0u64;

    for (offset, chunk) in chunks {
        if *offset > size {
            warn!(offset, covered = size, path = ?target, "Gap between uploaded chunks");
        }
        let mut source = fs::File::open(chunk).await?;
        file.seek(SeekFrom::Start(*offset)).await?;
        let written = tokio::io::copy(&mut source, &mut file).await?;
        size = size.max(offset + written);
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}
