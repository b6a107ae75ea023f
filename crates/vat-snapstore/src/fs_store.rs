use crate::{SnapStoreError, SnapStoreResult, io_error};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    fs::{self, File},
    future::Future,
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Instant,
};
use tempfile::{Builder as TempBuilder, TempPath};
use tokio::sync::Notify;
use vat_codec::{Hash, Hasher};

const COPY_CHUNK: usize = 64 * 1024;
const GZ_SUFFIX: &str = ".gz";

/// Outcome of [`SnapStore::save`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotResult {
    /// sha256 of the uncompressed snapshot.
    pub hash: Hash,
    pub file_path: PathBuf,
    pub raw_size: u64,
    pub compressed_size: u64,
    pub raw_save_seconds: f64,
    pub compress_seconds: f64,
}

/// Filesystem-backed snapshot store rooted at a single directory.
pub struct SnapStore {
    root: PathBuf,
    pending_deletes: Mutex<BTreeSet<Hash>>,
    leases: Mutex<HashMap<Hash, usize>>,
    released: Notify,
}

impl fmt::Debug for SnapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapStore")
            .field("root", &self.root)
            .field("pending_deletes", &self.pending_count())
            .finish()
    }
}

impl SnapStore {
    pub fn open(root: impl AsRef<Path>) -> SnapStoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self {
            root,
            pending_deletes: Mutex::new(BTreeSet::new()),
            leases: Mutex::new(HashMap::new()),
            released: Notify::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, hash: &Hash) -> PathBuf {
        self.root.join(format!("{}{GZ_SUFFIX}", hash.to_hex()))
    }

    pub fn has_hash(&self, hash: &Hash) -> bool {
        self.snapshot_path(hash).exists()
    }

    /// Persist a snapshot produced by `write_raw`.
    ///
    /// `write_raw` receives a fresh path in the store directory and must leave
    /// the uncompressed snapshot there. Saving content that is already stored
    /// returns the existing hash without rewriting the file.
    pub async fn save<F, Fut, E>(&self, write_raw: F) -> Result<SnapshotResult, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<SnapStoreError>,
    {
        let raw_path = self.temp_path("save-raw-", ".xss")?;
        let started = Instant::now();
        write_raw(raw_path.to_path_buf()).await?;
        let raw_save_seconds = started.elapsed().as_secs_f64();

        let root = self.root.clone();
        let started = Instant::now();
        let (hash, raw_size, compressed_size) =
            tokio::task::spawn_blocking(move || hash_and_compress(&root, raw_path))
                .await
                .map_err(|e| SnapStoreError::Task(e.to_string()))??;
        let compress_seconds = started.elapsed().as_secs_f64();

        log::debug!(
            "saved snapshot {hash}: raw {raw_size} bytes, compressed {compressed_size} bytes"
        );
        Ok(SnapshotResult {
            hash,
            file_path: self.snapshot_path(&hash),
            raw_size,
            compressed_size,
            raw_save_seconds,
            compress_seconds,
        })
    }

    /// Decompress snapshot `hash` into a temp file, verify it, and hand the
    /// path to `load_raw`. The temp file lives until `load_raw` completes.
    pub async fn load<F, Fut, T, E>(&self, hash: Hash, load_raw: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SnapStoreError>,
    {
        let _lease = self.lease(hash);
        let gz_path = self.snapshot_path(&hash);
        if !gz_path.exists() {
            return Err(SnapStoreError::Missing(hash).into());
        }
        let raw_path = self.temp_path(&format!("load-{}-", hash.to_hex()), ".xss")?;
        let target = raw_path.to_path_buf();
        let started = Instant::now();
        tokio::task::spawn_blocking(move || decompress_verified(&gz_path, &target, hash))
            .await
            .map_err(|e| SnapStoreError::Task(e.to_string()))??;
        log::debug!(
            "restored snapshot {hash} in {:.3}s",
            started.elapsed().as_secs_f64()
        );
        let result = load_raw(raw_path.to_path_buf()).await;
        drop(raw_path);
        result
    }

    /// Mark `hash` for deletion at the next [`SnapStore::commit_deletes`].
    pub fn prepare_to_delete(&self, hash: Hash) {
        self.pending_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash);
    }

    pub fn pending_count(&self) -> usize {
        self.pending_deletes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delete every prepared snapshot. Deletion of a hash waits for loads of
    /// that hash still in flight. The pending set is always cleared.
    pub async fn commit_deletes(&self, ignore_errors: bool) -> SnapStoreResult<()> {
        let pending = std::mem::take(
            &mut *self
                .pending_deletes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut errors = Vec::new();
        for hash in pending {
            self.wait_for_readers(&hash).await;
            let path = self.snapshot_path(&hash);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::debug!("deleted snapshot {hash}"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) if ignore_errors => {
                    log::warn!("ignoring failure to delete snapshot {hash}: {err}");
                }
                Err(err) => errors.push(io_error(path, err)),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SnapStoreError::Aggregate(errors))
        }
    }

    fn temp_path(&self, prefix: &str, suffix: &str) -> SnapStoreResult<TempPath> {
        temp_file_in(&self.root, prefix, suffix).map(|(_, path)| path)
    }

    fn lease(&self, hash: Hash) -> LoadLease<'_> {
        *self
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(hash)
            .or_insert(0) += 1;
        LoadLease { store: self, hash }
    }

    fn is_leased(&self, hash: &Hash) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hash)
    }

    async fn wait_for_readers(&self, hash: &Hash) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_leased(hash) {
                return;
            }
            notified.await;
        }
    }
}

struct LoadLease<'a> {
    store: &'a SnapStore,
    hash: Hash,
}

impl Drop for LoadLease<'_> {
    fn drop(&mut self) {
        let mut leases = self
            .store
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = leases.get_mut(&self.hash) {
            *count -= 1;
            if *count == 0 {
                leases.remove(&self.hash);
            }
        }
        drop(leases);
        self.store.released.notify_waiters();
    }
}

fn temp_file_in(dir: &Path, prefix: &str, suffix: &str) -> SnapStoreResult<(File, TempPath)> {
    let named = TempBuilder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)
        .map_err(|e| io_error(dir, e))?;
    let (file, path) = named.into_parts();
    Ok((file, path))
}

fn hash_and_compress(root: &Path, raw_path: TempPath) -> SnapStoreResult<(Hash, u64, u64)> {
    let (hash, raw_size) = hash_file(&raw_path)?;
    let final_path = root.join(format!("{}{GZ_SUFFIX}", hash.to_hex()));
    if let Ok(meta) = fs::metadata(&final_path) {
        log::debug!("snapshot {hash} already stored; discarding duplicate");
        return Ok((hash, raw_size, meta.len()));
    }

    let (gz_file, gz_path) = temp_file_in(root, &format!("{}-", hash.to_hex()), ".gz.tmp")?;
    let mut reader = File::open(&raw_path).map_err(|e| io_error(raw_path.to_path_buf(), e))?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    io::copy(&mut reader, &mut encoder).map_err(|e| io_error(gz_path.to_path_buf(), e))?;
    let gz_file = encoder
        .finish()
        .map_err(|e| io_error(gz_path.to_path_buf(), e))?;
    gz_file
        .sync_all()
        .map_err(|e| io_error(gz_path.to_path_buf(), e))?;
    let compressed_size = gz_file
        .metadata()
        .map_err(|e| io_error(gz_path.to_path_buf(), e))?
        .len();
    drop(gz_file);
    gz_path
        .persist(&final_path)
        .map_err(|e| io_error(&final_path, e.error))?;
    Ok((hash, raw_size, compressed_size))
}

fn hash_file(path: &Path) -> SnapStoreResult<(Hash, u64)> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finish(), total))
}

fn decompress_verified(gz_path: &Path, target: &Path, expected: Hash) -> SnapStoreResult<()> {
    let file = File::open(gz_path).map_err(|e| io_error(gz_path, e))?;
    let mut decoder = GzDecoder::new(file);
    let mut out = File::create(target).map_err(|e| io_error(target, e))?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = decoder.read(&mut buf).map_err(|e| io_error(gz_path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).map_err(|e| io_error(target, e))?;
    }
    out.flush().map_err(|e| io_error(target, e))?;
    let actual = hasher.finish();
    if actual != expected {
        return Err(SnapStoreError::HashMismatch { expected, actual });
    }
    Ok(())
}
