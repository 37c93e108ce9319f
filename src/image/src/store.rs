//! Content-addressed layer cache.
//!
//! The store negotiates between the local destination and the remote image,
//! caching layer blobs by digest and offering a way to purge the cache.
//!
//! On disk the cache looks like this:
//!
//! ```text
//! <cache>/
//!   .lock                      # cache-wide lock file
//!   layers/<digest>.layer      # raw gzipped tar, byte-for-byte from the registry
//!   links/<md5hex(dst)>.link   # line 1: destination, lines 2..: layer digests
//! ```
//!
//! A link file exists if and only if an extraction to its destination
//! succeeded, and lists exactly the digests that extraction consumed. That
//! makes purging safe: a layer is only removed once no existing destination
//! links to it.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use rootpull_core::{PullError, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::lock::PathLock;
use crate::remote::Remote;
use crate::untar::{apply_directory_modes, untar_layer, DirModeMap};

/// The layer cache rooted at a folder.
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open a store at the given folder, creating the cache structure as
    /// needed.
    pub fn new(folder: impl Into<PathBuf>) -> Store {
        let path = folder.into();

        // ignore creation errors here - if it's serious, we'll know about
        // it as soon as the cache is used
        let _ = fs::create_dir_all(path.join("layers"));
        let _ = fs::create_dir_all(path.join("links"));

        Store { path }
    }

    /// The path holding the cached blob of the given layer digest.
    pub fn layer_path(&self, digest: &str) -> PathBuf {
        self.path.join("layers").join(format!("{digest}.layer"))
    }

    /// The path of the link file recording the layers a destination uses.
    pub fn link_path(&self, dst: &Path) -> PathBuf {
        let sum = Md5::digest(dst.to_string_lossy().as_bytes());
        self.path.join("links").join(format!("{sum:x}.link"))
    }

    /// Download the image behind `remote` and extract it into `dst`.
    ///
    /// All missing layers are downloaded concurrently while extraction
    /// consumes them strictly in manifest order. The cache and the
    /// destination stay locked for the whole operation.
    pub async fn extract(
        &self,
        cancel: &CancellationToken,
        remote: &Remote,
        dst: &Path,
    ) -> Result<()> {
        // fetch the layers
        let layers = remote.layers().await?;
        if layers.is_empty() {
            return Err(PullError::NoLayers(remote.to_string()));
        }

        // lock the whole cache as well as the destination
        let _cache_guard = PathLock::new(self.path.join(".lock")).lock().await?;
        let _dst_guard = PathLock::new(destination_lock_path(dst)).lock().await?;

        // ensure the destination is empty
        let entries = fs::read_dir(dst)
            .map_err(|e| PullError::fs("read dir", dst, e))?
            .count();
        if entries > 1 {
            return Err(PullError::DestinationNotEmpty(dst.to_path_buf()));
        }

        // start all the downloads before extracting anything
        let mut results = Vec::with_capacity(layers.len());
        for layer in &layers {
            results.push(self.download_layer(remote, &layer.digest)?);
        }

        // process the layers in order
        let mut dirmodes = DirModeMap::new();
        let mut digests = Vec::with_capacity(layers.len());

        for (layer, result) in layers.iter().zip(results) {
            let path = result
                .await
                .map_err(|_| PullError::fs(
                    "download",
                    self.layer_path(&layer.digest),
                    std::io::Error::new(ErrorKind::Other, "layer download aborted"),
                ))??;

            tracing::debug!(digest = %layer.digest, "extracting layer");
            untar_layer(cancel, &path, dst, &mut dirmodes)?;

            digests.push(layer.digest.clone());
        }

        // set the correct permissions for all directories
        apply_directory_modes(&dirmodes)?;

        // record the destination in the cache
        self.save_link(dst, &digests)
    }

    /// Remove all unused data from the cache.
    ///
    /// A layer is unused if no link file with an existing destination
    /// mentions it. Link files whose destinations vanished are removed as
    /// well.
    pub async fn purge(&self) -> Result<()> {
        // lock the whole cache
        let _guard = PathLock::new(self.path.join(".lock")).lock().await?;

        // load the destination folders and the layers connected to them
        let links = self.read_links()?;

        // keep a list of known layers
        let mut live: HashSet<String> = HashSet::new();

        for (dst, digests) in links {
            match fs::metadata(&dst) {
                // the destination still exists, its digests stay alive
                Ok(_) => live.extend(digests),

                // the destination does not exist anymore, remove the link
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let link = self.link_path(Path::new(&dst));
                    fs::remove_file(&link).map_err(|e| PullError::fs("remove", &link, e))?;
                }

                Err(e) => return Err(PullError::fs("stat", dst, e)),
            }
        }

        // go through all the cached layers and remove the unknown ones
        let layers_dir = self.path.join("layers");
        let entries = fs::read_dir(&layers_dir)
            .map_err(|e| PullError::fs("read dir", &layers_dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| PullError::fs("read dir", &layers_dir, e))?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("layer") {
                continue;
            }

            let digest = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();

            if !live.contains(&digest) {
                fs::remove_file(&path).map_err(|e| PullError::fs("remove", &path, e))?;
                tracing::debug!(digest = %digest, "removed unused layer");
            }
        }

        Ok(())
    }

    /// Download the given layer into the cache, delivering the cached path
    /// through the returned receiver once the download completes.
    ///
    /// If the layer was downloaded already, the path is delivered right
    /// away.
    fn download_layer(
        &self,
        remote: &Remote,
        digest: &str,
    ) -> Result<oneshot::Receiver<Result<PathBuf>>> {
        let (tx, rx) = oneshot::channel();
        let path = self.layer_path(digest);

        // if the layer already exists, send it right away
        if path.exists() {
            let _ = tx.send(Ok(path));
            return Ok(rx);
        }

        // otherwise create the file
        let file = File::create(&path).map_err(|e| PullError::fs("create", &path, e))?;

        // then download it in the background
        let remote = remote.clone();
        let digest = digest.to_string();

        tokio::spawn(async move {
            tracing::debug!(digest = %digest, "downloading layer");

            let mut file = tokio::fs::File::from_std(file);
            let result = remote.download_layer(&digest, &mut file).await.map(|_| path);
            let _ = tx.send(result);
        });

        Ok(rx)
    }

    /// Record the digests a destination was built from.
    ///
    /// This assumes the cache has been locked already.
    fn save_link(&self, dst: &Path, digests: &[String]) -> Result<()> {
        let path = self.link_path(dst);
        let mut file = File::create(&path).map_err(|e| PullError::fs("create", &path, e))?;

        // the first line is the destination, the others are the digests
        writeln!(file, "{}", dst.to_string_lossy())
            .map_err(|e| PullError::fs("write", &path, e))?;

        for digest in digests {
            writeln!(file, "{digest}").map_err(|e| PullError::fs("write", &path, e))?;
        }

        Ok(())
    }

    /// All stored links as a map of destinations to the digests they are
    /// associated with.
    fn read_links(&self) -> Result<HashMap<String, Vec<String>>> {
        let links_dir = self.path.join("links");
        let mut links = HashMap::new();

        let entries = match fs::read_dir(&links_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(links),
            Err(e) => return Err(PullError::fs("read dir", &links_dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| PullError::fs("read dir", &links_dir, e))?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("link") {
                continue;
            }

            let content =
                fs::read_to_string(&path).map_err(|e| PullError::fs("read", &path, e))?;

            let mut lines = content.lines();

            // the first line contains the destination, the rest the digests
            let Some(dst) = lines.next() else { continue };

            links
                .entry(dst.to_string())
                .or_insert_with(Vec::new)
                .extend(lines.map(String::from));
        }

        Ok(links)
    }
}

/// The lock file guarding a destination, a sibling of the directory itself.
fn destination_lock_path(dst: &Path) -> PathBuf {
    let mut path = dst.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}
