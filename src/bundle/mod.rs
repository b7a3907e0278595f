//! Bundle building and publishing.
//!
//! Remote workers cannot see the dispatcher's filesystem, so the resolved
//! classpath and any suite descriptor files are packaged into one archive
//! and published to a blob store before the first worker starts. The
//! archive is deterministic: identical inputs produce byte-identical
//! bundles, so stores can dedupe and builds are reproducible.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Result type for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

/// Archive prefix for suite descriptor files.
pub const SUITE_FILE_PREFIX: &str = "suites/";

/// Errors that can occur while building or publishing a bundle.
///
/// Every variant is fatal for the dispatch: no worker can run without its
/// bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Failed to read classpath entry {path}: {source}")]
    ReadEntry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize bundle archive: {0}")]
    Archive(#[source] std::io::Error),

    #[error("Failed to stage bundle to a temporary file: {0}")]
    Stage(#[source] std::io::Error),

    #[error("Failed to publish bundle to the blob store: {0}")]
    Store(String),
}

/// A blob store the bundle is published to.
///
/// Implementations must support concurrent independent writes; collisions
/// are avoided by the per-run unique component in the bundle name, not by
/// the store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name` and return a durable address.
    async fn put(&self, name: &str, bytes: &[u8]) -> BundleResult<String>;
}

/// Filesystem-backed blob store.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> BundleResult<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BundleError::Store(e.to_string()))?;

        let target = self.root.join(name);
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| BundleError::Store(e.to_string()))?;

        Ok(format!("file://{}", target.display()))
    }
}

/// Builds the deterministic archive shipped to remote workers.
///
/// Entries map archive paths to source files. Classpath files are mapped by
/// basename; classpath directories are walked recursively and mapped by
/// path relative to the directory root. Entries processed later overwrite
/// colliding paths, so the caller's classpath order is the precedence
/// order. Suite descriptor files land under [`SUITE_FILE_PREFIX`].
pub struct BundleBuilder {
    entries: BTreeMap<String, PathBuf>,
}

impl BundleBuilder {
    /// Collect bundle entries from ordered classpath entries and suite
    /// descriptor files.
    pub fn from_classpath(classpath: &[PathBuf], suite_files: &[PathBuf]) -> BundleResult<Self> {
        let mut entries = BTreeMap::new();

        // Files first, then directory walks: a directory entry processed
        // later overwrites a colliding relative path.
        for entry in classpath {
            if entry.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name() {
                entries.insert(name.to_string_lossy().into_owned(), entry.clone());
            }
        }

        for entry in classpath {
            if entry.is_dir() {
                collect_dir(entry, entry, &mut entries)?;
            }
        }

        for file in suite_files {
            if let Some(name) = file.file_name() {
                entries.insert(
                    format!("{}{}", SUITE_FILE_PREFIX, name.to_string_lossy()),
                    file.clone(),
                );
            }
        }

        Ok(Self { entries })
    }

    /// Number of files in the bundle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the bundle into a tar archive.
    ///
    /// Entries are written in lexicographic path order with a fixed
    /// modification time and mode, so identical inputs produce
    /// byte-identical archives.
    pub fn archive(&self) -> BundleResult<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        for (path, source) in &self.entries {
            let data = std::fs::read(source).map_err(|e| BundleError::ReadEntry {
                path: source.clone(),
                source: e,
            })?;

            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mtime(0);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);

            builder
                .append_data(&mut header, path, data.as_slice())
                .map_err(BundleError::Archive)?;
        }

        builder.into_inner().map_err(BundleError::Archive)
    }

    /// Build the archive, stage it to an owner-only temporary file, and
    /// publish it under a per-run unique name.
    pub async fn publish(&self, store: &dyn BlobStore, run_id: &uuid::Uuid) -> BundleResult<String> {
        let bytes = self.archive()?;

        let digest = Sha256::digest(&bytes);
        debug!(
            entries = self.entries.len(),
            size = bytes.len(),
            digest = %format!("{:x}", digest),
            "built bundle archive"
        );

        let mut staged = tempfile::Builder::new()
            .prefix("volley-bundle-")
            .suffix(".tar")
            .tempfile()
            .map_err(BundleError::Stage)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(staged.path(), perms).map_err(BundleError::Stage)?;
        }

        staged.write_all(&bytes).map_err(BundleError::Stage)?;
        staged.flush().map_err(BundleError::Stage)?;

        let name = format!("bundle-{}.tar", run_id);
        let address = store.put(&name, &bytes).await?;
        info!(%address, "published bundle");

        Ok(address)
    }
}

/// Recursively collect files under `dir`, keyed by path relative to `root`.
fn collect_dir(
    root: &Path,
    dir: &Path,
    entries: &mut BTreeMap<String, PathBuf>,
) -> BundleResult<()> {
    let read = std::fs::read_dir(dir).map_err(|e| BundleError::ReadEntry {
        path: dir.to_path_buf(),
        source: e,
    })?;

    for entry in read {
        let entry = entry.map_err(|e| BundleError::ReadEntry {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();

        if path.is_dir() {
            collect_dir(root, &path, entries)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            entries.insert(relative, path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_files_mapped_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let jar = write_file(dir.path(), "libs/dep-1.0.jar", "jar bytes");

        let bundle = BundleBuilder::from_classpath(&[jar], &[]).unwrap();
        assert_eq!(bundle.len(), 1);
        assert!(bundle.entries.contains_key("dep-1.0.jar"));
    }

    #[test]
    fn test_directories_mapped_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "classes/com/example/A.class", "a");
        write_file(dir.path(), "classes/com/example/B.class", "b");

        let bundle =
            BundleBuilder::from_classpath(&[dir.path().join("classes")], &[]).unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(bundle.entries.contains_key("com/example/A.class"));
        assert!(bundle.entries.contains_key("com/example/B.class"));
    }

    #[test]
    fn test_later_directory_wins_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "first/same.txt", "first");
        let winner = write_file(dir.path(), "second/same.txt", "second");

        let bundle = BundleBuilder::from_classpath(
            &[dir.path().join("first"), dir.path().join("second")],
            &[],
        )
        .unwrap();

        assert_eq!(bundle.entries.get("same.txt"), Some(&winner));
    }

    #[test]
    fn test_suite_files_under_fixed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let suite = write_file(dir.path(), "suiteA.xml", "<suite/>");

        let bundle = BundleBuilder::from_classpath(&[], &[suite]).unwrap();
        assert!(bundle.entries.contains_key("suites/suiteA.xml"));
    }

    #[test]
    fn test_identical_inputs_produce_byte_identical_archives() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "classes/z.txt", "zzz");
        write_file(dir.path(), "classes/a/nested.txt", "nested");
        let jar = write_file(dir.path(), "dep.jar", "jar");
        let suite = write_file(dir.path(), "suite.xml", "<suite/>");

        let classpath = vec![jar, dir.path().join("classes")];
        let suites = vec![suite];

        let first = BundleBuilder::from_classpath(&classpath, &suites)
            .unwrap()
            .archive()
            .unwrap();
        let second = BundleBuilder::from_classpath(&classpath, &suites)
            .unwrap()
            .archive()
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_publish_writes_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let jar = write_file(dir.path(), "dep.jar", "jar");
        let store_dir = tempfile::tempdir().unwrap();

        let store = FsBlobStore::new(store_dir.path());
        let bundle = BundleBuilder::from_classpath(&[jar], &[]).unwrap();
        let run_id = uuid::Uuid::new_v4();

        let address = bundle.publish(&store, &run_id).await.unwrap();

        assert!(address.starts_with("file://"));
        assert!(address.contains(&run_id.to_string()));
        let stored = store_dir.path().join(format!("bundle-{}.tar", run_id));
        assert!(stored.exists());
    }

    #[test]
    fn test_missing_classpath_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ghost = dir.path().join("missing.jar");

        let bundle = BundleBuilder::from_classpath(&[ghost], &[]).unwrap();
        // The entry is recorded by name; reading it at archive time fails.
        assert!(matches!(
            bundle.archive(),
            Err(BundleError::ReadEntry { .. })
        ));
    }
}
