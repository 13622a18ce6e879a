//! File storage for large payload parts, zstd compressed

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;

/// External part files
///
/// Directory structure:
/// ```text
/// parts/
///   07/
///     1207_r0.zst     # part 1207, version 0
///     1207_r3.zst     # part 1207 after three rewrites
///   42/
///     42_r0.zst
/// ```
/// A new version is written to a new file, so a rolled-back transaction
/// never leaves the committed file modified.
pub struct PartStore {
    root: PathBuf,
    compression_level: i32,
}

impl PartStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create part storage directory")?;
        Ok(Self {
            root,
            compression_level: 3,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name for a part version
    pub fn file_name(part_id: i64, version: i64) -> String {
        format!("{}_r{}.zst", part_id, version)
    }

    fn path(&self, name: &str) -> PathBuf {
        let part_id: i64 = name
            .split('_')
            .next()
            .and_then(|id| id.parse().ok())
            .unwrap_or(0);
        self.root.join(format!("{:02}", part_id.rem_euclid(100))).join(name)
    }

    pub fn put(&self, part_id: i64, version: i64, data: &[u8]) -> Result<String> {
        let name = Self::file_name(part_id, version);
        let path = self.path(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress part")?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &compressed)?;
        fs::rename(&temp_path, &path)?;
        Ok(name)
    }

    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&path)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut data = Vec::new();
        decoder
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to decompress part file {}", name))?;
        Ok(Some(data))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove files, logging failures instead of returning them
    pub fn delete_all<'a>(&self, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            if let Err(e) = self.delete(name) {
                warn!("Failed to delete part file {}: {}", name, e);
            }
        }
    }
}
