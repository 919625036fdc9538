use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::geo::Tile;

/// On-disk cache of raw vector tiles.
///
/// Entries live under `<cache_dir>/<endpoint hash>/<z>/<x>/<y>.mvt`, so tiles
/// fetched from different endpoints never collide.
pub struct TileCache {
    cache_dir: PathBuf,
}

impl TileCache {
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();

        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir)
                .context("Failed to create cache directory")?;
        }

        Ok(Self { cache_dir })
    }

    fn endpoint_dir(&self, endpoint: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.trim_end_matches('/').as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.cache_dir.join(&hash[..16])
    }

    pub fn tile_path(&self, endpoint: &str, tile: Tile) -> PathBuf {
        self.endpoint_dir(endpoint)
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(format!("{}.mvt", tile.y))
    }

    /// Cached payload for `tile`, if any. Unreadable entries count as misses.
    pub fn load(&self, endpoint: &str, tile: Tile) -> Option<Vec<u8>> {
        fs::read(self.tile_path(endpoint, tile)).ok()
    }

    pub fn store(&self, endpoint: &str, tile: Tile, data: &[u8]) -> Result<PathBuf> {
        let file_path = self.tile_path(endpoint, tile);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create tile cache directory")?;
        }

        let tmp_path = file_path.with_extension("part");
        let mut file = File::create(&tmp_path)
            .context("Failed to create cache file")?;
        file.write_all(data)
            .context("Failed to write tile to cache")?;
        fs::rename(&tmp_path, &file_path)
            .context("Failed to move cache file into place")?;

        Ok(file_path)
    }

    pub fn clear(&self) -> Result<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)
                .context("Failed to remove cache directory")?;
            fs::create_dir_all(&self.cache_dir)
                .context("Failed to recreate cache directory")?;
        }

        Ok(())
    }
}
