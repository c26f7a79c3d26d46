//! Tile sources: where tile descriptors and their bundles come from.
//!
//! The engine only needs a parsed [`Tile`] plus the folder of its unpacked
//! bundle, and optionally a pre-recorded output log for dry runs.

use crate::core::error::{Error, Result};
use crate::core::parser::{parse_tile, validate_tile};
use crate::core::types::Tile;
use std::collections::HashMap;
use std::path::PathBuf;

/// File name of a tile descriptor inside its bundle.
pub const TILE_SPEC_FILE: &str = "tile-spec.yaml";

/// Dry-run fixture relative to the bundle.
pub const FIXTURE_LOG: &str = "test/output.log";

/// A fetched tile and the folder holding its bundle.
#[derive(Debug, Clone)]
pub struct TileBundle {
    pub tile: Tile,
    pub folder: PathBuf,
}

pub trait TileSource: Send + Sync {
    fn fetch(&self, name: &str, version: &str) -> Result<TileBundle>;

    /// Pre-recorded stage log used instead of running anything in dry-run.
    fn fixture_log(&self, name: &str, version: &str) -> Option<PathBuf>;
}

/// `<root>/<name>/<version>/tile-spec.yaml` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalTileRepo {
    root: PathBuf,
}

impl LocalTileRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bundle_dir(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }
}

impl TileSource for LocalTileRepo {
    fn fetch(&self, name: &str, version: &str) -> Result<TileBundle> {
        let folder = self.bundle_dir(name, version);
        let spec = folder.join(TILE_SPEC_FILE);
        let bytes = std::fs::read(&spec).map_err(|e| {
            Error::Parse(format!("cannot read {}: {}", spec.display(), e))
        })?;
        let tile = parse_tile(&bytes)?;
        if tile.metadata.name != name {
            return Err(Error::Parse(format!(
                "{} declares tile '{}', expected '{}'",
                spec.display(),
                tile.metadata.name,
                name
            )));
        }
        let errors = validate_tile(&tile);
        if !errors.is_empty() {
            return Err(Error::Validation(
                errors.into_iter().map(|e| e.message).collect(),
            ));
        }
        tracing::debug!(tile = name, version, folder = %folder.display(), "fetched tile");
        Ok(TileBundle { tile, folder })
    }

    fn fixture_log(&self, name: &str, version: &str) -> Option<PathBuf> {
        let path = self.bundle_dir(name, version).join(FIXTURE_LOG);
        path.is_file().then_some(path)
    }
}

/// In-memory tiles, keyed by name and version.
#[derive(Debug, Clone, Default)]
pub struct StaticTileSource {
    tiles: HashMap<(String, String), Tile>,
    fixtures: HashMap<(String, String), PathBuf>,
    folder: PathBuf,
}

impl StaticTileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folder reported as the bundle location of every tile.
    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_tile(mut self, tile: Tile) -> Self {
        let key = (tile.metadata.name.clone(), tile.metadata.version.clone());
        self.tiles.insert(key, tile);
        self
    }

    /// Parse and add a tile from YAML.
    pub fn with_yaml(self, yaml: &str) -> Result<Self> {
        let tile = parse_tile(yaml.as_bytes())?;
        Ok(self.with_tile(tile))
    }

    pub fn with_fixture(mut self, name: &str, version: &str, log: impl Into<PathBuf>) -> Self {
        self.fixtures
            .insert((name.to_string(), version.to_string()), log.into());
        self
    }
}

impl TileSource for StaticTileSource {
    fn fetch(&self, name: &str, version: &str) -> Result<TileBundle> {
        let tile = self
            .tiles
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| Error::Parse(format!("no tile {}@{}", name, version)))?;
        Ok(TileBundle {
            tile,
            folder: self.folder.join(name).join(version),
        })
    }

    fn fixture_log(&self, name: &str, version: &str) -> Option<PathBuf> {
        self.fixtures
            .get(&(name.to_string(), version.to_string()))
            .cloned()
    }
}
