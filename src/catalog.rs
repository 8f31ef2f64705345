//! Catalog: thread-safe directory of open fragments.
//!
//! Maps index name → frame name → slice → fragment, lazily creating
//! fragments on first reference. Lifecycle is tied to process uptime:
//! fragments stay open until their index or frame is explicitly
//! deleted. On startup, existing fragments are discovered from the data
//! directory tree (`<data>/<index>/<frame>/<slice>.snap|.wal`) and
//! reopened, which is where process-level crash recovery happens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::cluster::FrameInventory;
use crate::error::{GridError, Result};
use crate::storage::{Fragment, FragmentKey};

#[derive(Default)]
struct FrameEntry {
    fragments: HashMap<u64, Arc<Fragment>>,
}

#[derive(Default)]
struct IndexEntry {
    frames: HashMap<String, FrameEntry>,
}

/// Thread-safe registry of open fragments, keyed by (index, frame, slice).
pub struct Catalog {
    data_dir: PathBuf,
    indexes: RwLock<HashMap<String, IndexEntry>>,
}

impl Catalog {
    /// Open the catalog over `data_dir`, reopening every fragment found
    /// on disk. Creates the directory if it does not exist.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let catalog = Self {
            data_dir: data_dir.to_path_buf(),
            indexes: RwLock::new(HashMap::new()),
        };
        catalog.discover()?;
        Ok(catalog)
    }

    /// Walk the data directory and reopen every fragment it describes.
    fn discover(&self) -> Result<()> {
        let mut count = 0;
        for index_entry in std::fs::read_dir(&self.data_dir)? {
            let index_dir = index_entry?.path();
            if !index_dir.is_dir() {
                continue;
            }
            let index = match index_dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            for frame_entry in std::fs::read_dir(&index_dir)? {
                let frame_dir = frame_entry?.path();
                if !frame_dir.is_dir() {
                    continue;
                }
                let frame = match frame_dir.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                for slice in discover_slices(&frame_dir)? {
                    let key = FragmentKey::new(&index, &frame, slice);
                    self.fragment(&key)?;
                    count += 1;
                }
            }
        }
        if count > 0 {
            info!(fragments = count, dir = %self.data_dir.display(), "reopened fragments");
        }
        Ok(())
    }

    fn frame_dir(&self, key: &FragmentKey) -> PathBuf {
        self.data_dir.join(&key.index).join(&key.frame)
    }

    /// Get the fragment for `key`, creating it (and its directories) on
    /// first reference.
    pub fn fragment(&self, key: &FragmentKey) -> Result<Arc<Fragment>> {
        if let Some(fragment) = self.get(key) {
            return Ok(fragment);
        }

        let mut indexes = self.indexes.write().unwrap();
        let frame = indexes
            .entry(key.index.clone())
            .or_default()
            .frames
            .entry(key.frame.clone())
            .or_default();
        // Double-checked: another writer may have created it while we
        // waited for the write lock.
        if let Some(fragment) = frame.fragments.get(&key.slice) {
            return Ok(fragment.clone());
        }

        let fragment = Arc::new(Fragment::open(key.clone(), &self.frame_dir(key))?);
        frame.fragments.insert(key.slice, fragment.clone());
        Ok(fragment)
    }

    /// Get an already-open fragment, without creating.
    pub fn get(&self, key: &FragmentKey) -> Option<Arc<Fragment>> {
        self.indexes
            .read()
            .unwrap()
            .get(&key.index)?
            .frames
            .get(&key.frame)?
            .fragments
            .get(&key.slice)
            .cloned()
    }

    /// All open fragment keys, sorted.
    pub fn keys(&self) -> Vec<FragmentKey> {
        let indexes = self.indexes.read().unwrap();
        let mut keys = Vec::new();
        for (index, entry) in indexes.iter() {
            for (frame, frame_entry) in &entry.frames {
                for &slice in frame_entry.fragments.keys() {
                    keys.push(FragmentKey::new(index, frame, slice));
                }
            }
        }
        keys.sort();
        keys
    }

    /// Fragments of one frame, ascending by slice.
    pub fn frame_fragments(&self, index: &str, frame: &str) -> Vec<Arc<Fragment>> {
        let indexes = self.indexes.read().unwrap();
        let Some(frame_entry) = indexes.get(index).and_then(|i| i.frames.get(frame)) else {
            return Vec::new();
        };
        let mut slices: Vec<u64> = frame_entry.fragments.keys().copied().collect();
        slices.sort_unstable();
        slices
            .into_iter()
            .map(|s| frame_entry.fragments[&s].clone())
            .collect()
    }

    /// Per-frame max slice, for ownership enumeration.
    pub fn inventory(&self) -> Vec<FrameInventory> {
        let indexes = self.indexes.read().unwrap();
        let mut inventory = Vec::new();
        for (index, entry) in indexes.iter() {
            for (frame, frame_entry) in &entry.frames {
                if let Some(&max_slice) = frame_entry.fragments.keys().max() {
                    inventory.push(FrameInventory {
                        index: index.clone(),
                        frame: frame.clone(),
                        max_slice,
                    });
                }
            }
        }
        inventory.sort_by(|a, b| (&a.index, &a.frame).cmp(&(&b.index, &b.frame)));
        inventory
    }

    /// Drop a frame and delete its files.
    pub fn delete_frame(&self, index: &str, frame: &str) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        let entry = indexes
            .get_mut(index)
            .ok_or_else(|| GridError::IndexNotFound(index.to_string()))?;
        if entry.frames.remove(frame).is_none() {
            return Err(GridError::FrameNotFound(frame.to_string()));
        }
        drop(indexes);

        let dir = self.data_dir.join(index).join(frame);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!(index, frame, "deleted frame");
        Ok(())
    }

    /// Drop an index, all its frames, and their files.
    pub fn delete_index(&self, index: &str) -> Result<()> {
        let mut indexes = self.indexes.write().unwrap();
        if indexes.remove(index).is_none() {
            return Err(GridError::IndexNotFound(index.to_string()));
        }
        drop(indexes);

        let dir = self.data_dir.join(index);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!(index, "deleted index");
        Ok(())
    }

    /// Flush every open fragment. Keeps going past individual failures
    /// and returns the first error after attempting all.
    pub fn flush_all(&self) -> Result<()> {
        let fragments: Vec<Arc<Fragment>> = {
            let indexes = self.indexes.read().unwrap();
            indexes
                .values()
                .flat_map(|i| i.frames.values())
                .flat_map(|f| f.fragments.values().cloned())
                .collect()
        };

        let mut first_err = None;
        for fragment in fragments {
            if let Err(e) = fragment.flush() {
                warn!(key = %fragment.key(), error = %e, "flush failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Slice numbers present in a frame directory, deduplicated across
/// `.snap` and `.wal` files. `.tmp` leftovers are ignored.
fn discover_slices(frame_dir: &Path) -> Result<Vec<u64>> {
    let mut slices = Vec::new();
    for entry in std::fs::read_dir(frame_dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if !matches!(ext, Some("snap") | Some("wal")) {
            continue;
        }
        if let Some(slice) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            if !slices.contains(&slice) {
                slices.push(slice);
            }
        }
    }
    slices.sort_unstable();
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lazy_creation() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(catalog.keys().is_empty());

        let key = FragmentKey::new("docs", "tags", 0);
        assert!(catalog.get(&key).is_none());
        let frag = catalog.fragment(&key).unwrap();
        assert_eq!(frag.key(), &key);
        assert_eq!(catalog.keys(), vec![key.clone()]);

        // Second lookup returns the same instance.
        assert!(Arc::ptr_eq(&frag, &catalog.fragment(&key).unwrap()));
    }

    #[test]
    fn test_discovery_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            let frag = catalog
                .fragment(&FragmentKey::new("docs", "tags", 2))
                .unwrap();
            frag.set_bit(1, 2 * crate::bitmap::SLICE_WIDTH + 5).unwrap();
            catalog.flush_all().unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        assert_eq!(
            catalog.keys(),
            vec![FragmentKey::new("docs", "tags", 2)]
        );
        let frag = catalog
            .get(&FragmentKey::new("docs", "tags", 2))
            .unwrap();
        assert!(frag.contains(1, 2 * crate::bitmap::SLICE_WIDTH + 5));
    }

    #[test]
    fn test_inventory_tracks_max_slice() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.fragment(&FragmentKey::new("docs", "tags", 0)).unwrap();
        catalog.fragment(&FragmentKey::new("docs", "tags", 4)).unwrap();
        catalog.fragment(&FragmentKey::new("docs", "links", 1)).unwrap();

        let inventory = catalog.inventory();
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory[0].frame, "links");
        assert_eq!(inventory[0].max_slice, 1);
        assert_eq!(inventory[1].frame, "tags");
        assert_eq!(inventory[1].max_slice, 4);
    }

    #[test]
    fn test_delete_frame_removes_files() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let key = FragmentKey::new("docs", "tags", 0);
        catalog.fragment(&key).unwrap().set_bit(1, 1).unwrap();
        catalog.flush_all().unwrap();
        assert!(dir.path().join("docs/tags/0.snap").exists());

        catalog.delete_frame("docs", "tags").unwrap();
        assert!(catalog.get(&key).is_none());
        assert!(!dir.path().join("docs/tags").exists());

        let err = catalog.delete_frame("docs", "tags").unwrap_err();
        assert_eq!(err.code(), "FRAME_NOT_FOUND");
    }

    #[test]
    fn test_delete_unknown_index() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let err = catalog.delete_index("missing").unwrap_err();
        assert_eq!(err.code(), "INDEX_NOT_FOUND");
    }

    #[test]
    fn test_frame_fragments_ordered_by_slice() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        for slice in [3u64, 0, 1] {
            catalog
                .fragment(&FragmentKey::new("docs", "tags", slice))
                .unwrap();
        }
        let slices: Vec<u64> = catalog
            .frame_fragments("docs", "tags")
            .iter()
            .map(|f| f.key().slice)
            .collect();
        assert_eq!(slices, vec![0, 1, 3]);
    }
}
