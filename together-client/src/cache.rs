use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::debug;
use tempfile::TempDir;
use together_core::ClipId;

/// Where retrieved clips are staged. Everything in it is deleted when the
/// cache is dropped.
pub struct ClipCache {
    dir: TempDir,
}

impl ClipCache {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("together_").tempdir()?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// The final location of a verified clip.
    pub fn clip_path(&self, clip: ClipId) -> PathBuf {
        self.dir.path().join(format!("{}.clip", clip))
    }

    /// Where a clip is written while it downloads.
    pub fn partial_path(&self, clip: ClipId) -> PathBuf {
        self.dir.path().join(format!("{}.part", clip))
    }

    /// A verified copy, if one is staged.
    pub fn get(&self, clip: ClipId) -> Option<PathBuf> {
        let path = self.clip_path(clip);
        path.is_file().then_some(path)
    }

    /// Removes every staged file except those of `keep`.
    pub fn supersede(&self, keep: ClipId) -> io::Result<()> {
        let keep = [self.clip_path(keep), self.partial_path(keep)];
        self.remove_where(|path| !keep.iter().any(|k| k == path))
    }

    /// Removes every staged file.
    pub fn clear(&self) -> io::Result<()> {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, mut remove: impl FnMut(&Path) -> bool) -> io::Result<()> {
        for entry in fs::read_dir(self.dir.path())? {
            let path = entry?.path();

            if path.is_file() && remove(&path) {
                debug!("Removing staged file {}", path.display());
                fs::remove_file(&path)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use together_core::ClipId;

    use super::ClipCache;

    #[test]
    fn superseding_keeps_only_the_current_clip() {
        let cache = ClipCache::new().unwrap();
        let (old, current) = (ClipId::new(), ClipId::new());

        fs::write(cache.clip_path(old), b"old").unwrap();
        fs::write(cache.partial_path(current), b"par").unwrap();

        cache.supersede(current).unwrap();
        assert!(cache.get(old).is_none());
        assert!(cache.partial_path(current).exists());

        cache.clear().unwrap();
        assert!(!cache.partial_path(current).exists());
    }

    #[test]
    fn dropping_the_cache_deletes_its_directory() {
        let cache = ClipCache::new().unwrap();
        let dir = cache.dir().to_path_buf();
        fs::write(cache.clip_path(ClipId::new()), b"x").unwrap();

        drop(cache);
        assert!(!dir.exists());
    }
}
