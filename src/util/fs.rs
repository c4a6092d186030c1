//! Filesystem helpers: atomic replace and directory sync

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Fsync a directory so renames and creations inside it are durable
pub fn sync_dir(dir: &Path) -> Result<()> {
  let handle = File::open(dir)?;
  handle.sync_all()?;
  Ok(())
}

/// Atomically replace `path` with `bytes`: write tmp, fsync, rename,
/// fsync the containing directory.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<()> {
  let tmp = path.with_extension("tmp");
  {
    let mut file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
  }
  fs::rename(&tmp, path)?;
  if let Some(parent) = path.parent() {
    sync_dir(parent)?;
  }
  Ok(())
}
