//! Atomic file writes via sibling temp + rename.
//!
//! The rename is atomic on the same filesystem, so readers observe either
//! the old content or the new content, never a partial write. A crash
//! between write and rename leaves at worst a stray `.tmp` file.

use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;

pub fn atomic_write_text(path: &Path, content: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> eyre::Result<()> {
    let mut content = serde_json::to_string_pretty(value)?;
    content.push('\n');
    atomic_write_text(path, &content)?;
    Ok(())
}
