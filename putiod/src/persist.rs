use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Returns `path` with `suffix` appended to its file name
/// (`/a/b.json` + `tmp` -> `/a/b.json.tmp`).
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(OsString::new);
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Replaces the file at `path` with `data` so readers only ever observe the
/// old or the new content.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = sibling_path(path, "tmp");
    let mut file = tokio::fs::File::create(&temp).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&temp, path).await
}
