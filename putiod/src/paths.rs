use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote name is empty")]
    Empty,
    #[error("remote name {0:?} cannot be used as a local file name")]
    Reserved(String),
}

/// Maps a remote file or folder name onto a single local path component.
///
/// Path separators and NUL are replaced with `_` so a name can never escape
/// its parent directory.
pub fn local_component(name: &str) -> Result<String, PathError> {
    if name.trim().is_empty() {
        return Err(PathError::Empty);
    }
    if name == "." || name == ".." {
        return Err(PathError::Reserved(name.to_string()));
    }
    Ok(name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            other => other,
        })
        .collect())
}
