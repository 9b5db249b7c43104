//! Filesystem and input helpers shared by the server and client
//!
//! - `sanitize_input`: strips NUL padding and surrounding whitespace from request subjects
//! - `check_file_exists` / `read_text_file_contents`: file lookups used by computations
//! - `remove_path_if_exists`: socket path cleanup that tolerates an already-removed path

use std::fs;
use std::io;
use std::path::Path;

/// Strip embedded NUL bytes at either end and surrounding whitespace.
///
/// Clients that write fixed-size buffers pad the path with `\0`, so those
/// are trimmed before the whitespace.
///
/// # Examples
///
/// ```
/// use sockrelay::fs_utils::sanitize_input;
///
/// assert_eq!(sanitize_input("\0\0 notes.txt \n\0"), "notes.txt");
/// ```
pub fn sanitize_input(raw: &str) -> String {
    raw.trim_matches('\0').trim().to_string()
}

/// Check whether a file exists at `path`.
///
/// Returns a human-readable status on success and the underlying error
/// (typically `NotFound`) otherwise.
pub fn check_file_exists(path: &Path) -> io::Result<String> {
    fs::metadata(path)?;
    Ok(format!("File exists in {} filepath.", path.display()))
}

/// Read a text file, normalizing line terminators to `\n`.
///
/// A final unterminated line is kept as-is.
pub fn read_text_file_contents(path: &Path) -> io::Result<String> {
    let raw = fs::read_to_string(path)?;
    let mut out = String::with_capacity(raw.len());
    for line in raw.split_inclusive('\n') {
        match line.strip_suffix('\n') {
            Some(body) => {
                out.push_str(body.strip_suffix('\r').unwrap_or(body));
                out.push('\n');
            }
            None => out.push_str(line),
        }
    }
    Ok(out)
}

/// Remove a filesystem entry, treating "already gone" as success.
///
/// Returns `true` if something was removed.
pub fn remove_path_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
