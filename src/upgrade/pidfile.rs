//! PID file handling for process supervisors.
//!
//! The file always names the generation that currently owns the listeners:
//! a generation writes it when it reports ready, and rewrites it when an
//! upgrade it started fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Atomically write the current pid to `path` (temp file + rename).
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    write_pid(path, std::process::id())
}

pub(crate) fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    let tmp = temp_path(path, pid);
    fs::write(&tmp, format!("{pid}\n"))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Read a pid written by [`write_pid_file`].
pub fn read_pid_file(path: &Path) -> io::Result<u32> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad pid file: {e}")))
}

fn temp_path(path: &Path, pid: u32) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "pid".into());
    name.push(format!(".{pid}.tmp"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reads_back_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), std::process::id());
    }

    #[test]
    fn rewrite_replaces_previous_pid_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        write_pid(&path, 1111).unwrap();
        write_pid(&path, 2222).unwrap();

        assert_eq!(read_pid_file(&path).unwrap(), 2222);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn garbage_pid_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "not a pid").unwrap();

        let err = read_pid_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
