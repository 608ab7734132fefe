//! Workdir persistence
//!
//! Every step owns one directory of the run workdir and is its only writer.
//! Documents are pretty-printed JSON written atomically through a temp file.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

/// Step status and phase data
pub const STEP_FILE: &str = "step.json";
/// Discovered tests
pub const TESTS_FILE: &str = "tests.json";
/// Test or phase results
pub const RESULTS_FILE: &str = "results.json";
/// Failure excerpt of one test invocation
pub const FAILURES_FILE: &str = "failures.json";

/// A directory owned by a single step or invocation.
#[derive(Debug, Clone)]
pub struct Workdir {
    root: PathBuf,
}

impl Workdir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            OrchestratorError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create directory {:?}: {}", self.root, e),
            ))
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Write a JSON document (atomic write via temp file + rename)
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        self.ensure()?;
        let path = self.path(name);
        let temp_path = self.path(&format!(".{}.tmp", name));

        debug!("Writing {:?}", path);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path)?;

        Ok(path)
    }

    /// Read a JSON document, `None` when it does not exist
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }

        debug!("Reading {:?}", path);
        let content = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::Serialization(format!("Failed to parse {:?}: {}", path, e))
        })?;

        Ok(Some(value))
    }

    /// Remove everything except the preserved top-level entries.
    pub fn wipe(&self, preserve: &[&str]) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }

        info!(path = ?self.root, preserved = ?preserve, "Cleaning workdir");
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if preserve.iter().any(|kept| name.as_os_str() == OsStr::new(kept)) {
                continue;
            }

            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Escape a line so only printable ASCII remains.
///
/// Backslashes are doubled and every other byte outside `0x20..=0x7e` is
/// written as `\xHH`.
pub fn escape_line(line: &str) -> String {
    let mut escaped = String::with_capacity(line.len());
    for byte in line.bytes() {
        match byte {
            b'\\' => escaped.push_str("\\\\"),
            0x20..=0x7e => escaped.push(byte as char),
            _ => escaped.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    escaped
}

/// Inverse of [`escape_line`].
pub fn unescape_line(line: &str) -> Result<String> {
    let invalid = || OrchestratorError::Serialization(format!("Invalid escaped line: {:?}", line));

    let bytes = line.as_bytes();
    let mut raw = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] != b'\\' {
            raw.push(bytes[index]);
            index += 1;
            continue;
        }

        match bytes.get(index + 1) {
            Some(b'\\') => {
                raw.push(b'\\');
                index += 2;
            }
            Some(b'x') => {
                let hex = line.get(index + 2..index + 4).ok_or_else(invalid)?;
                raw.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                index += 4;
            }
            _ => return Err(invalid()),
        }
    }

    String::from_utf8(raw).map_err(|_| invalid())
}

/// Append lines to a failure excerpt file.
pub fn append_failures(workdir: &Workdir, lines: &[String]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut stored: Vec<String> = workdir.read_json(FAILURES_FILE)?.unwrap_or_default();
    stored.extend(lines.iter().map(|line| escape_line(line)));
    workdir.write_json(FAILURES_FILE, &stored)?;
    Ok(())
}

/// Load a failure excerpt file with the original lines restored.
pub fn load_failures(workdir: &Workdir) -> Result<Vec<String>> {
    let stored: Vec<String> = workdir.read_json(FAILURES_FILE)?.unwrap_or_default();
    stored.iter().map(|line| unescape_line(line)).collect()
}
