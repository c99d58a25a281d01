//! Small-file helpers shared by the state files the control plane owns.
//!
//! Every state file is replaced whole: content goes to a temporary file in
//! the same directory which is then renamed over the target, so a concurrent
//! reader sees either the old or the new content, never a partial write.

use crate::error::{HubError, HubResult};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Atomically replace `path` with `content`, optionally setting unix permissions.
pub fn atomic_write(path: &Path, content: &[u8], permissions: Option<u32>) -> HubResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    if let Some(mode) = permissions {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = permissions;

    tmp.persist(path)
        .map_err(|e| HubError::Io(e.error))?;

    debug!("Replaced {:?} ({} bytes)", path, content.len());
    Ok(())
}

/// Read a file, mapping "does not exist" to `None`.
pub fn read_optional(path: &Path) -> HubResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HubError::Io(e)),
    }
}

/// Parse line-oriented `KEY=value` content.
///
/// Blank lines and `#` comments are skipped; surrounding whitespace and a
/// single layer of double quotes around the value are removed.
pub fn parse_key_values(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            values.insert(key.trim().to_string(), value.to_string());
        }
    }

    values
}

/// Render `KEY=value` lines in the given order.
pub fn render_key_values<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
        out.push('\n');
    }
    out
}
