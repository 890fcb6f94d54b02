//! Purpose: Resolve which asset library a plugin bundle or CLI run loads.
//! Exports: `resolve_library_path`, `library_path`, `LIBRARY_ENV`, `DEFAULT_LIBRARY_FILE`.
//! Role: Keep CLI and C ABI path semantics aligned from one source.
//! Invariants: Precedence is explicit path, then `MESHBRIDGE_LIBRARY`, then
//!             `<bundle_dir>/library.hda`.
//! Invariants: An empty environment value counts as unset.
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

pub const LIBRARY_ENV: &str = "MESHBRIDGE_LIBRARY";
pub const DEFAULT_LIBRARY_FILE: &str = "library.hda";

pub fn resolve_library_path(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    bundle_dir: Option<&Path>,
) -> Result<PathBuf, Error> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    match bundle_dir {
        Some(dir) => Ok(dir.join(DEFAULT_LIBRARY_FILE)),
        None => Err(Error::new(ErrorKind::Usage)
            .with_message("no asset library configured")
            .with_hint(format!("pass --library or set {LIBRARY_ENV}"))),
    }
}

/// Resolves against the process environment; the bundle is the executable's directory.
pub fn library_path(explicit: Option<&Path>) -> Result<PathBuf, Error> {
    let bundle_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    resolve_library_path(explicit, std::env::var_os(LIBRARY_ENV), bundle_dir.as_deref())
}
