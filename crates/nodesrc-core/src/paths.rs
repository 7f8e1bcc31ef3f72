use std::path::{Path, PathBuf};

/// Environment variable overriding the request cache location.
pub const CACHE_DIR_ENV: &str = "NODESRC_CACHE_DIR";

/// Root of everything placed in the build directory.
pub const DATA_ROOT: &str = "flatpak-node";

/// Returns the request cache directory, or None if no cache location can be resolved.
///
/// Checked in order: `NODESRC_CACHE_DIR`, `$XDG_CACHE_HOME/nodesrc`, the
/// platform cache directory.
pub fn try_cache_root() -> Option<PathBuf> {
    if let Ok(val) = std::env::var(CACHE_DIR_ENV) {
        return Some(PathBuf::from(val));
    }
    if let Some(val) = std::env::var("XDG_CACHE_HOME").ok().filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(val).join("nodesrc"));
    }
    dirs::cache_dir().map(|dir| dir.join("nodesrc"))
}

/// `flatpak-node`
pub fn data_root() -> &'static Path {
    Path::new(DATA_ROOT)
}

/// Scratch space inside the build directory: flatpak-node/tmp
pub fn tmp_root() -> PathBuf {
    data_root().join("tmp")
}

/// Extract the filename from a URL, ignoring any query or fragment.
pub fn filename_from_url(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.split('/').next_back().unwrap_or("")
}

/// Parent directory of a URL path, keeping scheme and host.
pub fn url_dirname(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rfind('/') {
        Some(idx) if !path[..idx].ends_with('/') => &path[..idx],
        _ => path,
    }
}
