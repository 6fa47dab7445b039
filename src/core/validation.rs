//! Path validation and normalization
//!
//! Every path that reaches the manifest is absolute, `/`-separated and free of
//! empty, `.` and `..` components. Case is preserved.

use crate::error::{PakError, Result};

/// Longest accepted path component, in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Longest accepted path, in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Normalize a path to its canonical absolute form
///
/// A missing leading `/` is added and a single trailing `/` is dropped.
///
/// # Examples
///
/// ```
/// use pakfs::core::validation::normalize_path;
///
/// assert_eq!(normalize_path("/items/sword.png").unwrap(), "/items/sword.png");
/// assert_eq!(normalize_path("items/").unwrap(), "/items");
/// assert_eq!(normalize_path("/").unwrap(), "/");
///
/// assert!(normalize_path("/items/../etc").is_err());
/// assert!(normalize_path("/items//sword.png").is_err());
/// ```
pub fn normalize_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(PakError::InvalidPath("empty path".to_string()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(PakError::InvalidPath(format!(
            "path longer than {} bytes",
            MAX_PATH_LEN
        )));
    }

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = match trimmed.strip_suffix('/') {
        Some(rest) if !rest.is_empty() => rest,
        _ => trimmed,
    };
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }

    let mut normalized = String::with_capacity(trimmed.len() + 1);
    for component in trimmed.split('/') {
        validate_name(component).map_err(|_| {
            PakError::InvalidPath(format!("'{}' has an invalid component '{}'", path, component))
        })?;
        normalized.push('/');
        normalized.push_str(component);
    }
    Ok(normalized)
}

/// Check a single path component
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(PakError::InvalidPath(format!("invalid name '{}'", name)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PakError::InvalidPath(format!(
            "name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(PakError::InvalidPath(format!(
            "name '{}' contains a reserved character",
            name.escape_default()
        )));
    }
    Ok(())
}

/// Parent of a normalized path (`/` for top-level entries and the root)
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Last component of a normalized path (empty for the root)
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a normalized directory path and a validated name
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Prefix shared by every path strictly inside `dir`
pub fn dir_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Whether `path` lies strictly inside `dir`
pub fn is_inside(path: &str, dir: &str) -> bool {
    path != dir && path.starts_with(&dir_prefix(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() -> Result<()> {
        assert_eq!(normalize_path("/a/b")?, "/a/b");
        assert_eq!(normalize_path("a/b")?, "/a/b");
        assert_eq!(normalize_path("/a/b/")?, "/a/b");
        assert_eq!(normalize_path("/")?, "/");
        assert_eq!(normalize_path("/Items/Sword.PNG")?, "/Items/Sword.PNG");
        Ok(())
    }

    #[test]
    fn test_rejects_bad_components() {
        for bad in ["", "//", "/a//b", "/a/./b", "/a/../b", "/..", "/a\0b"] {
            assert!(
                matches!(normalize_path(bad), Err(PakError::InvalidPath(_))),
                "{:?} should be rejected",
                bad
            );
        }
        let long = format!("/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert!(normalize_path(&long).is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent("/items/sword.png"), "/items");
        assert_eq!(parent("/items"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/items/sword.png"), "sword.png");
        assert_eq!(file_name("/"), "");
        assert_eq!(join("/", "items"), "/items");
        assert_eq!(join("/items", "a"), "/items/a");
        assert!(is_inside("/items/a", "/items"));
        assert!(!is_inside("/items2/a", "/items"));
        assert!(!is_inside("/items", "/items"));
        assert!(is_inside("/items", "/"));
    }
}
