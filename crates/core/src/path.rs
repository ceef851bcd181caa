//! Path normalization

use std::io;
use std::path::{Component, Path, PathBuf};

/// Normalize a path into the form used as a key everywhere
///
/// - relative paths are resolved against the current directory
/// - `.` and `..` components are removed lexically (symlinks are not resolved)
/// - no trailing separator
pub fn normalize(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root leaves the root in place
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }

    Ok(out)
}

/// True if `path` equals `ancestor` or lies below it
pub fn is_within(path: &Path, ancestor: &Path) -> bool {
    path.starts_with(ancestor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_cleans_components() {
        assert_eq!(
            normalize("/tmp/a/./b/../c").unwrap(),
            PathBuf::from("/tmp/a/c")
        );
        assert_eq!(normalize("/tmp/a/").unwrap(), PathBuf::from("/tmp/a"));
        assert_eq!(normalize("/../..").unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn test_normalize_relative() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(normalize("some/dir").unwrap(), cwd.join("some/dir"));
    }

    #[test]
    fn test_is_within() {
        assert!(is_within(Path::new("/tmp/a"), Path::new("/tmp/a")));
        assert!(is_within(Path::new("/tmp/a/b/c"), Path::new("/tmp/a")));
        // Component-wise, not string prefix
        assert!(!is_within(Path::new("/tmp/ab"), Path::new("/tmp/a")));
        assert!(!is_within(Path::new("/tmp"), Path::new("/tmp/a")));
    }
}
