//! Maps client-supplied filenames onto the served root directory.
//!
//! Traversal is rejected for both existing and new targets: `..` components
//! are never allowed, existing targets must canonicalize to a path under the
//! root, and for targets that do not exist yet (write requests) the deepest
//! existing ancestor directory must canonicalize to a path under the root,
//! which also catches symlink escapes through intermediate directories.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, TftpError};

/// Resolve `filename` against `root`, or fail with an access-denied error.
///
/// On success the returned path is the canonical path of an existing file,
/// or the (non-canonicalized) join of the canonical root with the filename
/// when the target does not exist yet.
pub fn resolve(root: &Path, filename: &str) -> Result<PathBuf> {
    let filename = filename.replace('\\', "/");
    let relative = filename.trim_start_matches('/');
    if relative.is_empty() {
        return Err(TftpError::Tftp("empty filename".to_string()));
    }

    let rel_path = Path::new(relative);
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(TftpError::Tftp(format!("invalid filename: {}", filename))),
        }
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| TftpError::Tftp(format!("cannot resolve root {}: {}", root.display(), e)))?;
    let candidate = canonical_root.join(rel_path);

    match candidate.canonicalize() {
        Ok(resolved) => {
            if resolved.starts_with(&canonical_root) {
                Ok(resolved)
            } else {
                Err(TftpError::Tftp(format!(
                    "path escapes root: {}",
                    filename
                )))
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Write target that does not exist yet. Walk up to the deepest
            // existing ancestor and require it to stay under the root.
            let mut ancestor = candidate.parent();
            while let Some(dir) = ancestor {
                match dir.canonicalize() {
                    Ok(resolved) => {
                        if resolved.starts_with(&canonical_root) {
                            return Ok(candidate);
                        }
                        return Err(TftpError::Tftp(format!(
                            "path escapes root: {}",
                            filename
                        )));
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => ancestor = dir.parent(),
                    Err(e) => return Err(TftpError::Io(e)),
                }
            }
            Err(TftpError::Tftp(format!("path escapes root: {}", filename)))
        }
        Err(e) => Err(TftpError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("utftpd_path_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn accepts_existing_file_inside_root() {
        let root = temp_root("inside");
        std::fs::write(root.join("boot.cfg"), b"x").unwrap();
        let resolved = resolve(&root, "boot.cfg").unwrap();
        assert!(resolved.starts_with(root.canonicalize().unwrap()));
        assert!(resolved.ends_with("boot.cfg"));
    }

    #[test]
    fn strips_leading_slash() {
        let root = temp_root("slash");
        std::fs::write(root.join("image.bin"), b"x").unwrap();
        assert!(resolve(&root, "/image.bin").is_ok());
        assert!(resolve(&root, "//image.bin").is_ok());
    }

    #[test]
    fn rejects_parent_components() {
        let root = temp_root("dotdot");
        assert!(resolve(&root, "../etc/passwd").is_err());
        assert!(resolve(&root, "sub/../../etc/passwd").is_err());
        assert!(resolve(&root, "..").is_err());
    }

    #[test]
    fn rejects_parent_components_for_new_files() {
        let root = temp_root("dotdot_new");
        assert!(resolve(&root, "../fresh-upload.bin").is_err());
    }

    #[test]
    fn accepts_new_file_in_existing_subdir() {
        let root = temp_root("newfile");
        std::fs::create_dir(root.join("uploads")).unwrap();
        let resolved = resolve(&root, "uploads/new.bin").unwrap();
        assert!(resolved.ends_with("uploads/new.bin"));
    }

    #[test]
    fn accepts_new_file_with_missing_parents() {
        let root = temp_root("newdirs");
        let resolved = resolve(&root, "a/b/c/new.bin").unwrap();
        assert!(resolved.starts_with(root.canonicalize().unwrap()));
    }

    #[test]
    fn rejects_empty_filename() {
        let root = temp_root("empty");
        assert!(resolve(&root, "").is_err());
        assert!(resolve(&root, "/").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escaping_root() {
        let root = temp_root("symlink");
        let outside = temp_root("symlink_outside");
        std::fs::write(outside.join("secret.txt"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.join("secret.txt"), root.join("link.txt")).unwrap();
        assert!(resolve(&root, "link.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_new_file_under_escaping_symlink_dir() {
        let root = temp_root("symdir");
        let outside = temp_root("symdir_outside");
        std::os::unix::fs::symlink(&outside, root.join("leak")).unwrap();
        assert!(resolve(&root, "leak/new.bin").is_err());
    }

    #[test]
    fn normalizes_backslashes() {
        let root = temp_root("backslash");
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("f.txt"), b"x").unwrap();
        assert!(resolve(&root, "sub\\f.txt").is_ok());
        assert!(resolve(&root, "..\\escape").is_err());
    }
}
