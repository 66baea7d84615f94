//! Path resolution over on-disk directories.
//!
//! Used where the disk, not the in-memory namespace, is the authority:
//! finding the journal file at mount time, and walking recovered images
//! in tests.

use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::fs::inode::{Inode, T_DIR};
use crate::param::{DIRSIZ, ROOTINO};

use super::DiskFs;

/// Split the next path element off `path`.
///
/// Examples:
///   skipelem("a/bb/c") = Some(("bb/c", "a"))
///   skipelem("///a//bb") = Some(("bb", "a"))
///   skipelem("a") = Some(("", "a"))
///   skipelem("") = skipelem("////") = None
pub fn skipelem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let end = path.find('/').unwrap_or(path.len());
    let (name, rest) = path.split_at(end);
    Some((rest.trim_start_matches('/'), name))
}

impl DiskFs {
    /// Look up the inode for an absolute path.
    pub fn namei(&self, path: &str) -> Result<Arc<Inode>> {
        let (ip, _) = self.namex(path, false)?;
        Ok(ip)
    }

    /// Look up the parent directory of `path`, returning it and the final
    /// path element.
    pub fn nameiparent<'p>(&self, path: &'p str) -> Result<(Arc<Inode>, &'p str)> {
        let (ip, name) = self.namex(path, true)?;
        Ok((ip, name.expect("nameiparent: empty path")))
    }

    fn namex<'p>(&self, mut path: &'p str, parent: bool) -> Result<(Arc<Inode>, Option<&'p str>)> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut ip = self.iget(ROOTINO);

        while let Some((rest, name)) = skipelem(path) {
            if name.len() > DIRSIZ {
                return Err(FsError::NameTooLong);
            }
            let inner = ip.inner.read();
            if inner.typ != T_DIR {
                return Err(FsError::NotDir);
            }
            if parent && rest.is_empty() {
                drop(inner);
                return Ok((ip, Some(name)));
            }
            let info = self
                .dirlookup(&ip, &inner, name)
                .ok_or(FsError::NotFound)?;
            drop(inner);
            ip = self.iget(info.inum);
            path = rest;
        }

        if parent {
            // Path named the root; it has no parent element.
            return Err(FsError::InvalidPath);
        }
        Ok((ip, None))
    }
}

#[cfg(test)]
mod tests {
    use super::skipelem;

    #[test]
    fn skipelem_examples() {
        assert_eq!(skipelem("a/bb/c"), Some(("bb/c", "a")));
        assert_eq!(skipelem("///a//bb"), Some(("bb", "a")));
        assert_eq!(skipelem("a"), Some(("", "a")));
        assert_eq!(skipelem(""), None);
        assert_eq!(skipelem("////"), None);
    }
}
