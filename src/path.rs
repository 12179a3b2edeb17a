//! Path resolution.
//!
//! A path is a sequence of `/`-separated components; consecutive slashes
//! collapse. Resolution starts at the root for absolute paths and at the
//! caller's working directory otherwise, walks every component but the
//! last (`.` stays put, `..` climbs to the parent, which at the root is
//! the root itself), and hands back the still-open containing directory
//! together with the leaf name. The façade decides what the leaf means.
use crate::{directory::Directory, disk::Disk, fs::FsInner, Error};
use alloc::{
    string::String,
    sync::Arc,
    vec::Vec,
};

/// Splits `path` into its containing directory and leaf name.
///
/// A path consisting only of slashes (or the empty relative path) yields
/// the starting directory and an empty leaf.
///
/// Fails when an interior component is missing or is not a directory.
pub(crate) fn split<D: Disk>(
    fs: &Arc<FsInner<D>>,
    cwd: &Directory<D>,
    path: &str,
) -> Result<(Directory<D>, String), Error> {
    let mut dir = if path.starts_with('/') {
        fs.root_dir()?
    } else {
        cwd.reopen()?
    };

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((&leaf, walk)) = parts.split_last() else {
        return Ok((dir, String::new()));
    };

    for &part in walk {
        dir = match part {
            "." => dir,
            ".." => dir.parent()?,
            name => {
                let inode = dir.lookup(name)?;
                Directory::from_inode(fs, inode)?
            }
        };
    }
    Ok((dir, String::from(leaf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk::MemDisk, fs::FileSys};

    fn scratch() -> FileSys<MemDisk> {
        let fs = FileSys::format(MemDisk::new(2048)).expect("format must succeed");
        let root = fs.root().unwrap();
        fs.create(&root, "/d", 0, true).unwrap();
        fs.create(&root, "/d/e", 0, true).unwrap();
        fs.create(&root, "/d/f", 0, false).unwrap();
        fs
    }

    #[test]
    fn absolute_and_relative_agree() {
        let fs = scratch();
        let root = fs.root().unwrap();

        let (dir, leaf) = split(&fs.0, &root, "/d/e").unwrap();
        assert_eq!(leaf, "e");
        let d_sector = dir.sector();

        let (dir, leaf) = split(&fs.0, &root, "d/e").unwrap();
        assert_eq!(leaf, "e");
        assert_eq!(dir.sector(), d_sector);
    }

    #[test]
    fn empty_components_collapse() {
        let fs = scratch();
        let root = fs.root().unwrap();

        let (dir, leaf) = split(&fs.0, &root, "//d///e//").unwrap();
        assert_eq!(leaf, "e");
        assert!(!dir.is_root());
    }

    #[test]
    fn bare_slash_yields_root_and_empty_leaf() {
        let fs = scratch();
        let root = fs.root().unwrap();

        let (dir, leaf) = split(&fs.0, &root, "/").unwrap();
        assert!(leaf.is_empty());
        assert!(dir.is_root());
    }

    #[test]
    fn dot_and_dotdot_walk() {
        let fs = scratch();
        let root = fs.root().unwrap();

        let (dir, leaf) = split(&fs.0, &root, "/d/./e").unwrap();
        assert_eq!(leaf, "e");
        assert!(!dir.is_root());

        let (dir, leaf) = split(&fs.0, &root, "/d/../d/e").unwrap();
        assert_eq!(leaf, "e");
        assert!(!dir.is_root());

        // `..` at the root stays at the root.
        let (dir, leaf) = split(&fs.0, &root, "/../../d").unwrap();
        assert_eq!(leaf, "d");
        assert!(dir.is_root());
    }

    #[test]
    fn interior_file_is_not_a_directory() {
        let fs = scratch();
        let root = fs.root().unwrap();

        assert!(matches!(
            split(&fs.0, &root, "/d/f/x"),
            Err(Error::NotDirectory)
        ));
        assert!(matches!(
            split(&fs.0, &root, "/missing/x"),
            Err(Error::NoSuchEntry)
        ));
    }
}
