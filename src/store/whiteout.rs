//! Special-file bookkeeping for trees held in a versioned store
//!
//! The commit engine only stores regular files, directories and symlinks.
//! Device nodes, FIFOs and sockets found in a tree are recorded in a sidecar
//! file and removed before the commit, then recreated from the sidecar after
//! a checkout.

use crate::errors::StoreError;
use std::{
    ffi::CString,
    os::unix::{ffi::OsStrExt, fs::MetadataExt},
    path::{Path, PathBuf},
};

/// Name of the sidecar recorded at the root of a stripped tree
pub const SIDECAR_FILE: &str = ".whiteouts";

/// One special file removed from a tree before commit
///
/// `mode` carries the full st_mode including the file type bits, and
/// `device` is the raw device number, so `mknod` can reproduce the entry
/// exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFileDescriptor {
    pub path: PathBuf,
    pub mode: u32,
    pub device: u64,
}

impl DeviceFileDescriptor {
    fn to_line(&self) -> String {
        format!(
            "{} {:o} {}",
            self.path.display(),
            self.mode,
            self.device
        )
    }

    fn parse_line(line: &str) -> Result<Self, StoreError> {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(path), Some(mode), Some(device), None) => {
                let mode = u32::from_str_radix(mode, 8)
                    .map_err(|_| StoreError::MalformedWhiteout(line.to_owned()))?;
                let device = device
                    .parse()
                    .map_err(|_| StoreError::MalformedWhiteout(line.to_owned()))?;
                Ok(DeviceFileDescriptor {
                    path: PathBuf::from(path),
                    mode,
                    device,
                })
            }
            _ => Err(StoreError::MalformedWhiteout(line.to_owned())),
        }
    }

    fn restore_under(&self, root: &Path) -> Result<(), StoreError> {
        let dest = root.join(&self.path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest = CString::new(dest.as_os_str().as_bytes())
            .map_err(|_| StoreError::MalformedWhiteout(self.to_line()))?;
        let rc = unsafe {
            libc::mknod(
                dest.as_ptr(),
                self.mode as libc::mode_t,
                self.device as libc::dev_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// Remove every special file under `root` and record them in the sidecar
///
/// Returns the removed entries. No sidecar is written when the tree carries
/// no special files.
pub fn strip_tree(root: &Path) -> Result<Vec<DeviceFileDescriptor>, StoreError> {
    let mut removed = Vec::new();
    collect_special(root, root, &mut removed)?;
    if !removed.is_empty() {
        let mut lines = String::new();
        for entry in &removed {
            lines.push_str(&entry.to_line());
            lines.push('\n');
        }
        std::fs::write(root.join(SIDECAR_FILE), lines)?;
        log::info!(
            "recorded {} special file(s) in {:?}",
            removed.len(),
            root.join(SIDECAR_FILE)
        );
    }
    Ok(removed)
}

fn collect_special(
    root: &Path,
    dir: &Path,
    removed: &mut Vec<DeviceFileDescriptor>,
) -> Result<(), StoreError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = std::fs::symlink_metadata(&path)?;
        let file_type = metadata.file_type();
        if file_type.is_dir() {
            collect_special(root, &path, removed)?;
        } else if !file_type.is_file() && !file_type.is_symlink() {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| StoreError::MalformedWhiteout(path.display().to_string()))?;
            removed.push(DeviceFileDescriptor {
                path: relative.to_owned(),
                mode: metadata.mode(),
                device: metadata.rdev(),
            });
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Recreate the special files recorded in a checked-out tree's sidecar
///
/// A tree without a sidecar is left untouched. The sidecar itself is removed
/// once every entry has been replayed.
pub fn restore_tree(root: &Path) -> Result<Vec<DeviceFileDescriptor>, StoreError> {
    let sidecar = root.join(SIDECAR_FILE);
    if !sidecar.exists() {
        return Ok(Vec::new());
    }
    let mut restored = Vec::new();
    for line in std::fs::read_to_string(&sidecar)?.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = DeviceFileDescriptor::parse_line(line)?;
        entry.restore_under(root)?;
        restored.push(entry);
    }
    std::fs::remove_file(&sidecar)?;
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    fn make_fifo(path: &Path) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);
    }

    #[test]
    fn strip_and_restore_round_trip() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("var/run")).unwrap();
        std::fs::write(root.path().join("var/run/ordinary.txt"), "keep me").unwrap();
        make_fifo(&root.path().join("var/run/queue"));

        let removed = strip_tree(root.path()).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].path, PathBuf::from("var/run/queue"));
        assert!(!root.path().join("var/run/queue").exists());
        assert!(root.path().join(SIDECAR_FILE).exists());
        assert!(root.path().join("var/run/ordinary.txt").exists());

        let restored = restore_tree(root.path()).unwrap();
        assert_eq!(restored, removed);
        let metadata = std::fs::symlink_metadata(root.path().join("var/run/queue")).unwrap();
        assert!(metadata.file_type().is_fifo());
        assert!(!root.path().join(SIDECAR_FILE).exists());
    }

    #[test]
    fn plain_tree_gets_no_sidecar() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file.txt"), "plain").unwrap();
        assert!(strip_tree(root.path()).unwrap().is_empty());
        assert!(!root.path().join(SIDECAR_FILE).exists());
        assert!(restore_tree(root.path()).unwrap().is_empty());
    }

    #[test]
    fn malformed_sidecar_line_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(SIDECAR_FILE), "only-a-path\n").unwrap();
        match restore_tree(root.path()) {
            Err(StoreError::MalformedWhiteout(line)) => assert_eq!(line, "only-a-path"),
            other => panic!("expected MalformedWhiteout, got {:?}", other),
        }
    }
}
