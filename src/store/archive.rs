//! Offline archive store
//!
//! Packs a fetched target's images (and optionally its app bundles) into a
//! single tar keyed by the target's content hash, for air-gapped delivery.
//! Alongside every archive a size marker records the unpacked byte count, so
//! a device can check free space before committing to an update.

use crate::{
    errors::StoreError,
    fetcher::dir_size,
    store::cipher::{self, CipherEngine},
    target::Target,
};
use std::path::{Path, PathBuf};

/// Line separating the self-extracting script from its encrypted payload
const PAYLOAD_MARKER: &str = "__ARCHIVE_PAYLOAD__";

/// Resolved on-disk locations of one target's archive
#[derive(Clone, Debug)]
pub struct ArchiveLocation {
    /// Plain tar archive
    pub tar: PathBuf,
    /// Self-extracting encrypted variant
    pub encrypted: PathBuf,
    /// Unpacked-size marker, decimal bytes
    pub size_marker: PathBuf,
}

pub struct ArchiveStore {
    root: PathBuf,
    cipher: Option<Box<dyn CipherEngine>>,
}

impl ArchiveStore {
    pub fn new(root: &Path) -> Self {
        ArchiveStore {
            root: root.to_owned(),
            cipher: None,
        }
    }

    /// Use `cipher` for targets carrying an encryption key
    pub fn with_cipher(mut self, cipher: Box<dyn CipherEngine>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Where a target's archive lives
    ///
    /// The name is derived from the content hash, the platform and the
    /// sorted shortlist, so the same target archived with different
    /// shortlists yields distinct archives. An images-only archive gets its
    /// own suffix for the same reason.
    pub fn location(
        &self,
        target: &Target,
        images_only: bool,
    ) -> Result<ArchiveLocation, StoreError> {
        let sha = target
            .content_hash()
            .ok_or_else(|| StoreError::MissingContentHash(target.name.clone()))?;
        let mut base = format!("{}-{}", sha, target.platform());
        if let Some(shortlist) = target.shortlist() {
            let mut sorted: Vec<&str> = shortlist.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            base.push('-');
            base.push_str(&sorted.join("-"));
        }
        let suffix = if images_only { ".images.tar" } else { ".tar" };
        let tar = self.root.join(sha).join(format!("{}{}", base, suffix));
        let mut encrypted = tar.as_os_str().to_owned();
        encrypted.push(".sh");
        let mut size_marker = tar.as_os_str().to_owned();
        size_marker.push(".size");
        Ok(ArchiveLocation {
            tar,
            encrypted: encrypted.into(),
            size_marker: size_marker.into(),
        })
    }

    /// Pack a fetched target into its archive, returning the archive path
    ///
    /// `images_dir` lands at the archive root and `apps_dir`, when given,
    /// under an `apps/` prefix. A target carrying an encryption key is
    /// written as a self-extracting script instead of a plain tar.
    pub fn store(
        &self,
        target: &Target,
        images_dir: &Path,
        apps_dir: Option<&Path>,
    ) -> Result<PathBuf, StoreError> {
        let location = self.location(target, apps_dir.is_none())?;
        if let Some(parent) = location.tar.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", images_dir)?;
        let mut unpacked = dir_size(images_dir)?;
        if let Some(apps_dir) = apps_dir {
            builder.append_dir_all("apps", apps_dir)?;
            unpacked += dir_size(apps_dir)?;
        }
        let tar_bytes = builder.into_inner()?;
        std::fs::write(&location.size_marker, unpacked.to_string())?;

        match &target.custom.encryption_key {
            Some(key) => {
                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    StoreError::Cipher(format!(
                        "{} carries an encryption key but no cipher engine is configured",
                        target.name
                    ))
                })?;
                let payload = cipher.encrypt(&tar_bytes, key)?;
                let mut script = format!(
                    "#!/bin/sh\n\
                     # Self-extracting encrypted target archive.\n\
                     # Usage: ARCHIVE_KEY=... sh <archive> [dest-dir]\n\
                     set -e\n\
                     dest=\"${{1:-.}}\"\n\
                     payload=$(grep -a -n '^{marker}$' \"$0\" | head -1 | cut -d: -f1)\n\
                     tail -n +$((payload + 1)) \"$0\" | {decrypt} | tar -x -C \"$dest\"\n\
                     exit 0\n\
                     {marker}\n",
                    marker = PAYLOAD_MARKER,
                    decrypt = cipher::DECRYPT_COMMAND,
                )
                .into_bytes();
                script.extend_from_slice(&payload);
                std::fs::write(&location.encrypted, script)?;
                log::info!("{}: archived (encrypted) to {:?}", target.name, location.encrypted);
                Ok(location.encrypted)
            }
            None => {
                std::fs::write(&location.tar, tar_bytes)?;
                log::info!("{}: archived to {:?}", target.name, location.tar);
                Ok(location.tar)
            }
        }
    }

    /// Whether an archive (plain or encrypted) is already on disk
    pub fn exists(&self, target: &Target, images_only: bool) -> Result<bool, StoreError> {
        let location = self.location(target, images_only)?;
        Ok(location.tar.is_file() || location.encrypted.is_file())
    }

    /// The unpacked size recorded alongside the archive, if any
    pub fn recorded_size(
        &self,
        target: &Target,
        images_only: bool,
    ) -> Result<Option<u64>, StoreError> {
        let location = self.location(target, images_only)?;
        if !location.size_marker.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&location.size_marker)?;
        let size = text
            .trim()
            .parse()
            .map_err(|_| StoreError::Archive(format!("bad size marker: {:?}", text)))?;
        Ok(Some(size))
    }

    /// Unpack a target's archive, splitting images and app bundles back out
    ///
    /// Existing destination directories are replaced wholesale so a previous
    /// partial unpack cannot leak stale files into the result.
    pub fn copy_into(
        &self,
        target: &Target,
        images_dest: &Path,
        apps_dest: Option<&Path>,
    ) -> Result<(), StoreError> {
        let location = self.location(target, apps_dest.is_none())?;
        let tar_bytes = if location.tar.is_file() {
            std::fs::read(&location.tar)?
        } else if location.encrypted.is_file() {
            self.decrypt_archive(target, &location.encrypted)?
        } else {
            return Err(StoreError::Archive(format!(
                "no archive for {} at {:?}",
                target.name, location.tar
            )));
        };

        replace_dir(images_dest)?;
        if let Some(apps_dest) = apps_dest {
            replace_dir(apps_dest)?;
        }

        let mut archive = tar::Archive::new(&tar_bytes[..]);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let path = path.strip_prefix(".").unwrap_or(&path);
            if path.as_os_str().is_empty() {
                continue;
            }
            let dest = match path.strip_prefix("apps") {
                Ok(rest) if !rest.as_os_str().is_empty() => match apps_dest {
                    Some(apps_dest) => apps_dest.join(rest),
                    None => continue,
                },
                Ok(_) => continue,
                Err(_) => images_dest.join(path),
            };
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest)?;
        }
        Ok(())
    }

    fn decrypt_archive(&self, target: &Target, path: &Path) -> Result<Vec<u8>, StoreError> {
        let key = target.custom.encryption_key.as_ref().ok_or_else(|| {
            StoreError::Cipher(format!(
                "{} has an encrypted archive but carries no key",
                target.name
            ))
        })?;
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| StoreError::Cipher("no cipher engine configured".to_owned()))?;
        let bytes = std::fs::read(path)?;
        let marker = format!("\n{}\n", PAYLOAD_MARKER);
        let start = find_subsequence(&bytes, marker.as_bytes()).ok_or_else(|| {
            StoreError::Archive(format!("no payload marker in {:?}", path))
        })?;
        cipher.decrypt(&bytes[start + marker.len()..], key)
    }
}

fn replace_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
