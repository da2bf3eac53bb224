//! Symmetric encryption of archived targets
//!
//! The archive store only needs a byte-level encrypt/decrypt pair; the
//! default engine shells out to `openssl` so the resulting payload can also
//! be decrypted on devices that only carry the openssl binary.

use crate::errors::StoreError;
use std::{
    io::Write,
    process::{Command, Stdio},
};

/// Variable the passphrase is handed to the cipher process through, keeping
/// it off the command line
const PASS_ENV: &str = "ARCHIVE_KEY";

pub trait CipherEngine: Send + Sync {
    fn encrypt(&self, data: &[u8], key: &str) -> Result<Vec<u8>, StoreError>;
    fn decrypt(&self, data: &[u8], key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Cipher engine backed by the `openssl` command-line tool
///
/// Uses AES-256-CBC with PBKDF2 key derivation, matching what the
/// self-extracting archive script runs on the device side.
#[derive(Clone, Debug, Default)]
pub struct OpensslCipher;

impl OpensslCipher {
    fn run(&self, data: &[u8], key: &str, decrypt: bool) -> Result<Vec<u8>, StoreError> {
        let mut command = Command::new("openssl");
        command
            .args(["enc", "-aes-256-cbc", "-pbkdf2", "-pass"])
            .arg(format!("env:{}", PASS_ENV))
            .env(PASS_ENV, key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if decrypt {
            command.arg("-d");
        }
        let mut child = command.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StoreError::Cipher("no stdin handle on cipher process".to_owned()))?;
        // Feed stdin from a separate thread so a large payload cannot
        // deadlock against the output pipe.
        let data = data.to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&data));
        let output = child.wait_with_output()?;
        writer
            .join()
            .map_err(|_| StoreError::Cipher("cipher input writer panicked".to_owned()))??;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(StoreError::Cipher(format!(
                "openssl enc failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

impl CipherEngine for OpensslCipher {
    fn encrypt(&self, data: &[u8], key: &str) -> Result<Vec<u8>, StoreError> {
        self.run(data, key, false)
    }

    fn decrypt(&self, data: &[u8], key: &str) -> Result<Vec<u8>, StoreError> {
        self.run(data, key, true)
    }
}

/// Shell fragment the self-extracting archive script runs to undo
/// [OpensslCipher::encrypt]
pub(crate) const DECRYPT_COMMAND: &str =
    "openssl enc -d -aes-256-cbc -pbkdf2 -pass env:ARCHIVE_KEY";
