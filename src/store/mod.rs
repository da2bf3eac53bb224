//! Durable stores for fetched target content

pub mod archive;
pub mod cipher;
pub mod versioned;
pub mod whiteout;

pub use archive::ArchiveStore;
pub use cipher::{CipherEngine, OpensslCipher};
pub use versioned::{OstreeEngine, VersionedRepositoryEngine, VersionedStore};
