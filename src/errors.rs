//! Error types you might see while fetching or storing a target

use std::path::PathBuf;
use thiserror::Error;

/// Errors during reference parsing, registry retrieval and app fetching
#[derive(Error, Debug)]
pub enum FetchError {
    /// invalid image reference format
    #[error("invalid image reference format: {0:?}")]
    MalformedReference(String),

    /// registry answered the token probe with something other than a
    /// well-formed bearer challenge
    #[error("unexpected authentication challenge: {0}")]
    AuthProtocol(String),

    /// calculated digest of downloaded content is not what we asked for
    #[error("digest mismatch, expected {expected}, found {found}")]
    Integrity { expected: String, found: String },

    /// missing app, manifest or layer
    #[error("not found: {0}")]
    NotFound(String),

    /// container runtime login did not confirm success
    #[error("registry login failed: {0}")]
    Login(String),

    /// a fetched app bundle carried no compose definition
    #[error("app bundle has no compose definition: {0:?}")]
    MissingComposeFile(PathBuf),

    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// network request error
    #[error("network request error: {0}")]
    Network(#[from] reqwest::Error),

    /// json error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// compose definition error
    #[error("compose definition error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors from the durable content stores
#[derive(Error, Debug)]
pub enum StoreError {
    /// no initialized repository at the configured location
    #[error("store repository is not initialized: {0:?}")]
    NotInitialized(PathBuf),

    /// the target carries no content hash to key the archive by
    #[error("target carries no content hash: {0}")]
    MissingContentHash(String),

    /// the target carries no recorded store reference
    #[error("target carries no recorded store reference: {0}")]
    MissingStoreReference(String),

    /// underlying content-addressable engine failure
    #[error("repository engine failure: {0}")]
    Engine(String),

    /// cipher engine failure while producing or reading an encrypted archive
    #[error("cipher engine failure: {0}")]
    Cipher(String),

    /// a store transfer exceeded its wall-clock budget
    #[error("store transfer timed out")]
    Timeout,

    /// a whiteout sidecar line could not be parsed
    #[error("malformed whiteout record: {0:?}")]
    MalformedWhiteout(String),

    /// the archive is missing or has an unexpected shape
    #[error("archive error: {0}")]
    Archive(String),

    /// io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// error propagated from the fetch pipeline
    #[error(transparent)]
    Fetch(#[from] FetchError),
}
