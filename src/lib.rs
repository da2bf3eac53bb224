//! Fetch containerized app releases from an image registry and persist them
//! into deduplicating local stores.
//!
//! The pipeline is driven by [Target] descriptors: an [AppFetcher] pulls each
//! referenced app's manifest and content blobs through a [RegistryClient]
//! (every byte sequence is verified against its declared digest before it is
//! handed to anyone), and the resulting on-disk tree is persisted either as a
//! commit in a [store::VersionedStore] or as a flat archive in a
//! [store::ArchiveStore].

#[macro_use]
extern crate lazy_static;

pub mod compose;
pub mod errors;
pub mod fetcher;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod store;
pub mod target;

pub use crate::{
    errors::{FetchError, StoreError},
    fetcher::{AppFetcher, AppSource, FetchResult},
    reference::ImageReference,
    registry::RegistryClient,
    target::Target,
};
