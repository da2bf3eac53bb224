//! Authenticated retrieval of manifests and blobs from a registry server

mod auth;
mod client;

pub use auth::BearerChallenge;
pub use client::{RegistryClient, RegistryClientBuilder};
