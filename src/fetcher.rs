//! Per-target fetch pipeline
//!
//! Drives the downloads for one release descriptor: every referenced app
//! bundle, and optionally every container image those bundles name. All
//! writes land under a per-target directory so concurrent fetches of
//! different targets never contend.

use crate::{
    compose::{ComposeApp, COMPOSE_FILE},
    errors::FetchError,
    manifest::{media_types, Manifest, LAYERS_META_ANNOTATION},
    reference::{split_digest, ImageReference},
    target::Target,
};
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};

/// Where fetched content comes from
///
/// [crate::RegistryClient] is the production implementation; tests substitute
/// their own to observe exactly which network operations a fetch performs.
pub trait AppSource {
    /// Retrieve and verify a manifest document
    fn pull_manifest(
        &self,
        reference: &ImageReference,
        accept: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, FetchError>> + Send;

    /// Retrieve and verify a content blob
    fn pull_layer(
        &self,
        reference: &ImageReference,
        layer_digest: &str,
        token: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, FetchError>> + Send;

    /// Obtain a reusable access token for a repository, if it needs one
    fn authorize(
        &self,
        reference: &ImageReference,
    ) -> impl std::future::Future<Output = Result<Option<String>, FetchError>> + Send;
}

/// One successfully fetched app bundle
#[derive(Clone, Debug)]
pub struct FetchedApp {
    pub name: String,
    pub reference: ImageReference,
    pub compose: ComposeApp,
}

/// Outcome of fetching one target's apps
#[derive(Debug)]
pub struct FetchResult {
    pub target: Target,
    pub apps: Vec<FetchedApp>,
    dir: PathBuf,
}

impl FetchResult {
    /// Directory holding everything fetched for this target
    pub fn target_dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the fetched app bundles
    pub fn apps_dir(&self) -> PathBuf {
        self.dir.join("apps")
    }

    /// Directory holding the per-image layouts, once images are fetched
    pub fn images_dir(&self) -> PathBuf {
        self.dir.join("images")
    }
}

/// Fetches app bundles and container images for targets
pub struct AppFetcher<S> {
    source: S,
    work_dir: PathBuf,
}

impl<S: AppSource> AppFetcher<S> {
    pub fn new(source: S, work_dir: &Path) -> Self {
        AppFetcher {
            source,
            work_dir: work_dir.to_owned(),
        }
    }

    /// Fetch the app bundles a target references
    ///
    /// `shortlist` restricts the fetch to the named apps; when it is `None`
    /// the target's own shortlist applies, and a target without one fetches
    /// everything. An app whose content is already on disk is skipped without
    /// any network traffic unless `force` is set, so re-running a fetch after
    /// a partial failure only downloads what is missing.
    pub async fn fetch_target(
        &self,
        target: &Target,
        shortlist: Option<&[String]>,
        force: bool,
    ) -> Result<FetchResult, FetchError> {
        let target_dir = self.work_dir.join(&target.name);
        let shortlist = shortlist.or_else(|| target.shortlist());
        let mut apps = Vec::new();
        for (name, uri) in target.apps() {
            if let Some(list) = shortlist {
                if !list.iter().any(|wanted| wanted == name) {
                    log::debug!("{}: app {} is not shortlisted, skipping", target.name, name);
                    continue;
                }
            }
            let reference = ImageReference::parse(uri)?;
            let compose = self
                .fetch_app(&target_dir, name, &reference, target.platform(), force)
                .await?;
            apps.push(FetchedApp {
                name: name.to_owned(),
                reference,
                compose,
            });
        }
        Ok(FetchResult {
            target: target.clone(),
            apps,
            dir: target_dir,
        })
    }

    async fn fetch_app(
        &self,
        target_dir: &Path,
        name: &str,
        reference: &ImageReference,
        platform: &str,
        force: bool,
    ) -> Result<ComposeApp, FetchError> {
        let dest = target_dir
            .join("apps")
            .join(name)
            .join(reference.digest_hex());
        if dest.join(COMPOSE_FILE).exists() {
            if force {
                std::fs::remove_dir_all(&dest)?;
            } else {
                log::info!("{} is already fetched, skipping", reference);
                return ComposeApp::load(name, &dest);
            }
        }
        std::fs::create_dir_all(&dest)?;

        let manifest_bytes = self
            .source
            .pull_manifest(reference, media_types::ACCEPT_MANIFEST_OR_LIST)
            .await?;
        let mut manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;
        self.mirror_blob(target_dir, reference.digest_hex(), &manifest_bytes)?;

        // Bundles published for several platforms arrive as an index; narrow
        // to the target's entry before touching any layer.
        let manifest_bytes = if manifest.is_index() {
            let entry = manifest.platform_entry(platform).ok_or_else(|| {
                FetchError::NotFound(format!(
                    "{}: no bundle for platform {}",
                    reference, platform
                ))
            })?;
            let narrowed = reference.with_digest(&entry.digest)?;
            let bytes = self
                .source
                .pull_manifest(&narrowed, media_types::ACCEPT_MANIFEST_OR_LIST)
                .await?;
            manifest = serde_json::from_slice(&bytes)?;
            self.mirror_blob(target_dir, narrowed.digest_hex(), &bytes)?;
            bytes
        } else {
            manifest_bytes
        };
        std::fs::write(dest.join("manifest.json"), &manifest_bytes)?;

        let bundle = manifest.layers.first().ok_or_else(|| {
            FetchError::NotFound(format!("{}: manifest carries no layers", reference))
        })?;
        let token = self.source.authorize(reference).await?;
        let bundle_bytes = self
            .source
            .pull_layer(reference, &bundle.digest, token.as_deref())
            .await?;
        let (_, bundle_hex) = split_digest(&bundle.digest)?;
        std::fs::write(dest.join(format!("{}.tgz", bundle_hex)), &bundle_bytes)?;
        tar::Archive::new(GzDecoder::new(&bundle_bytes[..])).unpack(&dest)?;

        // An optional second layer carries per-layer size metadata for
        // downstream update estimates.
        for layer in &manifest.layers[1..] {
            if layer.annotations.contains_key(LAYERS_META_ANNOTATION) {
                let meta = self
                    .source
                    .pull_layer(reference, &layer.digest, token.as_deref())
                    .await?;
                std::fs::write(dest.join("layers_meta.json"), &meta)?;
            }
        }

        ComposeApp::load(name, &dest)
    }

    /// Fetch the container images named by already-fetched app bundles
    ///
    /// Each image lands in its own directory laid out as an OCI image
    /// layout, keyed by host, repository and digest, so the same image
    /// shared between apps is only stored once per target.
    pub async fn fetch_apps_images(
        &self,
        result: &FetchResult,
        force: bool,
    ) -> Result<(), FetchError> {
        let images_dir = result.images_dir();
        for app in &result.apps {
            for image in app.compose.images() {
                let reference = ImageReference::parse(&image)?;
                let dest = images_dir
                    .join(reference.host())
                    .join(reference.repository())
                    .join(reference.digest_hex());
                if dest.join("index.json").exists() && !force {
                    log::info!("image {} is already fetched, skipping", reference);
                    continue;
                }
                self.fetch_image(&reference, result.target.platform(), result.target_dir(), &dest)
                    .await?;
            }
        }
        Ok(())
    }

    async fn fetch_image(
        &self,
        reference: &ImageReference,
        platform: &str,
        target_dir: &Path,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let blobs = dest.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs)?;

        let top_bytes = self
            .source
            .pull_manifest(reference, media_types::ACCEPT_MANIFEST_OR_LIST)
            .await?;
        let top: Manifest = serde_json::from_slice(&top_bytes)?;
        std::fs::write(blobs.join(reference.digest_hex()), &top_bytes)?;
        self.mirror_blob(target_dir, reference.digest_hex(), &top_bytes)?;

        // A multi-arch index is narrowed to the one entry matching the
        // target's platform before any blob is pulled.
        let (manifest, manifest_bytes, manifest_hex) = if top.is_index() {
            let entry = top.platform_entry(platform).ok_or_else(|| {
                FetchError::NotFound(format!("{}: no manifest for platform {}", reference, platform))
            })?;
            let narrowed = reference.with_digest(&entry.digest)?;
            let bytes = self
                .source
                .pull_manifest(&narrowed, media_types::ACCEPT_MANIFEST_OR_LIST)
                .await?;
            let manifest: Manifest = serde_json::from_slice(&bytes)?;
            let (_, hex) = split_digest(&entry.digest)?;
            let hex = hex.to_owned();
            std::fs::write(blobs.join(&hex), &bytes)?;
            self.mirror_blob(target_dir, &hex, &bytes)?;
            (manifest, bytes, hex)
        } else {
            (top, top_bytes, reference.digest_hex().to_owned())
        };

        let token = self.source.authorize(reference).await?;
        if let Some(config) = &manifest.config {
            let bytes = self
                .source
                .pull_layer(reference, &config.digest, token.as_deref())
                .await?;
            let (_, hex) = split_digest(&config.digest)?;
            std::fs::write(blobs.join(hex), &bytes)?;
        }
        for layer in &manifest.layers {
            let bytes = self
                .source
                .pull_layer(reference, &layer.digest, token.as_deref())
                .await?;
            let (_, hex) = split_digest(&layer.digest)?;
            std::fs::write(blobs.join(hex), &bytes)?;
        }

        std::fs::write(dest.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": media_types::MANIFEST,
                "digest": format!("sha256:{}", manifest_hex),
                "size": manifest_bytes.len(),
            }]
        });
        std::fs::write(dest.join("index.json"), serde_json::to_vec(&index)?)?;
        log::info!("image {} fetched into {:?}", reference, dest);
        Ok(())
    }

    fn mirror_blob(&self, target_dir: &Path, hex: &str, data: &[u8]) -> Result<(), FetchError> {
        let blobs = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs)?;
        std::fs::write(blobs.join(hex), data)?;
        Ok(())
    }

    /// Total on-disk size of everything fetched for a target so far
    pub fn get_target_size(&self, target: &Target) -> Result<u64, FetchError> {
        Ok(dir_size(&self.work_dir.join(&target.name))?)
    }
}

/// Recursive size of a directory tree, zero if it does not exist
pub(crate) fn dir_size(dir: &Path) -> std::io::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use std::{
        collections::HashMap,
        io::Write,
        sync::Mutex,
    };

    struct MockSource {
        calls: Mutex<usize>,
        manifests: HashMap<String, Vec<u8>>,
        layers: HashMap<String, Vec<u8>>,
    }

    impl MockSource {
        fn new() -> Self {
            MockSource {
                calls: Mutex::new(0),
                manifests: HashMap::new(),
                layers: HashMap::new(),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl AppSource for &MockSource {
        async fn pull_manifest(
            &self,
            reference: &ImageReference,
            _accept: &str,
        ) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.manifests
                .get(reference.digest())
                .cloned()
                .ok_or_else(|| FetchError::NotFound(reference.to_string()))
        }

        async fn pull_layer(
            &self,
            _reference: &ImageReference,
            layer_digest: &str,
            _token: Option<&str>,
        ) -> Result<Vec<u8>, FetchError> {
            *self.calls.lock().unwrap() += 1;
            self.layers
                .get(layer_digest)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(layer_digest.to_owned()))
        }

        async fn authorize(
            &self,
            _reference: &ImageReference,
        ) -> Result<Option<String>, FetchError> {
            Ok(Some("mock-token".to_owned()))
        }
    }

    fn digest_of(data: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(data))
    }

    fn compose_bundle(image: &str) -> Vec<u8> {
        let compose = format!("services:\n  app:\n    image: {}\n", image);
        let mut tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(compose.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, COMPOSE_FILE, compose.as_bytes())
            .unwrap();
        tar.into_inner().unwrap().finish().unwrap()
    }

    /// Register an app bundle (manifest + compose layer), returning its uri
    fn add_app(source: &mut MockSource, name: &str, image: &str) -> String {
        let bundle = compose_bundle(image);
        let bundle_digest = digest_of(&bundle);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "layers": [{"digest": bundle_digest, "size": bundle.len(),
                        "mediaType": "application/octet-stream"}]
        }))
        .unwrap();
        let manifest_digest = digest_of(&manifest);
        source.layers.insert(bundle_digest, bundle);
        source.manifests.insert(manifest_digest.clone(), manifest);
        format!("hub.example.io/acme/{}@{}", name, manifest_digest)
    }

    fn target_with_apps(apps: &[(&str, &str)]) -> Target {
        let mut descs = serde_json::Map::new();
        for (name, uri) in apps {
            descs.insert(name.to_string(), json!({"uri": uri}));
        }
        Target::from_json(
            "test-target",
            json!({"custom": {"arch": "aarch64", "tags": ["main"],
                               "docker_compose_apps": descs}}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetch_creates_layout_and_is_idempotent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut source = MockSource::new();
        let uri = add_app(&mut source, "web", "ghcr.io/acme/nginx@sha256:aa");
        let target = target_with_apps(&[("web", &uri)]);
        let work = tempfile::tempdir().unwrap();
        let fetcher = AppFetcher::new(&source, work.path());

        let result = fetcher.fetch_target(&target, None, false).await.unwrap();
        assert_eq!(result.apps.len(), 1);
        let reference = ImageReference::parse(&uri).unwrap();
        let app_dir = result
            .apps_dir()
            .join("web")
            .join(reference.digest_hex());
        assert!(app_dir.join(COMPOSE_FILE).exists());
        assert!(app_dir.join("manifest.json").exists());
        assert!(work
            .path()
            .join("test-target/blobs/sha256")
            .join(reference.digest_hex())
            .exists());
        assert!(fetcher.get_target_size(&target).unwrap() > 0);

        // everything is on disk now, a second run must not touch the network
        let before = source.calls();
        let again = fetcher.fetch_target(&target, None, false).await.unwrap();
        assert_eq!(source.calls(), before);
        assert_eq!(again.apps.len(), 1);
    }

    #[tokio::test]
    async fn shortlist_restricts_the_fetch() {
        let mut source = MockSource::new();
        let web = add_app(&mut source, "web", "ghcr.io/acme/nginx@sha256:aa");
        let db = add_app(&mut source, "db", "ghcr.io/acme/postgres@sha256:bb");
        let target = target_with_apps(&[("web", &web), ("db", &db)]);
        let work = tempfile::tempdir().unwrap();
        let fetcher = AppFetcher::new(&source, work.path());

        let shortlist = vec!["db".to_string()];
        let result = fetcher
            .fetch_target(&target, Some(&shortlist), false)
            .await
            .unwrap();
        assert_eq!(result.apps.len(), 1);
        assert_eq!(result.apps[0].name, "db");
        assert!(!result.apps_dir().join("web").exists());
    }

    #[tokio::test]
    async fn multi_platform_bundle_is_narrowed() {
        let mut source = MockSource::new();
        let bundle = compose_bundle("ghcr.io/acme/nginx@sha256:aa");
        let bundle_digest = digest_of(&bundle);
        let arm_manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "layers": [{"digest": bundle_digest, "size": bundle.len(),
                        "mediaType": "application/octet-stream"}]
        }))
        .unwrap();
        let arm_digest = digest_of(&arm_manifest);
        let index = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "manifests": [
                {"digest": format!("sha256:{}", "b".repeat(64)), "size": 1,
                 "platform": {"architecture": "amd64"}},
                {"digest": arm_digest, "size": arm_manifest.len(),
                 "platform": {"architecture": "arm64"}}
            ]
        }))
        .unwrap();
        let index_digest = digest_of(&index);
        source.layers.insert(bundle_digest, bundle);
        source.manifests.insert(arm_digest.clone(), arm_manifest.clone());
        source.manifests.insert(index_digest.clone(), index);
        let uri = format!("hub.example.io/acme/web@{}", index_digest);
        let target = target_with_apps(&[("web", &uri)]);
        let work = tempfile::tempdir().unwrap();
        let fetcher = AppFetcher::new(&source, work.path());

        let result = fetcher.fetch_target(&target, None, false).await.unwrap();
        let reference = ImageReference::parse(&uri).unwrap();
        let app_dir = result.apps_dir().join("web").join(reference.digest_hex());
        // the persisted manifest is the platform one, not the index
        assert_eq!(
            std::fs::read(app_dir.join("manifest.json")).unwrap(),
            arm_manifest
        );
        let blobs = work.path().join("test-target/blobs/sha256");
        assert!(blobs.join(reference.digest_hex()).exists());
        assert!(blobs
            .join(arm_digest.trim_start_matches("sha256:"))
            .exists());
    }

    #[tokio::test]
    async fn bundle_without_compose_definition_fails() {
        let mut source = MockSource::new();
        let empty = {
            let tar = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
            let mut encoder = tar.into_inner().unwrap();
            encoder.write_all(&[]).unwrap();
            encoder.finish().unwrap()
        };
        let layer_digest = digest_of(&empty);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "layers": [{"digest": layer_digest, "size": empty.len(),
                        "mediaType": "application/octet-stream"}]
        }))
        .unwrap();
        let manifest_digest = digest_of(&manifest);
        source.layers.insert(layer_digest, empty);
        source.manifests.insert(manifest_digest.clone(), manifest);
        let uri = format!("hub.example.io/acme/broken@{}", manifest_digest);
        let target = target_with_apps(&[("broken", &uri)]);
        let work = tempfile::tempdir().unwrap();
        let fetcher = AppFetcher::new(&source, work.path());

        match fetcher.fetch_target(&target, None, false).await {
            Err(FetchError::MissingComposeFile(_)) => (),
            other => panic!("expected MissingComposeFile, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn images_land_in_oci_layout() {
        let mut source = MockSource::new();

        // one single-platform image, referenced by the app's compose file
        let config = br#"{"architecture":"arm64"}"#.to_vec();
        let layer = b"layer-bytes".to_vec();
        let image_manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "config": {"digest": digest_of(&config), "size": config.len(),
                       "mediaType": "application/vnd.oci.image.config.v1+json"},
            "layers": [{"digest": digest_of(&layer), "size": layer.len(),
                        "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"}]
        }))
        .unwrap();
        let image_digest = digest_of(&image_manifest);
        source.layers.insert(digest_of(&config), config);
        source.layers.insert(digest_of(&layer), layer);
        source
            .manifests
            .insert(image_digest.clone(), image_manifest);
        let image = format!("ghcr.io/acme/nginx@{}", image_digest);

        let uri = add_app(&mut source, "web", &image);
        let target = target_with_apps(&[("web", &uri)]);
        let work = tempfile::tempdir().unwrap();
        let fetcher = AppFetcher::new(&source, work.path());

        let result = fetcher.fetch_target(&target, None, false).await.unwrap();
        fetcher.fetch_apps_images(&result, false).await.unwrap();

        let image_ref = ImageReference::parse(&image).unwrap();
        let dest = result
            .images_dir()
            .join("ghcr.io/acme/nginx")
            .join(image_ref.digest_hex());
        assert!(dest.join("oci-layout").exists());
        assert!(dest.join("index.json").exists());
        assert!(dest
            .join("blobs/sha256")
            .join(image_ref.digest_hex())
            .exists());

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dest.join("index.json")).unwrap()).unwrap();
        assert_eq!(
            index["manifests"][0]["digest"],
            format!("sha256:{}", image_ref.digest_hex())
        );

        // the image manifest is also mirrored into the target's shared
        // digest-indexed cache
        assert!(work
            .path()
            .join("test-target/blobs/sha256")
            .join(image_ref.digest_hex())
            .exists());

        // already on disk, so refetching the images is free
        let before = source.calls();
        fetcher.fetch_apps_images(&result, false).await.unwrap();
        assert_eq!(source.calls(), before);
    }
}
