//! Compose app definitions extracted from fetched app bundles

use crate::errors::FetchError;
use std::path::{Path, PathBuf};

/// File name every app bundle must contain
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Suffix marking an app directory that should be ignored
const DISABLED_SUFFIX: &str = ".disabled";

/// One compose app definition on disk
#[derive(Clone, Debug)]
pub struct ComposeApp {
    pub name: String,
    pub dir: PathBuf,
    doc: serde_yaml::Value,
}

impl ComposeApp {
    /// Load the compose definition from an app directory
    ///
    /// A directory without a compose file is a hard failure: the app cannot
    /// be considered fetched without one.
    pub fn load(name: &str, dir: &Path) -> Result<Self, FetchError> {
        let file = dir.join(COMPOSE_FILE);
        if !file.exists() {
            return Err(FetchError::MissingComposeFile(file));
        }
        let doc: serde_yaml::Value = serde_yaml::from_str(&std::fs::read_to_string(&file)?)?;
        Ok(ComposeApp {
            name: name.to_owned(),
            dir: dir.to_owned(),
            doc,
        })
    }

    /// Image references of every service in the definition
    pub fn images(&self) -> Vec<String> {
        let mut images = Vec::new();
        if let Some(services) = self.doc.get("services").and_then(|v| v.as_mapping()) {
            for (_, service) in services {
                if let Some(image) = service.get("image").and_then(|v| v.as_str()) {
                    images.push(image.to_owned());
                }
            }
        }
        images
    }
}

/// All compose apps found under a fetched target's apps directory
///
/// The layout is `<appsDir>/<appName>/<contentDigest>/docker-compose.yml`,
/// so two versions of the same app can coexist; each version surfaces as its
/// own [ComposeApp].
#[derive(Debug, Default)]
pub struct ComposeApps {
    apps: Vec<ComposeApp>,
}

impl ComposeApps {
    pub fn load(apps_dir: &Path) -> Result<Self, FetchError> {
        let mut apps = Vec::new();
        for app_entry in std::fs::read_dir(apps_dir)? {
            let app_entry = app_entry?;
            let app_name = app_entry.file_name().to_string_lossy().into_owned();
            if app_name.ends_with(DISABLED_SUFFIX) {
                log::info!("app {} has been disabled, omitting it", app_name);
                continue;
            }
            if !app_entry.file_type()?.is_dir() {
                continue;
            }
            for version_entry in std::fs::read_dir(app_entry.path())? {
                let version_dir = version_entry?.path();
                if version_dir.join(COMPOSE_FILE).exists() {
                    apps.push(ComposeApp::load(&app_name, &version_dir)?);
                }
            }
        }
        Ok(ComposeApps { apps })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComposeApp> {
        self.apps.iter()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPOSE: &str = "\
services:
  web:
    image: hub.example.io/acme/nginx@sha256:aa
  worker:
    image: ghcr.io/acme/worker@sha256:bb
";

    #[test]
    fn images_from_services() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(COMPOSE_FILE), COMPOSE).unwrap();
        let app = ComposeApp::load("web-app", dir.path()).unwrap();
        assert_eq!(
            app.images(),
            vec![
                "hub.example.io/acme/nginx@sha256:aa".to_string(),
                "ghcr.io/acme/worker@sha256:bb".to_string(),
            ]
        );
    }

    #[test]
    fn missing_compose_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        match ComposeApp::load("empty", dir.path()) {
            Err(FetchError::MissingComposeFile(path)) => {
                assert!(path.ends_with(COMPOSE_FILE))
            }
            other => panic!("expected MissingComposeFile, got {:?}", other),
        }
    }

    #[test]
    fn load_scans_versioned_layout() {
        let root = tempfile::tempdir().unwrap();
        let enabled = root.path().join("web").join("aabb");
        std::fs::create_dir_all(&enabled).unwrap();
        std::fs::write(enabled.join(COMPOSE_FILE), COMPOSE).unwrap();
        let disabled = root.path().join("old.disabled").join("ccdd");
        std::fs::create_dir_all(&disabled).unwrap();
        std::fs::write(disabled.join(COMPOSE_FILE), COMPOSE).unwrap();

        let apps = ComposeApps::load(root.path()).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps.iter().next().unwrap().name, "web");
    }
}
