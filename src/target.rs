//! Versioned release descriptors

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, versioned release descriptor referencing a set of apps and
/// platform metadata
///
/// Targets are produced by an external release-tracking service and are
/// read-only from this pipeline's perspective, except for the store
/// bookkeeping fields written back after a successful commit. Fields we do
/// not model are preserved opaquely so a descriptor can be round-tripped
/// without losing forward-compatible metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    #[serde(skip)]
    pub name: String,
    pub custom: TargetCustom,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TargetCustom {
    pub arch: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub docker_compose_apps: BTreeMap<String, ComposeAppDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortlist: Option<Vec<String>>,
    #[serde(
        rename = "containers-sha",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub containers_sha: Option<String>,
    #[serde(
        rename = "compose-apps-hash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compose_apps_hash: Option<String>,
    #[serde(
        rename = "compose-apps-branch",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compose_apps_branch: Option<String>,
    #[serde(
        rename = "encryption-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encryption_key: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One app entry of `custom.docker_compose_apps`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComposeAppDesc {
    pub uri: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Target {
    /// Build a Target from its name and the JSON body found in the release
    /// metadata document
    pub fn from_json(name: &str, json: serde_json::Value) -> Result<Self, serde_json::Error> {
        let mut target: Target = serde_json::from_value(json)?;
        target.name = name.to_owned();
        Ok(target)
    }

    /// The container platform name for this target's hardware architecture
    pub fn platform(&self) -> &str {
        match self.custom.arch.as_str() {
            "aarch64" => "arm64",
            "x86_64" => "amd64",
            "arm" => "arm",
            other => other,
        }
    }

    /// Release tags, joined the way store branch names expect them
    pub fn joined_tags(&self) -> String {
        self.custom.tags.join("_")
    }

    /// Iterate over `(appName, appUri)` pairs
    pub fn apps(&self) -> impl Iterator<Item = (&str, &str)> {
        self.custom
            .docker_compose_apps
            .iter()
            .map(|(name, desc)| (name.as_str(), desc.uri.as_str()))
    }

    /// The shortlist filter, if one is set and non-empty
    pub fn shortlist(&self) -> Option<&[String]> {
        match self.custom.shortlist.as_deref() {
            Some([]) | None => None,
            Some(list) => Some(list),
        }
    }

    /// Content hash of the container set, used to key archive locations
    pub fn content_hash(&self) -> Option<&str> {
        self.custom.containers_sha.as_deref()
    }

    /// The `branch@commit` reference recorded by a versioned store
    pub fn store_reference(&self) -> Option<&str> {
        self.custom.compose_apps_hash.as_deref()
    }

    /// Commit hash portion of the recorded store reference
    pub fn store_commit(&self) -> Option<&str> {
        let reference = self.store_reference()?;
        match reference.split_once('@') {
            Some((_, commit)) if !commit.is_empty() => Some(commit),
            None => Some(reference),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "hashes": {"sha256": "0011"},
            "custom": {
                "arch": "aarch64",
                "tags": ["main", "devel"],
                "containers-sha": "deadbeef",
                "docker_compose_apps": {
                    "web": {"uri": "hub.example.io/acme/web@sha256:aa"},
                    "db": {"uri": "hub.example.io/acme/db@sha256:bb"}
                },
                "future-field": {"nested": true}
            }
        })
    }

    #[test]
    fn typed_fields_and_platform() {
        let target = Target::from_json("acme-lmp-42", sample()).unwrap();
        assert_eq!(target.name, "acme-lmp-42");
        assert_eq!(target.platform(), "arm64");
        assert_eq!(target.joined_tags(), "main_devel");
        assert_eq!(target.content_hash(), Some("deadbeef"));
        let apps: Vec<&str> = target.apps().map(|(name, _)| name).collect();
        assert_eq!(apps, vec!["db", "web"]);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let target = Target::from_json("t", sample()).unwrap();
        let back = serde_json::to_value(&target).unwrap();
        assert_eq!(back["hashes"]["sha256"], "0011");
        assert_eq!(back["custom"]["future-field"]["nested"], true);
    }

    #[test]
    fn bookkeeping_write_back_serializes() {
        let mut target = Target::from_json("t", sample()).unwrap();
        target.custom.compose_apps_branch = Some("acme/main/arm64".into());
        target.custom.compose_apps_hash = Some("acme/main/arm64@abc123".into());
        let back = serde_json::to_value(&target).unwrap();
        assert_eq!(back["custom"]["compose-apps-hash"], "acme/main/arm64@abc123");
        assert_eq!(target.store_commit(), Some("abc123"));
    }

    #[test]
    fn empty_shortlist_is_no_filter() {
        let mut target = Target::from_json("t", sample()).unwrap();
        assert!(target.shortlist().is_none());
        target.custom.shortlist = Some(vec![]);
        assert!(target.shortlist().is_none());
        target.custom.shortlist = Some(vec!["web".into()]);
        assert_eq!(target.shortlist(), Some(&["web".to_string()][..]));
    }
}
