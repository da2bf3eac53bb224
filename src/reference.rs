//! Content-addressed image references

use crate::errors::FetchError;
use regex::Regex;
use std::{
    cmp::{Ord, Ordering, PartialOrd},
    fmt,
    hash::{Hash, Hasher},
    ops::Range,
    str,
    str::FromStr,
};

/// Registry host under which references carry an owning realm and app name
pub const DEFAULT_REGISTRY_HOST: &str = "hub.example.io";

/// Digest algorithms we are willing to verify content against
const SUPPORTED_ALGORITHMS: &[&str] = &["sha256"];

/// Parsed content-addressed image reference
///
/// A reference has the shape `host/repository/path@algorithm:hex`. Unlike a
/// Docker-style name, the digest is mandatory: every object this pipeline
/// touches is pinned to its content, and the digest is what the fetched bytes
/// are verified against.
///
/// When `host` is the well-known registry host, the repository path is
/// expected to consist of exactly two segments, an owning realm and an app
/// name, and those are exposed through [ImageReference::realm] and
/// [ImageReference::app]. References to any other host carry neither.
#[derive(Clone)]
pub struct ImageReference {
    serialized: String,
    host_pos: Range<usize>,
    repository_pos: Range<usize>,
    algorithm_pos: Range<usize>,
    hex_pos: Range<usize>,
    realm_pos: Option<Range<usize>>,
    app_pos: Option<Range<usize>>,
}

impl ImageReference {
    /// Returns a reference to the existing string representation of an
    /// [ImageReference]
    ///
    /// Reconstructing `host + "/" + repository + "@" + algorithm + ":" + hex`
    /// always yields exactly this string.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Parse a [prim@str] as an [ImageReference]
    ///
    /// ```
    /// # use capstan::ImageReference;
    /// let r = ImageReference::parse(
    ///     "hub.example.io/acme/web-app@sha256:\
    ///      aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
    /// )
    /// .unwrap();
    /// assert_eq!(r.host(), "hub.example.io");
    /// assert_eq!(r.repository(), "acme/web-app");
    /// assert_eq!(r.realm(), Some("acme"));
    /// assert_eq!(r.app(), Some("web-app"));
    /// ```
    pub fn parse(s: &str) -> Result<Self, FetchError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(concat!(
                "^",
                "(?P<host>", // registry host, everything up to the first slash
                /* */ "[a-zA-Z0-9]",
                /* */ "[a-zA-Z0-9.-]*",
                /* */ "(?::[0-9]+)?", // optional port
                ")",
                "/",
                "(?P<repo>", // repository path, one or more segments
                /* */ "[a-z0-9]+(?:[._-][a-z0-9]+)*",
                /* */ "(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*",
                ")",
                "@",
                "(?P<alg>", // digest algorithm
                /* */ "[a-z][a-z0-9]*",
                ")",
                ":",
                "(?P<hex>", // digest value, lowercase hex only
                /* */ "[a-f0-9]{64}",
                ")",
                "$",
            ))
            .unwrap();
        }
        if s.matches('@').count() != 1 {
            return Err(FetchError::MalformedReference(s.to_owned()));
        }
        let captures = match RE.captures(s) {
            Some(captures) => captures,
            None => return Err(FetchError::MalformedReference(s.to_owned())),
        };
        let algorithm = captures.name("alg").unwrap();
        if !SUPPORTED_ALGORITHMS.contains(&algorithm.as_str()) {
            return Err(FetchError::MalformedReference(s.to_owned()));
        }
        let host = captures.name("host").unwrap();
        let repository = captures.name("repo").unwrap();

        let mut realm_pos = None;
        let mut app_pos = None;
        if host.as_str() == DEFAULT_REGISTRY_HOST {
            let repo_str = repository.as_str();
            let mut segments = repo_str.splitn(3, '/');
            if let (Some(realm), Some(app), None) =
                (segments.next(), segments.next(), segments.next())
            {
                let base = repository.range().start;
                realm_pos = Some(base..base + realm.len());
                app_pos = Some(base + realm.len() + 1..base + realm.len() + 1 + app.len());
            }
        }

        Ok(ImageReference {
            serialized: s.to_owned(),
            host_pos: host.range(),
            repository_pos: repository.range(),
            algorithm_pos: algorithm.range(),
            hex_pos: captures.name("hex").unwrap().range(),
            realm_pos,
            app_pos,
        })
    }

    /// Returns a reference to the registry host portion of the string
    pub fn host(&self) -> &str {
        &self.serialized[self.host_pos.clone()]
    }

    /// Returns a reference to the repository path portion of the string
    pub fn repository(&self) -> &str {
        &self.serialized[self.repository_pos.clone()]
    }

    /// Returns a reference to the digest algorithm portion of the string
    pub fn digest_algorithm(&self) -> &str {
        &self.serialized[self.algorithm_pos.clone()]
    }

    /// Returns a reference to the hexadecimal digest portion of the string
    pub fn digest_hex(&self) -> &str {
        &self.serialized[self.hex_pos.clone()]
    }

    /// Returns the full `algorithm:hex` digest
    pub fn digest(&self) -> &str {
        &self.serialized[self.algorithm_pos.start..self.hex_pos.end]
    }

    /// Returns the owning realm, when the reference points at the well-known
    /// registry host
    pub fn realm(&self) -> Option<&str> {
        self.realm_pos
            .as_ref()
            .map(|pos| &self.serialized[pos.clone()])
    }

    /// Returns the app name, when the reference points at the well-known
    /// registry host
    pub fn app(&self) -> Option<&str> {
        self.app_pos
            .as_ref()
            .map(|pos| &self.serialized[pos.clone()])
    }

    /// Build a new reference to a different object in the same repository
    ///
    /// `digest` must be a full `algorithm:hex` digest. Used when a manifest
    /// list entry or a layer descriptor points at a sibling object.
    pub fn with_digest(&self, digest: &str) -> Result<ImageReference, FetchError> {
        let (algorithm, hex) = split_digest(digest)?;
        ImageReference::parse(&format!(
            "{}/{}@{}:{}",
            self.host(),
            self.repository(),
            algorithm,
            hex
        ))
    }
}

/// Split an `algorithm:hex` digest string, validating the algorithm
pub(crate) fn split_digest(s: &str) -> Result<(&str, &str), FetchError> {
    let mut parts = s.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(algorithm), Some(hex))
            if SUPPORTED_ALGORITHMS.contains(&algorithm)
                && hex.len() == 64
                && hex.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9')) =>
        {
            Ok((algorithm, hex))
        }
        _ => Err(FetchError::MalformedReference(s.to_owned())),
    }
}

impl Eq for ImageReference {}

impl PartialEq for ImageReference {
    fn eq(&self, other: &Self) -> bool {
        self.serialized.eq(&other.serialized)
    }
}

impl FromStr for ImageReference {
    type Err = FetchError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Hash for ImageReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl Ord for ImageReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialized.cmp(&other.serialized)
    }
}

impl PartialOrd for ImageReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
