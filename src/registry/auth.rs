//! Bearer-token challenge/response flow
//!
//! Reference: <https://docs.docker.com/registry/spec/auth/token/>

use crate::errors::FetchError;
use regex::Regex;
use url::Url;

/// Parsed `WWW-Authenticate: Bearer …` challenge
///
/// `realm` is the token endpoint; every other `key="value"` parameter of the
/// challenge (`service`, `scope`, …) is forwarded verbatim as a query
/// parameter of the token request.
#[derive(Debug, Clone)]
pub struct BearerChallenge {
    pub realm: Url,
    pub params: Vec<(String, String)>,
}

impl BearerChallenge {
    pub fn parse(auth_header: &str) -> Result<Self, FetchError> {
        lazy_static! {
            static ref SCHEME: Regex = Regex::new(r"^\s*(?i:bearer)\s+(?P<params>.*)$").unwrap();
            static ref PARAM: Regex = Regex::new(r#"(?P<key>[a-zA-Z0-9_]+)="(?P<value>[^"]*)""#)
                .unwrap();
        }
        let captures = SCHEME
            .captures(auth_header)
            .ok_or_else(|| FetchError::AuthProtocol(format!("not a bearer challenge: {:?}", auth_header)))?;

        let mut realm = None;
        let mut params = Vec::new();
        for param in PARAM.captures_iter(&captures["params"]) {
            let key = &param["key"];
            let value = &param["value"];
            if key.eq_ignore_ascii_case("realm") {
                realm = Some(Url::parse(value).map_err(|err| {
                    FetchError::AuthProtocol(format!("bad challenge realm {:?}: {}", value, err))
                })?);
            } else {
                params.push((key.to_owned(), value.to_owned()));
            }
        }

        match realm {
            Some(realm) => Ok(BearerChallenge { realm, params }),
            None => Err(FetchError::AuthProtocol(format!(
                "challenge carries no realm: {:?}",
                auth_header
            ))),
        }
    }

    /// The token endpoint with all remaining challenge parameters attached
    pub fn token_endpoint(&self) -> Url {
        let mut url = self.realm.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.params {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

/// Body of a successful token response
#[derive(Clone, serde::Deserialize)]
pub(crate) struct TokenResponse {
    pub token: String,
}
