//! Data types for the Nexus search API and resolved cache hits

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Basic-auth credentials for the repository
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }
}

/// A repository URL split into its parts.
///
/// `https://nexus.example.com/repository/gh-cache/team/runners` becomes
/// endpoint `https://nexus.example.com`, repository `gh-cache` and prefix
/// `team/runners`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    /// Scheme, host and port of the Nexus service
    pub endpoint: String,
    pub repository: String,
    /// Path inside the repository, without leading or trailing slash
    pub prefix: String,
}

impl RemoteLocation {
    /// Asset path for `name` under the prefix
    pub fn asset_path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

/// Asset entry from `GET /service/rest/v1/search/assets`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchAsset {
    pub download_url: String,
    pub path: String,
    pub id: Option<String>,
    pub repository: Option<String>,
    pub format: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
    pub file_size: Option<u64>,
}

impl SearchAsset {
    /// Parsed `lastModified`, if present and well-formed
    pub fn last_modified_at(&self) -> Option<DateTime<FixedOffset>> {
        self.last_modified
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    }
}

/// One page of asset search results
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchAssetsResponse {
    #[serde(default)]
    pub items: Vec<SearchAsset>,
    pub continuation_token: Option<String>,
}

/// A cache hit served from the remote tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHit {
    /// Download URL routed through the configured endpoint
    pub archive_location: String,
    /// Key the artifact was stored under
    pub cache_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_path() {
        let location = RemoteLocation {
            endpoint: "https://nexus".to_string(),
            repository: "cache".to_string(),
            prefix: "team/runners".to_string(),
        };
        assert_eq!(location.asset_path("key-v1"), "team/runners/key-v1");

        let bare = RemoteLocation {
            prefix: String::new(),
            ..location
        };
        assert_eq!(bare.asset_path("key-v1"), "key-v1");
    }

    #[test]
    fn test_search_response_deserialization() {
        let json = r#"{
            "items": [
                {
                    "downloadUrl": "https://blob.internal/repository/cache/p/key-v1",
                    "path": "p/key-v1",
                    "id": "abc",
                    "repository": "cache",
                    "format": "raw",
                    "checksum": {"sha1": "00"},
                    "contentType": "application/octet-stream",
                    "lastModified": "2024-05-01T10:00:00.000+00:00",
                    "fileSize": 1234
                }
            ],
            "continuationToken": null
        }"#;

        let response: SearchAssetsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.items.len(), 1);
        assert!(response.continuation_token.is_none());

        let asset = &response.items[0];
        assert_eq!(asset.path, "p/key-v1");
        assert_eq!(asset.file_size, Some(1234));
        assert!(asset.last_modified_at().is_some());
    }

    #[test]
    fn test_search_response_without_items() {
        let response: SearchAssetsResponse =
            serde_json::from_str(r#"{"continuationToken": "next"}"#).unwrap();
        assert!(response.items.is_empty());
        assert_eq!(response.continuation_token.as_deref(), Some("next"));
    }
}
