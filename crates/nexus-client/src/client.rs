//! Nexus repository HTTP client

use crate::error::{NexusError, Result};
use crate::types::{Credentials, RemoteHit, RemoteLocation, SearchAsset, SearchAssetsResponse};
use reqwest::header::CONTENT_LENGTH;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::{Position, Url};

/// Upper bound on search pages followed for a single search key
const MAX_SEARCH_PAGES: usize = 100;

/// One entry of the ordered search list built from the restore keys
struct SearchKey {
    /// Asset name pattern passed to the search API
    name: String,
    /// Key reported on a hit; `None` means derive it from the asset path
    key: Option<String>,
}

/// Client for the remote cache tier
pub struct NexusClient {
    http: reqwest::Client,
    location: RemoteLocation,
    credentials: Option<Credentials>,
}

impl NexusClient {
    /// Create a client for `repository_url` with a 30 second timeout
    pub fn new(repository_url: &str, credentials: Option<Credentials>) -> Result<Self> {
        Self::with_timeout(repository_url, credentials, Duration::from_secs(30))
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(
        repository_url: &str,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self> {
        let location = Self::parse_location(repository_url)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            location,
            credentials,
        })
    }

    /// Split `scheme://host[:port]/repository/<repo>/<prefix...>`
    pub fn parse_location(repository_url: &str) -> Result<RemoteLocation> {
        let url = Url::parse(repository_url)
            .map_err(|e| NexusError::InvalidEndpoint(format!("{}: {}", repository_url, e)))?;

        let host = url.host_str().ok_or_else(|| {
            NexusError::InvalidEndpoint(format!("{}: missing host", repository_url))
        })?;
        let endpoint = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            ["repository", repository, prefix @ ..] => Ok(RemoteLocation {
                endpoint,
                repository: repository.to_string(),
                prefix: prefix.join("/"),
            }),
            _ => Err(NexusError::InvalidEndpoint(format!(
                "{}: expected /repository/<name>/<prefix>",
                repository_url
            ))),
        }
    }

    /// Parsed repository location
    pub fn location(&self) -> &RemoteLocation {
        &self.location
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => request.basic_auth(&c.username, Some(&c.secret)),
            None => request,
        }
    }

    /// Resolve a restore-key list against the repository.
    ///
    /// The first key is searched as `<prefix>/<key>-<version>`; the remaining
    /// keys as `<prefix>/<key>*` regardless of version. The newest asset of the
    /// first search yielding any result wins.
    pub async fn find_cache(&self, keys: &[String], version: &str) -> Result<Option<RemoteHit>> {
        for search in self.search_keys(keys, version) {
            let assets = self.search_assets(&search.name).await?;

            let Some(newest) = newest_asset(assets) else {
                continue;
            };

            let cache_key = search
                .key
                .unwrap_or_else(|| key_from_path(&newest.path, version));
            let archive_location = self.rewrite_location(&newest.download_url)?;

            debug!(
                name = %search.name,
                cache_key = %cache_key,
                archive_location = %archive_location,
                "Remote cache hit"
            );
            return Ok(Some(RemoteHit {
                archive_location,
                cache_key,
            }));
        }

        Ok(None)
    }

    fn search_keys(&self, keys: &[String], version: &str) -> Vec<SearchKey> {
        let Some((first, rest)) = keys.split_first() else {
            return Vec::new();
        };

        let mut searches = vec![SearchKey {
            name: self.location.asset_path(&format!("{}-{}", first, version)),
            key: Some(first.clone()),
        }];
        searches.extend(rest.iter().map(|key| SearchKey {
            name: format!("{}*", self.location.asset_path(key)),
            key: None,
        }));
        searches
    }

    /// All raw assets matching `name`, following continuation tokens
    pub async fn search_assets(&self, name: &str) -> Result<Vec<SearchAsset>> {
        let base = format!("{}/service/rest/v1/search/assets", self.location.endpoint);
        let mut token: Option<String> = None;
        let mut items = Vec::new();

        for _ in 0..MAX_SEARCH_PAGES {
            let mut url = Url::parse(&base)
                .map_err(|e| NexusError::InvalidEndpoint(format!("{}: {}", base, e)))?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("repository", &self.location.repository)
                    .append_pair("format", "raw")
                    .append_pair("name", name);
                if let Some(token) = &token {
                    query.append_pair("continuationToken", token);
                }
            }

            let response = self.authorize(self.http.get(url.as_str())).send().await?;
            if !response.status().is_success() {
                return Err(NexusError::Status {
                    status: response.status().as_u16(),
                    url: url.to_string(),
                });
            }

            let page: SearchAssetsResponse = response.json().await?;
            items.extend(page.items);

            match page.continuation_token {
                Some(next) => token = Some(next),
                None => return Ok(items),
            }
        }

        warn!(name, pages = MAX_SEARCH_PAGES, "Stopped following search pagination");
        Ok(items)
    }

    /// Route a download URL through the configured endpoint, hiding the
    /// blob host Nexus reports.
    fn rewrite_location(&self, download_url: &str) -> Result<String> {
        let url = Url::parse(download_url)
            .map_err(|e| NexusError::InvalidEndpoint(format!("{}: {}", download_url, e)))?;
        Ok(format!(
            "{}{}",
            self.location.endpoint,
            &url[Position::BeforePath..]
        ))
    }

    /// URL an artifact for `key`/`version` is stored at
    pub fn artifact_url(&self, key: &str, version: &str) -> String {
        let name = format!("{}-{}", key, version);
        let path = self
            .location
            .asset_path(&name)
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/repository/{}/{}",
            self.location.endpoint,
            urlencoding::encode(&self.location.repository),
            path
        )
    }

    /// Upload the file at `path` as the artifact for `key`/`version`
    pub async fn put_cache(&self, key: &str, version: &str, path: &Path) -> Result<()> {
        let url = self.artifact_url(key, version);
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let response = self
            .authorize(self.http.put(&url))
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NexusError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        info!(key, version, size, url = %url, "Uploaded artifact to Nexus");
        Ok(())
    }
}

/// Newest asset by `lastModified`; assets without a parseable timestamp rank last
fn newest_asset(mut assets: Vec<SearchAsset>) -> Option<SearchAsset> {
    assets.sort_by(|a, b| b.last_modified_at().cmp(&a.last_modified_at()));
    assets.into_iter().next()
}

/// Cache key encoded in an asset path `<prefix>/<key>-<version>`
fn key_from_path(path: &str, version: &str) -> String {
    let filename = path.rsplit('/').next().unwrap_or(path);
    if let Some(key) = filename.strip_suffix(&format!("-{}", version)) {
        return key.to_string();
    }
    match filename.rsplit_once('-') {
        Some((key, _)) => key.to_string(),
        None => filename.to_string(),
    }
}
