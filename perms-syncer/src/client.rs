//! Minimal JSON client shared by the code-host providers.

use errors::{ProviderError, ProviderResult};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Upper bound on followed `Link` pages for a single listing.
const MAX_PAGES: usize = 1000;

#[derive(Clone)]
pub struct CodeHostClient {
    client: Client,
    api_url: String
}

impl CodeHostClient {
    pub fn new(api_url: &str, timeout: Duration) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("perms-syncer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Network {
                reason: e.to_string()
            })?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string()
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Resolves a path such as `/user` against the API root. Absolute URLs
    /// (pagination links) are returned unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.api_url, path)
        }
    }

    /// GETs one page and returns it with the `rel="next"` link, if any.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str
    ) -> ProviderResult<(T, Option<String>)> {
        let url = self.url(path);
        debug!(url = %url, "Making code host API request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let next_link = extract_next_link(response.headers());

        if status.is_success() {
            let body = response
                .json::<T>()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    reason: e.to_string()
                })?;
            return Ok((body, next_link));
        }

        if let Some(retry_after) = rate_limit_reset(status, response.headers()) {
            return Err(ProviderError::RateLimited { retry_after });
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), body))
    }

    /// GETs every page of a listing by following `Link` headers.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str
    ) -> ProviderResult<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(path.to_string());
        let mut pages = 0;

        while let Some(current) = next.take() {
            let (page, link): (Vec<T>, _) = self.get(&current, token).await?;
            items.extend(page);
            pages += 1;
            if pages >= MAX_PAGES {
                return Err(ProviderError::InvalidResponse {
                    reason: format!("listing {path} exceeded {MAX_PAGES} pages")
                });
            }
            next = link;
        }

        Ok(items)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(e.to_string())
    } else {
        ProviderError::Network {
            reason: e.to_string()
        }
    }
}

/// Seconds to wait when the response signals an exhausted rate limit.
fn rate_limit_reset(status: StatusCode, headers: &HeaderMap) -> Option<u64> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => Some(header("retry-after").unwrap_or(60)),
        StatusCode::FORBIDDEN if header("x-ratelimit-remaining") == Some(0) => {
            Some(header("retry-after").unwrap_or(60))
        }
        _ => None
    }
}

fn extract_next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get("link")?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?;
        segments
            .any(|param| param.trim() == "rel=\"next\"")
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_extract_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "link",
            HeaderValue::from_static(
                "<https://api.github.com/user/repos?page=3>; rel=\"next\", <https://api.github.com/user/repos?page=9>; rel=\"last\""
            )
        );
        assert_eq!(
            extract_next_link(&headers).as_deref(),
            Some("https://api.github.com/user/repos?page=3")
        );

        let mut last_page = HeaderMap::new();
        last_page.insert(
            "link",
            HeaderValue::from_static("<https://api.github.com/user/repos?page=1>; rel=\"prev\"")
        );
        assert_eq!(extract_next_link(&last_page), None);
        assert_eq!(extract_next_link(&HeaderMap::new()), None);
    }

    #[test]
    fn test_rate_limit_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("12"));
        assert_eq!(
            rate_limit_reset(StatusCode::TOO_MANY_REQUESTS, &headers),
            Some(12)
        );

        let mut exhausted = HeaderMap::new();
        exhausted.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert_eq!(rate_limit_reset(StatusCode::FORBIDDEN, &exhausted), Some(60));
        assert_eq!(rate_limit_reset(StatusCode::FORBIDDEN, &HeaderMap::new()), None);
    }

    #[test]
    fn test_url_joins_paths() {
        let client = CodeHostClient::new("https://gitlab.example.com/api/v4/", Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.url("/user"), "https://gitlab.example.com/api/v4/user");
        assert_eq!(
            client.url("https://gitlab.example.com/api/v4/projects?page=2"),
            "https://gitlab.example.com/api/v4/projects?page=2"
        );
    }
}
