use crate::config::CachePurgeConfig;
use crate::files::{Bucket, File};
use anyhow::Context;
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

static QUERY_VARIANTS: [&str; 2] = ["", "?download"];
static PREVIEW_QUERY_VARIANTS: [&str; 3] = ["?preview", "?preview&download", "?download&preview"];

#[derive(Serialize)]
struct PurgeRequest<'a> {
    files: &'a [String],
}

/// Evicts a deleted file's public URLs from the CDN cache
pub struct CachePurger {
    client: Client,
    base: Url,
    endpoint: String,
    api_token: String,
}

impl CachePurger {
    pub fn new(config: &CachePurgeConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build cache purge HTTP client")?;
        Self::with_client(config, client)
    }

    pub fn with_client(config: &CachePurgeConfig, client: Client) -> anyhow::Result<Self> {
        let base = Url::parse(&config.public_url).context("Invalid cache_purge.public_url")?;
        if base.cannot_be_a_base() {
            anyhow::bail!("cache_purge.public_url must be a hierarchical URL");
        }

        Ok(Self {
            client,
            base,
            endpoint: format!(
                "{}/zones/{}/purge_cache",
                config.api_base.trim_end_matches('/'),
                config.zone_id
            ),
            api_token: config.api_token.clone(),
        })
    }

    fn file_url(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.to_string()
    }

    /// Every public URL a file may have been cached under
    pub fn purge_urls(&self, file: &File) -> Vec<String> {
        let bases = [
            self.file_url(&[file.bucket.as_str(), file.id.as_str()]),
            self.file_url(&[file.bucket.as_str(), file.id.as_str(), file.filename.as_str()]),
        ];
        let with_previews = file.bucket == Bucket::Attachments.as_str();

        bases
            .iter()
            .flat_map(|base| {
                let previews: &[&str] = if with_previews {
                    &PREVIEW_QUERY_VARIANTS
                } else {
                    &[]
                };
                QUERY_VARIANTS
                    .iter()
                    .chain(previews.iter())
                    .map(move |query| format!("{}{}", base, query))
            })
            .collect()
    }

    #[instrument(skip(self, file), fields(id = %file.id))]
    pub async fn purge(&self, file: &File) -> anyhow::Result<()> {
        let urls = self.purge_urls(file);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .json(&PurgeRequest { files: &urls })
            .send()
            .await
            .context("Cache purge request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("cache purge returned HTTP {}: {}", status, body);
        }

        metrics::counter!("uploads.cache.purged").increment(1);
        debug!(urls = urls.len(), "Cache purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn config(api_base: &str) -> CachePurgeConfig {
        CachePurgeConfig {
            api_token: "purge-token".to_string(),
            zone_id: "zone-1".to_string(),
            public_url: "https://cdn.example.com/".to_string(),
            api_base: api_base.to_string(),
        }
    }

    fn file(bucket: &str) -> File {
        File {
            id: "abc".to_string(),
            hash: "h".to_string(),
            bucket: bucket.to_string(),
            mime: "image/png".to_string(),
            filename: "my cat.png".to_string(),
            width: 0,
            height: 0,
            upload_region: "local".to_string(),
            uploaded_by: "alice".to_string(),
            uploaded_at: 0,
            claimed: true,
            used_by: None,
        }
    }

    #[test]
    fn test_attachment_urls_include_preview_variants() {
        let purger = CachePurger::new(&config("https://api.example.com")).unwrap();
        let urls = purger.purge_urls(&file("attachments"));

        assert_eq!(urls.len(), 10);
        assert!(urls.contains(&"https://cdn.example.com/attachments/abc".to_string()));
        assert!(urls.contains(&"https://cdn.example.com/attachments/abc?preview&download".to_string()));
        assert!(urls.contains(&"https://cdn.example.com/attachments/abc/my%20cat.png?download".to_string()));
    }

    #[test]
    fn test_other_buckets_skip_preview_variants() {
        let purger = CachePurger::new(&config("https://api.example.com")).unwrap();
        let urls = purger.purge_urls(&file("icons"));

        assert_eq!(urls.len(), 4);
        assert!(urls.iter().all(|u| !u.contains("preview")));
    }

    #[test]
    fn test_rejects_bad_public_url() {
        let mut bad = config("https://api.example.com");
        bad.public_url = "mailto:cdn@example.com".to_string();
        assert!(CachePurger::new(&bad).is_err());
    }

    type Captured = Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>;

    async fn capture(
        State(captured): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.lock().push((auth, body));
        StatusCode::OK
    }

    #[tokio::test]
    async fn test_purge_posts_urls_with_bearer_token() {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route("/zones/zone-1/purge_cache", post(capture))
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let purger = CachePurger::new(&config(&format!("http://{}", addr))).unwrap();
        purger.purge(&file("icons")).await.unwrap();

        let requests = captured.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.as_deref(), Some("Bearer purge-token"));
        assert_eq!(requests[0].1["files"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_purge_surfaces_http_errors() {
        let app = Router::new().route(
            "/zones/zone-1/purge_cache",
            post(|| async { StatusCode::FORBIDDEN }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let purger = CachePurger::new(&config(&format!("http://{}", addr))).unwrap();
        assert!(purger.purge(&file("attachments")).await.is_err());
    }
}
