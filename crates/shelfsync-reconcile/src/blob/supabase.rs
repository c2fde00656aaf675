//! Supabase Storage over its REST API.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::json;
use shelfsync_core::config::BlobConfig;
use tracing::debug;

use super::{BlobStore, validate_key};
use crate::error::{ReconcileError, Result};

const API: &str = "supabase storage";

pub struct SupabaseBlobStore {
    client: reqwest::Client,
    base_url: String,
    public_base_url: String,
}

impl SupabaseBlobStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| ReconcileError::Config(format!("invalid storage key: {e}")))?;
        let apikey = HeaderValue::from_str(api_key)
            .map_err(|e| ReconcileError::Config(format!("invalid storage key: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("apikey", apikey);

        let client = reqwest::Client::builder()
            .user_agent(concat!("shelfsync/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            public_base_url: base_url.clone(),
            base_url,
        })
    }

    /// Build from config; the key is read from the env var named by `blob.api_key_env`.
    pub fn from_config(config: &BlobConfig) -> Result<Self> {
        let url = config
            .supabase_url
            .as_deref()
            .ok_or_else(|| ReconcileError::Config("blob.supabase_url is not set".to_string()))?;
        let key = std::env::var(&config.api_key_env).map_err(|_| {
            ReconcileError::Config(format!("environment variable {} is not set", config.api_key_env))
        })?;
        let store = Self::new(url, &key)?;
        Ok(match &config.public_base_url {
            Some(public) => store.with_public_base_url(public),
            None => store,
        })
    }

    pub fn with_public_base_url(mut self, base: &str) -> Self {
        self.public_base_url = base.trim_end_matches('/').to_string();
        self
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_key(key)
        )
    }

    async fn check(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ReconcileError::ApiError(
            API.to_string(),
            format!("{url}: HTTP {status}: {body}"),
        ))
    }
}

fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl BlobStore for SupabaseBlobStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<()> {
        validate_key(key)?;
        let url = self.object_url(bucket, key);
        let size = bytes.len();
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", if upsert { "true" } else { "false" })
            .body(bytes)
            .send()
            .await?;
        Self::check(response, &url).await?;
        debug!(bucket, key, size, "uploaded object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let url = self.object_url(bucket, key);
        let response = self.client.get(&url).send().await?;
        let response = Self::check(response, &url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        validate_key(key)?;
        let url = format!(
            "{}/storage/v1/object/{}",
            self.base_url,
            urlencoding::encode(bucket)
        );
        let response = self
            .client
            .delete(&url)
            .json(&json!({ "prefixes": [key] }))
            .send()
            .await?;
        Self::check(response, &url).await?;
        debug!(bucket, key, "removed object");
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.public_base_url,
            urlencoding::encode(bucket),
            encode_key(key)
        )
    }
}
