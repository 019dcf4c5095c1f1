//! Object storage adapter
//!
//! Path-style S3 requests against a local emulator. Bucket names carry the
//! environment tag the same way queue names do.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::config::EndpointConfig;
use crate::error::{AccordError, AccordResult};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> AccordResult<()>;

    async fn put_text(&self, bucket: &str, key: &str, body: &str) -> AccordResult<()>;

    async fn put_bytes(&self, bucket: &str, key: &str, body: Vec<u8>) -> AccordResult<()>;

    /// False only for a 404; any other failure is an error
    async fn exists(&self, bucket: &str, key: &str) -> AccordResult<bool>;

    /// Makes a URL handed out by the store reachable from the test host
    fn transform_signed_url(&self, url: &str) -> String;
}

pub fn qualified_bucket_name(bucket: &str, environment: &str) -> String {
    format!("{}-{}", bucket, environment)
}

/// S3-compatible store
pub struct S3Storage {
    http: reqwest::Client,
    endpoint: EndpointConfig,
}

impl S3Storage {
    pub fn new(endpoint: EndpointConfig) -> AccordResult<Self> {
        info!(
            "Object storage endpoint {} (region {}, environment {})",
            endpoint.endpoint_url, endpoint.region, endpoint.environment
        );
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            endpoint,
        })
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.endpoint_url.trim_end_matches('/'),
            qualified_bucket_name(bucket, &self.endpoint.environment)
        )
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        let encoded: Vec<String> = key
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.bucket_url(bucket), encoded.join("/"))
    }

    async fn put(&self, bucket: &str, key: &str, body: reqwest::Body, content_type: &str) -> AccordResult<()> {
        let url = self.object_url(bucket, key);
        let resp = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AccordError::Storage(format!(
                "PUT {} failed with {}",
                url,
                resp.status()
            )));
        }
        debug!("Stored {}", url);
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn create_bucket(&self, bucket: &str) -> AccordResult<()> {
        let url = self.bucket_url(bucket);
        let resp = self.http.put(&url).send().await?;
        match resp.status() {
            s if s.is_success() => {
                info!("Created bucket {}", url);
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!("Bucket {} already exists", url);
                Ok(())
            }
            other => Err(AccordError::Storage(format!(
                "Creating bucket {} failed with {}",
                url, other
            ))),
        }
    }

    async fn put_text(&self, bucket: &str, key: &str, body: &str) -> AccordResult<()> {
        self.put(bucket, key, body.to_string().into(), "text/plain; charset=utf-8")
            .await
    }

    async fn put_bytes(&self, bucket: &str, key: &str, body: Vec<u8>) -> AccordResult<()> {
        self.put(bucket, key, body.into(), "application/octet-stream")
            .await
    }

    async fn exists(&self, bucket: &str, key: &str) -> AccordResult<bool> {
        let url = self.object_url(bucket, key);
        let resp = self.http.head(&url).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(AccordError::Storage(format!(
                "HEAD {} failed with {}",
                url, other
            ))),
        }
    }

    fn transform_signed_url(&self, url: &str) -> String {
        self.endpoint.rewrite_url(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> S3Storage {
        S3Storage::new(EndpointConfig {
            enabled: true,
            endpoint_url: "http://localhost:8001".into(),
            region: "s3mock".into(),
            environment: "local".into(),
            replace_url: Some("http://voila-s3mock:8001".into()),
        })
        .unwrap()
    }

    #[test]
    fn test_object_url() {
        assert_eq!(
            storage().object_url("invoices", "/2024/march report.pdf"),
            "http://localhost:8001/invoices-local/2024/march%20report.pdf"
        );
    }

    #[test]
    fn test_transform_signed_url() {
        assert_eq!(
            storage().transform_signed_url("http://voila-s3mock:8001/invoices-local/a?X-Amz-Signature=1"),
            "http://localhost:8001/invoices-local/a?X-Amz-Signature=1"
        );
    }
}
