//! HTTP action dispatcher
//!
//! Sends requests to registered applications, applying permanent and
//! one-time headers, and records per-request timing for the end-of-run
//! summary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{AccordError, AccordResult};
use crate::registry::ApplicationInfo;

/// Header name to value
pub type Headers = BTreeMap<String, String>;

pub const METHOD_OVERRIDE_HEADER: &str = "X-HTTP-Method-Override";
pub const DEFAULT_MEDIA_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = AccordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            "OPTIONS" => Ok(Method::Options),
            other => Err(AccordError::InvalidConfig(format!(
                "Unsupported HTTP method: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    Text(String),
    Bytes(Vec<u8>),
}

/// A request against a registered application
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: Method,
    pub path: String,
    /// Target the admin port instead of the main one
    pub admin: bool,
    pub body: Option<Body>,
    pub media_type: Option<String>,
    /// Tunnel the method through POST with an override header
    pub method_override: bool,
}

impl DispatchRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            admin: false,
            body: None,
            media_type: None,
            method_override: false,
        }
    }

    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    pub fn on_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Text(body.into()));
        self
    }

    pub fn bytes(mut self, body: Vec<u8>) -> Self {
        self.body = Some(Body::Bytes(body));
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn force_method_override(mut self) -> Self {
        self.method_override = true;
        self
    }
}

/// Uniform response shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: String,
    /// Lower-cased header name to all of its values
    pub headers: HashMap<String, Vec<String>>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn json(&self) -> AccordResult<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }

    async fn from_reqwest(resp: reqwest::Response) -> AccordResult<Self> {
        let status = resp.status().as_u16();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in resp.headers() {
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let body = resp.text().await?;
        Ok(Self {
            status,
            body,
            headers,
        })
    }
}

/// Permanent headers first, then one-time headers replacing any
/// permanent header of the same name
pub fn merge_headers(permanent: &Headers, one_time: &Headers) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = permanent
        .iter()
        .filter(|(name, _)| !one_time.keys().any(|k| k.eq_ignore_ascii_case(name)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(one_time.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Issues HTTP requests for step handlers
pub struct HttpDispatcher {
    client: reqwest::Client,
    force_method_override: bool,
    log: RequestLog,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> AccordResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            force_method_override: false,
            log: RequestLog::default(),
        })
    }

    /// Always tunnel PATCH through POST
    pub fn with_method_override(mut self, force: bool) -> Self {
        self.force_method_override = force;
        self
    }

    pub fn request_log(&self) -> &RequestLog {
        &self.log
    }

    /// Dispatches `req` to `app`.
    ///
    /// The one-time headers are drained before the request is built, so the
    /// set is empty afterwards whether or not the call succeeds.
    pub async fn dispatch(
        &self,
        app: &ApplicationInfo,
        req: &DispatchRequest,
        permanent: &Headers,
        one_time: &mut Headers,
    ) -> AccordResult<Response> {
        let one_time = std::mem::take(one_time);
        let headers = merge_headers(permanent, &one_time);
        let url = build_url(app, req);

        let started = Instant::now();
        let result = self.execute(&url, req, &headers).await;
        let elapsed = started.elapsed();

        self.log.record(req.method, strip_query(&req.path), elapsed);
        match &result {
            Ok(resp) => debug!(
                "{} {} -> {} in {}ms",
                req.method,
                url,
                resp.status,
                elapsed.as_millis()
            ),
            Err(e) => debug!("{} {} failed: {}", req.method, url, e),
        }
        result
    }

    /// Sends `req` to `app` without headers or timing, for probes
    pub async fn send(&self, app: &ApplicationInfo, req: &DispatchRequest) -> AccordResult<Response> {
        self.execute(&build_url(app, req), req, &[]).await
    }

    /// Sends a request to an absolute URL, e.g. a pre-signed storage URL
    pub async fn send_to_url(&self, url: &str, req: &DispatchRequest) -> AccordResult<Response> {
        let started = Instant::now();
        let result = self.execute(url, req, &[]).await;
        self.log.record(req.method, strip_query(url), started.elapsed());
        result
    }

    async fn execute(
        &self,
        url: &str,
        req: &DispatchRequest,
        headers: &[(String, String)],
    ) -> AccordResult<Response> {
        let tunnel = req.method_override
            || (self.force_method_override && req.method == Method::Patch);
        let wire_method = if tunnel { Method::Post } else { req.method };

        let mut builder = self.client.request(wire_method.to_reqwest(), url);
        if tunnel {
            builder = builder.header(METHOD_OVERRIDE_HEADER, req.method.as_str());
        }
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("accept")) {
            builder = builder.header(reqwest::header::ACCEPT, DEFAULT_MEDIA_TYPE);
        }
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &req.body {
            let media_type = req.media_type.as_deref().unwrap_or(DEFAULT_MEDIA_TYPE);
            builder = builder.header(reqwest::header::CONTENT_TYPE, media_type);
            builder = match body {
                Body::Text(text) => builder.body(text.clone()),
                Body::Bytes(bytes) => builder.body(bytes.clone()),
            };
        }

        let resp = builder.send().await?;
        Response::from_reqwest(resp).await
    }
}

fn build_url(app: &ApplicationInfo, req: &DispatchRequest) -> String {
    let base = app.base_url(req.admin);
    if req.path.starts_with('/') {
        format!("{}{}", base, req.path)
    } else {
        format!("{}/{}", base, req.path)
    }
}

fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// One timed request
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub method: Method,
    pub path: String,
    pub elapsed: Duration,
}

/// Aggregate timing for one method and path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    pub count: usize,
    pub total_ms: u128,
    pub average_ms: u128,
}

/// Append-only log of timed requests
#[derive(Debug, Default)]
pub struct RequestLog {
    entries: Mutex<Vec<RequestLogEntry>>,
}

impl RequestLog {
    pub fn record(&self, method: Method, path: &str, elapsed: Duration) {
        self.entries.lock().push(RequestLogEntry {
            method,
            path: path.to_string(),
            elapsed,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Per-endpoint totals, slowest first
    pub fn summaries(&self) -> Vec<RequestSummary> {
        let mut grouped: HashMap<(Method, String), (usize, u128)> = HashMap::new();
        for entry in self.entries.lock().iter() {
            let slot = grouped
                .entry((entry.method, entry.path.clone()))
                .or_insert((0, 0));
            slot.0 += 1;
            slot.1 += entry.elapsed.as_millis();
        }

        let mut summaries: Vec<RequestSummary> = grouped
            .into_iter()
            .map(|((method, path), (count, total_ms))| RequestSummary {
                method: method.as_str().to_string(),
                path,
                count,
                total_ms,
                average_ms: total_ms / count as u128,
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.total_ms
                .cmp(&a.total_ms)
                .then(b.average_ms.cmp(&a.average_ms))
                .then(b.count.cmp(&a.count))
                .then(b.path.cmp(&a.path))
                .then(b.method.cmp(&a.method))
        });
        summaries
    }

    pub fn render_summary(&self) -> String {
        let mut out = String::from("|   total ms | count |   avg ms | request\n");
        for s in self.summaries() {
            out.push_str(&format!(
                "| {:>10} | {:>5} | {:>8} | {:>6} {}\n",
                s.total_ms, s.count, s.average_ms, s.method, s.path
            ));
        }
        out
    }

    pub fn log_summary(&self) {
        if self.is_empty() {
            return;
        }
        info!("Request timing summary:\n{}", self.render_summary());
    }
}
