//! Scenario context, `${NAME}` parameterization and per-worker state

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{AccordError, AccordResult};
use crate::http::{Headers, Response};
use crate::registry::AppRegistry;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("token pattern is valid"));

/// Scenario-scoped variables shared by every worker.
///
/// Cloning is cheap and yields a handle to the same map. Concurrent writes to
/// one key are last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: Arc<DashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        debug!("Context {} = {}", name, value);
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.get(name).map(|v| v.value().clone())
    }

    /// Value as it would be substituted into a string
    pub fn get_string(&self, name: &str) -> AccordResult<String> {
        self.values
            .get(name)
            .map(|v| stringify(v.value()))
            .ok_or_else(|| AccordError::VariableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        self.values.clear();
    }

    /// Replaces every `${NAME}` token in `input` with its context value.
    ///
    /// Substituted values are not scanned again. Any unknown name fails the
    /// whole call.
    pub fn resolve(&self, input: &str, url_encode: bool) -> AccordResult<String> {
        if !input.contains("${") {
            return Ok(input.to_string());
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in TOKEN.captures_iter(input) {
            let (Some(token), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self.get_string(name.as_str())?;
            out.push_str(&input[last..token.start()]);
            if url_encode {
                out.push_str(&urlencoding::encode(&value));
            } else {
                out.push_str(&value);
            }
            last = token.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Seeds host/port/url variables for every registered application
    pub fn seed_application_vars(&self, registry: &AppRegistry) {
        for app in registry.apps() {
            let prefix = app.env_prefix();
            self.put(format!("{prefix}_HTTP_PORT"), app.http_port.to_string());
            self.put(format!("{prefix}_HTTP_ADMIN_PORT"), app.admin_port.to_string());
            self.put(format!("{prefix}_HTTP_HOST"), app.host.clone());
            self.put(format!("{prefix}_HTTP_ADMIN_HOST"), app.host.clone());
            self.put(format!("{prefix}_HTTP_URL"), app.http_url());
            self.put(format!("{prefix}_HTTP_ADMIN_URL"), app.admin_url());
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Transient state owned by one worker: the main scenario flow or one table row
#[derive(Debug, Default)]
pub struct Worker {
    pub one_time_headers: Headers,
    last_response: Option<Response>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_one_time_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.one_time_headers.insert(name.into(), value.into());
    }

    pub fn set_response(&mut self, response: Response) {
        self.last_response = Some(response);
    }

    pub fn last_response(&self) -> AccordResult<&Response> {
        self.last_response.as_ref().ok_or(AccordError::NoResponse)
    }

    pub fn last_response_mut(&mut self) -> AccordResult<&mut Response> {
        self.last_response.as_mut().ok_or(AccordError::NoResponse)
    }

    pub fn reset(&mut self) {
        self.one_time_headers.clear();
        self.last_response = None;
    }
}
