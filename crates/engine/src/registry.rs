//! Application registry and readiness probing

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::{AccordError, AccordResult};
use crate::http::{DispatchRequest, HttpDispatcher, Method};

/// Connection info for one service under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Leading path segment that routes requests to this service
    pub url_prefix: String,
    pub host: String,
    pub http_port: u16,
    pub admin_port: u16,
    pub admin_health_check_url: String,
}

impl ApplicationInfo {
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }

    pub fn admin_url(&self) -> String {
        format!("http://{}:{}", self.host, self.admin_port)
    }

    pub fn base_url(&self, admin: bool) -> String {
        if admin {
            self.admin_url()
        } else {
            self.http_url()
        }
    }

    /// Context variable prefix for this application, e.g. `ORDERS`
    pub fn env_prefix(&self) -> String {
        self.url_prefix
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// Timing for the readiness wait
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            interval: Duration::from_secs(1),
        }
    }
}

/// Registered applications, keyed by url prefix
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: BTreeMap<String, ApplicationInfo>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_apps(apps: impl IntoIterator<Item = ApplicationInfo>) -> Self {
        let mut registry = Self::new();
        for app in apps {
            registry.register(app);
        }
        registry
    }

    pub fn register(&mut self, info: ApplicationInfo) {
        debug!(prefix = %info.url_prefix, host = %info.host, "Registering application");
        self.apps.insert(info.url_prefix.clone(), info);
    }

    pub fn get(&self, prefix: &str) -> AccordResult<&ApplicationInfo> {
        self.apps
            .get(prefix)
            .ok_or_else(|| AccordError::UnknownApplication(prefix.to_string()))
    }

    /// Looks up the application owning `path` by its first segment
    pub fn get_for_path(&self, path: &str) -> AccordResult<&ApplicationInfo> {
        let without_query = path.split(['?', '#']).next().unwrap_or_default();
        let prefix = without_query
            .split('/')
            .find(|segment| !segment.is_empty())
            .ok_or_else(|| AccordError::MissingUrlPrefix(path.to_string()))?;
        self.get(prefix)
    }

    pub fn apps(&self) -> impl Iterator<Item = &ApplicationInfo> {
        self.apps.values()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Waits until every registered application answers on both ports.
    ///
    /// All probes run concurrently; the first one to exceed the deadline
    /// fails the whole wait.
    pub async fn wait_until_ready(
        &self,
        dispatcher: &HttpDispatcher,
        policy: ReadinessPolicy,
    ) -> AccordResult<()> {
        let started = Instant::now();
        try_join_all(self.apps().map(|app| probe(dispatcher, app, policy))).await?;
        info!(
            "{} application(s) ready in {:?}",
            self.apps.len(),
            started.elapsed()
        );
        Ok(())
    }
}

async fn probe(
    dispatcher: &HttpDispatcher,
    app: &ApplicationInfo,
    policy: ReadinessPolicy,
) -> AccordResult<()> {
    let deadline = Instant::now() + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match is_ready(dispatcher, app).await {
            Ok(true) => {
                info!(prefix = %app.url_prefix, attempts, "Application is ready");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                debug!(prefix = %app.url_prefix, "Readiness probe failed: {}", e);
            }
        }

        if Instant::now() + policy.interval > deadline {
            return Err(AccordError::ApplicationNotReady {
                prefix: app.url_prefix.clone(),
                timeout: policy.timeout,
            });
        }
        if attempts == 1 {
            info!("Waiting for {} to start...", app.url_prefix);
        }
        sleep(policy.interval).await;
    }
}

async fn is_ready(dispatcher: &HttpDispatcher, app: &ApplicationInfo) -> AccordResult<bool> {
    let health = dispatcher
        .send(app, &DispatchRequest::new(Method::Get, &app.admin_health_check_url).admin())
        .await?;
    if !matches!(health.status, 200 | 403) {
        debug!(prefix = %app.url_prefix, status = health.status, "Health check not accepted");
        return Ok(false);
    }

    let root = dispatcher
        .send(app, &DispatchRequest::new(Method::Get, "/"))
        .await?;
    Ok(matches!(root.status, 200 | 404))
}
