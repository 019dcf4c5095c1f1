//! Shared state for one test run
//!
//! A session owns everything that outlives a single step: the application
//! registry, the scenario context, the HTTP dispatcher and the fixtures.
//! Per-request state lives in [`Worker`](crate::context::Worker) instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::{RunnerSettings, SuiteConfig};
use crate::context::Context;
use crate::error::{AccordError, AccordResult};
use crate::fixtures::{Database, Mailbox, MessageQueue, ObjectStorage, Pop3Mailbox, S3Storage, SqsQueue};
use crate::http::{Headers, HttpDispatcher};
use crate::registry::{AppRegistry, ReadinessPolicy};

pub struct Session {
    registry: AppRegistry,
    context: Context,
    dispatcher: HttpDispatcher,
    permanent_headers: RwLock<Headers>,
    queue_headers: RwLock<Headers>,
    queue: Option<Arc<dyn MessageQueue>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    mailbox: Option<Arc<dyn Mailbox>>,
    databases: HashMap<String, Database>,
    settings: RunnerSettings,
}

impl Session {
    pub fn new(registry: AppRegistry, settings: RunnerSettings) -> AccordResult<Self> {
        let dispatcher = HttpDispatcher::new(settings.request_timeout())?
            .with_method_override(settings.force_method_override);
        let context = Context::new();
        context.seed_application_vars(&registry);

        Ok(Self {
            registry,
            context,
            dispatcher,
            permanent_headers: RwLock::new(Headers::new()),
            queue_headers: RwLock::new(Headers::new()),
            queue: None,
            storage: None,
            mailbox: None,
            databases: HashMap::new(),
            settings,
        })
    }

    /// Builds a session with every enabled fixture connected
    pub async fn from_config(config: &SuiteConfig) -> AccordResult<Self> {
        let registry = AppRegistry::from_apps(config.applications.iter().cloned());
        let mut session = Self::new(registry, config.runner.clone())?;

        if config.queue.enabled {
            session = session.with_queue(Arc::new(SqsQueue::new(config.queue.clone())?));
        }
        if config.storage.enabled {
            session = session.with_storage(Arc::new(S3Storage::new(config.storage.clone())?));
        }
        if config.mailbox.enabled {
            session = session.with_mailbox(Arc::new(Pop3Mailbox::new(&config.mailbox)));
        }
        for db in &config.databases {
            session = session.with_database(Database::connect(db).await?);
        }

        info!(
            "Session ready: {} application(s), {} database(s)",
            session.registry.apps().count(),
            session.databases.len()
        );
        Ok(session)
    }

    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn with_database(mut self, database: Database) -> Self {
        self.databases.insert(database.id().to_string(), database);
        self
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn dispatcher(&self) -> &HttpDispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Clears all scenario state and re-seeds the application variables
    pub fn reset(&self) {
        self.context.clear();
        self.context.seed_application_vars(&self.registry);
        self.permanent_headers.write().clear();
        self.queue_headers.write().clear();
        debug!("Session state reset");
    }

    pub fn permanent_headers(&self) -> Headers {
        self.permanent_headers.read().clone()
    }

    pub fn set_permanent_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.permanent_headers.write().insert(name.into(), value.into());
    }

    pub fn queue_headers(&self) -> Headers {
        self.queue_headers.read().clone()
    }

    pub fn set_queue_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.queue_headers.write().insert(name.into(), value.into());
    }

    pub fn queue(&self) -> AccordResult<&dyn MessageQueue> {
        self.queue
            .as_deref()
            .ok_or(AccordError::FixtureDisabled { fixture: "Queue" })
    }

    pub fn storage(&self) -> AccordResult<&dyn ObjectStorage> {
        self.storage
            .as_deref()
            .ok_or(AccordError::FixtureDisabled { fixture: "Object storage" })
    }

    pub fn mailbox(&self) -> AccordResult<&dyn Mailbox> {
        self.mailbox
            .as_deref()
            .ok_or(AccordError::FixtureDisabled { fixture: "Mailbox" })
    }

    pub fn database(&self, id: &str) -> AccordResult<&Database> {
        self.databases
            .get(id)
            .ok_or_else(|| AccordError::InvalidConfig(format!("Unknown database: {}", id)))
    }

    /// Resource path relative to the configured resources directory
    pub fn resource_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.settings.resources_dir.join(path)
        }
    }

    pub fn read_resource(&self, path: &Path) -> AccordResult<Vec<u8>> {
        let full = self.resource_path(path);
        std::fs::read(&full).map_err(|e| {
            AccordError::InvalidConfig(format!("Cannot read resource {}: {}", full.display(), e))
        })
    }

    pub fn read_resource_text(&self, path: &Path) -> AccordResult<String> {
        let bytes = self.read_resource(path)?;
        String::from_utf8(bytes).map_err(|_| {
            AccordError::InvalidConfig(format!("Resource {} is not UTF-8 text", path.display()))
        })
    }

    /// Blocks until every registered application is ready
    pub async fn wait_until_ready(&self) -> AccordResult<()> {
        let policy = ReadinessPolicy {
            timeout: self.settings.readiness_timeout(),
            interval: self.settings.probe_interval(),
        };
        self.registry.wait_until_ready(&self.dispatcher, policy).await
    }
}
