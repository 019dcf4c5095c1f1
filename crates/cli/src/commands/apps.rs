//! Application Commands

use accord_engine::{AppRegistry, ApplicationInfo, Session, SuiteConfig};
use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::output::{print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum AppsCommands {
    /// List the registered applications
    List,

    /// Wait until every application answers on both ports
    Wait {
        /// Override the readiness timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Serialize)]
pub struct AppDisplay {
    pub prefix: String,
    pub url: String,
    pub admin_url: String,
    pub health_check: String,
}

impl From<&ApplicationInfo> for AppDisplay {
    fn from(app: &ApplicationInfo) -> Self {
        Self {
            prefix: app.url_prefix.clone(),
            url: app.http_url(),
            admin_url: app.admin_url(),
            health_check: app.admin_health_check_url.clone(),
        }
    }
}

impl TableDisplay for AppDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Prefix", "URL", "Admin URL", "Health Check"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.prefix.clone(),
            self.url.clone(),
            self.admin_url.clone(),
            self.health_check.clone(),
        ]
    }
}

pub async fn execute(cmd: AppsCommands, config: &SuiteConfig, format: OutputFormat) -> Result<bool> {
    match cmd {
        AppsCommands::List => {
            let rows: Vec<AppDisplay> = config.applications.iter().map(AppDisplay::from).collect();
            print_list(&rows, format);
        }
        AppsCommands::Wait { timeout } => {
            let registry = AppRegistry::from_apps(config.applications.iter().cloned());
            if registry.is_empty() {
                print_warning("No applications configured");
                return Ok(true);
            }

            let mut settings = config.runner.clone();
            if let Some(secs) = timeout {
                settings.readiness_timeout_secs = secs;
            }
            Session::new(registry, settings)?.wait_until_ready().await?;
            print_success("All applications are ready");
        }
    }
    Ok(true)
}
