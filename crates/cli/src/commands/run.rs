//! Run Command

use std::path::PathBuf;

use accord_engine::{SuiteConfig, TestResult, TestRunner, TestSuiteResult};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;

use crate::output::{print_error, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct RunArgs {
    /// Only run scenarios carrying this tag
    #[arg(short, long, conflicts_with = "name")]
    tag: Option<String>,

    /// Run a single scenario by name
    #[arg(short, long)]
    name: Option<String>,

    /// Directory holding the feature files
    #[arg(long)]
    features: Option<PathBuf>,

    /// Directory for test-results.json
    #[arg(long)]
    output: Option<PathBuf>,

    /// Skip writing test-results.json
    #[arg(long)]
    no_results: bool,
}

#[derive(Serialize)]
pub struct ScenarioDisplay {
    pub feature: String,
    pub scenario: String,
    pub status: String,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl From<&TestResult> for ScenarioDisplay {
    fn from(result: &TestResult) -> Self {
        let status = if result.skipped {
            "skipped"
        } else if result.success {
            "passed"
        } else {
            "failed"
        };
        Self {
            feature: result.feature.clone(),
            scenario: result.name.clone(),
            status: status.to_string(),
            duration_ms: result.duration_ms,
            error: result.error.clone(),
        }
    }
}

impl TableDisplay for ScenarioDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Feature", "Scenario", "Status", "Time (ms)", "Error"]
    }

    fn row(&self) -> Vec<String> {
        let status = match self.status.as_str() {
            "passed" => self.status.green().to_string(),
            "failed" => self.status.red().to_string(),
            _ => self.status.yellow().to_string(),
        };
        vec![
            self.feature.clone(),
            self.scenario.clone(),
            status,
            self.duration_ms.to_string(),
            self.error.clone().unwrap_or_default(),
        ]
    }
}

/// Runs the selected scenarios; `Ok(false)` when any of them failed
pub async fn execute(args: RunArgs, config: &SuiteConfig, format: OutputFormat) -> Result<bool> {
    let mut runner = TestRunner::from_config(config)
        .await
        .context("Failed to set up the test session")?;
    if let Some(dir) = args.features {
        runner = runner.with_features_dir(dir);
    }
    if let Some(dir) = args.output {
        runner = runner.with_output_dir(dir);
    }

    let suite = match (&args.tag, &args.name) {
        (_, Some(name)) => single(runner.run_named(name).await?),
        (Some(tag), None) => runner.run_tagged(tag).await?,
        (None, None) => runner.run_all().await?,
    };

    let rows: Vec<ScenarioDisplay> = suite.results.iter().map(ScenarioDisplay::from).collect();
    print_list(&rows, format);

    if !args.no_results {
        runner.write_results(&suite)?;
    }

    let summary = format!(
        "{} passed, {} failed, {} skipped ({} ms)",
        suite.passed, suite.failed, suite.skipped, suite.duration_ms
    );
    if suite.success() {
        print_success(&summary);
    } else {
        print_error(&summary);
    }
    Ok(suite.success())
}

fn single(result: TestResult) -> TestSuiteResult {
    let (passed, failed, skipped) = match (result.skipped, result.success) {
        (true, _) => (0, 0, 1),
        (false, true) => (1, 0, 0),
        (false, false) => (0, 1, 0),
    };
    TestSuiteResult {
        total: 1,
        passed,
        failed,
        skipped,
        duration_ms: result.duration_ms,
        results: vec![result],
    }
}
