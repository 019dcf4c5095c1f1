//! Scenario runner: loads features, runs scenarios and reports results

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SuiteConfig;
use crate::context::Worker;
use crate::error::{AccordError, AccordResult};
use crate::session::Session;
use crate::spec::{Feature, Scenario, StepEntry};
use crate::steps;

/// Scenarios carrying this tag are reported as skipped
pub const SKIP_TAG: &str = "skip";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub feature: String,
    pub name: String,
    pub success: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
}

/// Result of running a set of scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl TestSuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

pub struct TestRunner {
    session: Session,
    features_dir: PathBuf,
    output_dir: PathBuf,
    ready: bool,
}

impl TestRunner {
    pub fn new(session: Session) -> Self {
        let features_dir = session.settings().features_dir.clone();
        let output_dir = session.settings().output_dir.clone();
        Self {
            session,
            features_dir,
            output_dir,
            ready: false,
        }
    }

    pub async fn from_config(config: &SuiteConfig) -> AccordResult<Self> {
        Ok(Self::new(Session::from_config(config).await?))
    }

    pub fn with_features_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.features_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Wait for the applications under test, once per runner
    pub async fn start(&mut self) -> AccordResult<()> {
        if self.ready {
            return Ok(());
        }
        self.session.wait_until_ready().await?;
        self.ready = true;
        Ok(())
    }

    pub fn load_features(&self) -> AccordResult<Vec<Feature>> {
        Feature::load_all(&self.features_dir)
    }

    /// Run every scenario in the features directory
    pub async fn run_all(&mut self) -> AccordResult<TestSuiteResult> {
        let features = self.load_features()?;
        self.run_features(&features, |_, _| true).await
    }

    /// Run scenarios carrying `tag` directly or through their feature
    pub async fn run_tagged(&mut self, tag: &str) -> AccordResult<TestSuiteResult> {
        let features = self.load_features()?;
        self.run_features(&features, |feature, scenario| {
            feature.scenario_tags(scenario).any(|t| t == tag)
        })
        .await
    }

    /// Run a single scenario by name
    pub async fn run_named(&mut self, name: &str) -> AccordResult<TestResult> {
        let features = self.load_features()?;
        let (feature, scenario) = features
            .iter()
            .find_map(|f| f.scenarios.iter().find(|s| s.name == name).map(|s| (f, s)))
            .ok_or_else(|| AccordError::InvalidConfig(format!("Scenario not found: {}", name)))?;

        self.start().await?;
        let result = self.run_scenario(feature, scenario).await;
        self.session.dispatcher().request_log().log_summary();
        Ok(result)
    }

    pub async fn run_features<F>(&mut self, features: &[Feature], filter: F) -> AccordResult<TestSuiteResult>
    where
        F: Fn(&Feature, &Scenario) -> bool,
    {
        let start = Instant::now();
        let selected: Vec<(&Feature, &Scenario)> = features
            .iter()
            .flat_map(|f| f.scenarios.iter().map(move |s| (f, s)))
            .filter(|&(f, s)| filter(f, s))
            .collect();

        self.start().await?;
        info!("Running {} scenario(s)...", selected.len());

        let mut results = Vec::with_capacity(selected.len());
        let (mut passed, mut failed, mut skipped) = (0, 0, 0);

        for (feature, scenario) in selected {
            let result = self.run_scenario(feature, scenario).await;
            if result.skipped {
                skipped += 1;
                info!("- {} (skipped)", result.name);
            } else if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.name, result.duration_ms);
            } else {
                failed += 1;
                error!(
                    "✗ {} - {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        self.session.dispatcher().request_log().log_summary();
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        Ok(TestSuiteResult {
            total: results.len(),
            passed,
            failed,
            skipped,
            duration_ms,
            results,
        })
    }

    /// Runs the feature background then the scenario steps, stopping at the
    /// first failing step
    pub async fn run_scenario(&self, feature: &Feature, scenario: &Scenario) -> TestResult {
        let start = Instant::now();
        let mut result = TestResult {
            feature: feature.name.clone(),
            name: scenario.name.clone(),
            success: true,
            skipped: false,
            duration_ms: 0,
            steps: Vec::new(),
            error: None,
        };

        if feature.scenario_tags(scenario).any(|t| t == SKIP_TAG) {
            result.skipped = true;
            return result;
        }

        debug!("Running scenario: {} / {}", feature.name, scenario.name);
        self.session.reset();
        let mut worker = Worker::new();

        for entry in feature.background.iter().chain(scenario.steps.iter()) {
            let step_result = self.run_step(&mut worker, entry).await;
            let failed = !step_result.success;
            if failed {
                result.success = false;
                result.error = step_result.error.clone();
            }
            result.steps.push(step_result);
            if failed {
                break;
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn run_step(&self, worker: &mut Worker, entry: &StepEntry) -> StepResult {
        let start = Instant::now();
        let name = entry.describe();
        debug!("Executing step: {}", name);

        let outcome = match entry.to_step() {
            Ok(step) => steps::execute(&self.session, worker, &step).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            warn!("Step failed: {} ({})", name, e);
        }

        StepResult {
            step: name,
            success: outcome.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    /// Write results to `test-results.json` in the output directory
    pub fn write_results(&self, results: &TestSuiteResult) -> AccordResult<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Resolves every step of every feature without running anything; returns
/// one message per step that fails to resolve
pub fn validate_features(features: &[Feature]) -> Vec<String> {
    let mut problems = Vec::new();
    for feature in features {
        let location = feature
            .source
            .as_deref()
            .map(Path::display)
            .map(|d| d.to_string())
            .unwrap_or_else(|| feature.name.clone());

        let background = feature.background.iter().map(|e| ("background", e));
        let scenarios = feature
            .scenarios
            .iter()
            .flat_map(|s| s.steps.iter().map(move |e| (s.name.as_str(), e)));
        for (scope, entry) in background.chain(scenarios) {
            if let Err(e) = entry.to_step() {
                problems.push(format!("{} [{}]: {}", location, scope, e));
            }
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerSettings;
    use crate::registry::AppRegistry;

    fn runner() -> TestRunner {
        TestRunner::new(Session::new(AppRegistry::new(), RunnerSettings::default()).unwrap())
    }

    fn feature() -> Feature {
        Feature::from_yaml(
            r#"
name: context
background:
  - I store the value "acme" as "TENANT"
scenarios:
  - name: passes
    steps:
      - I store the value "${TENANT}-1" as "ID"
      - action: log
        message: "id is ${ID}"
  - name: fails on unknown variable
    steps:
      - action: log
        message: "${NOPE}"
      - action: log
        message: never reached
  - name: skipped
    tags: [skip]
    steps:
      - the moon is made of cheese
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_features_counts_outcomes() {
        let mut runner = runner();
        let suite = runner.run_features(&[feature()], |_, _| true).await.unwrap();

        assert_eq!(suite.total, 3);
        assert_eq!((suite.passed, suite.failed, suite.skipped), (1, 1, 1));
        assert!(!suite.success());

        let failed = &suite.results[1];
        assert_eq!(failed.steps.len(), 2, "background plus the failing step");
        assert!(failed.error.as_deref().unwrap().contains("NOPE"));
    }

    #[tokio::test]
    async fn test_scenarios_do_not_share_context() {
        let runner = runner();
        let feature = feature();
        runner.run_scenario(&feature, &feature.scenarios[0]).await;
        assert!(runner.session().context().contains("ID"));

        runner.run_scenario(&feature, &feature.scenarios[1]).await;
        assert!(!runner.session().context().contains("ID"));
        assert!(runner.session().context().contains("TENANT"));
    }

    #[test]
    fn test_validate_features_reports_unknown_phrases() {
        let problems = validate_features(&[feature()]);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("skipped"));
    }

    #[test]
    fn test_write_results() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner().with_output_dir(dir.path());
        let suite = TestSuiteResult {
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_ms: 0,
            results: vec![],
        };
        let path = runner.write_results(&suite).unwrap();
        assert!(path.ends_with("test-results.json"));
        assert!(std::fs::read_to_string(path).unwrap().contains("\"total\": 0"));
    }
}
