//! Check Command

use std::path::PathBuf;

use accord_engine::runner::validate_features;
use accord_engine::{Feature, SuiteConfig};
use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use crate::output::{print_error, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct CheckArgs {
    /// Directory holding the feature files
    #[arg(long)]
    features: Option<PathBuf>,
}

#[derive(Serialize)]
pub struct FeatureDisplay {
    pub name: String,
    pub file: String,
    pub scenarios: usize,
    pub steps: usize,
}

impl From<&Feature> for FeatureDisplay {
    fn from(feature: &Feature) -> Self {
        let steps = feature
            .scenarios
            .iter()
            .map(|s| s.steps.len() + feature.background.len())
            .sum();
        Self {
            name: feature.name.clone(),
            file: feature
                .source
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            scenarios: feature.scenarios.len(),
            steps,
        }
    }
}

impl TableDisplay for FeatureDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Feature", "File", "Scenarios", "Steps"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.file.clone(),
            self.scenarios.to_string(),
            self.steps.to_string(),
        ]
    }
}

/// Parses every feature and resolves every step without contacting any service
pub fn execute(args: CheckArgs, config: &SuiteConfig, format: OutputFormat) -> Result<bool> {
    let dir = args.features.unwrap_or_else(|| config.runner.features_dir.clone());
    let features = Feature::load_all(&dir)
        .with_context(|| format!("Failed to load features from {}", dir.display()))?;

    let rows: Vec<FeatureDisplay> = features.iter().map(FeatureDisplay::from).collect();
    print_list(&rows, format);

    let problems = validate_features(&features);
    for problem in &problems {
        print_error(problem);
    }
    if problems.is_empty() {
        print_success(&format!("{} feature(s) are valid", features.len()));
    }
    Ok(problems.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_reports_unknown_phrases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orders.yaml"),
            r#"
name: orders
scenarios:
  - name: ok
    steps:
      - I expect HTTP status 200
  - name: typo
    steps:
      - I expectt HTTP status 200
"#,
        )
        .unwrap();

        let args = CheckArgs {
            features: Some(dir.path().to_path_buf()),
        };
        let valid = execute(args, &SuiteConfig::default(), OutputFormat::Plain).unwrap();
        assert!(!valid);
    }
}
