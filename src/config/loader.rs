// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::consts::DEFAULT_POLL_INTERVAL_MS;
use crate::engine::CoordinatorOptions;
use crate::errors::ConfigError;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one `parstep` run.
///
/// Loaded from YAML or TOML, chosen by file extension.
///
/// # Example
/// ```yaml
/// max_parallel: 2
/// hide_output_after_errors: true
/// poll_interval_ms: 250
/// steps:
///   - name: lint
///     command: ["cargo", "clippy"]
///   - name: unit
///     command: ["cargo", "test", "--lib"]
///     cwd: crates/core
/// ```
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Upper bound on concurrently running steps; unbounded when absent.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub hide_output_after_errors: bool,
    #[serde(default)]
    pub halt_on_error: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub steps: Vec<CommandStepConfig>,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// One external command run as a parallel step.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct CommandStepConfig {
    pub name: String,
    /// Program followed by its arguments; no shell is involved.
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RunnerConfig {
    /// Check the config for values that cannot run, reporting all of them.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if self.max_parallel == Some(0) {
            errors.push(ConfigError::MustBePositive {
                field: "max_parallel",
            });
        }
        if self.poll_interval_ms == 0 {
            errors.push(ConfigError::MustBePositive {
                field: "poll_interval_ms",
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.command.is_empty() || step.command[0].trim().is_empty() {
                errors.push(ConfigError::EmptyCommand {
                    name: step.name.clone(),
                });
            }
            if !seen.insert(step.name.as_str()) {
                errors.push(ConfigError::DuplicateStep(step.name.clone()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            max_parallel: self.max_parallel,
            hide_output_after_errors: self.hide_output_after_errors,
            halt_on_error: self.halt_on_error,
            poll_interval: self.poll_interval(),
        }
    }
}

/// Load a config from a `.yaml`, `.yml` or `.toml` file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RunnerConfig, ConfigError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    let is_toml = match extension.as_deref() {
        Some("yaml") | Some("yml") => false,
        Some("toml") => true,
        _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    };

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: RunnerConfig = if is_toml {
        toml::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(cfg)
}

/// Load a config and reject it if any value cannot run.
pub fn load_and_validate_config<P: AsRef<Path>>(path: P) -> Result<RunnerConfig, ConfigError> {
    let cfg = load_config(path)?;
    cfg.validate().map_err(ConfigError::Invalid)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_yaml_config() {
        let yaml = r#"
max_parallel: 2
halt_on_error: true
steps:
  - name: hello
    command: ["echo", "hello"]
  - name: build
    command: ["make", "-j4"]
    cwd: /tmp
    env:
      CC: clang
"#;

        let cfg: RunnerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.max_parallel, Some(2));
        assert!(cfg.halt_on_error);
        assert!(!cfg.hide_output_after_errors);
        assert_eq!(cfg.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(cfg.steps.len(), 2);
        assert_eq!(cfg.steps[1].cwd.as_deref(), Some(Path::new("/tmp")));
        assert_eq!(cfg.steps[1].env.get("CC").map(String::as_str), Some("clang"));
    }

    #[test]
    fn toml_and_yaml_load_the_same_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("run.yml");
        let toml_path = dir.path().join("run.toml");

        fs::write(
            &yaml_path,
            "poll_interval_ms: 100\nsteps:\n  - name: a\n    command: [\"true\"]\n",
        )
        .unwrap();
        fs::write(
            &toml_path,
            "poll_interval_ms = 100\n\n[[steps]]\nname = \"a\"\ncommand = [\"true\"]\n",
        )
        .unwrap();

        let from_yaml = load_config(&yaml_path).unwrap();
        let from_toml = load_config(&toml_path).unwrap();
        assert_eq!(from_yaml, from_toml);
        assert_eq!(from_toml.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let result = load_config("runner.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn missing_file_reports_its_path() {
        let error = load_config("/nonexistent/parstep.yaml").unwrap_err();
        assert!(error.to_string().contains("/nonexistent/parstep.yaml"));
    }

    #[test]
    fn validation_collects_every_problem() {
        let yaml = r#"
max_parallel: 0
poll_interval_ms: 0
steps:
  - name: twice
    command: ["true"]
  - name: twice
    command: []
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, yaml).unwrap();

        let error = load_and_validate_config(&path).unwrap_err();
        let ConfigError::Invalid(errors) = &error else {
            panic!("expected validation failure, got {error}");
        };
        assert_eq!(errors.len(), 4);

        let message = error.to_string();
        assert!(message.contains("max_parallel must be greater than zero"));
        assert!(message.contains("poll_interval_ms must be greater than zero"));
        assert!(message.contains("step 'twice' has an empty command"));
        assert!(message.contains("duplicate step name: 'twice'"));
    }

    #[test]
    fn coordinator_options_follow_the_config() {
        let cfg: RunnerConfig = serde_yaml::from_str(
            "max_parallel: 3\nhide_output_after_errors: true\npoll_interval_ms: 20\nsteps: []\n",
        )
        .unwrap();
        assert!(cfg.validate().is_ok());

        let options = cfg.coordinator_options();
        assert_eq!(options.max_parallel, Some(3));
        assert!(options.hide_output_after_errors);
        assert!(!options.halt_on_error);
        assert_eq!(options.poll_interval, Duration::from_millis(20));
    }
}
