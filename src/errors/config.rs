// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a runner configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported config extension for {0} (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(PathBuf),

    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },

    #[error("step '{name}' has an empty command")]
    EmptyCommand { name: String },

    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("configuration validation failed:\n{}", bullet_list(.0))]
    Invalid(Vec<ConfigError>),
}

fn bullet_list(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
