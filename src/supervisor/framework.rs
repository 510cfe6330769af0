use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunlaneError};
use crate::parser::OutputFormat;

const TARGET_PLACEHOLDER: &str = "{target}";

/// How to launch one test framework's runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkSpec {
    pub program: String,
    /// Argument template; `{target}` is replaced by the job target. When no
    /// argument mentions it, the target is appended.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl FrameworkSpec {
    pub fn new(program: &str, args: &[&str], format: OutputFormat) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            format,
            env: BTreeMap::new(),
        }
    }

    pub fn command_args(&self, target: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(TARGET_PLACEHOLDER, target))
            .collect();
        if !self.args.iter().any(|a| a.contains(TARGET_PLACEHOLDER)) && !target.is_empty() {
            args.push(target.to_string());
        }
        args
    }
}

/// Framework id to launch spec.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkRegistry {
    frameworks: BTreeMap<String, FrameworkSpec>,
}

impl Default for FrameworkRegistry {
    fn default() -> Self {
        let mut frameworks = BTreeMap::new();
        frameworks.insert(
            "cargo".to_string(),
            FrameworkSpec::new(
                "cargo",
                &["test", "--color", "never", "{target}"],
                OutputFormat::Libtest,
            ),
        );
        frameworks.insert(
            "pytest".to_string(),
            FrameworkSpec::new("pytest", &["-v", "-rA", "{target}"], OutputFormat::Pytest),
        );
        frameworks.insert(
            "jest".to_string(),
            FrameworkSpec::new("npx", &["jest", "--json", "{target}"], OutputFormat::JestJson),
        );
        frameworks.insert(
            "shell".to_string(),
            FrameworkSpec::new("sh", &["{target}"], OutputFormat::Auto),
        );
        frameworks.insert(
            "jsonl".to_string(),
            FrameworkSpec::new("sh", &["{target}"], OutputFormat::JsonLines),
        );
        Self { frameworks }
    }
}

impl FrameworkRegistry {
    /// Built-in frameworks, with configured entries added or replacing them.
    pub fn with_overrides(overrides: &BTreeMap<String, FrameworkSpec>) -> Self {
        let mut registry = Self::default();
        for (id, spec) in overrides {
            registry.frameworks.insert(id.clone(), spec.clone());
        }
        registry
    }

    pub fn get(&self, id: &str) -> Result<&FrameworkSpec> {
        self.frameworks
            .get(id)
            .ok_or_else(|| RunlaneError::UnknownFramework(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.frameworks.keys().map(String::as_str)
    }
}
