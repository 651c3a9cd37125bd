//! GT-003: Environment resolution.
//!
//! Precedence, highest first: explicit override, environment variable,
//! branch-name mapping, directory-name convention, configured default.
//! All context (branch, cwd, env-var value) is supplied by the caller.

use super::error::{Error, Result};
use super::types::*;
use indexmap::IndexMap;
use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

/// Prefix stripped from branch and directory names (`ENV-prod` → `prod`).
pub const ENV_PREFIX: &str = "ENV-";

/// Environment variables consulted, in order.
pub const ENV_VARS: [&str; 2] = ["GANTRY_ENV", "DEPLOY_ENVIRONMENT"];

/// Context signals gathered by the caller.
#[derive(Debug, Clone, Default)]
pub struct ResolveInputs<'a> {
    pub explicit: Option<&'a str>,
    pub env_var: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub cwd: Option<&'a Path>,
}

/// Maps a branch name to an environment name.
pub trait BranchMatcher {
    fn environment_for(&self, branch: &str) -> Option<String>;
}

/// Regex rules from `branch_mapping`, then the `ENV-<name>` convention.
#[derive(Debug, Clone)]
pub struct PatternBranchMatcher {
    rules: Vec<(Regex, Option<String>)>,
}

impl PatternBranchMatcher {
    pub fn from_rules(rules: &[BranchRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                Error::ConfigParse(format!("invalid branch pattern '{}': {}", rule.pattern, e))
            })?;
            if rule.environment.is_none() && re.capture_names().all(|n| n != Some("env")) {
                return Err(Error::ConfigParse(format!(
                    "branch pattern '{}' has neither an environment nor an 'env' capture group",
                    rule.pattern
                )));
            }
            compiled.push((re, rule.environment.clone()));
        }
        Ok(Self { rules: compiled })
    }
}

impl BranchMatcher for PatternBranchMatcher {
    fn environment_for(&self, branch: &str) -> Option<String> {
        for (re, fixed) in &self.rules {
            if let Some(caps) = re.captures(branch) {
                let name = match fixed {
                    Some(env) => Some(env.clone()),
                    None => caps.name("env").map(|m| m.as_str().to_string()),
                };
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    return Some(name);
                }
            }
        }
        branch
            .strip_prefix(ENV_PREFIX)
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }
}

/// Read the first non-empty environment variable from [`ENV_VARS`].
pub fn env_var_value() -> Option<String> {
    ENV_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|v| !v.trim().is_empty())
}

/// Resolve the active environment.
pub fn resolve(
    inputs: &ResolveInputs,
    config: &GantryConfig,
    matcher: &dyn BranchMatcher,
) -> Result<Environment> {
    let (name, source) = pick(inputs, config, matcher).ok_or_else(|| {
        Error::EnvironmentUnresolved(
            "no --env flag, GANTRY_ENV/DEPLOY_ENVIRONMENT variable, matching branch, \
             environment directory, or default_environment"
                .to_string(),
        )
    })?;

    if !config.environments.is_empty() && !config.environments.contains_key(&name) {
        warn!(environment = %name, "environment is not declared in config; no environment params apply");
    }
    debug!(environment = %name, source = %source, "resolved environment");

    let params = config
        .environments
        .get(&name)
        .map(|decl| stringify_params(&decl.params))
        .unwrap_or_default();
    Ok(Environment::new(name, source, params))
}

fn pick(
    inputs: &ResolveInputs,
    config: &GantryConfig,
    matcher: &dyn BranchMatcher,
) -> Option<(String, EnvironmentSource)> {
    if let Some(name) = non_empty(inputs.explicit) {
        return Some((name, EnvironmentSource::Explicit));
    }
    if let Some(name) = non_empty(inputs.env_var) {
        return Some((name, EnvironmentSource::EnvVar));
    }
    if !config.ignore_git_branch {
        if let Some(name) = inputs.branch.and_then(|b| matcher.environment_for(b)) {
            return Some((name, EnvironmentSource::Branch));
        }
    }
    if let Some(name) = inputs.cwd.and_then(|cwd| directory_environment(cwd, config)) {
        return Some((name, EnvironmentSource::Directory));
    }
    config
        .default_environment
        .clone()
        .filter(|d| !d.is_empty())
        .map(|d| (d, EnvironmentSource::Default))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Directory convention: the cwd's last component, `ENV-` prefix stripped.
fn directory_environment(cwd: &Path, config: &GantryConfig) -> Option<String> {
    let dir = cwd.file_name()?.to_str()?;
    let name = dir.strip_prefix(ENV_PREFIX).unwrap_or(dir);
    if name.is_empty() {
        return None;
    }
    if config.environments.contains_key(name) {
        return Some(name.to_string());
    }
    if config.environments.is_empty() && config.ignore_git_branch {
        return Some(name.to_string());
    }
    None
}

fn stringify_params(params: &IndexMap<String, serde_json::Value>) -> IndexMap<String, String> {
    params
        .iter()
        .filter_map(|(k, v)| param_value_to_string(v).map(|s| (k.clone(), s)))
        .collect()
}
