//! GT-004: YAML parsing, validation and module loading.
//!
//! Parses gantry.yml and validates structural constraints:
//! - Version must be "1.0"
//! - Name must not be empty
//! - Module paths must not be empty, `max_parallel` must be at least 1
//!
//! Loading then expands module paths, merges per-module descriptor files,
//! resolves backend kinds, enablement and parameter overlays for one
//! environment, and checks id uniqueness and dependency references.

use super::error::{Error, Result};
use super::resolver::{self, TemplateContext};
use super::types::*;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default config file name.
pub const CONFIG_FILE: &str = "gantry.yml";

/// Optional descriptor file inside a module directory.
pub const MODULE_DESCRIPTOR: &str = "gantry.module.yml";

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Read a gantry.yml file from disk, returning the raw text alongside the parsed config.
pub fn parse_config_file(path: &Path) -> Result<(GantryConfig, String)> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let config = parse_config(&content)?;
    Ok((config, content))
}

/// Parse a gantry.yml from a string.
pub fn parse_config(yaml: &str) -> Result<GantryConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| Error::ConfigParse(format!("YAML parse error: {}", e)))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &GantryConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError {
            message: format!("version must be \"1.0\", got \"{}\"", config.version),
        });
    }

    if config.name.is_empty() {
        errors.push(ValidationError {
            message: "name must not be empty".to_string(),
        });
    }

    if config.settings.max_parallel == 0 {
        errors.push(ValidationError {
            message: "settings.max_parallel must be at least 1".to_string(),
        });
    }

    if let Some(ref default) = config.default_environment {
        if !config.environments.is_empty() && !config.environments.contains_key(default) {
            errors.push(ValidationError {
                message: format!("default_environment '{}' is not declared", default),
            });
        }
    }

    for (i, decl) in config.modules.iter().enumerate() {
        if decl.path.trim().is_empty() {
            errors.push(ValidationError {
                message: format!("module #{} has an empty path", i + 1),
            });
        }
        if let Some(ref id) = decl.id {
            if id.trim().is_empty() {
                errors.push(ValidationError {
                    message: format!("module #{} has an empty id", i + 1),
                });
            }
        }
    }

    errors
}

/// Parse and validate, folding validation errors into one config error.
pub fn parse_and_validate(path: &Path) -> Result<(GantryConfig, String)> {
    let (config, raw) = parse_config_file(path)?;
    let errors = validate_config(&config);
    if errors.is_empty() {
        return Ok((config, raw));
    }
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::ConfigParse(format!("validation failed: {}", joined)))
}

/// Load every declared module for one environment, in declaration order.
pub fn load_modules(root: &Path, config: &GantryConfig, env: &Environment) -> Result<Vec<Module>> {
    let mut modules: Vec<Module> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for decl in &config.modules {
        for (id, path) in expand_paths(root, decl)? {
            if !seen.insert(id.clone()) {
                return Err(Error::DuplicateModuleId(id));
            }
            let descriptor = load_descriptor(&path)?;
            let index = modules.len();
            let module = build_module(config, env, decl, &descriptor, id, path, index)?;
            debug!(
                module = %module.id,
                backend = %module.backend,
                enabled = module.enabled,
                "loaded module"
            );
            modules.push(module);
        }
    }

    check_references(&modules)?;
    Ok(modules)
}

/// Expand a declaration into `(id, path)` pairs. Glob patterns yield one module per match.
fn expand_paths(root: &Path, decl: &ModuleDecl) -> Result<Vec<(String, PathBuf)>> {
    let is_glob = decl.path.contains(['*', '?', '[']);
    if !is_glob {
        let path = root.join(&decl.path);
        if !path.exists() {
            warn!(path = %path.display(), "module path does not exist");
        }
        let id = match decl.id {
            Some(ref id) => id.clone(),
            None => module_id_from_path(&path)?,
        };
        return Ok(vec![(id, path)]);
    }

    if decl.id.is_some() {
        return Err(Error::ConfigParse(format!(
            "module path '{}' is a glob pattern and cannot carry an explicit id",
            decl.path
        )));
    }

    let pattern = root.join(&decl.path);
    let pattern = pattern.to_string_lossy();
    let entries = glob::glob(&pattern)
        .map_err(|e| Error::ConfigParse(format!("invalid module path pattern '{}': {}", decl.path, e)))?;

    let mut matches: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_dir())
        .collect();
    matches.sort();

    if matches.is_empty() {
        return Err(Error::ConfigParse(format!(
            "module path pattern '{}' matched no directories",
            decl.path
        )));
    }

    matches
        .into_iter()
        .map(|p| module_id_from_path(&p).map(|id| (id, p)))
        .collect()
}

fn module_id_from_path(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::ConfigParse(format!("cannot derive module id from '{}'", path.display())))
}

/// Read `gantry.module.yml` if present.
fn load_descriptor(module_path: &Path) -> Result<ModuleDescriptor> {
    let path = module_path.join(MODULE_DESCRIPTOR);
    if !path.is_file() {
        return Ok(ModuleDescriptor::default());
    }
    let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
    serde_yaml_ng::from_str(&content)
        .map_err(|e| Error::ConfigParse(format!("{}: {}", path.display(), e)))
}

fn build_module(
    config: &GantryConfig,
    env: &Environment,
    decl: &ModuleDecl,
    descriptor: &ModuleDescriptor,
    id: String,
    path: PathBuf,
    declaration_index: usize,
) -> Result<Module> {
    let options = decl.options.merged_over(&descriptor.options);

    let backend = decl
        .backend
        .or(descriptor.backend)
        .or_else(|| BackendKind::from_suffix(&path))
        .or_else(|| (!options.commands.is_empty()).then_some(BackendKind::Script))
        .ok_or_else(|| {
            Error::ConfigParse(format!(
                "cannot determine backend for module '{}': set `type` or use a .cfn/.tf/.sls/.cdk directory",
                id
            ))
        })?;

    let depends_on = if decl.depends_on.is_empty() {
        descriptor.depends_on.clone()
    } else {
        decl.depends_on.clone()
    };

    let mut environments = descriptor.environments.clone();
    environments.extend(decl.environments.clone());

    let mut module_params = descriptor.params.clone();
    module_params.extend(decl.params.clone());

    let mut env_vars = descriptor.env_vars.clone();
    env_vars.extend(decl.env_vars.clone());

    let overlay = environments.get(env.name());
    let enabled = is_enabled(&environments, overlay);
    let overlay_params = match overlay {
        Some(EnvOverlay::Params(p)) => Some(p),
        _ => None,
    };

    let ctx = TemplateContext {
        environment: env,
        namespace: config.namespace(),
        module_id: &id,
    };
    // Disabled modules never reach an adapter; their templates stay unexpanded.
    let params = merge_params(&config.params, &module_params, overlay_params, enabled.then_some(&ctx))
        .map_err(|e| Error::ConfigParse(format!("module '{}': {}", id, e)))?;

    Ok(Module {
        id,
        path,
        backend,
        depends_on,
        params,
        env_vars,
        options,
        enabled,
        declaration_index,
    })
}

/// `false` overlay disables; a non-empty overlay map restricts to listed environments.
fn is_enabled(environments: &IndexMap<String, EnvOverlay>, overlay: Option<&EnvOverlay>) -> bool {
    match overlay {
        Some(EnvOverlay::Toggle(enabled)) => *enabled,
        Some(EnvOverlay::Params(_)) => true,
        None => environments.is_empty(),
    }
}

/// Total merge: environment overlay wins, then module, then global.
/// `null` at the winning layer yields an explicit `Unset`. Templates are
/// expanded only when a context is given.
fn merge_params(
    global: &IndexMap<String, serde_json::Value>,
    module: &IndexMap<String, serde_json::Value>,
    overlay: Option<&IndexMap<String, serde_json::Value>>,
    ctx: Option<&TemplateContext>,
) -> std::result::Result<IndexMap<String, ParamValue>, String> {
    let mut layered: IndexMap<String, &serde_json::Value> = IndexMap::new();
    for (k, v) in global {
        layered.insert(k.clone(), v);
    }
    for (k, v) in module {
        layered.insert(k.clone(), v);
    }
    if let Some(overlay) = overlay {
        for (k, v) in overlay {
            layered.insert(k.clone(), v);
        }
    }

    let mut merged = IndexMap::with_capacity(layered.len());
    for (key, value) in layered {
        let resolved = match (param_value_to_string(value), ctx) {
            (Some(raw), Some(ctx)) => ParamValue::Set(
                resolver::resolve_template(&raw, ctx).map_err(|e| format!("param '{}': {}", key, e))?,
            ),
            (Some(raw), None) => ParamValue::Set(raw),
            (None, _) => ParamValue::Unset,
        };
        merged.insert(key, resolved);
    }
    Ok(merged)
}

/// Every `depends_on` id must name a loaded module, and never the module itself.
/// An enabled module may only read outputs of its own dependencies, and only
/// from backends that expose them.
fn check_references(modules: &[Module]) -> Result<()> {
    let ids: HashSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();
    for module in modules {
        if module.enabled {
            check_output_refs(module, modules)?;
        }
        for dep in &module.depends_on {
            if dep == &module.id {
                return Err(Error::CyclicDependency(vec![module.id.clone()]));
            }
            if !ids.contains(dep.as_str()) {
                return Err(Error::MissingDependency {
                    module: module.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_output_refs(module: &Module, modules: &[Module]) -> Result<()> {
    for output in resolver::module_output_refs(module) {
        if !module.depends_on.contains(&output.module) {
            return Err(Error::ConfigParse(format!(
                "module '{}' reads outputs of '{}' but does not depend on it",
                module.id, output.module
            )));
        }
        let Some(source) = modules.iter().find(|m| m.id == output.module) else {
            continue;
        };
        if !source.backend.exposes_outputs() {
            return Err(Error::ConfigParse(format!(
                "module '{}' reads outputs of '{}', but the {} backend does not expose outputs",
                module.id, source.id, source.backend
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Environment {
        let mut params = IndexMap::new();
        params.insert("region".to_string(), "us-east-1".to_string());
        Environment::new(name, EnvironmentSource::Explicit, params)
    }

    fn load(yaml: &str, env_name: &str) -> Result<Vec<Module>> {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(yaml)?;
        load_modules(dir.path(), &config, &env(env_name))
    }

    #[test]
    fn test_gt004_parse_valid() {
        let yaml = r#"
version: "1.0"
name: test
modules:
  - path: vpc.cfn
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.name, "test");
        assert_eq!(config.settings.max_parallel, 1);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_gt004_parse_invalid_yaml() {
        let result = parse_config("version: [unclosed");
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }

    #[test]
    fn test_gt004_unknown_backend_type() {
        let yaml = r#"
version: "1.0"
name: test
modules:
  - path: app
    type: pulumi
"#;
        assert!(matches!(parse_config(yaml), Err(Error::ConfigParse(_))));
    }

    #[test]
    fn test_gt004_validate_errors() {
        let yaml = r#"
version: "2.0"
name: ""
default_environment: qa
environments:
  dev: {}
settings:
  max_parallel: 0
modules:
  - path: ""
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn test_gt004_backend_inference() {
        let mods = load(
            r#"
version: "1.0"
name: test
modules:
  - path: network/vpc.cfn
  - path: app.tf
  - path: api.sls
  - path: web.cdk
  - path: hooks
    options:
      commands:
        deploy: ./deploy.sh
  - path: custom
    type: terraform
"#,
            "dev",
        )
        .unwrap();
        let kinds: Vec<(String, BackendKind)> =
            mods.iter().map(|m| (m.id.clone(), m.backend)).collect();
        assert_eq!(
            kinds,
            vec![
                ("vpc".to_string(), BackendKind::Cloudformation),
                ("app".to_string(), BackendKind::Terraform),
                ("api".to_string(), BackendKind::Serverless),
                ("web".to_string(), BackendKind::Cdk),
                ("hooks".to_string(), BackendKind::Script),
                ("custom".to_string(), BackendKind::Terraform),
            ]
        );
        assert_eq!(mods[5].declaration_index, 5);
    }

    #[test]
    fn test_gt004_backend_unresolvable() {
        let result = load(
            r#"
version: "1.0"
name: test
modules:
  - path: mystery
"#,
            "dev",
        );
        assert!(matches!(result, Err(Error::ConfigParse(msg)) if msg.contains("mystery")));
    }

    #[test]
    fn test_gt004_duplicate_id() {
        let result = load(
            r#"
version: "1.0"
name: test
modules:
  - path: a/vpc.cfn
  - path: b/vpc.cfn
"#,
            "dev",
        );
        assert!(matches!(result, Err(Error::DuplicateModuleId(id)) if id == "vpc"));
    }

    #[test]
    fn test_gt004_missing_dependency() {
        let result = load(
            r#"
version: "1.0"
name: test
modules:
  - path: app.tf
    depends_on: [db]
"#,
            "dev",
        );
        match result {
            Err(Error::MissingDependency { module, dependency }) => {
                assert_eq!(module, "app");
                assert_eq!(dependency, "db");
            }
            other => panic!("expected MissingDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_gt004_self_dependency() {
        let result = load(
            r#"
version: "1.0"
name: test
modules:
  - path: app.tf
    depends_on: [app]
"#,
            "dev",
        );
        assert!(matches!(result, Err(Error::CyclicDependency(_))));
    }

    #[test]
    fn test_gt004_enablement() {
        let yaml = r#"
version: "1.0"
name: test
modules:
  - path: everywhere.tf
  - path: prod-only.tf
    environments:
      prod: true
  - path: not-dev.tf
    environments:
      dev: false
      prod: true
  - path: dev-params.tf
    environments:
      dev: {size: small}
"#;
        let dev = load(yaml, "dev").unwrap();
        let enabled: Vec<bool> = dev.iter().map(|m| m.enabled).collect();
        assert_eq!(enabled, vec![true, false, false, true]);

        let prod = load(yaml, "prod").unwrap();
        let enabled: Vec<bool> = prod.iter().map(|m| m.enabled).collect();
        assert_eq!(enabled, vec![true, true, true, false]);
    }

    #[test]
    fn test_gt004_param_merge_is_total() {
        let mods = load(
            r#"
version: "1.0"
name: test
namespace: acme
params:
  owner: platform
  tier: standard
  debug: true
modules:
  - path: app.tf
    params:
      tier: premium
      size: large
      bucket: "{{namespace}}-{{env.name}}-{{module.id}}"
    environments:
      dev:
        size: small
        debug: null
        region_copy: "{{env.region}}"
"#,
            "dev",
        )
        .unwrap();
        let p = &mods[0].params;
        assert_eq!(p["owner"], ParamValue::Set("platform".to_string()));
        assert_eq!(p["tier"], ParamValue::Set("premium".to_string()));
        assert_eq!(p["size"], ParamValue::Set("small".to_string()));
        assert_eq!(p["debug"], ParamValue::Unset);
        assert_eq!(p["bucket"], ParamValue::Set("acme-dev-app".to_string()));
        assert_eq!(p["region_copy"], ParamValue::Set("us-east-1".to_string()));
        assert_eq!(mods[0].param("debug"), None);
        assert_eq!(mods[0].set_params().count(), 5);
    }

    #[test]
    fn test_gt004_unknown_template_is_config_error() {
        let result = load(
            r#"
version: "1.0"
name: test
modules:
  - path: app.tf
    params:
      x: "{{env.nope}}"
"#,
            "dev",
        );
        assert!(matches!(result, Err(Error::ConfigParse(msg)) if msg.contains("module 'app'")));
    }

    #[test]
    fn test_gt004_disabled_module_templates_not_expanded() {
        let yaml = r#"
version: "1.0"
name: test
modules:
  - path: app.tf
  - path: cache.tf
    params:
      count: "{{env.replicas}}"
    environments:
      prod: true
"#;
        let dev = load(yaml, "dev").unwrap();
        assert!(dev[0].enabled);
        assert!(!dev[1].enabled);
        assert_eq!(dev[1].params["count"], ParamValue::Set("{{env.replicas}}".to_string()));

        // Enabled in prod, where `replicas` is not declared by this environment.
        let prod = load(yaml, "prod");
        assert!(matches!(prod, Err(Error::ConfigParse(msg)) if msg.contains("module 'cache'")));
    }

    #[test]
    fn test_gt004_output_references() {
        let yaml = r#"
version: "1.0"
name: test
modules:
  - path: vpc.cfn
  - path: app.tf
    depends_on: [vpc]
    params:
      vpc_id: "{{output vpc::VpcId}}"
      label: "{{env.name}}"
"#;
        let mods = load(yaml, "dev").unwrap();
        assert_eq!(mods[1].params["vpc_id"], ParamValue::Set("{{output vpc::VpcId}}".to_string()));
        assert_eq!(mods[1].params["label"], ParamValue::Set("dev".to_string()));

        let undeclared = load(&yaml.replace("    depends_on: [vpc]\n", ""), "dev");
        assert!(matches!(undeclared, Err(Error::ConfigParse(msg)) if msg.contains("does not depend on it")));

        let script_source = r#"
version: "1.0"
name: test
modules:
  - path: seed
    type: script
    options:
      commands: {deploy: "true"}
  - path: app.tf
    depends_on: [seed]
    params:
      token: "{{output seed::Token}}"
"#;
        let result = load(script_source, "dev");
        assert!(matches!(result, Err(Error::ConfigParse(msg)) if msg.contains("does not expose outputs")));
    }

    #[test]
    fn test_gt004_descriptor_merge() {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join("svc");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(
            module_dir.join(MODULE_DESCRIPTOR),
            r#"
type: serverless
depends_on: [base]
params:
  memory: "256"
  timeout: "10"
options:
  args: ["--verbose"]
"#,
        )
        .unwrap();
        let config = parse_config(
            r#"
version: "1.0"
name: test
modules:
  - path: base.tf
  - path: svc
    params:
      timeout: "30"
"#,
        )
        .unwrap();
        let mods = load_modules(dir.path(), &config, &env("dev")).unwrap();
        let svc = &mods[1];
        assert_eq!(svc.backend, BackendKind::Serverless);
        assert_eq!(svc.depends_on, vec!["base"]);
        assert_eq!(svc.param("memory"), Some("256"));
        assert_eq!(svc.param("timeout"), Some("30"));
        assert_eq!(svc.options.args, vec!["--verbose"]);
    }

    #[test]
    fn test_gt004_glob_expansion() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["stacks/b.cfn", "stacks/a.cfn", "stacks/readme"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("stacks/notes.cfn"), "not a dir").unwrap();
        let config = parse_config(
            r#"
version: "1.0"
name: test
modules:
  - path: "stacks/*.cfn"
"#,
        )
        .unwrap();
        let mods = load_modules(dir.path(), &config, &env("dev")).unwrap();
        let ids: Vec<&str> = mods.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_gt004_glob_with_id_rejected() {
        let result = load(
            r#"
version: "1.0"
name: test
modules:
  - id: all
    path: "stacks/*.cfn"
"#,
            "dev",
        );
        assert!(matches!(result, Err(Error::ConfigParse(_))));
    }

    #[test]
    fn test_gt004_parse_and_validate_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "version: \"2.0\"\nname: x\n").unwrap();
        let result = parse_and_validate(&path);
        assert!(matches!(result, Err(Error::ConfigParse(msg)) if msg.contains("validation")));
        assert!(matches!(
            parse_and_validate(&dir.path().join("missing.yml")),
            Err(Error::Io { .. })
        ));
    }
}
