//! GT-001: Core types for the config schema, modules, environments, plans and reports.
//!
//! Defines the YAML schema types for `gantry.yml`, the in-memory module records
//! the loader produces, and the plan/report types the engine works with.
//! Schema types derive Serialize/Deserialize/JsonSchema; report types derive
//! Serialize/Deserialize for JSON roundtripping.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Top-level gantry.yml
// ============================================================================

/// Root configuration: environments and the modules deployed into them.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GantryConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable infrastructure name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Prefix for fully qualified backend names (stack names, etc.)
    #[serde(default)]
    pub namespace: Option<String>,

    /// Environment used when no other signal resolves one
    #[serde(default)]
    pub default_environment: Option<String>,

    /// Skip branch-name mapping during environment resolution
    #[serde(default)]
    pub ignore_git_branch: bool,

    /// Branch-name to environment rules, tried in order
    #[serde(default)]
    pub branch_mapping: Vec<BranchRule>,

    /// Declared environments (order-preserving)
    #[serde(default)]
    pub environments: IndexMap<String, EnvironmentDecl>,

    /// Run settings
    #[serde(default)]
    pub settings: Settings,

    /// Global parameter defaults, inherited by every module
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,

    /// Module declarations (declaration order is the planning tiebreak)
    #[serde(default)]
    pub modules: Vec<ModuleDecl>,
}

impl GantryConfig {
    /// Namespace, or empty when unset.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

/// One branch-name mapping rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BranchRule {
    /// Regular expression matched against the branch name
    pub pattern: String,

    /// Fixed environment name; when absent the `env` capture group is used
    #[serde(default)]
    pub environment: Option<String>,
}

/// A declared environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentDecl {
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Parameters scoped to this environment
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,
}

/// Run settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    /// Maximum module invocations in flight at once, across graph depths
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Where run reports are written, relative to the config root
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            report_dir: default_report_dir(),
        }
    }
}

fn default_max_parallel() -> usize {
    1
}

fn default_report_dir() -> String {
    ".gantry/reports".to_string()
}

// ============================================================================
// Modules
// ============================================================================

/// A module as declared in `gantry.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModuleDecl {
    /// Module id (defaults to the file stem of the path)
    #[serde(default)]
    pub id: Option<String>,

    /// Module directory, relative to the config root (glob patterns allowed)
    pub path: String,

    /// Backend kind (inferred from the path suffix when absent)
    #[serde(rename = "type", default)]
    pub backend: Option<BackendKind>,

    /// Modules that must run before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Module parameter defaults
    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,

    /// Extra environment variables for backend invocations
    #[serde(default)]
    pub env_vars: IndexMap<String, String>,

    /// Per-environment overlays; a non-empty map restricts the module to the listed environments
    #[serde(default)]
    pub environments: IndexMap<String, EnvOverlay>,

    /// Backend-specific options
    #[serde(default)]
    pub options: ModuleOptions,
}

/// Per-module descriptor file (`gantry.module.yml` inside the module directory).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ModuleDescriptor {
    #[serde(rename = "type", default)]
    pub backend: Option<BackendKind>,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub params: IndexMap<String, serde_json::Value>,

    #[serde(default)]
    pub env_vars: IndexMap<String, String>,

    #[serde(default)]
    pub environments: IndexMap<String, EnvOverlay>,

    #[serde(default)]
    pub options: ModuleOptions,
}

/// Environment overlay: a plain toggle or a map of parameter overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EnvOverlay {
    Toggle(bool),
    Params(IndexMap<String, serde_json::Value>),
}

/// Backend-specific module options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModuleOptions {
    /// CloudFormation template file (default `template.yaml`)
    #[serde(default)]
    pub template: Option<String>,

    /// Explicit stack name (default `<namespace>-<id>`)
    #[serde(default)]
    pub stack_name: Option<String>,

    /// Terraform workspace (default: environment name)
    #[serde(default)]
    pub workspace: Option<String>,

    /// Commands for the script backend, one per action
    #[serde(default)]
    pub commands: ScriptCommands,

    /// Extra arguments appended to the main backend command
    #[serde(default)]
    pub args: Vec<String>,
}

impl ModuleOptions {
    /// Field-wise merge: values set on `self` win, `base` fills the gaps.
    pub fn merged_over(&self, base: &ModuleOptions) -> ModuleOptions {
        ModuleOptions {
            template: self.template.clone().or_else(|| base.template.clone()),
            stack_name: self.stack_name.clone().or_else(|| base.stack_name.clone()),
            workspace: self.workspace.clone().or_else(|| base.workspace.clone()),
            commands: ScriptCommands {
                plan: self.commands.plan.clone().or_else(|| base.commands.plan.clone()),
                deploy: self.commands.deploy.clone().or_else(|| base.commands.deploy.clone()),
                destroy: self.commands.destroy.clone().or_else(|| base.commands.destroy.clone()),
                test: self.commands.test.clone().or_else(|| base.commands.test.clone()),
            },
            args: if self.args.is_empty() {
                base.args.clone()
            } else {
                self.args.clone()
            },
        }
    }
}

/// Shell commands for the script backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptCommands {
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub deploy: Option<String>,
    #[serde(default)]
    pub destroy: Option<String>,
    #[serde(default)]
    pub test: Option<String>,
}

impl ScriptCommands {
    pub fn for_action(&self, action: Action) -> Option<&str> {
        match action {
            Action::Plan => self.plan.as_deref(),
            Action::Deploy => self.deploy.as_deref(),
            Action::Destroy => self.destroy.as_deref(),
            Action::Test => self.test.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plan.is_none() && self.deploy.is_none() && self.destroy.is_none() && self.test.is_none()
    }
}

/// Backend kind enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Cloudformation,
    Terraform,
    Serverless,
    Cdk,
    Script,
}

impl BackendKind {
    /// Infer the backend from a module directory suffix (`vpc.cfn`, `app.tf`, ...).
    pub fn from_suffix(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("cfn") => Some(Self::Cloudformation),
            Some("tf") => Some(Self::Terraform),
            Some("sls") => Some(Self::Serverless),
            Some("cdk") => Some(Self::Cdk),
            _ => None,
        }
    }

    /// Backends whose deployed outputs `{{output <module>::<key>}}` can read.
    pub fn exposes_outputs(self) -> bool {
        matches!(self, Self::Cloudformation | Self::Terraform)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cloudformation => write!(f, "cloudformation"),
            Self::Terraform => write!(f, "terraform"),
            Self::Serverless => write!(f, "serverless"),
            Self::Cdk => write!(f, "cdk"),
            Self::Script => write!(f, "script"),
        }
    }
}

/// A module after loading: overlays merged, enablement resolved for one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub id: String,
    /// Working directory for backend invocations
    pub path: PathBuf,
    pub backend: BackendKind,
    pub depends_on: Vec<String>,
    /// Every known parameter, resolved or explicitly unset
    pub params: IndexMap<String, ParamValue>,
    pub env_vars: IndexMap<String, String>,
    pub options: ModuleOptions,
    /// Whether the module runs in the resolved environment
    pub enabled: bool,
    /// Position in the config (planning tiebreak)
    pub declaration_index: usize,
}

impl Module {
    /// Parameters that carry a value, in merge order.
    pub fn set_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().filter_map(|(k, v)| match v {
            ParamValue::Set(s) => Some((k.as_str(), s.as_str())),
            ParamValue::Unset => None,
        })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        match self.params.get(key) {
            Some(ParamValue::Set(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A resolved parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Set(String),
    Unset,
}

/// Render a scalar config value as a parameter string. `null` means unset.
pub fn param_value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// Environments
// ============================================================================

/// Which signal produced the environment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentSource {
    Explicit,
    EnvVar,
    Branch,
    Directory,
    Default,
}

impl fmt::Display for EnvironmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::EnvVar => write!(f, "env-var"),
            Self::Branch => write!(f, "branch"),
            Self::Directory => write!(f, "directory"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// The resolved deployment environment. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    name: String,
    source: EnvironmentSource,
    params: IndexMap<String, String>,
}

impl Environment {
    pub fn new(
        name: impl Into<String>,
        source: EnvironmentSource,
        params: IndexMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> EnvironmentSource {
        self.source
    }

    pub fn params(&self) -> &IndexMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

// ============================================================================
// Actions and plans
// ============================================================================

/// Action requested of every planned module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Plan,
    Deploy,
    Destroy,
    Test,
}

impl Action {
    /// Deploy and destroy stop at the first failure; plan and test run best-effort.
    pub fn aborts_on_failure(self) -> bool {
        matches!(self, Self::Deploy | Self::Destroy)
    }

    /// Destroy tears dependents down before their dependencies.
    pub fn direction(self) -> Direction {
        match self {
            Self::Destroy => Direction::Reverse,
            _ => Direction::Forward,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Deploy => write!(f, "deploy"),
            Self::Destroy => write!(f, "destroy"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Plan ordering direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Dependencies first
    Forward,
    /// Dependents first
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Reverse => write!(f, "reverse"),
        }
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    /// Index into the loaded module list
    pub index: usize,
    pub module: String,
    /// Longest chain of planned predecessors
    pub depth: u32,
    /// Plan positions that must finish before this step starts
    pub waits_on: Vec<usize>,
}

/// Ordered, dependency-respecting sequence of modules for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub action: Action,
    pub direction: Direction,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn module_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.module.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ============================================================================
// Invocation results and run reports
// ============================================================================

/// Normalized three-state module outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failure,
    Skipped,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a module was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An earlier failure aborted the run
    Aborted,
    /// The run was cancelled before the module started
    Cancelled,
    /// The backend reported nothing to do (e.g. stack already gone)
    Backend,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Backend => write!(f, "nothing to do"),
        }
    }
}

/// Per-module outcome. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub module: String,
    pub backend: BackendKind,
    pub action: Action,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl InvocationResult {
    /// A module that was never started.
    pub fn skipped(module: &Module, action: Action, reason: SkipReason) -> Self {
        Self {
            module: module.id.clone(),
            backend: module.backend,
            action,
            status: InvocationStatus::Skipped,
            skip_reason: Some(reason),
            output: String::new(),
            error: None,
            duration_seconds: 0.0,
        }
    }

    /// A module that failed before any backend command ran.
    pub fn failed(module: &Module, action: Action, error: String) -> Self {
        Self {
            status: InvocationStatus::Failure,
            skip_reason: None,
            error: Some(error),
            ..Self::skipped(module, action, SkipReason::Aborted)
        }
    }

    /// Success, or a skip the backend itself asked for.
    pub fn is_ok(&self) -> bool {
        match self.status {
            InvocationStatus::Success => true,
            InvocationStatus::Skipped => self.skip_reason == Some(SkipReason::Backend),
            InvocationStatus::Failure => false,
        }
    }
}

/// Run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Aborted,
    Cancelled,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregate record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub name: String,
    pub action: Action,
    #[serde(default)]
    pub what_if: bool,
    pub environment: String,
    pub environment_source: EnvironmentSource,
    pub config_hash: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<InvocationResult>,
}

impl RunReport {
    /// Completed with every module ok.
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed && self.results.iter().all(InvocationResult::is_ok)
    }

    pub fn count(&self, status: InvocationStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}
