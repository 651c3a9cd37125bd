//! GT-020: Backend adapters, one per backend kind, behind a single trait.
//!
//! Each adapter turns a generic {action, module, environment} request into
//! the command sequence its framework needs and classifies the outcome. The
//! shared [`invoke`] drives that sequence through an [`Invoker`] and
//! normalizes it into an [`InvocationResult`].

pub mod cdk;
pub mod cloudformation;
pub mod script;
pub mod serverless;
pub mod terraform;

use crate::core::error::{Error, Result};
use crate::core::resolver::{self, ModuleOutputs};
use crate::core::types::*;
use crate::transport::{CancelToken, CommandSpec, ExecOutput, Invoker};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything an adapter needs to build its commands.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub action: Action,
    /// Reverse on destroy, and on a what-if of destroy
    pub direction: Direction,
    pub module: Arc<Module>,
    pub environment: Arc<Environment>,
    pub namespace: Arc<str>,
}

impl InvocationRequest {
    /// Fully qualified name: `<namespace>-<module id>`, or the bare id.
    pub fn fqn(&self) -> String {
        if self.namespace.is_empty() {
            self.module.id.clone()
        } else {
            format!("{}-{}", self.namespace, self.module.id)
        }
    }

    /// Region from the module params, falling back to the environment's.
    pub fn region(&self) -> Option<&str> {
        self.module
            .param("region")
            .or_else(|| self.environment.param("region"))
    }

    /// Variables exported to every backend process.
    pub fn base_env(&self) -> IndexMap<String, String> {
        let mut env = IndexMap::new();
        env.insert("GANTRY_ENVIRONMENT".to_string(), self.environment.name().to_string());
        env.insert("GANTRY_MODULE".to_string(), self.module.id.clone());
        env.insert("GANTRY_NAMESPACE".to_string(), self.namespace.to_string());
        env.insert("GANTRY_ACTION".to_string(), self.action.to_string());
        env.insert("GANTRY_DIRECTION".to_string(), self.direction.to_string());
        for (key, value) in self.module.set_params() {
            env.insert(format!("GANTRY_PARAM_{}", env_key(key)), value.to_string());
        }
        for (key, value) in &self.module.env_vars {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// A command rooted in the module directory with the base environment.
    pub fn command(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program, self.module.path.clone()).envs(&self.base_env())
    }
}

/// `db-host` → `DB_HOST`.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// How one finished command affects the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Run the next command (or succeed if this was the last)
    Continue,
    /// Stop and record a failure
    Fail,
    /// Stop and record a skip: the backend has nothing to do
    Skip,
}

/// Uniform capability set over one backend kind.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend can perform `action` for `module`.
    fn supports(&self, action: Action, module: &Module) -> bool;

    /// Commands to run, in order.
    fn commands(&self, req: &InvocationRequest) -> Result<Vec<CommandSpec>>;

    /// Classify one finished command.
    fn classify(&self, _req: &InvocationRequest, cmd: &CommandSpec, out: &ExecOutput) -> Verdict {
        if cmd.accepts(out.exit_code) {
            Verdict::Continue
        } else {
            Verdict::Fail
        }
    }

    /// Command printing the module's deployed outputs, if the backend has any.
    fn outputs_command(&self, _req: &InvocationRequest) -> Option<CommandSpec> {
        None
    }

    /// Parse the stdout of [`Backend::outputs_command`].
    fn parse_outputs(&self, _stdout: &str) -> std::result::Result<IndexMap<String, String>, String> {
        Ok(IndexMap::new())
    }
}

static CLOUDFORMATION: cloudformation::CloudFormation = cloudformation::CloudFormation;
static TERRAFORM: terraform::Terraform = terraform::Terraform;
static SERVERLESS: serverless::Serverless = serverless::Serverless;
static CDK: cdk::Cdk = cdk::Cdk;
static SCRIPT: script::Script = script::Script;

/// The adapter for a backend kind.
pub fn for_kind(kind: BackendKind) -> &'static dyn Backend {
    match kind {
        BackendKind::Cloudformation => &CLOUDFORMATION,
        BackendKind::Terraform => &TERRAFORM,
        BackendKind::Serverless => &SERVERLESS,
        BackendKind::Cdk => &CDK,
        BackendKind::Script => &SCRIPT,
    }
}

/// Run one module invocation to a terminal status.
pub async fn invoke(
    backend: &dyn Backend,
    invoker: &dyn Invoker,
    req: &InvocationRequest,
    cancel: &CancelToken,
) -> InvocationResult {
    let start = Instant::now();
    let mut output = String::new();

    let outcome = run_commands(backend, invoker, req, cancel, &mut output).await;
    let (status, skip_reason, error) = match outcome {
        Ok(Verdict::Skip) => (InvocationStatus::Skipped, Some(SkipReason::Backend), None),
        Ok(_) => (InvocationStatus::Success, None, None),
        Err(e) => (InvocationStatus::Failure, None, Some(e.to_string())),
    };

    InvocationResult {
        module: req.module.id.clone(),
        backend: backend.kind(),
        action: req.action,
        status,
        skip_reason,
        output,
        error,
        duration_seconds: start.elapsed().as_secs_f64(),
    }
}

async fn run_commands(
    backend: &dyn Backend,
    invoker: &dyn Invoker,
    req: &InvocationRequest,
    cancel: &CancelToken,
    output: &mut String,
) -> Result<Verdict> {
    if !backend.supports(req.action, &req.module) {
        return Err(Error::UnsupportedAction {
            backend: backend.kind(),
            action: req.action,
        });
    }

    for cmd in backend.commands(req)? {
        if cancel.is_cancelled() {
            return Err(Error::RunCancelled);
        }
        debug!(module = %req.module.id, command = %cmd, "invoking");
        output.push_str(&format!("$ {}\n", cmd));

        let out = invoker.invoke(&cmd, cancel).await?;
        output.push_str(&out.stdout);
        output.push_str(&out.stderr);

        match backend.classify(req, &cmd, &out) {
            Verdict::Continue => {}
            Verdict::Fail => {
                warn!(module = %req.module.id, exit_code = out.exit_code, command = %cmd, "command failed");
                return Err(Error::invocation(
                    &cmd.program,
                    format!("exit code {}: {}", out.exit_code, tail(&out)),
                ));
            }
            Verdict::Skip => return Ok(Verdict::Skip),
        }
    }
    Ok(Verdict::Continue)
}

/// Read the deployed outputs of `source`'s module.
pub async fn fetch_outputs(
    source: &InvocationRequest,
    invoker: &dyn Invoker,
    cancel: &CancelToken,
) -> Result<IndexMap<String, String>> {
    let lookup_error = |message: String| Error::OutputLookup {
        module: source.module.id.clone(),
        message,
    };
    let backend = for_kind(source.module.backend);
    let cmd = backend
        .outputs_command(source)
        .ok_or_else(|| lookup_error(format!("the {} backend does not expose outputs", backend.kind())))?;
    debug!(module = %source.module.id, command = %cmd, "reading outputs");

    let out = invoker.invoke(&cmd, cancel).await?;
    if !cmd.accepts(out.exit_code) {
        return Err(lookup_error(format!("exit code {}: {}", out.exit_code, tail(&out))));
    }
    backend.parse_outputs(&out.stdout).map_err(lookup_error)
}

/// Replace `{{output <module>::<key>}}` references in `req`'s params with
/// values read from `sources`, one lookup per source module.
pub async fn resolve_outputs(
    req: &InvocationRequest,
    sources: &[InvocationRequest],
    invoker: &dyn Invoker,
    cancel: &CancelToken,
) -> Result<InvocationRequest> {
    if sources.is_empty() {
        return Ok(req.clone());
    }
    let mut outputs = ModuleOutputs::new();
    for source in sources {
        let values = fetch_outputs(source, invoker, cancel).await?;
        outputs.insert(source.module.id.clone(), values);
    }

    let mut module = Module::clone(&req.module);
    for (key, value) in module.params.iter_mut() {
        if let ParamValue::Set(raw) = value {
            *raw = resolver::resolve_output_refs(raw, &outputs).map_err(|message| Error::OutputLookup {
                module: req.module.id.clone(),
                message: format!("param '{}': {}", key, message),
            })?;
        }
    }
    Ok(InvocationRequest {
        module: Arc::new(module),
        ..req.clone()
    })
}

/// Last meaningful line of a failed command, stderr first.
fn tail(out: &ExecOutput) -> &str {
    [&out.stderr, &out.stdout]
        .into_iter()
        .find_map(|s| s.lines().rev().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("no output")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    pub(crate) fn module(id: &str, backend: BackendKind) -> Module {
        let mut params = IndexMap::new();
        params.insert("db-host".to_string(), ParamValue::Set("db.internal".to_string()));
        params.insert("debug".to_string(), ParamValue::Unset);
        Module {
            id: id.to_string(),
            path: PathBuf::from(format!("/infra/{}", id)),
            backend,
            depends_on: vec![],
            params,
            env_vars: IndexMap::new(),
            options: ModuleOptions::default(),
            enabled: true,
            declaration_index: 0,
        }
    }

    pub(crate) fn request(module: Module, action: Action) -> InvocationRequest {
        let mut env_params = IndexMap::new();
        env_params.insert("region".to_string(), "us-east-1".to_string());
        InvocationRequest {
            action,
            direction: action.direction(),
            module: Arc::new(module),
            environment: Arc::new(Environment::new(
                "dev",
                EnvironmentSource::Explicit,
                env_params,
            )),
            namespace: Arc::from("acme"),
        }
    }

    /// Records commands and answers with scripted outputs (default: exit 0).
    #[derive(Default)]
    pub(crate) struct ScriptedInvoker {
        pub calls: Mutex<Vec<CommandSpec>>,
        pub replies: Mutex<Vec<ExecOutput>>,
    }

    impl ScriptedInvoker {
        pub fn reply(self, exit_code: i32, stdout: &str, stderr: &str) -> Self {
            self.replies.lock().unwrap().push(ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
            self
        }
    }

    #[async_trait]
    impl Invoker for ScriptedInvoker {
        async fn invoke(&self, cmd: &CommandSpec, _cancel: &CancelToken) -> Result<ExecOutput> {
            self.calls.lock().unwrap().push(cmd.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Ok(ExecOutput { exit_code: 0, stdout: String::new(), stderr: String::new() })
            } else {
                Ok(replies.remove(0))
            }
        }
    }

    #[test]
    fn test_gt020_base_env() {
        let req = request(module("vpc", BackendKind::Cloudformation), Action::Deploy);
        let env = req.base_env();
        assert_eq!(env["GANTRY_ENVIRONMENT"], "dev");
        assert_eq!(env["GANTRY_MODULE"], "vpc");
        assert_eq!(env["GANTRY_NAMESPACE"], "acme");
        assert_eq!(env["GANTRY_ACTION"], "deploy");
        assert_eq!(env["GANTRY_PARAM_DB_HOST"], "db.internal");
        assert!(!env.contains_key("GANTRY_PARAM_DEBUG"));
    }

    #[test]
    fn test_gt020_fqn_and_region() {
        let req = request(module("vpc", BackendKind::Cloudformation), Action::Deploy);
        assert_eq!(req.fqn(), "acme-vpc");
        assert_eq!(req.region(), Some("us-east-1"));
        let mut bare = req.clone();
        bare.namespace = Arc::from("");
        assert_eq!(bare.fqn(), "vpc");
    }

    #[test]
    fn test_gt020_registry_kinds() {
        for kind in [
            BackendKind::Cloudformation,
            BackendKind::Terraform,
            BackendKind::Serverless,
            BackendKind::Cdk,
            BackendKind::Script,
        ] {
            assert_eq!(for_kind(kind).kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_gt020_invoke_unsupported_action() {
        let req = request(module("api", BackendKind::Serverless), Action::Test);
        let invoker = ScriptedInvoker::default();
        let result = invoke(for_kind(BackendKind::Serverless), &invoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Failure);
        assert!(result.error.unwrap().contains("does not support 'test'"));
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gt020_invoke_stops_at_first_failure() {
        let req = request(module("app", BackendKind::Terraform), Action::Deploy);
        let invoker = ScriptedInvoker::default().reply(1, "", "Error: backend init failed");
        let result = invoke(for_kind(BackendKind::Terraform), &invoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Failure);
        assert_eq!(invoker.calls.lock().unwrap().len(), 1);
        assert!(result.error.unwrap().contains("backend init failed"));
        assert!(result.output.contains("$ terraform init"));
    }

    #[tokio::test]
    async fn test_gt020_invoke_success_runs_all() {
        let req = request(module("app", BackendKind::Terraform), Action::Deploy);
        let invoker = ScriptedInvoker::default();
        let result = invoke(for_kind(BackendKind::Terraform), &invoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Success);
        assert_eq!(invoker.calls.lock().unwrap().len(), 3);
        assert_eq!(result.module, "app");
        assert_eq!(result.backend, BackendKind::Terraform);
    }

    #[tokio::test]
    async fn test_gt020_invoke_cancelled_before_start() {
        let (handle, token) = crate::transport::cancellation();
        handle.cancel();
        let req = request(module("app", BackendKind::Terraform), Action::Deploy);
        let invoker = ScriptedInvoker::default();
        let result = invoke(for_kind(BackendKind::Terraform), &invoker, &req, &token).await;
        assert_eq!(result.status, InvocationStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("run cancelled"));
    }

    #[tokio::test]
    async fn test_gt020_resolve_outputs_from_source() {
        let mut app = module("app", BackendKind::Terraform);
        app.depends_on = vec!["vpc".to_string()];
        app.params.insert("vpc_id".to_string(), ParamValue::Set("{{output vpc::VpcId}}".to_string()));
        let req = request(app, Action::Deploy);
        let source = request(module("vpc", BackendKind::Cloudformation), Action::Deploy);
        let invoker = ScriptedInvoker::default().reply(0, r#"[{"OutputKey": "VpcId", "OutputValue": "vpc-9"}]"#, "");

        let resolved = resolve_outputs(&req, &[source], &invoker, &CancelToken::never()).await.unwrap();
        assert_eq!(resolved.module.param("vpc_id"), Some("vpc-9"));
        assert_eq!(resolved.module.param("db-host"), Some("db.internal"));
        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args.contains(&"describe-stacks".to_string()));
    }

    #[tokio::test]
    async fn test_gt020_resolve_outputs_failures() {
        let mut app = module("app", BackendKind::Terraform);
        app.params.insert("vpc_id".to_string(), ParamValue::Set("{{output vpc::SubnetId}}".to_string()));
        let req = request(app, Action::Deploy);
        let source = request(module("vpc", BackendKind::Cloudformation), Action::Deploy);

        let missing_key = ScriptedInvoker::default().reply(0, "[]", "");
        let err = resolve_outputs(&req, &[source.clone()], &missing_key, &CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot read outputs of module 'app': param 'vpc_id': module 'vpc' has no output 'SubnetId'"
        );

        let absent_stack = ScriptedInvoker::default().reply(255, "", "Stack with id acme-vpc does not exist");
        let err = resolve_outputs(&req, &[source], &absent_stack, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutputLookup { ref module, .. } if module == "vpc"));
        assert_eq!(err.category(), crate::core::error::ExitCategory::ModuleFailure);
    }

    #[tokio::test]
    async fn test_gt020_fetch_outputs_unsupported_backend() {
        let source = request(module("api", BackendKind::Serverless), Action::Deploy);
        let invoker = ScriptedInvoker::default();
        let err = fetch_outputs(&source, &invoker, &CancelToken::never()).await.unwrap_err();
        assert!(err.to_string().contains("does not expose outputs"));
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_gt020_env_key() {
        assert_eq!(env_key("db-host"), "DB_HOST");
        assert_eq!(env_key("a.b"), "A_B");
    }
}
