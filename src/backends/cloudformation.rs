//! GT-021: CloudFormation backend via the AWS CLI.
//!
//! Stack name defaults to the module's fully qualified name. Module params
//! (except `region`) become `--parameter-overrides`.

use super::{Backend, InvocationRequest, Verdict};
use crate::core::error::Result;
use crate::core::types::*;
use crate::transport::{CommandSpec, ExecOutput};
use indexmap::IndexMap;
use serde::Deserialize;

const DEFAULT_TEMPLATE: &str = "template.yaml";

pub struct CloudFormation;

/// One entry of `describe-stacks --query Stacks[0].Outputs`.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackOutput {
    output_key: String,
    output_value: String,
}

impl CloudFormation {
    fn stack_name(req: &InvocationRequest) -> String {
        req.module
            .options
            .stack_name
            .clone()
            .unwrap_or_else(|| req.fqn())
    }

    fn template(req: &InvocationRequest) -> String {
        req.module
            .options
            .template
            .clone()
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string())
    }

    fn aws(req: &InvocationRequest) -> CommandSpec {
        let cmd = req.command("aws").env("AWS_PAGER", "").arg("cloudformation");
        match req.region() {
            Some(region) => cmd.args(["--region", region]),
            None => cmd,
        }
    }

    fn describe(req: &InvocationRequest, stack: &str) -> CommandSpec {
        Self::aws(req).args(["describe-stacks", "--stack-name", stack])
    }

    fn deploy(req: &InvocationRequest, stack: &str, execute: bool) -> CommandSpec {
        let mut cmd = Self::aws(req).args([
            "deploy".to_string(),
            "--stack-name".to_string(),
            stack.to_string(),
            "--template-file".to_string(),
            Self::template(req),
            "--no-fail-on-empty-changeset".to_string(),
            "--capabilities".to_string(),
            "CAPABILITY_IAM".to_string(),
            "CAPABILITY_NAMED_IAM".to_string(),
        ]);
        if !execute {
            cmd = cmd.arg("--no-execute-changeset");
        }
        let overrides: Vec<String> = req
            .module
            .set_params()
            .filter(|(k, _)| *k != "region")
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if !overrides.is_empty() {
            cmd = cmd.arg("--parameter-overrides").args(overrides);
        }
        cmd.args(req.module.options.args.iter().cloned())
    }
}

impl Backend for CloudFormation {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloudformation
    }

    fn supports(&self, _action: Action, _module: &Module) -> bool {
        true
    }

    fn commands(&self, req: &InvocationRequest) -> Result<Vec<CommandSpec>> {
        let stack = Self::stack_name(req);
        let cmds = match (req.action, req.direction) {
            (Action::Plan, Direction::Forward) => vec![Self::deploy(req, &stack, false)],
            (Action::Plan, Direction::Reverse) => vec![Self::describe(req, &stack)],
            (Action::Deploy, _) => vec![Self::deploy(req, &stack, true)],
            (Action::Destroy, _) => vec![
                Self::describe(req, &stack),
                Self::aws(req).args(["delete-stack", "--stack-name", stack.as_str()]),
                Self::aws(req).args(["wait", "stack-delete-complete", "--stack-name", stack.as_str()]),
            ],
            (Action::Test, _) => vec![req.command("cfn-lint").arg(Self::template(req))],
        };
        Ok(cmds)
    }

    fn classify(&self, req: &InvocationRequest, cmd: &CommandSpec, out: &ExecOutput) -> Verdict {
        if out.success() {
            return Verdict::Continue;
        }
        // A stack that is already gone needs no teardown.
        let describing = cmd.args.iter().any(|a| a == "describe-stacks");
        if describing && req.direction == Direction::Reverse && out.stderr.contains("does not exist") {
            return Verdict::Skip;
        }
        Verdict::Fail
    }

    fn outputs_command(&self, req: &InvocationRequest) -> Option<CommandSpec> {
        let stack = Self::stack_name(req);
        Some(Self::describe(req, &stack).args(["--query", "Stacks[0].Outputs", "--output", "json"]))
    }

    fn parse_outputs(&self, stdout: &str) -> std::result::Result<IndexMap<String, String>, String> {
        // A stack without outputs prints `null`.
        let outputs: Option<Vec<StackOutput>> =
            serde_json::from_str(stdout.trim()).map_err(|e| format!("unexpected describe-stacks output: {}", e))?;
        Ok(outputs
            .unwrap_or_default()
            .into_iter()
            .map(|o| (o.output_key, o.output_value))
            .collect())
    }
}
