//! GT-022: Terraform backend.
//!
//! Every run initializes the module, then selects (or creates) a workspace
//! named after the environment unless the module pins one. Module params
//! are passed as `-var`; an `<env>.tfvars` file next to the module is
//! picked up when present.

use super::{Backend, InvocationRequest};
use crate::core::error::Result;
use crate::core::types::*;
use crate::transport::CommandSpec;
use indexmap::IndexMap;
use serde::Deserialize;

pub struct Terraform;

/// One value of `terraform output -json`.
#[derive(Deserialize)]
struct OutputValue {
    value: serde_json::Value,
}

/// `terraform plan -detailed-exitcode` exits 2 when changes are pending.
const PLAN_OK_CODES: &[i32] = &[0, 2];

impl Terraform {
    fn tf(req: &InvocationRequest) -> CommandSpec {
        req.command("terraform").env("TF_IN_AUTOMATION", "1")
    }

    fn workspace(req: &InvocationRequest) -> String {
        req.module
            .options
            .workspace
            .clone()
            .unwrap_or_else(|| req.environment.name().to_string())
    }

    fn var_args(req: &InvocationRequest) -> Vec<String> {
        let mut args = Vec::new();
        let var_file = format!("{}.tfvars", req.environment.name());
        if req.module.path.join(&var_file).is_file() {
            args.push(format!("-var-file={}", var_file));
        }
        for (key, value) in req.module.set_params() {
            args.push("-var".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend(req.module.options.args.iter().cloned());
        args
    }
}

impl Backend for Terraform {
    fn kind(&self) -> BackendKind {
        BackendKind::Terraform
    }

    fn supports(&self, _action: Action, _module: &Module) -> bool {
        true
    }

    fn commands(&self, req: &InvocationRequest) -> Result<Vec<CommandSpec>> {
        if req.action == Action::Test {
            return Ok(vec![
                Self::tf(req).args(["init", "-backend=false", "-input=false"]),
                Self::tf(req).arg("validate"),
            ]);
        }

        let init = Self::tf(req).args(["init", "-input=false"]);
        let select = Self::tf(req).args(["workspace", "select", "-or-create"]).arg(Self::workspace(req));
        let run = match req.action {
            Action::Plan => {
                let cmd = Self::tf(req)
                    .args(["plan", "-input=false", "-detailed-exitcode"])
                    .ok_exit_codes(PLAN_OK_CODES);
                if req.direction == Direction::Reverse {
                    cmd.arg("-destroy")
                } else {
                    cmd
                }
            }
            Action::Deploy => Self::tf(req).args(["apply", "-auto-approve", "-input=false"]),
            _ => Self::tf(req).args(["destroy", "-auto-approve", "-input=false"]),
        };
        Ok(vec![init, select, run.args(Self::var_args(req))])
    }

    fn outputs_command(&self, req: &InvocationRequest) -> Option<CommandSpec> {
        Some(
            Self::tf(req)
                .env("TF_WORKSPACE", Self::workspace(req))
                .args(["output", "-json"]),
        )
    }

    fn parse_outputs(&self, stdout: &str) -> std::result::Result<IndexMap<String, String>, String> {
        let outputs: IndexMap<String, OutputValue> =
            serde_json::from_str(stdout.trim()).map_err(|e| format!("unexpected terraform output: {}", e))?;
        Ok(outputs
            .into_iter()
            .map(|(key, o)| (key, param_value_to_string(&o.value).unwrap_or_default()))
            .collect())
    }
}
