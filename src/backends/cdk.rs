//! GT-024: AWS CDK backend.
//!
//! Params reach the app as context values; `environment` is always set.

use super::{Backend, InvocationRequest};
use crate::core::error::Result;
use crate::core::types::*;
use crate::transport::CommandSpec;

pub struct Cdk;

impl Cdk {
    fn context_args(req: &InvocationRequest) -> Vec<String> {
        let mut args = vec!["-c".to_string(), format!("environment={}", req.environment.name())];
        for (key, value) in req.module.set_params() {
            args.push("-c".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }
}

impl Backend for Cdk {
    fn kind(&self) -> BackendKind {
        BackendKind::Cdk
    }

    fn supports(&self, _action: Action, _module: &Module) -> bool {
        true
    }

    fn commands(&self, req: &InvocationRequest) -> Result<Vec<CommandSpec>> {
        let verb: &[&str] = match (req.action, req.direction) {
            (Action::Plan, Direction::Forward) => &["diff"],
            (Action::Plan, Direction::Reverse) => &["list"],
            (Action::Deploy, _) => &["deploy", "--all", "--require-approval", "never"],
            (Action::Destroy, _) => &["destroy", "--all", "--force"],
            (Action::Test, _) => &["synth", "--quiet"],
        };
        let mut cmd = req.command("npx").arg("cdk").args(verb.iter().copied());
        if let Some(region) = req.region() {
            cmd = cmd.env("AWS_REGION", region);
        }
        let cmd = cmd
            .args(Self::context_args(req))
            .args(req.module.options.args.iter().cloned());
        Ok(vec![cmd])
    }
}
