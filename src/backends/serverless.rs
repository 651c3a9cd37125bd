//! GT-023: Serverless Framework backend.
//!
//! The environment name is the stage. There is no test command.

use super::{Backend, InvocationRequest};
use crate::core::error::Result;
use crate::core::types::*;
use crate::transport::CommandSpec;

pub struct Serverless;

impl Backend for Serverless {
    fn kind(&self) -> BackendKind {
        BackendKind::Serverless
    }

    fn supports(&self, action: Action, _module: &Module) -> bool {
        action != Action::Test
    }

    fn commands(&self, req: &InvocationRequest) -> Result<Vec<CommandSpec>> {
        let verb = match (req.action, req.direction) {
            (Action::Plan, Direction::Forward) => "package",
            (Action::Plan, Direction::Reverse) => "info",
            (Action::Destroy, _) => "remove",
            _ => "deploy",
        };
        let mut cmd = req
            .command("npx")
            .args(["serverless", verb, "--stage", req.environment.name()]);
        if let Some(region) = req.region() {
            cmd = cmd.args(["--region", region]);
        }
        for (key, value) in req.module.set_params() {
            if key != "region" {
                cmd = cmd.arg(format!("--param={}={}", key, value));
            }
        }
        Ok(vec![cmd.args(req.module.options.args.iter().cloned())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::tests::{module, request};

    #[test]
    fn test_gt023_deploy_command() {
        let req = request(module("api", BackendKind::Serverless), Action::Deploy);
        let cmds = Serverless.commands(&req).unwrap();
        assert_eq!(
            cmds[0].to_string(),
            "npx serverless deploy --stage dev --region us-east-1 --param=db-host=db.internal"
        );
    }

    #[test]
    fn test_gt023_verbs_per_action() {
        let verb = |action, direction| {
            let mut req = request(module("api", BackendKind::Serverless), action);
            req.direction = direction;
            Serverless.commands(&req).unwrap()[0].args[1].clone()
        };
        assert_eq!(verb(Action::Plan, Direction::Forward), "package");
        assert_eq!(verb(Action::Plan, Direction::Reverse), "info");
        assert_eq!(verb(Action::Destroy, Direction::Reverse), "remove");
    }

    #[test]
    fn test_gt023_no_test_support() {
        let m = module("api", BackendKind::Serverless);
        assert!(!Serverless.supports(Action::Test, &m));
        assert!(Serverless.supports(Action::Deploy, &m));
    }
}
