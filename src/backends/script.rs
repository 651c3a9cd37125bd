//! GT-025: Script backend: user-declared shell commands per action.

use super::{Backend, InvocationRequest};
use crate::core::error::{Error, Result};
use crate::core::types::*;
use crate::transport::CommandSpec;

pub struct Script;

impl Backend for Script {
    fn kind(&self) -> BackendKind {
        BackendKind::Script
    }

    fn supports(&self, action: Action, module: &Module) -> bool {
        module.options.commands.for_action(action).is_some()
    }

    fn commands(&self, req: &InvocationRequest) -> Result<Vec<CommandSpec>> {
        let script = req
            .module
            .options
            .commands
            .for_action(req.action)
            .ok_or(Error::UnsupportedAction {
                backend: BackendKind::Script,
                action: req.action,
            })?;
        Ok(vec![req
            .command("bash")
            .args(["-euo", "pipefail", "-c", script, "gantry"])
            .args(req.module.options.args.iter().cloned())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::tests::{module, request, ScriptedInvoker};
    use crate::backends::{for_kind, invoke};
    use crate::transport::local::LocalInvoker;
    use crate::transport::CancelToken;

    fn scripted(deploy: &str) -> Module {
        let mut m = module("seed", BackendKind::Script);
        m.options.commands.deploy = Some(deploy.to_string());
        m
    }

    #[test]
    fn test_gt025_supports_declared_actions_only() {
        let m = scripted("./seed.sh");
        assert!(Script.supports(Action::Deploy, &m));
        assert!(!Script.supports(Action::Destroy, &m));
    }

    #[test]
    fn test_gt025_command_shape() {
        let req = request(scripted("./seed.sh"), Action::Deploy);
        let cmds = Script.commands(&req).unwrap();
        assert_eq!(cmds[0].to_string(), "bash -euo pipefail -c ./seed.sh gantry");
        assert_eq!(cmds[0].working_dir, std::path::PathBuf::from("/infra/seed"));
    }

    #[tokio::test]
    async fn test_gt025_missing_command_is_unsupported() {
        let req = request(scripted("./seed.sh"), Action::Destroy);
        let invoker = ScriptedInvoker::default();
        let result = invoke(for_kind(BackendKind::Script), &invoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Failure);
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gt025_runs_with_gantry_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = scripted("echo \"$GANTRY_ENVIRONMENT/$GANTRY_PARAM_DB_HOST\"");
        m.path = dir.path().to_path_buf();
        let req = request(m, Action::Deploy);
        let result = invoke(&Script, &LocalInvoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Success);
        assert!(result.output.contains("dev/db.internal"));
    }

    #[tokio::test]
    async fn test_gt025_args_are_positional() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = scripted("echo \"first=[$1] all=[$*]\"");
        m.path = dir.path().to_path_buf();
        m.options.args = vec!["--verbose".to_string(), "--dry".to_string()];
        let req = request(m, Action::Deploy);
        let result = invoke(&Script, &LocalInvoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Success);
        assert!(result.output.contains("first=[--verbose] all=[--verbose --dry]"));
    }

    #[tokio::test]
    async fn test_gt025_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = scripted("echo boom >&2; exit 3");
        m.path = dir.path().to_path_buf();
        let req = request(m, Action::Deploy);
        let result = invoke(&Script, &LocalInvoker, &req, &CancelToken::never()).await;
        assert_eq!(result.status, InvocationStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("failed to invoke bash: exit code 3: boom"));
    }
}
