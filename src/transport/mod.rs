//! GT-010: Transport, the process seam every backend adapter invokes through.
//!
//! A backend describes what to run as [`CommandSpec`]s; an [`Invoker`] runs
//! them and reports exit status plus captured output. Cancellation is a
//! watch channel shared by the engine and every in-flight invocation.

pub mod local;

use crate::core::error::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;

/// Output from executing a command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One process to run for a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: IndexMap<String, String>,
    /// Exit codes treated as success (usually just 0)
    pub ok_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: IndexMap::new(),
            ok_exit_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &IndexMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn ok_exit_codes(mut self, codes: &[i32]) -> Self {
        self.ok_exit_codes = codes.to_vec();
        self
    }

    pub fn accepts(&self, exit_code: i32) -> bool {
        self.ok_exit_codes.contains(&exit_code)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Backend collaborator interface: run a command, wait for a definitive exit.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, cmd: &CommandSpec, cancel: &CancelToken) -> Result<ExecOutput>;
}

/// Create a linked cancel handle and token.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Sender side: flips every token to cancelled.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiver side, cheap to clone into tasks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the value false forever.
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if it never can be.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
