//! Gantry: multi-environment infrastructure orchestration.
//!
//! One config, many modules, many backends. Resolves the target environment,
//! orders modules by their declared dependencies and drives CloudFormation,
//! Terraform, Serverless, CDK or plain scripts with per-environment params.

pub mod backends;
pub mod cli;
pub mod core;
pub mod transport;
