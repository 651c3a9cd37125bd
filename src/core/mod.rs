//! Core orchestration logic: parsing, resolution, planning and execution.

pub mod environment;
pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod report;
pub mod resolver;
pub mod types;
