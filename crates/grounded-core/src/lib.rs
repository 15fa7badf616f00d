//! Shared types for the grounded conversation workspace: messages, tool
//! calls, provider and agent-service traits, errors and configuration.

pub mod agent;
pub mod config;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;
pub mod tools;
