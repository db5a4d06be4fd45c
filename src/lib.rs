//! emissary: a conversational agent bridged to chat channels.

pub mod agent;
pub mod channels;
pub mod config;
pub mod council;
pub mod error;
pub mod llm;
pub mod tools;
pub mod workspace;
