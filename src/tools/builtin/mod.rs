//! Built-in tools: council deliberation and workspace file access.

pub mod council;
pub mod file;
