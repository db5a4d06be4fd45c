//! LLM-callable tools: trait, registry, and built-ins.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::*;
