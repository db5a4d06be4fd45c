//! Agent orchestration: prompt assembly, history hygiene, and the
//! provider/tool loop.

pub mod history;
pub mod orchestrator;
pub mod prompt;

pub use orchestrator::Orchestrator;
pub use prompt::{PromptAssembler, SummaryProvider};
