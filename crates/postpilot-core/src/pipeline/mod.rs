//! Content pipeline state machine
//!
//! [`PipelineEngine::start_pipeline`] spawns one task per content item. The
//! task owns its [`PipelineContext`] and walks it through
//! UPLOAD → CAPTION → SCHEDULE → POST → ANALYZE → COMPLETED, or to FAILED on
//! the first unrecovered error.

mod engine;
mod types;

pub use engine::{PipelineConfig, PipelineEngine};
pub use types::{PipelineContext, PipelineMetrics, PipelineOutcome, PipelineState, PipelineStatus};
