//! Shard planning: partition a workload and render per-shard pipelines.
//!
//! # Example
//!
//! ```rust,ignore
//! use shard_launch::planner::{ShardPlanner, StageTemplate};
//!
//! let stages = vec![
//!     StageTemplate::new("python generate.py --start {{ start }} --end {{ end }} --out {{ output }}"),
//!     StageTemplate::new("python score.py --in {{ output }}"),
//! ];
//!
//! let pipelines = ShardPlanner::new(1000, 4)
//!     .with_output_dir("/results")
//!     .plan(&stages)?;
//!
//! for pipeline in &pipelines {
//!     println!("{}: {}", pipeline.range, pipeline.command_line());
//! }
//! ```

pub mod pipeline;
pub mod range;

pub use pipeline::{
    plan, PipelineStage, ShardPipeline, ShardPlanner, StageTemplate, DEFAULT_OUTPUT_TEMPLATE,
};
pub use range::{shard_ranges, ShardRange};
