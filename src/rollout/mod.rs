//! Multi-turn, tool-augmented rollout.
//!
//! Prompts fan out into independent requests that alternate between engine
//! generation and tool calls until they finish, run out of budget or fail to
//! answer. Finished requests are scored and reassembled into one rectangular
//! batch for the optimization core.

pub mod batch;
pub mod engine;
pub mod image;
pub mod machine;
pub mod mock;
pub mod pool;
pub mod processor;
pub mod prompt;
pub mod scoring;
pub mod tools;
pub mod types;

pub use batch::{assemble, final_eos_mask, BatchStatistics, BatchSummary, RolloutBatch, RowMeta};
pub use engine::{final_output, EnginePrompt, GenerationEngine};
pub use machine::{Collaborators, RolloutWorker};
pub use processor::{ImageProcessor, PatchGridProcessor, Tokenizer};
pub use prompt::ChatTemplate;
pub use scoring::{
    AnswerMatchScorer, RewardScorer, ScoreRequest, ValidityClassifier, ValidityReport,
    ZeroVarianceFilter,
};
pub use tools::{CropTool, ToolDispatcher, ToolObservation};
pub use types::{
    FinishReason, GenerationOutput, PositionIds, PromptBatch, PromptSample, RequestState,
    RolloutMode, RolloutOutcome, RolloutRequest, SamplingParams,
};
