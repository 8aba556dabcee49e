// Normalization pipeline: per-record stages, worker pool and process lifecycle

pub mod cancel;
pub mod orchestrator;
pub mod processing;
pub mod worker;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use orchestrator::{FollowOn, Orchestrator, ProcessEvent};
pub use worker::{RecordOutcome, RecordPipeline};
