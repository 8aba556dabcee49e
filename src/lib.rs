pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod observability;
pub mod storage;

// Normalization stages and process lifecycle
pub mod pipeline;

// Layered boundaries: ports and service facade, plus provider/source adapters
pub mod app;
pub mod infra;

pub use app::NsiService;
pub use config::Config;
pub use error::{PipelineError, Result};
