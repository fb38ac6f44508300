#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod blob;
pub mod config;
pub mod embedding;
pub mod error;
pub mod feed;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod tokens;

pub use config::Config;
pub use error::{PipelineError, RaglineError, Result};
pub use pipeline::{Pipeline, PipelineOptions, ProcessOutcome, WorkerLoop};
pub use store::Store;
