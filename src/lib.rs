pub mod auth;
pub mod config;
pub mod error;
pub mod image_processing;
pub mod normalize;
pub mod orchestrator;
pub mod replicate;
pub mod retry;
pub mod routes;
pub mod store;
pub mod validation;

pub use error::GenerationError;
pub use orchestrator::{GenerationRequest, Orchestrator};
