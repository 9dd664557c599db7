pub mod config;
pub mod error;
pub mod generation;
pub mod model;
pub mod scoring;
pub mod server;

pub use config::AppConfig;
pub use model::{EssayEvaluateScore, EssayRequest, ModelRegistry};
pub use server::build_router;
