pub(crate) mod loader;
mod registry;
mod types;

pub use loader::ModelArtifacts;
pub use registry::ModelRegistry;
pub use types::{EssayEvaluateScore, EssayRequest, EssayResponse, EvaluationResponse, ScoreResponse};
