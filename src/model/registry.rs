use tokio::task;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::loader::ModelArtifacts,
};

/// Owns the loaded models and runs every inference call on the blocking
/// thread pool so forward passes never stall the async runtime.
pub struct ModelRegistry {
    artifacts: ModelArtifacts,
}

impl ModelRegistry {
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let artifacts = ModelArtifacts::load(config)?;
        Ok(Self { artifacts })
    }

    pub async fn essay(
        &self,
        question: String,
        band: String,
        config: &AppConfig,
    ) -> Result<String, ServiceError> {
        let generator = self.artifacts.generator.clone();
        let max_length = config.essay_max_length;
        task::spawn_blocking(move || generator.generate_essay(&question, &band, max_length))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    /// Scores the essay first, then generates the evaluation narrative
    /// conditioned on the predicted band. A scoring failure aborts the whole
    /// call; there is no fallback score.
    pub async fn evaluation(
        &self,
        question: String,
        essay: String,
        config: &AppConfig,
    ) -> Result<String, ServiceError> {
        let generator = self.artifacts.generator.clone();
        let scorer = self.artifacts.scorer.clone();
        let max_length = config.evaluation_max_length;
        task::spawn_blocking(move || {
            let band = scorer.predict(&question, &essay)?;
            tracing::debug!(%band, "conditioning evaluation on predicted band");
            generator.generate_evaluation(&question, &essay, &band, max_length)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }

    pub async fn score(
        &self,
        question: String,
        essay: String,
    ) -> Result<String, ServiceError> {
        let scorer = self.artifacts.scorer.clone();
        task::spawn_blocking(move || scorer.predict(&question, &essay))
            .await
            .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}
