use std::{path::Path, sync::Arc, time::Instant};

use tch::{Device, IValue, Tensor};
use tokenizers::Tokenizer;

use crate::{
    config::AppConfig, error::ServiceError, generation::GenerativeModel, scoring::ScoringModel,
};

/// TorchScript module filenames probed inside a checkpoint directory.
const MODULE_FILES: [&str; 2] = ["model.pt", "model.ts"];

const TOKENIZER_FILE: &str = "tokenizer.json";

/// Both model instances, loaded eagerly at startup. A missing or corrupt
/// checkpoint fails the load; there is no lazy path and no fallback.
pub struct ModelArtifacts {
    pub generator: Arc<GenerativeModel>,
    pub scorer: Arc<ScoringModel>,
}

impl ModelArtifacts {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let started = Instant::now();

        let generator = Arc::new(GenerativeModel::load(
            &config.gen_checkpoint_dir,
            config.device,
        )?);
        let scorer = Arc::new(ScoringModel::load(
            &config.score_checkpoint_dir,
            config.device,
        )?);

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            device = ?config.device,
            "model checkpoints loaded"
        );

        Ok(Self { generator, scorer })
    }
}

pub(crate) fn load_tokenizer(checkpoint_dir: &Path) -> Result<Tokenizer, ServiceError> {
    let path = checkpoint_dir.join(TOKENIZER_FILE);
    if !path.exists() {
        return Err(ServiceError::Other(format!(
            "tokenizer artifact missing: {}",
            path.display()
        )));
    }
    Tokenizer::from_file(&path).map_err(|e| ServiceError::Tokenizer(e.to_string()))
}

pub(crate) fn load_module(
    checkpoint_dir: &Path,
    device: Device,
) -> Result<tch::CModule, ServiceError> {
    let path = MODULE_FILES
        .iter()
        .map(|name| checkpoint_dir.join(name))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            ServiceError::Other(format!(
                "no TorchScript module found in {}",
                checkpoint_dir.display()
            ))
        })?;

    let mut module = tch::CModule::load_on_device(&path, device)
        .map_err(|e| ServiceError::Inference(e.to_string()))?;
    module.set_eval();
    Ok(module)
}

/// Traced modules may return the logits tensor directly or a tuple with the
/// logits first (e.g. followed by past key values).
pub(crate) fn extract_logits(output: IValue) -> Result<Tensor, ServiceError> {
    match output {
        IValue::Tensor(t) => Ok(t),
        IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
            IValue::Tensor(t) => Ok(t.shallow_clone()),
            _ => Err(ServiceError::Inference(
                "expected tensor as first tuple element".into(),
            )),
        },
        _ => Err(ServiceError::Inference(
            "unexpected model output format".into(),
        )),
    }
}
