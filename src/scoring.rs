use std::path::Path;

use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::{Tokenizer, TruncationParams};

use crate::{error::ServiceError, model::loader};

/// Classifier output index -> IELTS band label. The order mirrors the label
/// order the scoring checkpoint was trained with; index i of the classifier's
/// logits corresponds to `BAND_LABELS[i]`.
pub const BAND_LABELS: [&str; 12] = [
    "3.0", "4.0", "4.5", "5.0", "5.5", "6.0", "6.5", "7.0", "7.5", "8.0", "8.5", "9.0",
];

/// Max token length of the encoded question/essay pair. Longer inputs are
/// truncated, not rejected.
pub const SCORING_MAX_TOKENS: usize = 512;

pub fn band_label(index: usize) -> Option<&'static str> {
    BAND_LABELS.get(index).copied()
}

/// Sequence-classification scorer: question + essay pair in, band label out.
pub struct ScoringModel {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    device: Device,
}

impl ScoringModel {
    pub fn load(checkpoint_dir: &Path, device: Device) -> Result<Self, ServiceError> {
        let mut tokenizer = loader::load_tokenizer(checkpoint_dir)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: SCORING_MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let module = loader::load_module(checkpoint_dir, device)?;

        Ok(Self {
            tokenizer,
            module: Mutex::new(module),
            device,
        })
    }

    /// Encodes the pair (the tokenizer inserts its separator between question
    /// and essay and truncates at 512 tokens), runs a forward pass without
    /// gradients, and maps the argmax class to its band label. An index the
    /// table does not cover is an error, never a silently wrong label.
    pub fn predict(&self, question: &str, essay: &str) -> Result<String, ServiceError> {
        let encoding = self
            .tokenizer
            .encode((question, essay), true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let seq_len = input_ids.len() as i64;

        let pred_id = no_grad(|| {
            let ids = Tensor::from_slice(&input_ids)
                .reshape([1, seq_len])
                .to(self.device);
            let mask = Tensor::from_slice(&attention_mask)
                .reshape([1, seq_len])
                .to(self.device);

            let module = self.module.lock();
            let output = module
                .forward_is(&[tch::IValue::Tensor(ids), tch::IValue::Tensor(mask)])
                .map_err(|e| ServiceError::Inference(e.to_string()))?;
            let logits = loader::extract_logits(output)?.squeeze();

            let probs = logits.to_kind(Kind::Float).softmax(-1, Kind::Float);
            Ok::<i64, ServiceError>(probs.argmax(-1, false).int64_value(&[]))
        })?;

        band_label(pred_id as usize)
            .map(|label| label.to_string())
            .ok_or_else(|| {
                ServiceError::Inference(format!(
                    "classifier produced out-of-range class index {pred_id}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_table_covers_all_twelve_bands() {
        let expected = [
            "3.0", "4.0", "4.5", "5.0", "5.5", "6.0", "6.5", "7.0", "7.5", "8.0", "8.5", "9.0",
        ];
        for (idx, want) in expected.iter().enumerate() {
            assert_eq!(band_label(idx), Some(*want));
        }
    }

    #[test]
    fn label_table_rejects_out_of_range_indices() {
        assert_eq!(band_label(12), None);
        assert_eq!(band_label(usize::MAX), None);
    }

    #[test]
    fn label_table_is_strictly_increasing() {
        for pair in BAND_LABELS.windows(2) {
            let a: f64 = pair[0].parse().unwrap();
            let b: f64 = pair[1].parse().unwrap();
            assert!(a < b, "{} should precede {}", pair[0], pair[1]);
        }
    }
}
