use std::path::Path;

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::{error::ServiceError, model::loader};

/// Token the generator was trained to emit when the target text is complete.
pub const END_MARKER: &str = "[END]";

pub fn essay_prompt(question: &str, band: &str) -> String {
    format!(
        "From the topic: {question}\n Band: {band}.\n Please write the essay for that question: \n"
    )
}

pub fn evaluation_prompt(question: &str, essay: &str, band: &str) -> String {
    format!(
        "From the topic: {question}.\n Essay: {essay}\n Band: {band}.\n Please write the evaluation for that essay: \n"
    )
}

/// Decoding knobs for one generation call. `max_length` bounds the total
/// sequence, prompt included.
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub max_length: usize,
    pub num_beams: usize,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i64,
}

impl DecodeConfig {
    /// Essay generation: beam search combined with sampling. The combination
    /// is intentional and matches how the generator checkpoint is used in
    /// production; do not normalize it to plain beam search.
    pub fn essay(max_length: usize) -> Self {
        Self {
            max_length,
            num_beams: 5,
            no_repeat_ngram_size: 3,
            early_stopping: true,
            do_sample: true,
            temperature: 0.3,
            top_p: 0.85,
            top_k: 50,
        }
    }

    /// Evaluation narratives: pure sampling, looser distribution.
    pub fn evaluation(max_length: usize) -> Self {
        Self {
            max_length,
            num_beams: 1,
            no_repeat_ngram_size: 4,
            early_stopping: false,
            do_sample: true,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
        }
    }
}

/// Tokens that would complete an n-gram already present in `ids`, given the
/// last n-1 tokens as context. Empty when the sequence is too short to repeat.
pub fn banned_ngram_tokens(ids: &[i64], ngram_size: usize) -> Vec<i64> {
    if ngram_size == 0 || ids.len() + 1 < ngram_size {
        return Vec::new();
    }
    let prefix = &ids[ids.len() + 1 - ngram_size..];
    let mut banned = Vec::new();
    for window in ids.windows(ngram_size) {
        let last = window[ngram_size - 1];
        if window[..ngram_size - 1] == *prefix && !banned.contains(&last) {
            banned.push(last);
        }
    }
    banned
}

/// Removes the echoed prompt prefix, then drops the end marker and anything
/// after it. The prompt echo may be absent (the decoder can normalize
/// whitespace), and the marker may never have been generated; both cases pass
/// the text through unchanged.
pub fn postprocess(decoded: &str, prompt: &str) -> String {
    let text = decoded
        .strip_prefix(prompt)
        .map(str::trim_start)
        .unwrap_or(decoded);
    match text.split_once(END_MARKER) {
        Some((kept, _)) => kept.trim_end().to_string(),
        None => text.to_string(),
    }
}

#[derive(Clone)]
struct BeamHypothesis {
    ids: Vec<i64>,
    score: f64,
    done: bool,
}

/// Causal-LM generator wrapping a TorchScript module. Forward passes are
/// serialized through the module mutex; the runtime is not assumed safe for
/// concurrent calls on shared device state.
pub struct GenerativeModel {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    device: Device,
    end_marker_id: Option<i64>,
}

impl GenerativeModel {
    pub fn load(checkpoint_dir: &Path, device: Device) -> Result<Self, ServiceError> {
        let tokenizer = loader::load_tokenizer(checkpoint_dir)?;
        let module = loader::load_module(checkpoint_dir, device)?;
        let end_marker_id = tokenizer.token_to_id(END_MARKER).map(i64::from);
        if end_marker_id.is_none() {
            tracing::warn!(
                "generator tokenizer has no {END_MARKER} token; generation will only stop at max length"
            );
        }

        Ok(Self {
            tokenizer,
            module: Mutex::new(module),
            device,
            end_marker_id,
        })
    }

    pub fn generate_essay(
        &self,
        question: &str,
        band: &str,
        max_length: usize,
    ) -> Result<String, ServiceError> {
        self.generate(&essay_prompt(question, band), &DecodeConfig::essay(max_length))
    }

    pub fn generate_evaluation(
        &self,
        question: &str,
        essay: &str,
        band: &str,
        max_length: usize,
    ) -> Result<String, ServiceError> {
        self.generate(
            &evaluation_prompt(question, essay, band),
            &DecodeConfig::evaluation(max_length),
        )
    }

    fn generate(&self, prompt: &str, config: &DecodeConfig) -> Result<String, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let prompt_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if prompt_ids.is_empty() {
            return Err(ServiceError::Tokenizer("prompt encoded to zero tokens".into()));
        }

        let output_ids = {
            let module = self.module.lock();
            no_grad(|| {
                if config.num_beams > 1 {
                    self.beam_sample_decode(&module, &prompt_ids, config)
                } else {
                    self.sample_decode(&module, &prompt_ids, config)
                }
            })
        }?;
        tracing::debug!(
            prompt_tokens = prompt_ids.len(),
            generated_tokens = output_ids.len() - prompt_ids.len(),
            "decoding finished"
        );

        let all_ids: Vec<u32> = output_ids.iter().map(|&id| id as u32).collect();
        let decoded = self
            .tokenizer
            .decode(&all_ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        Ok(postprocess(&decoded, prompt))
    }

    fn sample_decode(
        &self,
        module: &tch::CModule,
        prompt_ids: &[i64],
        config: &DecodeConfig,
    ) -> Result<Vec<i64>, ServiceError> {
        let mut ids = prompt_ids.to_vec();
        while ids.len() < config.max_length {
            let log_probs = self.next_token_log_probs(module, &ids, config)?;
            let next = if config.do_sample {
                let probs = log_probs.exp();
                probs.multinomial(1, true).int64_value(&[0])
            } else {
                log_probs.argmax(-1, false).int64_value(&[])
            };
            ids.push(next);
            if Some(next) == self.end_marker_id {
                break;
            }
        }
        Ok(ids)
    }

    /// Beam search where each live beam proposes sampled continuations from
    /// its warped distribution; hypotheses are ranked by cumulative
    /// log-probability during search and length-normalized at the end.
    fn beam_sample_decode(
        &self,
        module: &tch::CModule,
        prompt_ids: &[i64],
        config: &DecodeConfig,
    ) -> Result<Vec<i64>, ServiceError> {
        let prompt_len = prompt_ids.len();
        let mut beams = vec![BeamHypothesis {
            ids: prompt_ids.to_vec(),
            score: 0.0,
            done: prompt_len >= config.max_length,
        }];

        while beams.iter().any(|b| !b.done) {
            let mut candidates: Vec<BeamHypothesis> = Vec::new();
            for beam in &beams {
                if beam.done {
                    candidates.push(beam.clone());
                    continue;
                }
                let log_probs = self.next_token_log_probs(module, &beam.ids, config)?;
                for token in self.propose_tokens(&log_probs, config) {
                    let mut ids = beam.ids.clone();
                    ids.push(token);
                    let done =
                        Some(token) == self.end_marker_id || ids.len() >= config.max_length;
                    candidates.push(BeamHypothesis {
                        score: beam.score + log_probs.double_value(&[token]),
                        ids,
                        done,
                    });
                }
            }
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            candidates.truncate(config.num_beams);
            beams = candidates;

            if config.early_stopping && beams.iter().all(|b| b.done) {
                break;
            }
        }

        beams
            .into_iter()
            .max_by(|a, b| {
                let norm_a = a.score / (a.ids.len() - prompt_len).max(1) as f64;
                let norm_b = b.score / (b.ids.len() - prompt_len).max(1) as f64;
                norm_a.total_cmp(&norm_b)
            })
            .map(|beam| beam.ids)
            .ok_or_else(|| ServiceError::Inference("beam search produced no hypotheses".into()))
    }

    /// Candidate next tokens for one beam: sampled (deduplicated) draws when
    /// sampling is on, the top-scoring tokens otherwise.
    fn propose_tokens(&self, log_probs: &Tensor, config: &DecodeConfig) -> Vec<i64> {
        let beam_width = config.num_beams as i64;
        if config.do_sample {
            let draws = log_probs.exp().multinomial(beam_width, true);
            let mut tokens = Vec::with_capacity(config.num_beams);
            for i in 0..beam_width {
                let token = draws.int64_value(&[i]);
                if !tokens.contains(&token) {
                    tokens.push(token);
                }
            }
            tokens
        } else {
            let (_, indices) = log_probs.topk(beam_width, -1, true, true);
            (0..beam_width).map(|i| indices.int64_value(&[i])).collect()
        }
    }

    /// One forward pass followed by the logits pipeline: n-gram ban,
    /// temperature, top-k, then nucleus filtering.
    fn next_token_log_probs(
        &self,
        module: &tch::CModule,
        ids: &[i64],
        config: &DecodeConfig,
    ) -> Result<Tensor, ServiceError> {
        let input = Tensor::from_slice(ids)
            .reshape([1, ids.len() as i64])
            .to(self.device);
        let output = module
            .forward_is(&[IValue::Tensor(input)])
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        let logits = loader::extract_logits(output)?;

        let mut last = logits.select(1, -1).squeeze().to_kind(Kind::Float);

        let banned = banned_ngram_tokens(ids, config.no_repeat_ngram_size);
        if !banned.is_empty() {
            let index = Tensor::from_slice(&banned).to(self.device);
            let _ = last.index_fill_(0, &index, f64::NEG_INFINITY);
        }
        if config.temperature != 1.0 {
            last = last / config.temperature;
        }
        if config.top_k > 0 {
            last = top_k_filter(&last, config.top_k);
        }
        if config.top_p < 1.0 {
            last = top_p_filter(&last, config.top_p);
        }

        Ok(last.log_softmax(-1, Kind::Float))
    }
}

fn top_k_filter(logits: &Tensor, k: i64) -> Tensor {
    let vocab = logits.size()[0];
    let k = k.min(vocab);
    let (values, _) = logits.topk(k, -1, true, true);
    let threshold = values.select(0, k - 1);
    let below = logits.lt_tensor(&threshold);
    logits.masked_fill(&below, f64::NEG_INFINITY)
}

fn top_p_filter(logits: &Tensor, p: f64) -> Tensor {
    let (sorted, indices) = logits.sort(-1, true);
    let probs = sorted.softmax(-1, Kind::Float);
    // mass strictly before each candidate, so the token that crosses p stays
    let preceding = probs.cumsum(-1, Kind::Float) - &probs;
    let remove = preceding.gt(p);
    let filtered = sorted.masked_fill(&remove, f64::NEG_INFINITY);
    logits
        .full_like(f64::NEG_INFINITY)
        .scatter(-1, &indices, &filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn essay_prompt_matches_training_template() {
        let prompt = essay_prompt("Some people think...", "7.0");
        assert_eq!(
            prompt,
            "From the topic: Some people think...\n Band: 7.0.\n Please write the essay for that question: \n"
        );
    }

    #[test]
    fn evaluation_prompt_embeds_question_essay_and_band() {
        let prompt = evaluation_prompt("Q", "My essay.", "6.5");
        assert_eq!(
            prompt,
            "From the topic: Q.\n Essay: My essay.\n Band: 6.5.\n Please write the evaluation for that essay: \n"
        );
    }

    #[test]
    fn essay_preset_keeps_beam_search_with_sampling() {
        let config = DecodeConfig::essay(512);
        assert_eq!(config.max_length, 512);
        assert_eq!(config.num_beams, 5);
        assert_eq!(config.no_repeat_ngram_size, 3);
        assert!(config.early_stopping);
        assert!(config.do_sample);
        assert_eq!(config.temperature, 0.3);
        assert_eq!(config.top_p, 0.85);
        assert_eq!(config.top_k, 50);
    }

    #[test]
    fn evaluation_preset_is_pure_sampling() {
        let config = DecodeConfig::evaluation(1024);
        assert_eq!(config.max_length, 1024);
        assert_eq!(config.num_beams, 1);
        assert_eq!(config.no_repeat_ngram_size, 4);
        assert!(!config.early_stopping);
        assert!(config.do_sample);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.top_p, 0.9);
        assert_eq!(config.top_k, 50);
    }

    #[test]
    fn postprocess_strips_prompt_echo() {
        let prompt = essay_prompt("Q", "7.0");
        let decoded = format!("{prompt}An essay body.");
        assert_eq!(postprocess(&decoded, &prompt), "An essay body.");
    }

    #[test]
    fn postprocess_truncates_at_end_marker() {
        let out = postprocess("An essay body. [END] trailing junk", "unrelated prompt");
        assert_eq!(out, "An essay body.");
    }

    #[test]
    fn postprocess_passes_through_without_echo_or_marker() {
        assert_eq!(postprocess("plain text", "prompt"), "plain text");
    }

    #[test]
    fn postprocess_handles_echo_and_marker_together() {
        let prompt = evaluation_prompt("Q", "E", "5.5");
        let decoded = format!("{prompt}  Good cohesion.[END][END]");
        assert_eq!(postprocess(&decoded, &prompt), "Good cohesion.");
    }

    #[test]
    fn ngram_ban_blocks_repeated_trigram_completion() {
        // sequence contains trigram (1, 2, 3); context ends with (1, 2)
        let ids = [1, 2, 3, 4, 1, 2];
        assert_eq!(banned_ngram_tokens(&ids, 3), vec![3]);
    }

    #[test]
    fn ngram_ban_empty_when_sequence_too_short() {
        assert!(banned_ngram_tokens(&[1, 2], 4).is_empty());
        assert!(banned_ngram_tokens(&[], 3).is_empty());
    }

    #[test]
    fn ngram_ban_deduplicates_candidates() {
        let ids = [7, 8, 9, 7, 8, 9, 7, 8];
        assert_eq!(banned_ngram_tokens(&ids, 3), vec![9]);
    }

    #[test]
    fn unigram_ban_blocks_every_seen_token() {
        let ids = [5, 6, 5];
        assert_eq!(banned_ngram_tokens(&ids, 1), vec![5, 6]);
    }

    #[test]
    fn top_k_filter_keeps_exactly_k_candidates() {
        let logits = Tensor::from_slice(&[1.0f32, 4.0, 3.0, 2.0, 0.5]);
        let filtered = top_k_filter(&logits, 2);
        let kept = filtered.isfinite().sum(Kind::Int64).int64_value(&[]);
        assert_eq!(kept, 2);
        assert!(filtered.double_value(&[1]).is_finite());
        assert!(filtered.double_value(&[2]).is_finite());
    }

    #[test]
    fn top_p_filter_always_keeps_most_probable_token() {
        let logits = Tensor::from_slice(&[10.0f32, 1.0, 0.0, -1.0]);
        let filtered = top_p_filter(&logits, 0.05);
        assert!(filtered.double_value(&[0]).is_finite());
        let kept = filtered.isfinite().sum(Kind::Int64).int64_value(&[]);
        assert_eq!(kept, 1);
    }
}
