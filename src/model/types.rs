use serde::{Deserialize, Serialize};

/// Body of `POST /generate_essay`. The target band is embedded in the prompt
/// verbatim; it is not checked against the label table.
#[derive(Debug, Deserialize)]
pub struct EssayRequest {
    pub question: String,
    pub score: String,
}

/// Body of `POST /generate_evaltext` and `POST /evaluate`.
#[derive(Debug, Deserialize)]
pub struct EssayEvaluateScore {
    pub question: String,
    pub essay: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EssayResponse {
    pub essay: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResponse {
    pub evaluation_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreResponse {
    pub score: String,
}
