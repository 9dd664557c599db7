use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use axum::http::HeaderValue;
use tch::Device;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub gen_checkpoint_dir: PathBuf,
    pub score_checkpoint_dir: PathBuf,
    pub cors_origin: HeaderValue,
    pub essay_max_length: usize,
    pub evaluation_max_length: usize,
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

        let gen_checkpoint_dir = PathBuf::from(
            env::var("GEN_CHECKPOINT_DIR")
                .unwrap_or_else(|_| "./gpt_ielts/checkpoint-8170".to_string()),
        );
        let score_checkpoint_dir = PathBuf::from(
            env::var("SCORE_CHECKPOINT_DIR").unwrap_or_else(|_| "./eval_score".to_string()),
        );

        let cors_origin = env::var("CORS_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .parse::<HeaderValue>()
            .map_err(|e| anyhow::anyhow!("invalid CORS_ORIGIN: {e}"))?;

        let essay_max_length = env::var("ESSAY_MAX_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(512);
        let evaluation_max_length = env::var("EVALUATION_MAX_LENGTH")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);

        // Accelerator if present, CPU otherwise. No override flag.
        let device = Device::cuda_if_available();

        Ok(Self {
            listen_addr,
            gen_checkpoint_dir,
            score_checkpoint_dir,
            cors_origin,
            essay_max_length,
            evaluation_max_length,
            device,
        })
    }
}
