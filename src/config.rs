use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub download_dir: PathBuf,
    pub ytdlp_container: String,
    pub docker_bin: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub aria2_rpc_url: String,
    pub aria2_rpc_secret: Option<String>,
    pub upstream_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("MEDIA_GATEWAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 4000)));

        let download_dir = PathBuf::from(
            env::var("MEDIA_GATEWAY_DOWNLOAD_DIR").unwrap_or_else(|_| "/data/movies".to_string()),
        );

        let ytdlp_container = non_empty_var("MEDIA_GATEWAY_YTDLP_CONTAINER")
            .unwrap_or_else(|| "drive-ytdlp".to_string());
        let docker_bin =
            non_empty_var("MEDIA_GATEWAY_DOCKER_BIN").unwrap_or_else(|| "docker".to_string());

        let ollama_base_url = non_empty_var("OLLAMA_BASE_URL")
            .unwrap_or_else(|| "http://drive-ollama:11434".to_string())
            .trim_end_matches('/')
            .to_string();
        let ollama_model =
            non_empty_var("OLLAMA_MODEL").unwrap_or_else(|| "qwen2.5:1.5b".to_string());

        let aria2_rpc_url = non_empty_var("ARIA2_RPC_URL")
            .unwrap_or_else(|| "http://drive-gluetun:6800/jsonrpc".to_string());
        let aria2_rpc_secret = non_empty_var("ARIA2_RPC_SECRET");

        let upstream_timeout = env::var("MEDIA_GATEWAY_UPSTREAM_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Ok(Self {
            bind_addr,
            download_dir,
            ytdlp_container,
            docker_bin,
            ollama_base_url,
            ollama_model,
            aria2_rpc_url,
            aria2_rpc_secret,
            upstream_timeout,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
