use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::UpstreamError;

const SERVICE: &str = "aria2";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

/// Thin JSON-RPC client for the aria2 daemon. Download entries are passed
/// through as raw JSON.
#[derive(Debug, Clone)]
pub struct Aria2Client {
    http: reqwest::Client,
    rpc_url: String,
    secret: Option<String>,
    timeout: Duration,
}

impl Aria2Client {
    pub fn new(
        http: reqwest::Client,
        rpc_url: String,
        secret: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            rpc_url,
            secret,
            timeout,
        }
    }

    pub async fn add_magnet(&self, magnet_link: &str, save_path: &str) -> Result<String, UpstreamError> {
        validate_magnet(magnet_link)?;
        self.call(
            "aria2.addUri",
            vec![json!([magnet_link]), json!({ "dir": save_path })],
        )
        .await
    }

    pub async fn tell_active(&self) -> Result<Value, UpstreamError> {
        self.call("aria2.tellActive", Vec::new()).await
    }

    pub async fn tell_waiting(&self) -> Result<Value, UpstreamError> {
        self.call("aria2.tellWaiting", vec![json!(0), json!(PAGE_SIZE)])
            .await
    }

    pub async fn tell_stopped(&self) -> Result<Value, UpstreamError> {
        self.call("aria2.tellStopped", vec![json!(0), json!(PAGE_SIZE)])
            .await
    }

    /// aria2 answers an unknown gid with an RPC error; that reads as `None`.
    pub async fn tell_status(&self, gid: &str) -> Result<Option<Value>, UpstreamError> {
        match self.call("aria2.tellStatus", vec![json!(gid)]).await {
            Ok(value) => Ok(Some(value)),
            Err(UpstreamError::Rpc { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn pause(&self, gid: &str, force: bool) -> Result<String, UpstreamError> {
        let method = if force { "aria2.forcePause" } else { "aria2.pause" };
        self.call(method, vec![json!(gid)]).await
    }

    pub async fn resume(&self, gid: &str) -> Result<String, UpstreamError> {
        self.call("aria2.unpause", vec![json!(gid)]).await
    }

    pub async fn remove(&self, gid: &str, force: bool) -> Result<String, UpstreamError> {
        let method = if force { "aria2.forceRemove" } else { "aria2.remove" };
        self.call(method, vec![json!(gid)]).await
    }

    pub async fn global_stat(&self) -> Result<Value, UpstreamError> {
        self.call("aria2.getGlobalStat", Vec::new()).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, UpstreamError> {
        let payload = rpc_payload(method, self.secret.as_deref(), params);
        let response = self
            .http
            .post(&self.rpc_url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                service: SERVICE,
                source,
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|source| UpstreamError::Transport {
            service: SERVICE,
            source,
        })?;

        // aria2 reports RPC errors with a non-2xx status and a JSON body.
        let parsed = serde_json::from_str::<RpcResponse<T>>(&text);
        match parsed {
            Ok(RpcResponse {
                error: Some(err), ..
            }) => Err(UpstreamError::Rpc {
                code: err.code,
                message: err.message,
            }),
            Ok(RpcResponse {
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            _ if !status.is_success() => Err(UpstreamError::Status {
                service: SERVICE,
                status: status.as_u16(),
                detail: text,
            }),
            _ => Err(UpstreamError::Invalid(format!(
                "aria2 returned an unexpected response to {method}"
            ))),
        }
    }
}

pub fn validate_magnet(magnet_link: &str) -> Result<(), UpstreamError> {
    if magnet_link.starts_with("magnet:") {
        Ok(())
    } else {
        Err(UpstreamError::Invalid(
            "Invalid magnet link. Must start with \"magnet:\"".to_string(),
        ))
    }
}

fn rpc_payload(method: &str, secret: Option<&str>, params: Vec<Value>) -> Value {
    let mut all_params = Vec::with_capacity(params.len() + 1);
    if let Some(secret) = secret {
        all_params.push(json!(format!("token:{secret}")));
    }
    all_params.extend(params);

    json!({
        "jsonrpc": "2.0",
        "method": method,
        "id": format!("req_{}", Uuid::new_v4().simple()),
        "params": all_params,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{rpc_payload, validate_magnet};

    #[test]
    fn secret_is_prepended_as_token() {
        let payload = rpc_payload("aria2.pause", Some("s3cret"), vec![json!("abc")]);
        assert_eq!(payload["method"], "aria2.pause");
        assert_eq!(payload["params"], json!(["token:s3cret", "abc"]));
        assert!(payload["id"].as_str().expect("id").starts_with("req_"));
    }

    #[test]
    fn no_secret_leaves_params_untouched() {
        let payload = rpc_payload("aria2.tellActive", None, Vec::new());
        assert_eq!(payload["params"], json!([]));
    }

    #[test]
    fn magnet_prefix_required() {
        assert!(validate_magnet("magnet:?xt=urn:btih:abc").is_ok());
        assert!(validate_magnet("http://example.com/a.torrent").is_err());
    }
}
