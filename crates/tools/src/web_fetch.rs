//! Web fetch tool: HTTP GET a URL and return the (truncated) body.

use async_trait::async_trait;
use ouroboros_core::error::ToolError;
use ouroboros_core::tool::{Tool, ToolOutput};
use std::time::Duration;
use tracing::{debug, warn};

pub struct WebFetchTool {
    client: reqwest::Client,
    max_bytes: usize,
    timeout: Duration,
}

impl WebFetchTool {
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ouroboros/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            client,
            max_bytes,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page or API endpoint over HTTP(S) with GET and return the status and body text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http:// or https:// URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let url = arguments["url"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'url' argument".into()))?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ToolError::Validation {
                tool_name: "web_fetch".into(),
                reason: format!("unsupported URL scheme in '{url}'"),
            });
        }

        debug!(url = %url, "Fetching URL");
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout {
                    tool_name: "web_fetch".into(),
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                ToolError::ExecutionFailed {
                    tool_name: "web_fetch".into(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "web_fetch".into(),
                reason: format!("failed to read body: {e}"),
            })?;

        let total = bytes.len();
        let shown = &bytes[..total.min(self.max_bytes)];
        let mut body = String::from_utf8_lossy(shown).into_owned();
        if total > self.max_bytes {
            body.push_str(&format!("\n... [truncated, {total} bytes total]"));
        }

        let text = format!("HTTP {}\n\n{body}", status.as_u16());
        let data = serde_json::json!({
            "status": status.as_u16(),
            "content_type": content_type,
            "bytes": total,
        });
        let output = if status.is_success() {
            ToolOutput::ok(text)
        } else {
            ToolOutput::failed(text)
        };
        Ok(output.with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/page")
    }

    #[tokio::test]
    async fn fetches_and_truncates() {
        let url = serve_once("200 OK", "abcdefghijklmnopqrstuvwxyz").await;
        let tool = WebFetchTool::new(Duration::from_secs(5), 10);
        let result = tool.execute(serde_json::json!({"url": url})).await.unwrap();
        assert!(result.success);
        assert!(result.output.starts_with("HTTP 200\n\nabcdefghij\n"));
        assert!(result.output.contains("26 bytes total"));
        assert_eq!(result.data.unwrap()["content_type"], "text/plain");
    }

    #[tokio::test]
    async fn error_status_is_failure() {
        let url = serve_once("404 Not Found", "missing").await;
        let tool = WebFetchTool::new(Duration::from_secs(5), 1000);
        let result = tool.execute(serde_json::json!({"url": url})).await.unwrap();
        assert!(!result.success);
        assert!(result.output.starts_with("HTTP 404"));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let tool = WebFetchTool::new(Duration::from_secs(5), 1000);
        let result = tool
            .execute(serde_json::json!({"url": "file:///etc/passwd"}))
            .await;
        assert!(matches!(result, Err(ToolError::Validation { .. })));
    }
}
