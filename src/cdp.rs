//! Chrome DevTools Protocol plumbing: the out-of-band channel used to
//! inspect and drive a launched browser without user interaction.

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub const BLANK_URL: &str = "about:blank";

const READY_MAX_ATTEMPTS: u32 = 50;
const READY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum CdpError {
  #[error("HTTP error on browser endpoint: {0}")]
  Http(#[from] reqwest::Error),

  #[error("WebSocket error: {0}")]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

  #[error("CDP protocol error: {0}")]
  Protocol(String),

  #[error("Control channel not ready after {attempts} attempts on port {port}")]
  NotReady { attempts: u32, port: u16 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdpTarget {
  pub id: String,
  #[serde(rename = "type")]
  pub target_type: String,
  #[serde(default)]
  pub url: String,
  #[serde(rename = "webSocketDebuggerUrl")]
  pub websocket_debugger_url: Option<String>,
}

impl CdpTarget {
  pub fn is_page(&self) -> bool {
    self.target_type == "page"
  }
}

/// Thin client over one browser's DevTools endpoint on localhost.
pub struct CdpClient {
  port: u16,
  http: Client,
}

impl CdpClient {
  pub fn new(port: u16) -> Self {
    Self {
      port,
      http: Client::new(),
    }
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// Poll `/json/version` until the freshly spawned browser starts
  /// answering. The browser binds the debugging port asynchronously, so a
  /// bounded retry loop stands between spawn and first command.
  pub async fn wait_until_ready(&self) -> Result<(), CdpError> {
    let url = format!("http://127.0.0.1:{}/json/version", self.port);

    for attempt in 0..READY_MAX_ATTEMPTS {
      match self.http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
          log::info!(
            "Control channel ready on port {} after {attempt} attempts",
            self.port
          );
          return Ok(());
        }
        _ => tokio::time::sleep(READY_DELAY).await,
      }
    }

    Err(CdpError::NotReady {
      attempts: READY_MAX_ATTEMPTS,
      port: self.port,
    })
  }

  /// Single liveness probe, used by the health monitor.
  pub async fn is_reachable(&self) -> bool {
    let url = format!("http://127.0.0.1:{}/json/version", self.port);
    matches!(self.http.get(&url).send().await, Ok(resp) if resp.status().is_success())
  }

  pub async fn targets(&self) -> Result<Vec<CdpTarget>, CdpError> {
    let url = format!("http://127.0.0.1:{}/json", self.port);
    let resp = self.http.get(&url).send().await?;
    let targets: Vec<CdpTarget> = resp.json().await?;
    Ok(targets)
  }

  pub async fn page_targets(&self) -> Result<Vec<CdpTarget>, CdpError> {
    Ok(
      self
        .targets()
        .await?
        .into_iter()
        .filter(|t| t.is_page())
        .collect(),
    )
  }

  /// WebSocket URL of the browser-level target (`/json/version`).
  pub async fn browser_ws_url(&self) -> Result<String, CdpError> {
    let url = format!("http://127.0.0.1:{}/json/version", self.port);
    let resp = self.http.get(&url).send().await?;
    let version: Value = resp.json().await?;
    version
      .get("webSocketDebuggerUrl")
      .and_then(|v| v.as_str())
      .map(|s| s.to_string())
      .ok_or_else(|| CdpError::Protocol("missing webSocketDebuggerUrl".to_string()))
  }

  /// WebSocket URL for a page target id, without re-fetching `/json`.
  pub fn page_ws_url(&self, target_id: &str) -> String {
    format!("ws://127.0.0.1:{}/devtools/page/{target_id}", self.port)
  }

  /// One-shot command: connect, send, wait for the matching response,
  /// disconnect. Long-lived event listeners use their own sessions.
  pub async fn send_command(
    &self,
    ws_url: &str,
    method: &str,
    params: Value,
  ) -> Result<Value, CdpError> {
    let (mut ws_stream, _) = connect_async(ws_url).await?;

    let command = json!({
      "id": 1,
      "method": method,
      "params": params
    });

    ws_stream
      .send(Message::Text(command.to_string().into()))
      .await?;

    while let Some(msg) = ws_stream.next().await {
      match msg? {
        Message::Text(text) => {
          let response: Value = serde_json::from_str(text.as_str())
            .map_err(|e| CdpError::Protocol(format!("bad JSON from browser: {e}")))?;
          if response.get("id") == Some(&json!(1)) {
            if let Some(error) = response.get("error") {
              return Err(CdpError::Protocol(format!("CDP error: {error}")));
            }
            return Ok(response.get("result").cloned().unwrap_or(json!({})));
          }
        }
        Message::Close(_) => break,
        _ => {}
      }
    }

    Err(CdpError::Protocol(format!("no response to {method}")))
  }

  /// Close one tab by target id.
  pub async fn close_target(&self, target_id: &str) -> Result<(), CdpError> {
    let ws_url = self.browser_ws_url().await?;
    self
      .send_command(&ws_url, "Target.closeTarget", json!({ "targetId": target_id }))
      .await?;
    Ok(())
  }

  /// Ask the browser to shut down cleanly. The socket usually drops before
  /// the response arrives, so callers should treat timeouts as success and
  /// verify via the process table.
  pub async fn close_browser(&self) -> Result<(), CdpError> {
    let ws_url = self.browser_ws_url().await?;
    self.send_command(&ws_url, "Browser.close", json!({})).await?;
    Ok(())
  }
}

/// Pick an ephemeral localhost port for `--remote-debugging-port`.
pub async fn find_free_port() -> Result<u16, std::io::Error> {
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
  let port = listener.local_addr()?.port();
  drop(listener);
  Ok(port)
}
