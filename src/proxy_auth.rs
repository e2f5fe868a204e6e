//! Proxy credential binder.
//!
//! Chrome never surfaces an upstream proxy's auth challenge to automation
//! through the normal page lifecycle, so every page target gets a Fetch
//! interception session that answers `Fetch.authRequired` with the
//! configured credentials: existing tabs at bind time and every tab the
//! user opens afterwards. Tabs that already carried real content when the
//! credentials arrived are reloaded once so the authenticated fetch
//! actually happens.

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::cdp::{CdpClient, CdpError};
use crate::proxy_storage::StoredProxy;
use crate::session_restore::{is_blank_url, is_internal_url};

const RELOAD_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProxyCredentials {
  pub username: String,
  pub password: String,
}

impl ProxyCredentials {
  /// Extract credentials from a stored proxy. `None` when the proxy has no
  /// username, in which case binding is skipped entirely.
  pub fn from_proxy(proxy: &StoredProxy) -> Option<Self> {
    if !proxy.has_credentials() {
      return None;
    }
    Some(Self {
      username: proxy.username.clone().unwrap_or_default(),
      password: proxy.password.clone().unwrap_or_default(),
    })
  }
}

/// Handle over the listener tasks spawned by [`bind`]. Cancelling it tears
/// down the per-target sessions and the new-target watcher.
pub struct AuthBinding {
  cancel: CancellationToken,
}

impl AuthBinding {
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn cancel(&self) {
    self.cancel.cancel();
  }
}

/// Tabs showing real content at bind time need one reload for the
/// authenticated connection to take effect; placeholders and internal
/// pages do not.
fn should_reload(url: &str) -> bool {
  !is_blank_url(url) && !is_internal_url(url)
}

/// Attach credentials to every current page target and keep attaching to
/// targets created later, for the lifetime of the instance.
pub async fn bind(cdp: &CdpClient, credentials: ProxyCredentials) -> Result<AuthBinding, CdpError> {
  let cancel = CancellationToken::new();

  let targets = cdp.page_targets().await?;
  log::info!(
    "Binding proxy credentials to {} existing tab(s)",
    targets.len()
  );

  for target in &targets {
    let ws_url = target
      .websocket_debugger_url
      .clone()
      .unwrap_or_else(|| cdp.page_ws_url(&target.id));
    tokio::spawn(attach_target(
      ws_url,
      target.url.clone(),
      credentials.clone(),
      cancel.child_token(),
    ));
  }

  let browser_ws = cdp.browser_ws_url().await?;
  tokio::spawn(watch_new_targets(
    browser_ws,
    cdp.port(),
    credentials,
    cancel.child_token(),
  ));

  Ok(AuthBinding { cancel })
}

/// Browser-endpoint listener that discovers page targets created after
/// bind time and attaches a credential session to each.
async fn watch_new_targets(
  browser_ws: String,
  port: u16,
  credentials: ProxyCredentials,
  cancel: CancellationToken,
) {
  let (mut ws, _) = match connect_async(browser_ws.as_str()).await {
    Ok(conn) => conn,
    Err(e) => {
      log::warn!("Could not open target-discovery socket: {e}");
      return;
    }
  };

  let discover = json!({
    "id": 1,
    "method": "Target.setDiscoverTargets",
    "params": { "discover": true }
  });
  if let Err(e) = ws.send(Message::Text(discover.to_string().into())).await {
    log::warn!("Could not enable target discovery: {e}");
    return;
  }

  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      msg = ws.next() => {
        match msg {
          Some(Ok(Message::Text(text))) => {
            let Ok(event) = serde_json::from_str::<Value>(text.as_str()) else {
              continue;
            };
            if event.get("method").and_then(|m| m.as_str()) != Some("Target.targetCreated") {
              continue;
            }
            let info = &event["params"]["targetInfo"];
            if info.get("type").and_then(|t| t.as_str()) != Some("page") {
              continue;
            }
            if let Some(target_id) = info.get("targetId").and_then(|t| t.as_str()) {
              let url = info
                .get("url")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
              log::info!("Binding proxy credentials to new tab {target_id}");
              let ws_url = format!("ws://127.0.0.1:{port}/devtools/page/{target_id}");
              tokio::spawn(attach_target(
                ws_url,
                url,
                credentials.clone(),
                cancel.child_token(),
              ));
            }
          }
          Some(Ok(Message::Close(_))) | None => break,
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            log::warn!("Target-discovery socket error: {e}");
            break;
          }
        }
      }
    }
  }
}

async fn send_on<S>(
  ws: &mut S,
  next_id: &mut u64,
  method: &str,
  params: Value,
) -> Result<(), WsError>
where
  S: Sink<Message, Error = WsError> + Unpin,
{
  let id = *next_id;
  *next_id += 1;
  let command = json!({ "id": id, "method": method, "params": params });
  ws.send(Message::Text(command.to_string().into())).await
}

/// Per-target session: enables Fetch interception with auth handling,
/// answers challenges with the credentials, and reloads the tab once after
/// a short delay if it already carried real content.
async fn attach_target(
  ws_url: String,
  initial_url: String,
  credentials: ProxyCredentials,
  cancel: CancellationToken,
) {
  let (mut ws, _) = match connect_async(ws_url.as_str()).await {
    Ok(conn) => conn,
    Err(e) => {
      log::warn!("Could not attach to tab at {ws_url}: {e}");
      return;
    }
  };

  let mut next_id: u64 = 1;

  if let Err(e) = send_on(
    &mut ws,
    &mut next_id,
    "Fetch.enable",
    json!({ "handleAuthRequests": true }),
  )
  .await
  {
    log::warn!("Could not enable auth interception on {ws_url}: {e}");
    return;
  }

  let mut reload_pending = should_reload(&initial_url);
  let reload_timer = tokio::time::sleep(RELOAD_DELAY);
  tokio::pin!(reload_timer);

  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = &mut reload_timer, if reload_pending => {
        reload_pending = false;
        log::info!("Reloading {initial_url} to pick up authenticated proxy connection");
        if let Err(e) = send_on(&mut ws, &mut next_id, "Page.reload", json!({})).await {
          // The tab keeps its pre-reload state; nothing else to do.
          log::warn!("Post-auth reload failed for {initial_url}: {e}");
        }
      }
      msg = ws.next() => {
        match msg {
          Some(Ok(Message::Text(text))) => {
            let Ok(event) = serde_json::from_str::<Value>(text.as_str()) else {
              continue;
            };
            match event.get("method").and_then(|m| m.as_str()) {
              Some("Fetch.authRequired") => {
                let Some(request_id) = event["params"]["requestId"].as_str() else {
                  continue;
                };
                let answer = json!({
                  "requestId": request_id,
                  "authChallengeResponse": {
                    "response": "ProvideCredentials",
                    "username": credentials.username.clone(),
                    "password": credentials.password.clone(),
                  }
                });
                if let Err(e) = send_on(&mut ws, &mut next_id, "Fetch.continueWithAuth", answer).await {
                  log::warn!("Could not answer auth challenge: {e}");
                }
              }
              Some("Fetch.requestPaused") => {
                let Some(request_id) = event["params"]["requestId"].as_str() else {
                  continue;
                };
                if let Err(e) = send_on(
                  &mut ws,
                  &mut next_id,
                  "Fetch.continueRequest",
                  json!({ "requestId": request_id }),
                )
                .await
                {
                  log::warn!("Could not continue intercepted request: {e}");
                }
              }
              _ => {}
            }
          }
          Some(Ok(Message::Close(_))) | None => break,
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            log::debug!("Tab session closed: {e}");
            break;
          }
        }
      }
    }
  }
}
