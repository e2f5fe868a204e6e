//! The authoritative registry of running browser instances, plus the
//! per-instance health monitor.
//!
//! The registry map is the only shared mutable state in the orchestration
//! core. Writers are the launcher (insert), explicit stops (remove) and
//! health transitions; everything else reads snapshots. Health monitors
//! run as independent tasks that report transitions over a channel back to
//! a single registry-update task, so the second writer racing toward
//! "disconnected" is a no-op rather than an error.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::cdp::CdpClient;
use crate::proxy_storage::{ProxyScheme, StoredProxy};
use crate::window_placement::WindowGeometry;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const EXIT_POLL_ROUNDS: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("Instance '{0}' not found")]
  InstanceNotFound(String),
}

fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

fn now_millis() -> u128 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis()
}

/// One running browser process bound to a profile. Owned exclusively by
/// the registry; everything outside sees [`InstanceSummary`] copies.
#[derive(Debug)]
pub struct Instance {
  pub id: String,
  pub profile_id: uuid::Uuid,
  pub pid: u32,
  pub cdp_port: u16,
  pub proxy: Option<StoredProxy>,
  pub geometry: WindowGeometry,
  pub start_time: u64,
  pub is_active: bool,
  pub disconnected_at: Option<u64>,
  pub warnings: Vec<String>,
  monitor_cancel: CancellationToken,
  auth_cancel: Option<CancellationToken>,
}

impl Instance {
  pub fn new(
    profile_id: uuid::Uuid,
    pid: u32,
    cdp_port: u16,
    proxy: Option<StoredProxy>,
    geometry: WindowGeometry,
    warnings: Vec<String>,
    auth_cancel: Option<CancellationToken>,
  ) -> Self {
    // Millisecond start stamp plus a process-local sequence number, so two
    // launches landing in the same millisecond still get distinct ids.
    static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed);
    Self {
      id: format!("{profile_id}_{}_{seq}", now_millis()),
      profile_id,
      pid,
      cdp_port,
      proxy,
      geometry,
      start_time: now_secs(),
      is_active: true,
      disconnected_at: None,
      warnings,
      monitor_cancel: CancellationToken::new(),
      auth_cancel,
    }
  }

  fn summary(&self) -> InstanceSummary {
    InstanceSummary {
      instance_id: self.id.clone(),
      profile_id: self.profile_id,
      pid: self.pid,
      cdp_port: self.cdp_port,
      is_active: self.is_active,
      start_time: self.start_time,
      disconnected_at: self.disconnected_at,
      geometry: self.geometry,
      proxy: self.proxy.as_ref().map(|p| ProxySummary {
        host: p.host.clone(),
        port: p.port,
        scheme: p.scheme,
      }),
      warnings: self.warnings.clone(),
    }
  }
}

/// Proxy metadata exposed through snapshots. Credentials never leave the
/// registry.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySummary {
  pub host: String,
  pub port: u16,
  pub scheme: ProxyScheme,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
  pub instance_id: String,
  pub profile_id: uuid::Uuid,
  pub pid: u32,
  pub cdp_port: u16,
  pub is_active: bool,
  pub start_time: u64,
  pub disconnected_at: Option<u64>,
  pub geometry: WindowGeometry,
  pub proxy: Option<ProxySummary>,
  pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum DisconnectReason {
  ChannelLost,
  ProcessExited,
}

#[derive(Debug)]
struct HealthEvent {
  instance_id: String,
  reason: DisconnectReason,
}

pub struct InstanceRegistry {
  inner: Arc<AsyncMutex<HashMap<String, Instance>>>,
  events_tx: mpsc::UnboundedSender<HealthEvent>,
  events_rx: StdMutex<Option<mpsc::UnboundedReceiver<HealthEvent>>>,
  event_loop_started: AtomicBool,
}

impl InstanceRegistry {
  pub fn new() -> Self {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    Self {
      inner: Arc::new(AsyncMutex::new(HashMap::new())),
      events_tx,
      events_rx: StdMutex::new(Some(events_rx)),
      event_loop_started: AtomicBool::new(false),
    }
  }

  /// The registry-update task: single consumer of health events. Spawned
  /// lazily from the first `register` call so construction never needs a
  /// runtime.
  fn ensure_event_loop(&self) {
    if self.event_loop_started.swap(true, Ordering::SeqCst) {
      return;
    }
    let rx = self.events_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(mut rx) = rx {
      let inner = Arc::clone(&self.inner);
      tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
          Self::apply_disconnect(&inner, event).await;
        }
      });
    }
  }

  async fn apply_disconnect(
    inner: &Arc<AsyncMutex<HashMap<String, Instance>>>,
    event: HealthEvent,
  ) {
    let mut map = inner.lock().await;
    match map.get_mut(&event.instance_id) {
      Some(instance) if instance.is_active => {
        instance.is_active = false;
        instance.disconnected_at = Some(now_secs());
        instance.monitor_cancel.cancel();
        if let Some(auth) = &instance.auth_cancel {
          auth.cancel();
        }
        match event.reason {
          DisconnectReason::ProcessExited => {
            log::info!("Instance {} process exited, marked disconnected", event.instance_id)
          }
          DisconnectReason::ChannelLost => log::info!(
            "Instance {} stopped answering health checks, marked disconnected",
            event.instance_id
          ),
        }
      }
      // Already disconnected or removed by an explicit stop; nothing to do.
      _ => log::debug!(
        "Disconnect for {} ignored, instance already gone",
        event.instance_id
      ),
    }
  }

  /// Insert a freshly launched instance and begin health monitoring it.
  pub async fn register(&self, mut instance: Instance) -> InstanceSummary {
    self.ensure_event_loop();

    let monitor_cancel = CancellationToken::new();
    instance.monitor_cancel = monitor_cancel.clone();

    let id = instance.id.clone();
    let pid = instance.pid;
    let port = instance.cdp_port;
    let summary = instance.summary();

    {
      let mut map = self.inner.lock().await;
      map.insert(id.clone(), instance);
    }

    self.spawn_monitor(id, pid, port, monitor_cancel);
    summary
  }

  /// Health-check loop for one instance. Self-terminates when cancelled or
  /// once it has reported a disconnect, so monitors never accumulate.
  fn spawn_monitor(&self, instance_id: String, pid: u32, port: u16, cancel: CancellationToken) {
    let tx = self.events_tx.clone();
    tokio::spawn(async move {
      let cdp = CdpClient::new(port);
      let mut failures: u32 = 0;
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {
            if cdp.is_reachable().await {
              failures = 0;
              continue;
            }
            if !process_alive(pid) {
              let _ = tx.send(HealthEvent {
                instance_id: instance_id.clone(),
                reason: DisconnectReason::ProcessExited,
              });
              break;
            }
            failures += 1;
            log::debug!(
              "Health check failed for {instance_id} ({failures}/{MAX_CONSECUTIVE_FAILURES})"
            );
            if failures >= MAX_CONSECUTIVE_FAILURES {
              let _ = tx.send(HealthEvent {
                instance_id: instance_id.clone(),
                reason: DisconnectReason::ChannelLost,
              });
              break;
            }
          }
        }
      }
    });
  }

  /// Copy of the current registry contents. Callers can never mutate
  /// registry state through this.
  pub async fn snapshot(&self) -> Vec<InstanceSummary> {
    let map = self.inner.lock().await;
    let mut list: Vec<InstanceSummary> = map.values().map(|i| i.summary()).collect();
    list.sort_by(|a, b| a.start_time.cmp(&b.start_time));
    list
  }

  pub async fn get(&self, instance_id: &str) -> Option<InstanceSummary> {
    let map = self.inner.lock().await;
    map.get(instance_id).map(|i| i.summary())
  }

  pub async fn active_count(&self) -> usize {
    let map = self.inner.lock().await;
    map.values().filter(|i| i.is_active).count()
  }

  /// Explicit stop: close the control channel, make sure the process is
  /// gone, and delete the entry. Exactly one of two concurrent callers
  /// performs the teardown; the loser gets `InstanceNotFound`, which reads
  /// as "already stopped".
  pub async fn stop(&self, instance_id: &str) -> Result<(), RegistryError> {
    let instance = {
      let mut map = self.inner.lock().await;
      map.remove(instance_id)
    };

    let Some(instance) = instance else {
      return Err(RegistryError::InstanceNotFound(instance_id.to_string()));
    };

    log::info!("Stopping instance {instance_id}");

    instance.monitor_cancel.cancel();
    if let Some(auth) = &instance.auth_cancel {
      auth.cancel();
    }

    if instance.is_active {
      let cdp = CdpClient::new(instance.cdp_port);
      match tokio::time::timeout(CLOSE_TIMEOUT, cdp.close_browser()).await {
        Ok(Ok(())) => {}
        // The socket usually drops mid-close; the process table decides.
        Ok(Err(e)) => log::debug!("Browser.close for {instance_id}: {e}"),
        Err(_) => log::debug!("Browser.close for {instance_id} timed out"),
      }
    }

    for _ in 0..EXIT_POLL_ROUNDS {
      if !process_alive(instance.pid) {
        return Ok(());
      }
      tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    log::warn!(
      "Instance {instance_id} (pid {}) did not exit cleanly, terminating",
      instance.pid
    );
    terminate_process(instance.pid);

    for _ in 0..EXIT_POLL_ROUNDS {
      if !process_alive(instance.pid) {
        return Ok(());
      }
      tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    force_kill_process(instance.pid);
    Ok(())
  }

  /// Drop entries that are no longer active. Disconnected instances stay
  /// queryable until dismissed through here (or stopped explicitly).
  pub async fn clear_disconnected(&self) -> usize {
    let mut map = self.inner.lock().await;
    let before = map.len();
    map.retain(|_, instance| instance.is_active);
    before - map.len()
  }

  /// Stop every instance bound to a profile. Used before the profile's
  /// state directory is deleted.
  pub async fn stop_instances_for_profile(&self, profile_id: &uuid::Uuid) {
    let ids: Vec<String> = self
      .snapshot()
      .await
      .into_iter()
      .filter(|s| s.profile_id == *profile_id)
      .map(|s| s.instance_id)
      .collect();

    for id in ids {
      if let Err(e) = self.stop(&id).await {
        log::debug!("Stopping {id} for profile teardown: {e}");
      }
    }
  }

  pub async fn stop_all(&self) {
    let ids: Vec<String> = self
      .snapshot()
      .await
      .into_iter()
      .map(|s| s.instance_id)
      .collect();
    for id in ids {
      let _ = self.stop(&id).await;
    }
  }
}

impl Default for InstanceRegistry {
  fn default() -> Self {
    Self::new()
  }
}

pub fn registry() -> &'static InstanceRegistry {
  &INSTANCE_REGISTRY
}

lazy_static::lazy_static! {
  static ref INSTANCE_REGISTRY: InstanceRegistry = InstanceRegistry::new();
}

pub fn process_alive(pid: u32) -> bool {
  let system = System::new_with_specifics(
    RefreshKind::nothing().with_processes(ProcessRefreshKind::everything()),
  );
  system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

pub(crate) fn terminate_process(pid: u32) {
  #[cfg(unix)]
  {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
  }
  #[cfg(windows)]
  {
    let _ = std::process::Command::new("taskkill")
      .args(["/PID", &pid.to_string(), "/F"])
      .output();
  }
}

fn force_kill_process(pid: u32) {
  #[cfg(unix)]
  {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
  }
  #[cfg(windows)]
  {
    let _ = std::process::Command::new("taskkill")
      .args(["/PID", &pid.to_string(), "/F"])
      .output();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // A pid that cannot belong to a live process on any sane system.
  const DEAD_PID: u32 = u32::MAX - 7;

  fn fake_instance(profile_id: uuid::Uuid, port: u16) -> Instance {
    Instance::new(
      profile_id,
      DEAD_PID,
      port,
      None,
      WindowGeometry {
        width: 1000,
        height: 700,
        x: 0,
        y: 0,
      },
      Vec::new(),
      None,
    )
  }

  #[test]
  fn test_process_alive_detects_self_and_rejects_bogus() {
    assert!(process_alive(std::process::id()));
    assert!(!process_alive(DEAD_PID));
  }

  #[tokio::test]
  async fn test_stop_unknown_instance_is_an_error_not_a_crash() {
    let registry = InstanceRegistry::new();
    let result = registry.stop("does_not_exist").await;
    assert!(matches!(result, Err(RegistryError::InstanceNotFound(_))));
  }

  #[tokio::test]
  async fn test_register_and_snapshot() {
    let registry = InstanceRegistry::new();
    let profile_id = uuid::Uuid::new_v4();

    let summary = registry.register(fake_instance(profile_id, 1)).await;
    assert!(summary.is_active);
    assert!(summary.instance_id.starts_with(&profile_id.to_string()));

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].profile_id, profile_id);
    assert_eq!(registry.active_count().await, 1);

    assert!(registry.get(&summary.instance_id).await.is_some());
    assert!(registry.get("nope").await.is_none());
  }

  #[tokio::test]
  async fn test_stop_removes_entry() {
    let registry = InstanceRegistry::new();
    let summary = registry.register(fake_instance(uuid::Uuid::new_v4(), 1)).await;

    registry.stop(&summary.instance_id).await.unwrap();
    assert_eq!(registry.snapshot().await.len(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_stop_has_exactly_one_winner() {
    let registry = Arc::new(InstanceRegistry::new());
    let summary = registry.register(fake_instance(uuid::Uuid::new_v4(), 1)).await;

    let id_a = summary.instance_id.clone();
    let id_b = summary.instance_id.clone();
    let reg_a = Arc::clone(&registry);
    let reg_b = Arc::clone(&registry);

    let (a, b) = tokio::join!(
      tokio::spawn(async move { reg_a.stop(&id_a).await }),
      tokio::spawn(async move { reg_b.stop(&id_b).await }),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_ne!(a.is_ok(), b.is_ok(), "exactly one stop performs teardown");
  }

  #[tokio::test]
  async fn test_clear_disconnected_keeps_active_entries() {
    let registry = InstanceRegistry::new();
    let active = registry.register(fake_instance(uuid::Uuid::new_v4(), 1)).await;
    let doomed = registry.register(fake_instance(uuid::Uuid::new_v4(), 2)).await;

    InstanceRegistry::apply_disconnect(
      &registry.inner,
      HealthEvent {
        instance_id: doomed.instance_id.clone(),
        reason: DisconnectReason::ProcessExited,
      },
    )
    .await;

    assert_eq!(registry.active_count().await, 1);
    // The disconnected entry stays queryable until dismissed.
    let entry = registry.get(&doomed.instance_id).await.unwrap();
    assert!(!entry.is_active);
    assert!(entry.disconnected_at.is_some());

    assert_eq!(registry.clear_disconnected().await, 1);
    assert!(registry.get(&doomed.instance_id).await.is_none());
    assert!(registry.get(&active.instance_id).await.is_some());
  }

  #[tokio::test]
  async fn test_second_disconnect_is_a_no_op() {
    let registry = InstanceRegistry::new();
    let summary = registry.register(fake_instance(uuid::Uuid::new_v4(), 1)).await;

    for _ in 0..2 {
      InstanceRegistry::apply_disconnect(
        &registry.inner,
        HealthEvent {
          instance_id: summary.instance_id.clone(),
          reason: DisconnectReason::ChannelLost,
        },
      )
      .await;
    }

    let entry = registry.get(&summary.instance_id).await.unwrap();
    assert!(!entry.is_active);
  }

  #[tokio::test]
  async fn test_disconnect_after_explicit_stop_is_a_no_op() {
    let registry = InstanceRegistry::new();
    let summary = registry.register(fake_instance(uuid::Uuid::new_v4(), 1)).await;

    registry.stop(&summary.instance_id).await.unwrap();

    // A racing health check that lost still cannot corrupt anything.
    InstanceRegistry::apply_disconnect(
      &registry.inner,
      HealthEvent {
        instance_id: summary.instance_id.clone(),
        reason: DisconnectReason::ProcessExited,
      },
    )
    .await;
    assert!(registry.get(&summary.instance_id).await.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn test_dead_process_transitions_to_disconnected() {
    let registry = InstanceRegistry::new();
    // Unreachable port + dead pid: the first health check reports
    // ProcessExited.
    let summary = registry.register(fake_instance(uuid::Uuid::new_v4(), 1)).await;

    let mut transitioned = false;
    for _ in 0..80 {
      tokio::time::sleep(Duration::from_millis(250)).await;
      if let Some(entry) = registry.get(&summary.instance_id).await {
        if !entry.is_active {
          transitioned = true;
          break;
        }
      }
    }
    assert!(transitioned, "instance should disconnect within the health budget");
    assert_eq!(registry.active_count().await, 0);
  }

  #[tokio::test]
  async fn test_snapshot_excludes_credentials() {
    let registry = InstanceRegistry::new();
    let proxy = StoredProxy::new("auth", "1.2.3.4", 8080, ProxyScheme::Http)
      .with_credentials(Some("user".to_string()), Some("secret".to_string()));

    let mut instance = fake_instance(uuid::Uuid::new_v4(), 1);
    instance.proxy = Some(proxy);
    registry.register(instance).await;

    let snapshot = registry.snapshot().await;
    let rendered = serde_json::to_string(&snapshot).unwrap();
    assert!(rendered.contains("1.2.3.4"));
    assert!(!rendered.contains("secret"));
  }

  #[tokio::test]
  async fn test_stop_instances_for_profile() {
    let registry = InstanceRegistry::new();
    let target = uuid::Uuid::new_v4();
    let other = uuid::Uuid::new_v4();

    registry.register(fake_instance(target, 1)).await;
    registry.register(fake_instance(target, 2)).await;
    let kept = registry.register(fake_instance(other, 3)).await;

    registry.stop_instances_for_profile(&target).await;

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].instance_id, kept.instance_id);
  }
}
