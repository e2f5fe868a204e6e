//! Instance launcher: assembles the full launch configuration for one
//! profile and walks the start sequence in order: provision extensions,
//! plan the window, spawn the process, bind proxy credentials, reconcile
//! the blank tab, then register with the registry.
//!
//! Only a process that fails to start (or a control channel that never
//! comes up) aborts a launch. Everything downstream degrades: the browser
//! still runs, the returned summary just carries warnings for the
//! refinements that were skipped.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command as TokioCommand;

use crate::browser;
use crate::cdp::{self, CdpClient};
use crate::extension_manager::{self, ExtensionManager};
use crate::instance_registry::{registry, Instance, InstanceSummary};
use crate::profile::{Profile, ProfileManager};
use crate::proxy_auth::{self, ProxyCredentials};
use crate::proxy_storage::{self, StoredProxy};
use crate::session_restore::{self, ReconcileOutcome};
use crate::window_placement::{self, Display};

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
  #[error("Profile {0} not found")]
  ProfileNotFound(String),

  #[error("Proxy '{0}' not found")]
  ProxyNotFound(String),

  #[error("Profile state directory inaccessible: {0}")]
  StateDir(std::io::Error),

  #[error("No browser executable found; set CHROME_MANAGER_BROWSER or install Chrome/Chromium")]
  ExecutableNotFound,

  #[error("Browser process failed to start: {0}")]
  Spawn(std::io::Error),

  #[error("Control channel never came up: {0}")]
  ControlChannel(String),
}

/// Launch-time inputs that come from the host environment rather than the
/// profile: the display arrangement for placement and an optional browser
/// executable override.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
  pub displays: Vec<Display>,
  pub executable: Option<PathBuf>,
}

pub struct BrowserRunner;

impl BrowserRunner {
  fn new() -> Self {
    Self
  }

  pub fn instance() -> &'static BrowserRunner {
    &BROWSER_RUNNER
  }

  /// Resolve a profile id (and optional proxy override) to stored records
  /// and launch. Missing records are fatal before anything starts.
  pub async fn launch_profile(
    &self,
    profile_id: &uuid::Uuid,
    proxy_id_override: Option<String>,
    options: &LaunchOptions,
  ) -> Result<InstanceSummary, LaunchError> {
    let profile = ProfileManager::instance()
      .get_profile(profile_id)
      .map_err(|_| LaunchError::ProfileNotFound(profile_id.to_string()))?;

    let proxy_id = proxy_id_override.or_else(|| profile.proxy_id.clone());
    let proxy = match proxy_id {
      Some(id) => Some(
        proxy_storage::get_proxy(&id).ok_or_else(|| LaunchError::ProxyNotFound(id.clone()))?,
      ),
      None => None,
    };

    self.launch_instance(&profile, proxy, options).await
  }

  /// The ordered launch sequence. Steps either complete or degrade before
  /// the next begins; the registry only learns about the instance at the
  /// very end.
  pub async fn launch_instance(
    &self,
    profile: &Profile,
    proxy: Option<StoredProxy>,
    options: &LaunchOptions,
  ) -> Result<InstanceSummary, LaunchError> {
    let profiles_dir = crate::app_dirs::profiles_dir();
    let profile_data_path = profile.data_path(&profiles_dir);
    std::fs::create_dir_all(&profile_data_path).map_err(LaunchError::StateDir)?;

    let mut warnings: Vec<String> = Vec::new();

    // Which extensions does this profile want loaded?
    let extension_dirs = ExtensionManager::instance().enabled_extension_dirs(profile);

    // Rewrite the preference documents so they come up enabled and pinned.
    match extension_manager::provision_extensions(&profile_data_path, &extension_dirs) {
      Ok(report) => {
        for failure in &report.failures {
          warnings.push(format!(
            "extension not provisioned: {} ({})",
            failure.path.display(),
            failure.error
          ));
        }
      }
      Err(e) => {
        log::warn!("Extension provisioning failed for {}: {e}", profile.name);
        warnings.push(format!("extension provisioning failed: {e}"));
      }
    }

    // Place the window relative to everything already running.
    let active_count = registry().active_count().await;
    let geometry = window_placement::plan(&options.displays, active_count);

    let restore_session = session_restore::has_existing_session(&profile_data_path);
    log::info!(
      "Profile {} has existing session: {restore_session}",
      profile.name
    );

    // Assemble the argument set and start the process.
    let executable = browser::find_browser_executable(options.executable.as_deref())
      .ok_or(LaunchError::ExecutableNotFound)?;
    let cdp_port = cdp::find_free_port()
      .await
      .map_err(|e| LaunchError::ControlChannel(format!("no free port: {e}")))?;

    let proxy_arg = proxy.as_ref().map(|p| p.launch_arg());
    let args = browser::create_launch_args(
      &profile_data_path.to_string_lossy(),
      &geometry,
      &extension_dirs,
      proxy_arg.as_deref(),
      restore_session,
      cdp_port,
    );

    log::info!(
      "Launching {} for profile {} ({}x{} at {},{})",
      executable.display(),
      profile.name,
      geometry.width,
      geometry.height,
      geometry.x,
      geometry.y
    );

    let mut cmd = TokioCommand::new(&executable);
    cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;
    let pid = child
      .id()
      .ok_or_else(|| LaunchError::ControlChannel("spawned process has no pid".to_string()))?;

    // Reap the child whenever it exits; liveness tracking goes through the
    // registry, not this handle.
    tokio::spawn(async move {
      let _ = child.wait().await;
    });

    let cdp_client = CdpClient::new(cdp_port);
    if let Err(e) = cdp_client.wait_until_ready().await {
      log::error!("Control channel for {} never came up: {e}", profile.name);
      crate::instance_registry::terminate_process(pid);
      return Err(LaunchError::ControlChannel(e.to_string()));
    }

    // Attach proxy credentials to current and future tabs.
    let auth_cancel = match proxy.as_ref().and_then(ProxyCredentials::from_proxy) {
      Some(credentials) => match proxy_auth::bind(&cdp_client, credentials).await {
        Ok(binding) => Some(binding.cancellation_token()),
        Err(e) => {
          log::warn!("Proxy auth binding failed for {}: {e}", profile.name);
          warnings.push(format!("proxy auth binding failed: {e}"));
          None
        }
      },
      None => None,
    };

    // Clean up the placeholder tab session restore may have left.
    match session_restore::reconcile_blank_tabs(&cdp_client).await {
      ReconcileOutcome::TimedOut => {
        warnings.push("blank-tab reconciliation hit its attempt budget".to_string());
      }
      outcome => log::debug!("Blank-tab reconciliation for {}: {outcome:?}", profile.name),
    }

    // Hand the instance to the registry and start monitoring.
    let instance = Instance::new(
      profile.id,
      pid,
      cdp_port,
      proxy,
      geometry,
      warnings,
      auth_cancel,
    );
    let summary = registry().register(instance).await;

    log::info!(
      "Instance {} running (pid {pid}, control port {cdp_port})",
      summary.instance_id
    );
    Ok(summary)
  }
}

impl Default for BrowserRunner {
  fn default() -> Self {
    Self::new()
  }
}

lazy_static::lazy_static! {
  static ref BROWSER_RUNNER: BrowserRunner = BrowserRunner::new();
}
