//! Extension store and profile provisioner.
//!
//! Extensions are unpacked directories registered once in the app data dir
//! and provisioned into each profile's preference documents before launch,
//! so the browser starts with them enabled and pinned without any
//! interactive confirmation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

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

/// A registered unpacked extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
  pub id: String,
  pub name: String,
  pub path: PathBuf,
  pub enabled: bool,
  pub created_at: u64,
  pub updated_at: u64,
}

/// Derive the browser-visible extension id from the extension's directory
/// path: blake3, first 32 hex chars, digits shifted into Chrome's a-p id
/// alphabet. The same path always maps to the same id, which keeps toolbar
/// pin slots stable across launches.
///
/// Two distinct directories can in principle collide here and silently
/// fight over one pin slot. Changing the scheme would orphan every
/// previously provisioned profile, so the derivation stays as-is.
pub fn stable_extension_id(path: &Path) -> String {
  let hash = blake3::hash(path.to_string_lossy().as_bytes());
  hash
    .to_hex()
    .as_str()[..32]
    .chars()
    .map(|c| match c {
      '0'..='9' => (b'a' + (c as u8 - b'0')) as char,
      other => other,
    })
    .collect()
}

pub fn read_manifest(extension_dir: &Path) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
  let manifest_path = extension_dir.join("manifest.json");
  let content = fs::read_to_string(&manifest_path)
    .map_err(|e| format!("cannot read {}: {e}", manifest_path.display()))?;
  let manifest: Value = serde_json::from_str(&content)
    .map_err(|e| format!("invalid manifest {}: {e}", manifest_path.display()))?;
  Ok(manifest)
}

#[derive(Debug)]
pub struct ProvisionFailure {
  pub path: PathBuf,
  pub error: String,
}

/// Outcome of one provisioning pass. Per-extension failures are collected
/// rather than aborting the pass; the caller decides how loudly to warn.
#[derive(Debug, Default)]
pub struct ProvisionReport {
  pub provisioned: Vec<String>,
  pub failures: Vec<ProvisionFailure>,
}

impl ProvisionReport {
  pub fn is_complete(&self) -> bool {
    self.failures.is_empty()
  }
}

fn read_json_document(path: &Path) -> Value {
  match fs::read_to_string(path) {
    Ok(content) => match serde_json::from_str(&content) {
      Ok(value) => value,
      Err(e) => {
        log::warn!("Regenerating corrupt document {}: {e}", path.display());
        json!({})
      }
    },
    Err(_) => json!({}),
  }
}

fn ensure_object<'a>(value: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
  let map = value.as_object_mut().expect("document root is an object");
  if !map.get(key).is_some_and(|v| v.is_object()) {
    map.insert(key.to_string(), json!({}));
  }
  map.get_mut(key).unwrap().as_object_mut().unwrap()
}

fn ensure_array<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Vec<Value> {
  if !map.get(key).is_some_and(|v| v.is_array()) {
    map.insert(key.to_string(), json!([]));
  }
  map.get_mut(key).unwrap().as_array_mut().unwrap()
}

fn push_unique(list: &mut Vec<Value>, id: &str) {
  if !list.iter().any(|v| v.as_str() == Some(id)) {
    list.push(Value::String(id.to_string()));
  }
}

fn extension_settings_entry(extension_dir: &Path, manifest: &Value) -> Value {
  let permissions = manifest.get("permissions").cloned().unwrap_or(json!([]));
  let host_permissions = manifest.get("host_permissions").cloned().unwrap_or(json!([]));
  let grants = json!({
    "api": permissions.clone(),
    "explicit_host": host_permissions,
    "manifest_permissions": permissions,
  });

  json!({
    "active_permissions": grants.clone(),
    "granted_permissions": grants,
    "disable_reasons": [],
    "incognito_enabled": true,
    "location": 1,
    "manifest": manifest,
    "path": extension_dir.to_string_lossy(),
    "state": 1,
    "from_webstore": false,
    "from_bookmark": false,
    "was_installed_by_default": false,
    "was_installed_by_oem": false,
    "was_installed_by_custodian": false,
    "install_time": now_millis().to_string(),
    "creation_flags": 1,
    "toolbar_pin_state": "force_pinned",
  })
}

/// Merge session-restore and first-run settings so a relaunched profile
/// continues where it left off instead of showing crash/restore bubbles.
fn merge_session_prefs(prefs: &mut Value) {
  let session = ensure_object(prefs, "session");
  session.insert("restore_on_startup".to_string(), json!(1));
  session.insert("restore_on_startup_migrated".to_string(), json!(true));
  session.insert("startup_urls".to_string(), json!([]));
  session.insert("tabs_to_restore".to_string(), json!(-1));
  session.insert("load_tabs_lazily".to_string(), json!(false));

  let browser = ensure_object(prefs, "browser");
  browser.insert("show_home_button".to_string(), json!(true));
  browser.insert("check_default_browser".to_string(), json!(false));

  let profile = ensure_object(prefs, "profile");
  profile.insert("exit_type".to_string(), json!("Normal"));
  profile.insert("exited_cleanly".to_string(), json!(true));
}

/// Rewrite the profile's `Default/Preferences` and profile-root
/// `Local State` so every given extension starts enabled, granted its
/// declared permissions, and force-pinned to the toolbar.
///
/// One unreadable manifest never aborts the others; failures are collected
/// in the report. Re-running with the same set never duplicates pin
/// entries.
pub fn provision_extensions(
  profile_data_dir: &Path,
  extension_dirs: &[PathBuf],
) -> Result<ProvisionReport, Box<dyn std::error::Error + Send + Sync>> {
  let mut report = ProvisionReport::default();

  let default_dir = profile_data_dir.join("Default");
  fs::create_dir_all(&default_dir)?;

  let preferences_path = default_dir.join("Preferences");
  let local_state_path = profile_data_dir.join("Local State");

  let mut prefs = read_json_document(&preferences_path);
  if !prefs.is_object() {
    prefs = json!({});
  }

  for extension_dir in extension_dirs {
    let manifest = match read_manifest(extension_dir) {
      Ok(m) => m,
      Err(e) => {
        log::warn!(
          "Skipping extension {}: {e}",
          extension_dir.display()
        );
        report.failures.push(ProvisionFailure {
          path: extension_dir.clone(),
          error: e.to_string(),
        });
        continue;
      }
    };

    let ext_id = stable_extension_id(extension_dir);
    let entry = extension_settings_entry(extension_dir, &manifest);

    let extensions = ensure_object(&mut prefs, "extensions");
    if !extensions.get("settings").is_some_and(|v| v.is_object()) {
      extensions.insert("settings".to_string(), json!({}));
    }
    extensions
      .get_mut("settings")
      .unwrap()
      .as_object_mut()
      .unwrap()
      .insert(ext_id.clone(), entry);

    push_unique(ensure_array(extensions, "pinned_extensions"), &ext_id);
    push_unique(ensure_array(extensions, "toolbar"), &ext_id);

    log::info!(
      "Provisioned extension {} ({ext_id})",
      manifest
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or("unnamed")
    );
    report.provisioned.push(ext_id);
  }

  merge_session_prefs(&mut prefs);
  fs::write(&preferences_path, serde_json::to_string_pretty(&prefs)?)?;

  // Mirror the pin lists into Local State so toolbar visibility survives
  // the browser regenerating the per-profile document.
  let mut local_state = read_json_document(&local_state_path);
  if !local_state.is_object() {
    local_state = json!({});
  }

  let extensions = ensure_object(&mut local_state, "extensions");
  for ext_id in &report.provisioned {
    push_unique(ensure_array(extensions, "toolbar"), ext_id);
    push_unique(ensure_array(extensions, "pinned_extensions"), ext_id);
  }

  let session = ensure_object(&mut local_state, "session");
  session.insert("restore_on_startup".to_string(), json!(1));
  session.insert("restore_on_startup_migrated".to_string(), json!(true));
  session.insert("load_tabs_lazily".to_string(), json!(false));

  fs::write(&local_state_path, serde_json::to_string_pretty(&local_state)?)?;

  Ok(report)
}

/// CRUD over registered extensions, one JSON record per extension under
/// the app data dir.
pub struct ExtensionManager;

impl ExtensionManager {
  pub fn new() -> Self {
    Self
  }

  pub fn instance() -> &'static ExtensionManager {
    &EXTENSION_MANAGER
  }

  fn record_path(&self, id: &str) -> PathBuf {
    crate::app_dirs::extensions_dir().join(format!("{id}.json"))
  }

  pub fn add_extension(
    &self,
    name: Option<String>,
    extension_dir: &Path,
  ) -> Result<Extension, Box<dyn std::error::Error + Send + Sync>> {
    let manifest = read_manifest(extension_dir)?;

    if self
      .list_extensions()?
      .iter()
      .any(|e| e.path == extension_dir)
    {
      return Err(format!("Extension at {} already registered", extension_dir.display()).into());
    }

    let name = name
      .or_else(|| {
        manifest
          .get("name")
          .and_then(|n| n.as_str())
          .map(|s| s.to_string())
      })
      .unwrap_or_else(|| "Unknown Extension".to_string());

    let now = now_secs();
    let ext = Extension {
      id: uuid::Uuid::new_v4().to_string(),
      name,
      path: extension_dir.to_path_buf(),
      enabled: true,
      created_at: now,
      updated_at: now,
    };

    let record_path = self.record_path(&ext.id);
    if let Some(parent) = record_path.parent() {
      fs::create_dir_all(parent)?;
    }
    fs::write(&record_path, serde_json::to_string_pretty(&ext)?)?;

    Ok(ext)
  }

  pub fn get_extension(&self, id: &str) -> Result<Extension, Box<dyn std::error::Error + Send + Sync>> {
    let record_path = self.record_path(id);
    if !record_path.exists() {
      return Err(format!("Extension with id '{id}' not found").into());
    }
    let content = fs::read_to_string(record_path)?;
    Ok(serde_json::from_str(&content)?)
  }

  pub fn list_extensions(&self) -> Result<Vec<Extension>, Box<dyn std::error::Error + Send + Sync>> {
    let base = crate::app_dirs::extensions_dir();
    if !base.exists() {
      return Ok(Vec::new());
    }

    let mut extensions = Vec::new();
    for entry in fs::read_dir(base)? {
      let entry = entry?;
      let path = entry.path();
      if path.extension().is_some_and(|ext| ext == "json") {
        if let Ok(content) = fs::read_to_string(&path) {
          if let Ok(ext) = serde_json::from_str::<Extension>(&content) {
            extensions.push(ext);
          }
        }
      }
    }

    extensions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(extensions)
  }

  pub fn set_enabled(
    &self,
    id: &str,
    enabled: bool,
  ) -> Result<Extension, Box<dyn std::error::Error + Send + Sync>> {
    let mut ext = self.get_extension(id)?;
    ext.enabled = enabled;
    ext.updated_at = now_secs();
    fs::write(self.record_path(id), serde_json::to_string_pretty(&ext)?)?;
    Ok(ext)
  }

  pub fn delete_extension(&self, id: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let record_path = self.record_path(id);
    if !record_path.exists() {
      return Err(format!("Extension with id '{id}' not found").into());
    }
    fs::remove_file(record_path)?;
    Ok(())
  }

  /// Resolve the on-disk directories of all enabled extensions referenced
  /// by a profile. Broken references (record gone, directory gone, no
  /// manifest) are skipped with a log line rather than failing the launch.
  pub fn enabled_extension_dirs(&self, profile: &crate::profile::Profile) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    for profile_ext in &profile.extensions {
      if !profile_ext.enabled {
        continue;
      }

      let ext = match self.get_extension(&profile_ext.id) {
        Ok(ext) => ext,
        Err(_) => {
          log::warn!(
            "Profile {} references unknown extension {}",
            profile.id,
            profile_ext.id
          );
          continue;
        }
      };

      if !ext.enabled {
        continue;
      }

      if ext.path.join("manifest.json").exists() {
        dirs.push(ext.path.clone());
      } else {
        log::warn!(
          "Extension {} has no manifest at {}, skipping",
          ext.name,
          ext.path.display()
        );
      }
    }

    dirs
  }
}

impl Default for ExtensionManager {
  fn default() -> Self {
    Self::new()
  }
}

lazy_static::lazy_static! {
  static ref EXTENSION_MANAGER: ExtensionManager = ExtensionManager::new();
}
