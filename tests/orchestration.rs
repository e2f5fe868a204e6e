//! End-to-end exercises of the public API that do not need a real browser:
//! profile lifecycle, extension provisioning into a profile's state
//! directory, and registry behavior around unknown instances.

use std::path::Path;
use std::sync::OnceLock;

use tempfile::TempDir;

use chrome_manager::extension_manager::{self, ExtensionManager};
use chrome_manager::profile::ProfileManager;
use chrome_manager::window_placement::{plan, Display};
use chrome_manager::{proxy_storage, registry, ProxyScheme, StoredProxy};

static DATA_DIR: OnceLock<TempDir> = OnceLock::new();

/// Point the whole process at a throwaway data dir before the first
/// manager call. Tests in this file share it, so names must be unique.
fn setup() {
  let dir = DATA_DIR.get_or_init(|| TempDir::new().unwrap());
  std::env::set_var("CHROME_MANAGER_DATA_DIR", dir.path());
}

fn write_manifest(dir: &Path) {
  std::fs::create_dir_all(dir).unwrap();
  std::fs::write(
    dir.join("manifest.json"),
    r#"{"manifest_version":3,"name":"Session Helper","version":"2.1","permissions":["tabs"]}"#,
  )
  .unwrap();
}

#[tokio::test]
async fn profile_lifecycle_roundtrip() {
  setup();
  let manager = ProfileManager::instance();

  let profile = manager
    .create_profile("lifecycle", None, Some("integration".to_string()))
    .unwrap();
  assert!(profile
    .data_path(&manager.get_profiles_dir())
    .exists());

  let proxy = StoredProxy::new("upstream", "10.1.1.1", 3128, ProxyScheme::Socks5);
  proxy_storage::save_proxy(&proxy).unwrap();

  let updated = manager
    .update_profile_proxy(&profile.id, Some(proxy.id.clone()))
    .unwrap();
  assert_eq!(updated.proxy_id.as_deref(), Some(proxy.id.as_str()));

  let listed = manager.list_profiles().unwrap();
  assert!(listed.iter().any(|p| p.name == "lifecycle"));

  manager.delete_profile(&profile.id).await.unwrap();
  assert!(manager.get_profile(&profile.id).is_err());
  assert!(!manager
    .get_profiles_dir()
    .join(profile.id.to_string())
    .exists());
}

#[tokio::test]
async fn extensions_provision_into_new_profile() {
  setup();

  let ext_dir = DATA_DIR.get().unwrap().path().join("unpacked-session-helper");
  write_manifest(&ext_dir);

  let ext = ExtensionManager::instance()
    .add_extension(None, &ext_dir)
    .unwrap();
  assert_eq!(ext.name, "Session Helper");

  // New profiles pick the registered extension up automatically.
  let profile = ProfileManager::instance()
    .create_profile("provisioned", None, None)
    .unwrap();
  assert!(profile.extensions.iter().any(|e| e.id == ext.id));

  let data_path = profile.data_path(&ProfileManager::instance().get_profiles_dir());
  let dirs = ExtensionManager::instance().enabled_extension_dirs(&profile);
  assert_eq!(dirs, vec![ext_dir.clone()]);

  // Provision twice; the pinned list must not grow.
  for _ in 0..2 {
    let report = extension_manager::provision_extensions(&data_path, &dirs).unwrap();
    assert!(report.is_complete());
  }

  let prefs: serde_json::Value = serde_json::from_str(
    &std::fs::read_to_string(data_path.join("Default").join("Preferences")).unwrap(),
  )
  .unwrap();
  assert_eq!(
    prefs["extensions"]["pinned_extensions"]
      .as_array()
      .unwrap()
      .len(),
    1
  );
  assert_eq!(prefs["session"]["restore_on_startup"], 1);

  ExtensionManager::instance().delete_extension(&ext.id).unwrap();
}

#[tokio::test]
async fn stopping_unknown_instance_is_reported_not_fatal() {
  setup();
  let result = registry().stop("no_such_instance").await;
  assert!(result.is_err());
  assert!(result.unwrap_err().to_string().contains("not found"));
}

#[test]
fn placement_is_stable_for_equal_inputs() {
  let displays = vec![Display::primary(2560, 1440)];
  assert_eq!(plan(&displays, 3), plan(&displays, 3));
}
