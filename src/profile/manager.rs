use std::fs::{self, create_dir_all};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::extension_manager::ExtensionManager;
use crate::profile::types::{Profile, ProfileExtension};

fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

pub struct ProfileManager;

impl ProfileManager {
  fn new() -> Self {
    Self
  }

  pub fn instance() -> &'static ProfileManager {
    &PROFILE_MANAGER
  }

  pub fn get_profiles_dir(&self) -> PathBuf {
    crate::app_dirs::profiles_dir()
  }

  fn metadata_path(&self, id: &uuid::Uuid) -> PathBuf {
    self.get_profiles_dir().join(id.to_string()).join("metadata.json")
  }

  /// Create a profile: allocate its state directory, seed it with every
  /// currently known enabled extension, persist the metadata record.
  pub fn create_profile(
    &self,
    name: &str,
    proxy_id: Option<String>,
    note: Option<String>,
  ) -> Result<Profile, Box<dyn std::error::Error + Send + Sync>> {
    log::info!("Creating profile: {name}");

    let existing = self.list_profiles()?;
    if existing
      .iter()
      .any(|p| p.name.to_lowercase() == name.to_lowercase())
    {
      return Err(format!("Profile with name '{name}' already exists").into());
    }

    let profile_id = uuid::Uuid::new_v4();
    let profiles_dir = self.get_profiles_dir();
    let profile_uuid_dir = profiles_dir.join(profile_id.to_string());
    let profile_data_dir = profile_uuid_dir.join("profile");

    create_dir_all(&profile_uuid_dir)?;
    create_dir_all(&profile_data_dir)?;

    let now = now_secs();
    let mut profile = Profile {
      id: profile_id,
      name: name.to_string(),
      proxy_id,
      extensions: Vec::new(),
      note,
      created_at: now,
      updated_at: now,
    };

    // New profiles pick up the full current extension set automatically.
    self.sync_known_extensions(&mut profile);

    self.save_profile(&profile)?;
    Ok(profile)
  }

  /// Add every enabled extension from the store that the profile does not
  /// reference yet. Returns how many references were added.
  pub fn sync_known_extensions(&self, profile: &mut Profile) -> usize {
    let known = match ExtensionManager::instance().list_extensions() {
      Ok(list) => list,
      Err(e) => {
        log::warn!("Could not list extensions while seeding profile: {e}");
        return 0;
      }
    };

    let mut added = 0;
    for ext in known.into_iter().filter(|e| e.enabled) {
      if profile.extensions.iter().any(|p| p.id == ext.id) {
        continue;
      }
      profile.extensions.push(ProfileExtension {
        id: ext.id,
        name: ext.name,
        enabled: true,
        installed_at: now_secs(),
      });
      added += 1;
    }

    if added > 0 {
      profile.updated_at = now_secs();
    }
    added
  }

  /// Re-run extension seeding for a stored profile and persist the result.
  pub fn install_known_extensions(
    &self,
    profile_id: &uuid::Uuid,
  ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let mut profile = self.get_profile(profile_id)?;
    let added = self.sync_known_extensions(&mut profile);
    if added > 0 {
      self.save_profile(&profile)?;
    }
    Ok(added)
  }

  pub fn save_profile(&self, profile: &Profile) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let metadata_path = self.metadata_path(&profile.id);
    if let Some(parent) = metadata_path.parent() {
      create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(profile)?;
    fs::write(metadata_path, json)?;
    Ok(())
  }

  pub fn get_profile(
    &self,
    id: &uuid::Uuid,
  ) -> Result<Profile, Box<dyn std::error::Error + Send + Sync>> {
    let metadata_path = self.metadata_path(id);
    if !metadata_path.exists() {
      return Err(format!("Profile {id} not found").into());
    }
    let content = fs::read_to_string(metadata_path)?;
    Ok(serde_json::from_str(&content)?)
  }

  pub fn get_profile_by_name(
    &self,
    name: &str,
  ) -> Result<Profile, Box<dyn std::error::Error + Send + Sync>> {
    self
      .list_profiles()?
      .into_iter()
      .find(|p| p.name == name)
      .ok_or_else(|| format!("Profile '{name}' not found").into())
  }

  pub fn list_profiles(&self) -> Result<Vec<Profile>, Box<dyn std::error::Error + Send + Sync>> {
    let profiles_dir = self.get_profiles_dir();
    if !profiles_dir.exists() {
      return Ok(Vec::new());
    }

    let mut profiles = Vec::new();
    for entry in fs::read_dir(profiles_dir)? {
      let entry = entry?;
      if entry.file_type()?.is_dir() {
        let metadata_path = entry.path().join("metadata.json");
        if metadata_path.exists() {
          let content = fs::read_to_string(&metadata_path)?;
          match serde_json::from_str::<Profile>(&content) {
            Ok(profile) => profiles.push(profile),
            Err(e) => log::warn!("Skipping unreadable profile record {}: {e}", metadata_path.display()),
          }
        }
      }
    }

    profiles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(profiles)
  }

  /// Partial update of the mutable metadata fields.
  pub fn update_profile(
    &self,
    id: &uuid::Uuid,
    name: Option<String>,
    note: Option<Option<String>>,
  ) -> Result<Profile, Box<dyn std::error::Error + Send + Sync>> {
    let mut profile = self.get_profile(id)?;

    if let Some(new_name) = name {
      let clash = self
        .list_profiles()?
        .iter()
        .any(|p| p.name.to_lowercase() == new_name.to_lowercase() && p.id != *id);
      if clash {
        return Err(format!("Profile with name '{new_name}' already exists").into());
      }
      profile.name = new_name;
    }
    if let Some(new_note) = note {
      profile.note = new_note;
    }

    profile.updated_at = now_secs();
    self.save_profile(&profile)?;
    Ok(profile)
  }

  /// Re-point the profile at a different stored proxy (or none). Takes
  /// effect on the next launch; a running instance keeps the proxy it was
  /// started with.
  pub fn update_profile_proxy(
    &self,
    id: &uuid::Uuid,
    proxy_id: Option<String>,
  ) -> Result<Profile, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(pid) = &proxy_id {
      if crate::proxy_storage::get_proxy(pid).is_none() {
        return Err(format!("Proxy '{pid}' not found").into());
      }
    }

    let mut profile = self.get_profile(id)?;
    profile.proxy_id = proxy_id;
    profile.updated_at = now_secs();
    self.save_profile(&profile)?;

    match &profile.proxy_id {
      Some(pid) => log::info!("Profile {} now uses proxy {pid}", profile.name),
      None => log::info!("Profile {} no longer uses a proxy", profile.name),
    }

    Ok(profile)
  }

  /// Delete a profile and its entire state directory. Any running instance
  /// bound to it is stopped first.
  pub async fn delete_profile(
    &self,
    id: &uuid::Uuid,
  ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let profile = self.get_profile(id)?;

    crate::instance_registry::registry()
      .stop_instances_for_profile(id)
      .await;

    let profile_uuid_dir = self.get_profiles_dir().join(id.to_string());
    if profile_uuid_dir.exists() {
      fs::remove_dir_all(&profile_uuid_dir)?;
    }

    log::info!("Deleted profile {} and its state directory", profile.name);
    Ok(())
  }
}

impl Default for ProfileManager {
  fn default() -> Self {
    Self::new()
  }
}

lazy_static::lazy_static! {
  static ref PROFILE_MANAGER: ProfileManager = ProfileManager::new();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_dirs;
  use tempfile::TempDir;

  fn test_manager() -> (ProfileManager, TempDir, app_dirs::TestDirGuard) {
    let temp = TempDir::new().unwrap();
    let guard = app_dirs::set_test_data_dir(temp.path().to_path_buf());
    (ProfileManager::new(), temp, guard)
  }

  #[test]
  fn test_create_profile() {
    let (manager, _temp, _guard) = test_manager();

    let profile = manager.create_profile("Test Profile", None, None).unwrap();
    assert_eq!(profile.name, "Test Profile");
    assert!(profile.proxy_id.is_none());
    assert!(profile.data_path(&manager.get_profiles_dir()).exists());
  }

  #[test]
  fn test_duplicate_name_rejected() {
    let (manager, _temp, _guard) = test_manager();

    manager.create_profile("Work", None, None).unwrap();
    let result = manager.create_profile("work", None, None);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("already exists"));
  }

  #[test]
  fn test_save_and_list_profiles() {
    let (manager, _temp, _guard) = test_manager();

    manager.create_profile("One", None, None).unwrap();
    manager.create_profile("Two", None, None).unwrap();

    let profiles = manager.list_profiles().unwrap();
    assert_eq!(profiles.len(), 2);
    let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
    assert!(names.contains(&"One"));
    assert!(names.contains(&"Two"));
  }

  #[test]
  fn test_update_profile_fields() {
    let (manager, _temp, _guard) = test_manager();

    let profile = manager.create_profile("Before", None, None).unwrap();
    let updated = manager
      .update_profile(&profile.id, Some("After".to_string()), Some(Some("a note".to_string())))
      .unwrap();

    assert_eq!(updated.name, "After");
    assert_eq!(updated.note.as_deref(), Some("a note"));

    let reloaded = manager.get_profile(&profile.id).unwrap();
    assert_eq!(reloaded.name, "After");
  }

  #[test]
  fn test_rename_to_existing_name_rejected() {
    let (manager, _temp, _guard) = test_manager();

    manager.create_profile("One", None, None).unwrap();
    let two = manager.create_profile("Two", None, None).unwrap();

    assert!(manager
      .update_profile(&two.id, Some("One".to_string()), None)
      .is_err());
  }

  #[test]
  fn test_update_proxy_requires_known_proxy() {
    let (manager, _temp, _guard) = test_manager();

    let profile = manager.create_profile("P", None, None).unwrap();
    assert!(manager
      .update_profile_proxy(&profile.id, Some("proxy_missing".to_string()))
      .is_err());

    let proxy = crate::proxy_storage::StoredProxy::new(
      "dc",
      "10.0.0.1",
      3128,
      crate::proxy_storage::ProxyScheme::Http,
    );
    crate::proxy_storage::save_proxy(&proxy).unwrap();

    let updated = manager
      .update_profile_proxy(&profile.id, Some(proxy.id.clone()))
      .unwrap();
    assert_eq!(updated.proxy_id.as_deref(), Some(proxy.id.as_str()));

    let cleared = manager.update_profile_proxy(&profile.id, None).unwrap();
    assert!(cleared.proxy_id.is_none());
  }

  #[tokio::test]
  async fn test_delete_profile_removes_state_dir() {
    let (manager, _temp, _guard) = test_manager();

    let profile = manager.create_profile("Doomed", None, None).unwrap();
    let state_dir = manager.get_profiles_dir().join(profile.id.to_string());
    assert!(state_dir.exists());

    manager.delete_profile(&profile.id).await.unwrap();
    assert!(!state_dir.exists());
    assert!(manager.get_profile(&profile.id).is_err());
  }

  #[test]
  fn test_profile_seeded_with_known_extensions() {
    let (manager, temp, _guard) = test_manager();

    let ext_dir = temp.path().join("ublock");
    std::fs::create_dir_all(&ext_dir).unwrap();
    std::fs::write(
      ext_dir.join("manifest.json"),
      r#"{"manifest_version":3,"name":"uBlock","version":"1.0"}"#,
    )
    .unwrap();
    ExtensionManager::instance()
      .add_extension(None, &ext_dir)
      .unwrap();

    let profile = manager.create_profile("With Extensions", None, None).unwrap();
    assert_eq!(profile.extensions.len(), 1);
    assert_eq!(profile.extensions[0].name, "uBlock");
    assert!(profile.extensions[0].enabled);

    // Re-seeding the same set adds nothing.
    let added = manager.install_known_extensions(&profile.id).unwrap();
    assert_eq!(added, 0);
  }
}
