use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Reference from a profile to a registered extension, with its own
/// enabled flag so one profile can opt out of a globally enabled
/// extension.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProfileExtension {
  pub id: String,
  pub name: String,
  pub enabled: bool,
  pub installed_at: u64,
}

/// An isolated browsing identity backed by a private state directory.
/// The directory is created before first launch and never shared between
/// two profiles.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Profile {
  pub id: uuid::Uuid,
  pub name: String,
  #[serde(default)]
  pub proxy_id: Option<String>,
  #[serde(default)]
  pub extensions: Vec<ProfileExtension>,
  #[serde(default)]
  pub note: Option<String>,
  #[serde(default)]
  pub created_at: u64,
  #[serde(default)]
  pub updated_at: u64,
}

impl Profile {
  /// Path to the browser state directory (profiles/{uuid}/profile).
  pub fn data_path(&self, profiles_dir: &Path) -> PathBuf {
    profiles_dir.join(self.id.to_string()).join("profile")
  }
}
