use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Proxy scheme as understood by Chrome's `--proxy-server` switch.
/// Chrome only distinguishes HTTP-like from SOCKS dials, so `https`
/// upstreams are folded into `Http` at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyScheme {
  #[default]
  Http,
  Socks4,
  Socks5,
}

impl ProxyScheme {
  pub fn as_str(&self) -> &'static str {
    match self {
      ProxyScheme::Http => "http",
      ProxyScheme::Socks4 => "socks4",
      ProxyScheme::Socks5 => "socks5",
    }
  }
}

impl fmt::Display for ProxyScheme {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ProxyScheme {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "http" | "https" => Ok(ProxyScheme::Http),
      "socks4" => Ok(ProxyScheme::Socks4),
      "socks5" => Ok(ProxyScheme::Socks5),
      other => Err(format!("Unknown proxy scheme: {other}")),
    }
  }
}

impl Serialize for ProxyScheme {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for ProxyScheme {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// An upstream proxy definition. Once a launch copies one of these into an
/// instance it is never mutated; re-pointing a profile requires a relaunch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProxy {
  pub id: String,
  #[serde(default)]
  pub label: String,
  pub host: String,
  pub port: u16,
  #[serde(default)]
  pub scheme: ProxyScheme,
  #[serde(default)]
  pub username: Option<String>,
  #[serde(default)]
  pub password: Option<String>,
  #[serde(default)]
  pub created_at: u64,
}

impl StoredProxy {
  pub fn new(label: &str, host: &str, port: u16, scheme: ProxyScheme) -> Self {
    Self {
      id: generate_proxy_id(),
      label: label.to_string(),
      host: host.to_string(),
      port,
      scheme,
      username: None,
      password: None,
      created_at: now_secs(),
    }
  }

  pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
    self.username = username;
    self.password = password;
    self
  }

  /// True when the upstream expects an auth challenge answered with
  /// credentials. An empty username counts as "no credentials".
  pub fn has_credentials(&self) -> bool {
    self.username.as_deref().is_some_and(|u| !u.is_empty())
  }

  /// Render the `--proxy-server` switch value. Credentials never appear
  /// here; Chrome ignores userinfo in this switch and they are supplied
  /// through the control channel instead.
  pub fn launch_arg(&self) -> String {
    format!("{}://{}:{}", self.scheme, self.host, self.port)
  }
}

fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

pub fn get_storage_dir() -> PathBuf {
  crate::app_dirs::proxies_dir()
}

pub fn save_proxy(proxy: &StoredProxy) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
  let storage_dir = get_storage_dir();
  fs::create_dir_all(&storage_dir)?;

  let file_path = storage_dir.join(format!("{}.json", proxy.id));
  let content = serde_json::to_string_pretty(proxy)?;
  fs::write(&file_path, content)?;

  Ok(())
}

pub fn get_proxy(id: &str) -> Option<StoredProxy> {
  let file_path = get_storage_dir().join(format!("{id}.json"));

  if !file_path.exists() {
    return None;
  }

  match fs::read_to_string(&file_path) {
    Ok(content) => serde_json::from_str(&content).ok(),
    Err(_) => None,
  }
}

pub fn delete_proxy(id: &str) -> bool {
  let file_path = get_storage_dir().join(format!("{id}.json"));

  if !file_path.exists() {
    return false;
  }

  fs::remove_file(&file_path).is_ok()
}

pub fn list_proxies() -> Vec<StoredProxy> {
  let storage_dir = get_storage_dir();

  if !storage_dir.exists() {
    return Vec::new();
  }

  let mut proxies = Vec::new();
  if let Ok(entries) = fs::read_dir(&storage_dir) {
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_some_and(|ext| ext == "json") {
        if let Ok(content) = fs::read_to_string(&path) {
          if let Ok(proxy) = serde_json::from_str::<StoredProxy>(&content) {
            proxies.push(proxy);
          }
        }
      }
    }
  }

  proxies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
  proxies
}

pub fn generate_proxy_id() -> String {
  format!(
    "proxy_{}_{}",
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    rand::random::<u32>()
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::app_dirs;
  use tempfile::TempDir;

  #[test]
  fn test_scheme_parsing() {
    assert_eq!("http".parse::<ProxyScheme>().unwrap(), ProxyScheme::Http);
    assert_eq!("HTTP".parse::<ProxyScheme>().unwrap(), ProxyScheme::Http);
    assert_eq!(
      "socks4".parse::<ProxyScheme>().unwrap(),
      ProxyScheme::Socks4
    );
    assert_eq!(
      "socks5".parse::<ProxyScheme>().unwrap(),
      ProxyScheme::Socks5
    );
    assert!("ftp".parse::<ProxyScheme>().is_err());
  }

  #[test]
  fn test_https_normalizes_to_http() {
    // Chrome's proxy dial has no separate https mode.
    assert_eq!("https".parse::<ProxyScheme>().unwrap(), ProxyScheme::Http);
  }

  #[test]
  fn test_launch_arg_format() {
    let proxy = StoredProxy::new("upstream", "1.2.3.4", 8080, ProxyScheme::Http);
    assert_eq!(proxy.launch_arg(), "http://1.2.3.4:8080");

    let socks = StoredProxy::new("socks", "proxy.example.com", 1080, ProxyScheme::Socks5);
    assert_eq!(socks.launch_arg(), "socks5://proxy.example.com:1080");
  }

  #[test]
  fn test_launch_arg_never_carries_credentials() {
    let proxy = StoredProxy::new("auth", "1.2.3.4", 8080, ProxyScheme::Http)
      .with_credentials(Some("user".to_string()), Some("secret".to_string()));
    assert!(!proxy.launch_arg().contains("user"));
    assert!(!proxy.launch_arg().contains("secret"));
  }

  #[test]
  fn test_has_credentials() {
    let plain = StoredProxy::new("plain", "1.2.3.4", 8080, ProxyScheme::Http);
    assert!(!plain.has_credentials());

    let empty_user = StoredProxy::new("empty", "1.2.3.4", 8080, ProxyScheme::Http)
      .with_credentials(Some(String::new()), Some("pw".to_string()));
    assert!(!empty_user.has_credentials());

    let with_auth = StoredProxy::new("auth", "1.2.3.4", 8080, ProxyScheme::Http)
      .with_credentials(Some("u".to_string()), Some("p".to_string()));
    assert!(with_auth.has_credentials());
  }

  #[test]
  fn test_save_and_list_roundtrip() {
    let temp = TempDir::new().unwrap();
    let _guard = app_dirs::set_test_data_dir(temp.path().to_path_buf());

    let proxy = StoredProxy::new("dc1", "10.0.0.1", 3128, ProxyScheme::Http);
    save_proxy(&proxy).unwrap();

    let loaded = get_proxy(&proxy.id).unwrap();
    assert_eq!(loaded.host, "10.0.0.1");
    assert_eq!(loaded.scheme, ProxyScheme::Http);

    assert_eq!(list_proxies().len(), 1);
    assert!(delete_proxy(&proxy.id));
    assert!(get_proxy(&proxy.id).is_none());
    assert!(!delete_proxy(&proxy.id));
  }

  #[test]
  fn test_stored_scheme_https_still_loads() {
    let temp = TempDir::new().unwrap();
    let _guard = app_dirs::set_test_data_dir(temp.path().to_path_buf());

    // A record written by an older build may still say "https".
    let dir = get_storage_dir();
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
      dir.join("proxy_legacy.json"),
      r#"{"id":"proxy_legacy","host":"h","port":443,"scheme":"https"}"#,
    )
    .unwrap();

    let loaded = get_proxy("proxy_legacy").unwrap();
    assert_eq!(loaded.scheme, ProxyScheme::Http);
  }
}
