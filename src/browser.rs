//! Browser executable discovery and launch-argument assembly for
//! Chromium-family binaries.

use std::path::{Path, PathBuf};

use crate::window_placement::WindowGeometry;

#[cfg(target_os = "macos")]
const EXECUTABLE_CANDIDATES: &[&str] = &[
  "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
  "/Applications/Chromium.app/Contents/MacOS/Chromium",
  "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
];

#[cfg(target_os = "windows")]
const EXECUTABLE_CANDIDATES: &[&str] = &[
  r"C:\Program Files\Google\Chrome\Application\chrome.exe",
  r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
  r"C:\Program Files\Chromium\Application\chrome.exe",
];

#[cfg(all(unix, not(target_os = "macos")))]
const EXECUTABLE_CANDIDATES: &[&str] = &[
  "/usr/bin/google-chrome",
  "/usr/bin/google-chrome-stable",
  "/usr/bin/chromium",
  "/usr/bin/chromium-browser",
  "/opt/google/chrome/chrome",
  "/snap/bin/chromium",
];

const PATH_NAMES: &[&str] = &[
  "google-chrome",
  "google-chrome-stable",
  "chromium",
  "chromium-browser",
];

fn search_path_env() -> Option<PathBuf> {
  let path_var = std::env::var_os("PATH")?;
  for dir in std::env::split_paths(&path_var) {
    for name in PATH_NAMES {
      let candidate = dir.join(name);
      if candidate.is_file() {
        return Some(candidate);
      }
    }
  }
  None
}

/// Locate the browser binary: explicit override first, then the
/// `CHROME_MANAGER_BROWSER` environment variable, then well-known install
/// locations, then `PATH`.
pub fn find_browser_executable(override_path: Option<&Path>) -> Option<PathBuf> {
  if let Some(path) = override_path {
    if path.is_file() {
      return Some(path.to_path_buf());
    }
    log::warn!(
      "Configured browser executable does not exist: {}, falling back to discovery",
      path.display()
    );
  }

  if let Ok(env_path) = std::env::var("CHROME_MANAGER_BROWSER") {
    let path = PathBuf::from(&env_path);
    if path.is_file() {
      return Some(path);
    }
    log::warn!("CHROME_MANAGER_BROWSER points at nothing: {env_path}");
  }

  for candidate in EXECUTABLE_CANDIDATES {
    let path = Path::new(candidate);
    if path.is_file() {
      return Some(path.to_path_buf());
    }
  }

  search_path_env()
}

/// Build the full argument set for one instance. The profile's state
/// directory, the debugging port, the planned geometry, the extension
/// allow/load lists and the proxy dial all land here; credentials never
/// do (they travel over the control channel).
pub fn create_launch_args(
  profile_data_path: &str,
  geometry: &WindowGeometry,
  extension_dirs: &[PathBuf],
  proxy_arg: Option<&str>,
  restore_session: bool,
  cdp_port: u16,
) -> Vec<String> {
  let mut args = vec![
    format!("--user-data-dir={profile_data_path}"),
    format!("--remote-debugging-port={cdp_port}"),
    "--remote-debugging-address=127.0.0.1".to_string(),
    "--no-first-run".to_string(),
    "--no-default-browser-check".to_string(),
    "--disable-background-mode".to_string(),
    "--disable-component-update".to_string(),
    "--disable-background-timer-throttling".to_string(),
    "--disable-session-crashed-bubble".to_string(),
    "--hide-crash-restore-bubble".to_string(),
    "--disable-infobars".to_string(),
    "--password-store=basic".to_string(),
    "--use-mock-keychain".to_string(),
    format!("--window-size={},{}", geometry.width, geometry.height),
    format!("--window-position={},{}", geometry.x, geometry.y),
  ];

  if restore_session {
    args.push("--restore-last-session".to_string());
  } else {
    // Nothing to restore; open a single plain window instead of letting
    // session restore race the first tab.
    args.push("--new-window".to_string());
  }

  if !extension_dirs.is_empty() {
    let joined = extension_dirs
      .iter()
      .map(|p| p.to_string_lossy().into_owned())
      .collect::<Vec<_>>()
      .join(",");
    args.push(format!("--disable-extensions-except={joined}"));
    args.push(format!("--load-extension={joined}"));
  }

  if let Some(proxy) = proxy_arg {
    args.push(format!("--proxy-server={proxy}"));
  }

  args
}

#[cfg(test)]
mod tests {
  use super::*;

  fn geometry() -> WindowGeometry {
    WindowGeometry {
      width: 1400,
      height: 900,
      x: 100,
      y: 50,
    }
  }

  #[test]
  fn test_launch_args_basics() {
    let args = create_launch_args("/path/to/profile", &geometry(), &[], None, false, 9222);

    assert!(args.contains(&"--user-data-dir=/path/to/profile".to_string()));
    assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
    assert!(args.contains(&"--no-default-browser-check".to_string()));
    assert!(args.contains(&"--disable-background-mode".to_string()));
    assert!(args.contains(&"--disable-component-update".to_string()));
    assert!(args.contains(&"--window-size=1400,900".to_string()));
    assert!(args.contains(&"--window-position=100,50".to_string()));
  }

  #[test]
  fn test_launch_args_session_restore_flag() {
    let with_session = create_launch_args("/p", &geometry(), &[], None, true, 9222);
    assert!(with_session.contains(&"--restore-last-session".to_string()));
    assert!(!with_session.contains(&"--new-window".to_string()));

    let fresh = create_launch_args("/p", &geometry(), &[], None, false, 9222);
    assert!(fresh.contains(&"--new-window".to_string()));
    assert!(!fresh.contains(&"--restore-last-session".to_string()));
  }

  #[test]
  fn test_launch_args_extensions() {
    let exts = vec![PathBuf::from("/ext/a"), PathBuf::from("/ext/b")];
    let args = create_launch_args("/p", &geometry(), &exts, None, false, 9222);

    assert!(args.contains(&"--load-extension=/ext/a,/ext/b".to_string()));
    assert!(args.contains(&"--disable-extensions-except=/ext/a,/ext/b".to_string()));
  }

  #[test]
  fn test_launch_args_no_extension_flags_when_empty() {
    let args = create_launch_args("/p", &geometry(), &[], None, false, 9222);
    assert!(!args.iter().any(|a| a.starts_with("--load-extension")));
    assert!(!args.iter().any(|a| a.starts_with("--disable-extensions-except")));
  }

  #[test]
  fn test_launch_args_proxy() {
    let args = create_launch_args(
      "/p",
      &geometry(),
      &[],
      Some("socks5://1.2.3.4:1080"),
      false,
      9222,
    );
    assert!(args.contains(&"--proxy-server=socks5://1.2.3.4:1080".to_string()));

    let no_proxy = create_launch_args("/p", &geometry(), &[], None, false, 9222);
    assert!(!no_proxy.iter().any(|a| a.starts_with("--proxy-server")));
  }

  #[test]
  fn test_find_browser_prefers_override() {
    // A file that certainly exists on any platform running the tests.
    let this_file = std::env::current_exe().unwrap();
    let found = find_browser_executable(Some(&this_file)).unwrap();
    assert_eq!(found, this_file);
  }

  #[test]
  fn test_find_browser_ignores_missing_override() {
    let missing = Path::new("/definitely/not/a/browser");
    // Falls through to discovery; whatever that yields, it is not the
    // bogus override.
    if let Some(found) = find_browser_executable(Some(missing)) {
      assert_ne!(found, missing);
    }
  }
}
