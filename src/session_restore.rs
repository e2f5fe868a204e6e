//! Heuristics around Chrome's session restore: deciding whether a profile
//! has a previous session on disk, and cleaning up the transient blank tab
//! the browser opens before restoration has populated real tabs.

use std::path::Path;
use std::time::Duration;

use crate::cdp::{CdpClient, CdpTarget, BLANK_URL};

const RECONCILE_MAX_ATTEMPTS: usize = 5;
const RECONCILE_DELAY: Duration = Duration::from_secs(1);
// Attempts to sit out before concluding there is nothing to restore.
const KEEP_BLANK_AFTER_ATTEMPT: usize = 3;

/// Session-artifact files whose presence (non-empty) marks a profile as
/// having something to restore. Chrome's own on-disk layout, matched not
/// designed.
const SESSION_FILES: &[&str] = &[
  "Default/Current Session",
  "Default/Last Session",
  "Default/Current Tabs",
  "Default/Last Tabs",
  "Default/Sessions/Session_13313",
  "Default/Sessions/Tabs_13313",
  "Default/Preferences",
  "Default/History",
];

pub fn is_blank_url(url: &str) -> bool {
  url.is_empty() || url == BLANK_URL
}

pub fn is_internal_url(url: &str) -> bool {
  url.starts_with("chrome://") || url.starts_with("devtools://")
}

/// True when the profile directory carries a restorable session. Only ever
/// used to pick launch flags; IO errors read as "fresh profile".
pub fn has_existing_session(profile_data_dir: &Path) -> bool {
  for rel in SESSION_FILES {
    let path = profile_data_dir.join(rel);
    if let Ok(meta) = std::fs::metadata(&path) {
      if meta.len() > 0 {
        log::debug!("Found session artifact: {}", path.display());
        return true;
      }
    }
  }

  // Anything at all in the Sessions folder also counts.
  let sessions_dir = profile_data_dir.join("Default").join("Sessions");
  if let Ok(mut entries) = std::fs::read_dir(&sessions_dir) {
    if entries.next().is_some() {
      log::debug!("Found entries in {}", sessions_dir.display());
      return true;
    }
  }

  false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
  /// Restoration produced real tabs and no placeholder was left behind.
  SessionRestored,
  /// Real tabs appeared alongside placeholders; the placeholders were closed.
  ClosedBlankTabs(usize),
  /// Nothing to restore; exactly one blank tab was left in place.
  KeptBlankTab,
  /// The attempt budget ran out without a decision. Not an error.
  TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileStep {
  CloseBlanks,
  KeepOne,
  Restored,
  Wait,
}

fn split_tabs(targets: &[CdpTarget]) -> (Vec<&CdpTarget>, Vec<&CdpTarget>) {
  let mut real = Vec::new();
  let mut blank = Vec::new();
  for t in targets {
    if is_blank_url(&t.url) {
      blank.push(t);
    } else {
      real.push(t);
    }
  }
  (real, blank)
}

fn decide(real: usize, blank: usize, attempt: usize) -> ReconcileStep {
  if real > 0 && blank > 0 {
    ReconcileStep::CloseBlanks
  } else if blank == 0 && real > 0 {
    ReconcileStep::Restored
  } else if real == 0 && blank > 0 && attempt >= KEEP_BLANK_AFTER_ATTEMPT {
    ReconcileStep::KeepOne
  } else {
    ReconcileStep::Wait
  }
}

/// Bounded retry loop that reconciles the placeholder tab Chrome opens
/// while session restore is still in flight. Closes placeholders once real
/// tabs show up; a profile with nothing to restore keeps exactly one blank
/// tab, never zero.
pub async fn reconcile_blank_tabs(cdp: &CdpClient) -> ReconcileOutcome {
  for attempt in 0..RECONCILE_MAX_ATTEMPTS {
    tokio::time::sleep(RECONCILE_DELAY).await;

    let targets = match cdp.page_targets().await {
      Ok(t) => t,
      Err(e) => {
        log::warn!("Could not list tabs on attempt {}: {e}", attempt + 1);
        continue;
      }
    };

    if targets.is_empty() {
      log::debug!("No tabs yet on attempt {}, waiting", attempt + 1);
      continue;
    }

    let (real, blank) = split_tabs(&targets);
    log::debug!(
      "Attempt {}: {} real tab(s), {} blank tab(s)",
      attempt + 1,
      real.len(),
      blank.len()
    );

    match decide(real.len(), blank.len(), attempt) {
      ReconcileStep::CloseBlanks => {
        let mut closed = 0;
        for tab in &blank {
          match cdp.close_target(&tab.id).await {
            Ok(()) => closed += 1,
            Err(e) => log::warn!("Failed to close blank tab {}: {e}", tab.id),
          }
        }
        log::info!("Closed {closed} blank tab(s) after session restore");
        return ReconcileOutcome::ClosedBlankTabs(closed);
      }
      ReconcileStep::Restored => {
        return ReconcileOutcome::SessionRestored;
      }
      ReconcileStep::KeepOne => {
        // A fresh profile legitimately has nothing to restore; keep one
        // placeholder so the window is never tabless.
        for tab in blank.iter().skip(1) {
          if let Err(e) = cdp.close_target(&tab.id).await {
            log::warn!("Failed to close extra blank tab {}: {e}", tab.id);
          }
        }
        return ReconcileOutcome::KeptBlankTab;
      }
      ReconcileStep::Wait => {}
    }
  }

  log::info!("Blank-tab reconciliation hit its attempt budget, keeping current tabs");
  ReconcileOutcome::TimedOut
}
