use serde::{Deserialize, Serialize};

/// Work-area rectangle of a display, in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rect {
  pub x: i32,
  pub y: i32,
  pub width: u32,
  pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Display {
  pub work_area: Rect,
  pub is_primary: bool,
}

impl Display {
  pub fn primary(width: u32, height: u32) -> Self {
    Self {
      work_area: Rect {
        x: 0,
        y: 0,
        width,
        height,
      },
      is_primary: true,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowGeometry {
  pub width: u32,
  pub height: u32,
  pub x: i32,
  pub y: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeBucket {
  UltraWide,
  Large,
  Medium,
  Small,
}

impl SizeBucket {
  fn classify(work_width: u32) -> Self {
    if work_width >= 2560 {
      SizeBucket::UltraWide
    } else if work_width >= 1920 {
      SizeBucket::Large
    } else if work_width >= 1366 {
      SizeBucket::Medium
    } else {
      SizeBucket::Small
    }
  }
}

const MIN_WIDTH: u32 = 900;
const MIN_HEIGHT: u32 = 600;
const CASCADE_RESET: usize = 8;

fn primary_display(displays: &[Display]) -> Display {
  displays
    .iter()
    .find(|d| d.is_primary)
    .or_else(|| displays.first())
    .copied()
    .unwrap_or_else(|| Display::primary(1920, 1080))
}

fn window_size(work_area: &Rect) -> (u32, u32) {
  let sw = work_area.width as f64;
  let sh = work_area.height as f64;

  let (width, height) = match SizeBucket::classify(work_area.width) {
    SizeBucket::UltraWide => (f64::min(1600.0, sw * 0.70), f64::min(1000.0, sh * 0.80)),
    SizeBucket::Large => (f64::min(1400.0, sw * 0.75), f64::min(900.0, sh * 0.80)),
    SizeBucket::Medium => (f64::min(1200.0, sw * 0.80), f64::min(800.0, sh * 0.80)),
    SizeBucket::Small => (f64::min(1000.0, sw * 0.85), f64::min(700.0, sh * 0.85)),
  };

  (
    (width as u32).max(MIN_WIDTH),
    (height as u32).max(MIN_HEIGHT),
  )
}

fn centered(work_area: &Rect, width: u32, height: u32) -> (i32, i32) {
  let x = work_area.x + (work_area.width.saturating_sub(width) / 2) as i32;
  let y = work_area.y + (work_area.height.saturating_sub(height) / 2) as i32;
  (x, y)
}

/// Compute the geometry for the next browser window. Deterministic in its
/// inputs: the same displays and active-instance count always yield the
/// same placement.
///
/// With several displays and at least one running instance, windows
/// round-robin across displays, centered. On a single display the first
/// window is centered and later ones cascade diagonally, resetting every
/// eight windows and never extending past the visible work area.
pub fn plan(displays: &[Display], active_count: usize) -> WindowGeometry {
  let primary = primary_display(displays);
  let (width, height) = window_size(&primary.work_area);

  if displays.len() > 1 && active_count > 0 {
    let target = displays[active_count % displays.len()];
    let (x, y) = centered(&target.work_area, width, height);
    return WindowGeometry {
      width,
      height,
      x,
      y,
    };
  }

  let area = primary.work_area;
  let (cx, cy) = centered(&area, width, height);

  if active_count == 0 {
    return WindowGeometry {
      width,
      height,
      x: cx,
      y: cy,
    };
  }

  let step = f64::min(50.0, area.width as f64 / 30.0) as i32;
  let offset = ((active_count % CASCADE_RESET) as i32) * step;

  let mut x = cx + offset;
  let mut y = cy + offset;

  let right = area.x + area.width as i32;
  let bottom = area.y + area.height as i32;
  if x + width as i32 > right {
    x = right - width as i32 - 20;
  }
  if y + height as i32 > bottom {
    y = bottom - height as i32 - 50;
  }

  WindowGeometry {
    width,
    height,
    x: x.max(area.x),
    y: y.max(area.y),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn single_full_hd() -> Vec<Display> {
    vec![Display::primary(1920, 1080)]
  }

  #[test]
  fn test_plan_is_deterministic() {
    let displays = single_full_hd();
    for count in 0..20 {
      assert_eq!(plan(&displays, count), plan(&displays, count));
    }
  }

  #[test]
  fn test_size_buckets() {
    let ultra = plan(&[Display::primary(3440, 1440)], 0);
    assert_eq!(ultra.width, 1600);
    assert_eq!(ultra.height, 1000);

    let large = plan(&single_full_hd(), 0);
    assert_eq!(large.width, 1400);
    assert_eq!(large.height, 864); // 1080 * 0.8

    let medium = plan(&[Display::primary(1366, 768)], 0);
    assert_eq!(medium.width, 1092); // 1366 * 0.8
    assert_eq!(medium.height, 614); // 768 * 0.8

    let small = plan(&[Display::primary(1280, 720)], 0);
    assert_eq!(small.width, 1000); // floor beats 1280 * 0.85 = 1088 -> min(1000, ..)
    assert_eq!(small.height, 612);
  }

  #[test]
  fn test_minimum_floor() {
    let geom = plan(&[Display::primary(1024, 640)], 0);
    assert!(geom.width >= 900);
    assert!(geom.height >= 600);
  }

  #[test]
  fn test_first_window_centered() {
    let geom = plan(&single_full_hd(), 0);
    assert_eq!(geom.x, (1920 - geom.width as i32) / 2);
    assert_eq!(geom.y, (1080 - geom.height as i32) / 2);
  }

  #[test]
  fn test_cascade_stays_inside_work_area() {
    let displays = single_full_hd();
    for count in 0..32 {
      let geom = plan(&displays, count);
      assert!(geom.x >= 0, "x out of bounds at count {count}");
      assert!(geom.y >= 0, "y out of bounds at count {count}");
      assert!(
        geom.x + geom.width as i32 <= 1920,
        "right edge out of bounds at count {count}"
      );
      assert!(
        geom.y + geom.height as i32 <= 1080,
        "bottom edge out of bounds at count {count}"
      );
    }
  }

  #[test]
  fn test_cascade_offset_resets() {
    let displays = single_full_hd();
    // Window 1 and window 9 share the same cascade slot.
    assert_eq!(plan(&displays, 1), plan(&displays, 9));
    assert_ne!(plan(&displays, 1), plan(&displays, 2));
  }

  #[test]
  fn test_multi_display_round_robin() {
    let displays = vec![
      Display::primary(1920, 1080),
      Display {
        work_area: Rect {
          x: 1920,
          y: 0,
          width: 1920,
          height: 1080,
        },
        is_primary: false,
      },
    ];

    // First instance still lands centered on the primary.
    let first = plan(&displays, 0);
    assert!(first.x < 1920);

    // Second alternates onto the other display.
    let second = plan(&displays, 1);
    assert!(second.x >= 1920);

    let third = plan(&displays, 2);
    assert!(third.x < 1920);
  }

  #[test]
  fn test_no_displays_falls_back() {
    let geom = plan(&[], 0);
    assert!(geom.width >= MIN_WIDTH);
    assert!(geom.height >= MIN_HEIGHT);
  }
}
