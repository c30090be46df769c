//! Monitor enumeration and source/destination selection using RandR

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;
use x11rb::connection::Connection;
use x11rb::protocol::randr::ConnectionExt as RandrExt;
use x11rb::protocol::xproto::{ConnectionExt, Window};
use x11rb::rust_connection::RustConnection;

use crate::geometry::Rect;

/// One attached monitor, as reported by RandR 1.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    pub name: String,
    pub rect: Rect,
    pub primary: bool,
}

/// Monitor selection failures. These abort `enable()` with no side
/// effects; everything else in the engine degrades instead of failing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("could not find a pair of monitors to mirror")]
    NoMonitorAvailable,
    #[error("monitor {0} is not active")]
    MonitorNotFound(String),
    #[error("source and destination both map the same screen area")]
    SourceEqualsDestination,
}

/// The chosen source/destination pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub source: MonitorInfo,
    pub dest: MonitorInfo,
}

pub fn list_monitors(conn: &RustConnection, root: Window) -> Result<Vec<MonitorInfo>> {
    let mut monitors = Vec::new();

    let reply = conn
        .randr_get_monitors(root, true)
        .context("Failed to query RandR monitors")
        .and_then(|cookie| cookie.reply().context("Failed to get RandR monitors reply"));
    match reply {
        Ok(reply) => {
            for m in &reply.monitors {
                if m.width == 0 || m.height == 0 {
                    continue;
                }

                let name = conn
                    .get_atom_name(m.name)
                    .ok()
                    .and_then(|cookie| cookie.reply().ok())
                    .map(|r| String::from_utf8_lossy(&r.name).into_owned())
                    .unwrap_or_default();

                monitors.push(MonitorInfo {
                    name,
                    rect: Rect::new(m.x as i32, m.y as i32, m.width as i32, m.height as i32),
                    primary: m.primary,
                });
            }
        }
        Err(err) => {
            warn!("RandR monitor query failed ({err:#}), using screen geometry");
        }
    }

    // Servers without usable RandR monitor info still expose the screen
    // dimensions; treat the whole screen as a single nameless monitor.
    if monitors.is_empty() {
        let screen = &conn.setup().roots[0];
        monitors.push(MonitorInfo {
            name: String::new(),
            rect: Rect::new(
                0,
                0,
                screen.width_in_pixels as i32,
                screen.height_in_pixels as i32,
            ),
            primary: true,
        });
    }

    Ok(monitors)
}

fn find_by_name<'a>(
    monitors: &'a [MonitorInfo],
    name: &str,
) -> Result<&'a MonitorInfo, SelectError> {
    monitors
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| SelectError::MonitorNotFound(name.to_string()))
}

/// The rightmost monitor whose geometry differs from `exclude`.
fn rightmost_monitor_but<'a>(
    monitors: &'a [MonitorInfo],
    exclude: Option<&Rect>,
) -> Option<&'a MonitorInfo> {
    monitors
        .iter()
        .filter(|m| exclude != Some(&m.rect))
        .max_by_key(|m| m.rect.x + m.rect.width)
}

/// The primary monitor if its geometry differs from `exclude`, else the
/// first monitor (in enumeration order) with a different geometry.
fn default_dest_but<'a>(
    monitors: &'a [MonitorInfo],
    exclude: Option<&Rect>,
) -> Option<&'a MonitorInfo> {
    monitors
        .iter()
        .filter(|m| exclude != Some(&m.rect))
        .find(|m| m.primary)
        .or_else(|| monitors.iter().find(|m| exclude != Some(&m.rect)))
}

/// Pick the source and destination monitors.
///
/// Named monitors are resolved first and must be attached. An unnamed
/// source defaults to the rightmost monitor not used as destination; an
/// unnamed destination defaults to the primary monitor, falling back to
/// the first monitor not used as source.
pub fn select_monitors(
    monitors: &[MonitorInfo],
    source_name: Option<&str>,
    dest_name: Option<&str>,
) -> Result<Selection, SelectError> {
    if monitors.len() < 2 && source_name.is_none() {
        // a single monitor mirrored onto itself is useless; an explicit
        // source may still be paired with a window on the same monitor
        return Err(SelectError::NoMonitorAvailable);
    }

    let mut source = match source_name {
        Some(name) => Some(find_by_name(monitors, name)?),
        None => None,
    };
    let mut dest = match dest_name {
        Some(name) => Some(find_by_name(monitors, name)?),
        None => None,
    };

    if let (Some(src), Some(dst)) = (source, dest) {
        if src.rect == dst.rect {
            return Err(SelectError::SourceEqualsDestination);
        }
    }

    if source.is_none() {
        source = rightmost_monitor_but(monitors, dest.map(|m| &m.rect));
    }
    if dest.is_none() {
        dest = default_dest_but(monitors, source.map(|m| &m.rect));
    }

    match (source, dest) {
        (Some(src), Some(dst)) => Ok(Selection {
            source: src.clone(),
            dest: dst.clone(),
        }),
        _ => Err(SelectError::NoMonitorAvailable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(name: &str, x: i32, width: i32, primary: bool) -> MonitorInfo {
        MonitorInfo {
            name: name.to_string(),
            rect: Rect::new(x, 0, width, 1080),
            primary,
        }
    }

    fn two_monitors() -> Vec<MonitorInfo> {
        vec![
            monitor("eDP-1", 0, 1920, true),
            monitor("HDMI-1", 1920, 1280, false),
        ]
    }

    #[test]
    fn test_defaults_pick_rightmost_source_and_primary_dest() {
        let monitors = two_monitors();
        let sel = select_monitors(&monitors, None, None).unwrap();
        assert_eq!(sel.source.name, "HDMI-1");
        assert_eq!(sel.dest.name, "eDP-1");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let monitors = two_monitors();
        let first = select_monitors(&monitors, None, None).unwrap();
        for _ in 0..3 {
            assert_eq!(select_monitors(&monitors, None, None).unwrap(), first);
        }
    }

    #[test]
    fn test_named_source_resolves() {
        let monitors = two_monitors();
        let sel = select_monitors(&monitors, Some("eDP-1"), None).unwrap();
        assert_eq!(sel.source.name, "eDP-1");
        // destination avoids the chosen source even though it is primary
        assert_eq!(sel.dest.name, "HDMI-1");
    }

    #[test]
    fn test_unknown_name_fails() {
        let monitors = two_monitors();
        assert_eq!(
            select_monitors(&monitors, Some("DP-3"), None),
            Err(SelectError::MonitorNotFound("DP-3".to_string()))
        );
        assert_eq!(
            select_monitors(&monitors, None, Some("DP-3")),
            Err(SelectError::MonitorNotFound("DP-3".to_string()))
        );
    }

    #[test]
    fn test_same_monitor_for_both_roles_fails() {
        let monitors = two_monitors();
        assert_eq!(
            select_monitors(&monitors, Some("eDP-1"), Some("eDP-1")),
            Err(SelectError::SourceEqualsDestination)
        );
    }

    #[test]
    fn test_single_monitor_without_explicit_source_fails() {
        let monitors = vec![monitor("eDP-1", 0, 1920, true)];
        assert_eq!(
            select_monitors(&monitors, None, None),
            Err(SelectError::NoMonitorAvailable)
        );
    }

    #[test]
    fn test_no_monitors_fails() {
        assert_eq!(
            select_monitors(&[], None, None),
            Err(SelectError::NoMonitorAvailable)
        );
    }

    #[test]
    fn test_three_monitors_tie_break_by_enumeration_order() {
        let monitors = vec![
            monitor("DP-1", 0, 1920, false),
            monitor("DP-2", 1920, 1920, false),
            monitor("DP-3", 3840, 1920, false),
        ];
        let sel = select_monitors(&monitors, None, None).unwrap();
        // rightmost source; no primary, so first other monitor wins
        assert_eq!(sel.source.name, "DP-3");
        assert_eq!(sel.dest.name, "DP-1");
    }
}
