//! Active-window tracking via _NET_ACTIVE_WINDOW
//!
//! Queries against windows owned by other clients can fail at any time
//! (the window may be gone by the time the reply arrives); every such
//! failure is swallowed and the last good geometry stays in effect.

use anyhow::Result;
use tracing::{debug, warn};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ConnectionExt, EventMask, Window,
};
use x11rb::rust_connection::RustConnection;

use crate::geometry::Rect;
use crate::surface::{intern_atom, set_root_event_mask};

pub struct FocusTracker {
    net_active_window: Atom,
    root: Window,
    root_rect: Rect,
    /// Our own top-level; never monitored as a foreign window.
    own_window: Window,
    active: Option<Window>,
    active_rect: Rect,
}

impl FocusTracker {
    /// Subscribe to focus changes on the root window.
    pub fn enable(conn: &RustConnection, root: Window, own_window: Window) -> Result<Self> {
        let net_active_window = intern_atom(conn, b"_NET_ACTIVE_WINDOW")?;
        set_root_event_mask(conn, root, EventMask::PROPERTY_CHANGE)?;

        let root_rect = window_geometry(conn, root).unwrap_or_default();

        Ok(Self {
            net_active_window,
            root,
            root_rect,
            own_window,
            active: None,
            active_rect: Rect::default(),
        })
    }

    /// The tracked window's last-known geometry, if a window with
    /// meaningful geometry currently has focus.
    pub fn active_rect(&self) -> Option<&Rect> {
        self.active.map(|_| &self.active_rect)
    }

    pub fn is_focus_change(&self, window: Window, atom: Atom) -> bool {
        window == self.root && atom == self.net_active_window
    }

    pub fn is_tracked(&self, window: Window) -> bool {
        self.active == Some(window)
    }

    /// Focus moved: re-read _NET_ACTIVE_WINDOW and start tracking the
    /// new holder's top-level ancestor.
    pub fn restart_monitoring(&mut self, conn: &RustConnection) {
        self.stop_monitoring(conn);

        let Some(focused) = self.read_active_window(conn) else {
            return;
        };
        let Some(toplevel) = self.resolve_toplevel(conn, focused) else {
            return;
        };
        let Some(rect) = window_geometry(conn, toplevel) else {
            return;
        };

        if rect == self.root_rect {
            // same geometry as the whole display: nothing meaningfully
            // focused (desktop, lock screen, ...)
            debug!("focused window covers the display, not tracking");
            return;
        }

        self.active = Some(toplevel);
        self.active_rect = rect;

        if toplevel != self.own_window {
            // foreign window: ask for ConfigureNotify so the geometry
            // stays current while it is focused
            let _ = conn.change_window_attributes(
                toplevel,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::STRUCTURE_NOTIFY),
            );
        }
        debug!(window = toplevel, ?rect, "tracking active window");
    }

    /// The tracked window was moved or resized.
    pub fn refresh_geometry(&mut self, conn: &RustConnection) {
        let Some(window) = self.active else {
            return;
        };
        match window_geometry(conn, window) {
            Some(rect) => self.active_rect = rect,
            None => {
                // transient failure; keep the previous geometry
                warn!(window, "active window geometry query failed, keeping last");
            }
        }
    }

    pub fn stop_monitoring(&mut self, conn: &RustConnection) {
        if let Some(window) = self.active.take() {
            if window != self.own_window {
                let _ = conn.change_window_attributes(
                    window,
                    &ChangeWindowAttributesAux::new().event_mask(EventMask::NO_EVENT),
                );
            }
        }
    }

    /// Tear down focus tracking entirely.
    pub fn disable(&mut self, conn: &RustConnection) -> Result<()> {
        self.stop_monitoring(conn);
        set_root_event_mask(conn, self.root, EventMask::NO_EVENT)?;
        Ok(())
    }

    fn read_active_window(&self, conn: &RustConnection) -> Option<Window> {
        let reply = conn
            .get_property(
                false,
                self.root,
                self.net_active_window,
                AtomEnum::WINDOW,
                0,
                1,
            )
            .ok()?
            .reply()
            .ok()?;
        let window = reply.value32()?.next()?;
        if window == x11rb::NONE {
            None
        } else {
            Some(window)
        }
    }

    /// Walk up the window tree to the child of the root.
    fn resolve_toplevel(&self, conn: &RustConnection, window: Window) -> Option<Window> {
        let mut current = window;
        let mut parent = window;
        while parent != self.root {
            current = parent;
            let tree = conn.query_tree(current).ok()?.reply().ok()?;
            parent = tree.parent;
        }
        Some(current)
    }
}

/// Absolute geometry of a window, grown by its border width.
fn window_geometry(conn: &RustConnection, window: Window) -> Option<Rect> {
    let geom = conn.get_geometry(window).ok()?.reply().ok()?;
    let bw = geom.border_width as i32;
    Some(Rect::new(
        geom.x as i32 - bw,
        geom.y as i32 - bw,
        geom.width as i32 + 2 * bw,
        geom.height as i32 + 2 * bw,
    ))
}
