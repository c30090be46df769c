//! The mirroring engine: lifecycle, event dispatch, run loop
//!
//! Everything created by `enable()` lives in one `Enabled` value and is
//! torn down by `disable()` in reverse dependency order: timers first,
//! then notification subscriptions, then tracking state, then the owned
//! surfaces. All capture and compositing runs on the calling thread; the
//! run loop waits on the X connection fd with a timeout derived from the
//! earliest pending timer deadline.

use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::damage::{self, ConnectionExt as DamageExt};
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt};
use x11rb::protocol::xinput::{self, ConnectionExt as XinputExt};
use x11rb::protocol::xproto::{ClientMessageEvent, ConfigureNotifyEvent, ConnectionExt, Window};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::config::Config;
use crate::cursor::CursorOverlay;
use crate::focus::FocusTracker;
use crate::geometry::Rect;
use crate::monitor::{self, MonitorInfo};
use crate::reflow::{self, Offset};
use crate::scheduler::{
    DamageAction, PollTimer, RateLimiter, RefreshPolicy, RefreshStrategy, TaskSlot,
};
use crate::surface::MirrorSurface;
use crate::visibility::{self, Visibility, VisibilityState};

/// XIAllMasterDevices
const XI_ALL_MASTER_DEVICES: u16 = 1;

// Modifier keysyms that may belong to window-manager chords; key-press
// reveal ignores them (Shift is deliberately not in this set).
const XK_CONTROL_L: u32 = 0xffe3;
const XK_CONTROL_R: u32 = 0xffe4;
const XK_META_L: u32 = 0xffe7;
const XK_META_R: u32 = 0xffe8;
const XK_ALT_L: u32 = 0xffe9;
const XK_ALT_R: u32 = 0xffea;

/// Upper bound on one run-loop wait, so shutdown requests are noticed
/// promptly even with no timers pending.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Keycode-to-keysym table, fetched once at enable time.
struct Keymap {
    first_keycode: u8,
    keysyms_per_keycode: u8,
    keysyms: Vec<u32>,
}

impl Keymap {
    fn keysym(&self, keycode: u32) -> Option<u32> {
        let index = keycode.checked_sub(self.first_keycode as u32)? as usize
            * self.keysyms_per_keycode as usize;
        self.keysyms.get(index).copied()
    }
}

fn is_modifier_keysym(keysym: u32) -> bool {
    matches!(
        keysym,
        XK_CONTROL_L | XK_CONTROL_R | XK_META_L | XK_META_R | XK_ALT_L | XK_ALT_R
    )
}

/// Why the engine disabled itself mid-run. Returned from `run()` so the
/// caller can decide whether re-enabling makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DisplayChanged,
    WindowClosed,
}

impl StopReason {
    pub fn message(self) -> &'static str {
        match self {
            StopReason::DisplayChanged => "display configuration changed, disabling",
            StopReason::WindowClosed => "mirror window closed, disabling",
        }
    }
}

/// Everything owned between `enable()` and `disable()`.
struct Enabled {
    root: Window,
    source: Rect,
    dest: Rect,
    windowed: bool,
    surface: MirrorSurface,
    overlay: CursorOverlay,
    focus: FocusTracker,
    visibility: VisibilityState,
    offset: Offset,
    limiter: Option<RateLimiter>,
    damage: Option<damage::Damage>,
    deferred: TaskSlot,
    poll_timer: Option<PollTimer>,
    raw_motion: bool,
    keymap: Option<Keymap>,
}

pub struct Engine {
    conn: RustConnection,
    screen_num: usize,
    config: Config,
    on_error: Option<Box<dyn Fn(&str)>>,
    state: Option<Enabled>,
}

impl Engine {
    /// Connect to the X server. Screen-reconfiguration notifications are
    /// selected for the lifetime of the connection.
    pub fn connect(config: Config) -> Result<Self> {
        let (conn, screen_num) =
            RustConnection::connect(None).context("Failed to connect to X11 display")?;

        let root = conn.setup().roots[screen_num].root;
        if probe_randr(&conn) {
            conn.randr_select_input(root, randr::NotifyMask::SCREEN_CHANGE)
                .context("Failed to select RandR notifications")?;
        }

        Ok(Self {
            conn,
            screen_num,
            config,
            on_error: None,
            state: None,
        })
    }

    /// Hook invoked when a steady-state condition forces the engine to
    /// disable itself (display reconfiguration, mirror window closed).
    pub fn set_error_hook(&mut self, hook: impl Fn(&str) + 'static) {
        self.on_error = Some(Box::new(hook));
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    pub fn monitors(&self) -> Result<Vec<MonitorInfo>> {
        monitor::list_monitors(&self.conn, self.root())
    }

    fn root(&self) -> Window {
        self.conn.setup().roots[self.screen_num].root
    }

    /// Select regions, build the surface, probe capabilities, subscribe
    /// to notifications and draw the first frame. On error nothing is
    /// left registered.
    pub fn enable(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }

        let monitors = self.monitors()?;
        let selection = monitor::select_monitors(
            &monitors,
            self.config.source_name.as_deref(),
            self.config.dest_name.as_deref(),
        )?;
        info!(
            source = %selection.source.name,
            dest = %selection.dest.name,
            "mirroring {}x{} onto {}x{}",
            selection.source.rect.width,
            selection.source.rect.height,
            selection.dest.rect.width,
            selection.dest.rect.height,
        );
        let source = selection.source.rect;
        let dest = selection.dest.rect;

        let screen = &self.conn.setup().roots[self.screen_num];
        let root = screen.root;
        let windowed = self.config.windowed;

        let surface = MirrorSurface::create(&self.conn, screen, source, dest, windowed)?;

        // anything failing from here on must unwind what already exists,
        // so a failed enable() leaves nothing registered
        let mut focus = match FocusTracker::enable(&self.conn, root, surface.window) {
            Ok(focus) => focus,
            Err(err) => {
                let _ = surface.destroy(&self.conn);
                let _ = self.conn.flush();
                return Err(err);
            }
        };

        let overlay = match CursorOverlay::create(&self.conn, screen, &surface) {
            Ok(overlay) => overlay,
            Err(err) => {
                let _ = focus.disable(&self.conn);
                let _ = surface.destroy(&self.conn);
                let _ = self.conn.flush();
                return Err(err);
            }
        };

        let raw_motion = probe_raw_motion(&self.conn, root);
        let keymap = if raw_motion {
            fetch_keymap(&self.conn)
        } else {
            None
        };

        let has_damage = probe_damage(&self.conn);
        let policy = RefreshPolicy::derive(&self.config, has_damage, raw_motion);
        info!(
            strategy = ?policy.strategy,
            min_period_ms = policy.min_period_ms,
            poll_fps = ?policy.poll_fps,
            raw_motion,
            "refresh policy"
        );

        focus.restart_monitoring(&self.conn);

        let mut state = Enabled {
            root,
            source,
            dest,
            windowed,
            surface,
            overlay,
            focus,
            visibility: VisibilityState::new(),
            offset: Offset::default(),
            limiter: None,
            damage: None,
            deferred: TaskSlot::default(),
            poll_timer: policy.poll_fps.map(PollTimer::new),
            raw_motion,
            keymap,
        };

        if let Err(err) = self.finish_enable(&mut state, &policy) {
            let _ = state.teardown(&self.conn);
            return Err(err);
        }

        self.state = Some(state);
        Ok(())
    }

    /// Damage registration and the first frame. Runs against a fully
    /// assembled `Enabled` so a failure can unwind through `teardown`.
    fn finish_enable(&self, state: &mut Enabled, policy: &RefreshPolicy) -> Result<()> {
        if policy.strategy == RefreshStrategy::EventDriven {
            let handle = self.conn.generate_id()?;
            self.conn
                .damage_create(handle, state.root, damage::ReportLevel::BOUNDING_BOX)?
                .check()
                .context("Failed to create damage object")?;
            state.damage = Some(handle);
            state.limiter = Some(RateLimiter::new(policy.min_period_ms));
        }

        // first frame: locate the pointer, settle visibility, capture
        state.refresh_cursor_location(&self.conn)?;
        state.update_visibility(&self.conn)?;
        state.refresh_frame(&self.conn)?;
        self.conn.flush()?;
        Ok(())
    }

    /// Tear down in reverse dependency order; idempotent.
    pub fn disable(&mut self) -> Result<()> {
        if let Some(mut state) = self.state.take() {
            state.teardown(&self.conn)?;
            info!("mirroring disabled");
        }
        Ok(())
    }

    /// Process events and timers until `shutdown` is set or a condition
    /// forces the engine to disable itself.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<Option<StopReason>> {
        while !shutdown.load(Ordering::Relaxed) {
            let stop_reason = {
                let Some(state) = self.state.as_mut() else {
                    break;
                };

                let mut stop = None;
                'work: loop {
                    let mut handled = false;
                    while let Some(event) = self.conn.poll_for_event()? {
                        handled = true;
                        if let Some(reason) = state.handle_event(&self.conn, event)? {
                            stop = Some(reason);
                            break 'work;
                        }
                    }
                    let refreshed = state.fire_timers(&self.conn, Instant::now())?;
                    // reply round trips inside the handlers and refreshes
                    // buffer events on the connection without touching the
                    // fd; sleep only once a full pass found nothing to do
                    if !handled && !refreshed {
                        break;
                    }
                }
                stop
            };

            if let Some(reason) = stop_reason {
                warn!("{}", reason.message());
                if let Some(hook) = &self.on_error {
                    hook(reason.message());
                }
                self.disable()?;
                return Ok(Some(reason));
            }

            self.conn.flush()?;
            self.wait_for_activity()?;
        }
        Ok(None)
    }

    /// Block on the connection fd until an event arrives or the next
    /// timer deadline passes.
    fn wait_for_activity(&self) -> Result<()> {
        let deadline = self
            .state
            .as_ref()
            .and_then(|state| state.next_deadline());

        let now = Instant::now();
        let timeout = deadline
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);
        let timeout_ms = timeout.as_millis() as u16;

        let mut fds = [PollFd::new(self.conn.stream().as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(_) => Ok(()),
            Err(Errno::EINTR) => Ok(()),
            Err(err) => Err(err).context("Failed to poll X connection"),
        }
    }
}

impl Enabled {
    /// Full refresh: capture, overlay, repaint.
    fn refresh_frame(&mut self, conn: &RustConnection) -> Result<()> {
        if !self.raw_motion {
            // no motion events: piggyback location tracking on the tick
            self.refresh_cursor_location(conn)?;
        }

        self.surface.blit(conn, &self.source)?;

        // the scratch buffer holds pre-capture pixels now; drop it and
        // redraw the overlay into the fresh frame
        self.overlay.invalidate_saved();
        self.overlay.redraw(conn, &self.surface, false)?;

        self.surface.present_all(conn)?;
        conn.flush()?;
        Ok(())
    }

    /// Re-read the pointer, update visibility and panning, redraw the
    /// overlay at its new position.
    fn refresh_cursor_location(&mut self, conn: &RustConnection) -> Result<()> {
        self.overlay.refresh_location(conn, self.root, &self.source)?;
        self.update_visibility(conn)?;

        let offset_moved = self.fix_offset(conn)?;
        self.overlay.redraw(conn, &self.surface, !offset_moved)?;
        if offset_moved {
            // the content moved under the window; repaint everything so
            // no stale pixels remain at the margins
            self.surface.present_all(conn)?;
        }
        Ok(())
    }

    /// Evaluate the visibility rule and restack if the answer changed.
    fn update_visibility(&mut self, conn: &RustConnection) -> Result<()> {
        let target = visibility::decide(
            self.overlay.on_region(),
            self.focus.active_rect(),
            &self.source,
            &self.dest,
        );
        if let Some(change) = self.visibility.apply(target) {
            debug!(?change, "visibility");
            match change {
                Visibility::Raised => self.surface.raise(conn, &self.dest)?,
                Visibility::Lowered => self.surface.lower(conn)?,
            }
        }
        Ok(())
    }

    /// Recompute the blit offset; true if the content was repositioned.
    fn fix_offset(&mut self, conn: &RustConnection) -> Result<bool> {
        let next = reflow::adjust_offset(self.offset, self.source, self.dest, self.overlay.position());
        if next == self.offset {
            return Ok(false);
        }
        debug!(x = next.x, y = next.y, "blit offset");
        self.offset = next;
        self.surface.set_offset(conn, next)?;
        Ok(true)
    }

    /// Route one X event to its owning component. Returns a reason when
    /// the engine must disable itself.
    fn handle_event(
        &mut self,
        conn: &RustConnection,
        event: Event,
    ) -> Result<Option<StopReason>> {
        match event {
            Event::PropertyNotify(ev) if self.focus.is_focus_change(ev.window, ev.atom) => {
                self.focus.restart_monitoring(conn);
                self.update_visibility(conn)?;
            }
            Event::ConfigureNotify(ev) => {
                if self.focus.is_tracked(ev.window) {
                    self.focus.refresh_geometry(conn);
                    self.update_visibility(conn)?;
                } else if ev.window == self.surface.window {
                    self.on_own_configure(conn, &ev)?;
                }
            }
            Event::XinputRawMotion(_) if self.raw_motion => {
                self.refresh_cursor_location(conn)?;
            }
            Event::XinputRawKeyPress(ev) if self.raw_motion => {
                self.on_raw_key_press(conn, ev.detail)?;
            }
            Event::XfixesCursorNotify(_) => {
                self.overlay.refresh_image(conn)?;
                self.overlay.redraw(conn, &self.surface, true)?;
            }
            Event::DamageNotify(ev) => {
                self.on_damage(conn, &ev)?;
            }
            Event::RandrScreenChangeNotify(_) => {
                return Ok(Some(StopReason::DisplayChanged));
            }
            Event::ClientMessage(ev) => {
                if self.is_delete_request(&ev) {
                    return Ok(Some(StopReason::WindowClosed));
                }
            }
            Event::Error(err) => {
                // foreign-window queries race with window destruction;
                // nothing here is fatal
                debug!(?err, "ignoring X error");
            }
            _ => {}
        }
        Ok(None)
    }

    fn is_delete_request(&self, ev: &ClientMessageEvent) -> bool {
        self.windowed
            && ev.window == self.surface.window
            && ev.format == 32
            && ev.type_ == self.surface.wm_protocols
            && ev.data.as_data32()[0] == self.surface.wm_delete_window
    }

    /// A damage notification: filter, rate limit, refresh or defer.
    fn on_damage(&mut self, conn: &RustConnection, ev: &damage::NotifyEvent) -> Result<()> {
        if let Some(handle) = self.damage {
            conn.damage_subtract(handle, x11rb::NONE, x11rb::NONE)?;
        }

        // the more flag announces further sub-rectangles of the same
        // update; the final one carries the full bounding box. Skipping
        // refreshes entirely while source and destination overlap
        // prevents feedback amplification from our own repaints.
        let more = (u8::from(ev.level) & 0x80) != 0;
        if more || self.source.intersects(&self.dest) {
            return Ok(());
        }

        let area = Rect::new(
            ev.area.x as i32,
            ev.area.y as i32,
            ev.area.width as i32,
            ev.area.height as i32,
        );
        if !area.intersects(&self.source) {
            return Ok(());
        }

        let Some(limiter) = self.limiter.as_mut() else {
            return Ok(());
        };
        match limiter.on_damage(ev.timestamp) {
            DamageAction::RefreshNow => {
                self.deferred.cancel();
                self.refresh_frame(conn)?;
            }
            DamageAction::Defer { delay_ms, tag } => {
                self.deferred
                    .schedule(Duration::from_millis(delay_ms as u64), tag);
            }
            DamageAction::AlreadyPending => {}
        }
        Ok(())
    }

    /// Our own window was moved or resized (windowed mode).
    fn on_own_configure(&mut self, conn: &RustConnection, ev: &ConfigureNotifyEvent) -> Result<()> {
        if !self.windowed {
            return Ok(());
        }

        // ConfigureNotify coordinates are parent-relative under a
        // reparenting window manager; translate to root space
        let (x, y) = conn
            .translate_coordinates(self.surface.window, self.root, 0, 0)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .map(|r| (r.dst_x as i32, r.dst_y as i32))
            .unwrap_or((ev.x as i32, ev.y as i32));

        self.dest = Rect::new(x, y, ev.width as i32, ev.height as i32);
        if self.fix_offset(conn)? {
            self.surface.present_all(conn)?;
        }

        if self.limiter.is_some() {
            // with the mirror over the source region, its own repaints
            // would show up as damage; keep it unmapped until it leaves
            let overlaps = self.dest.intersects(&self.source);
            self.surface.set_mirror_mapped(conn, !overlaps)?;
        }
        Ok(())
    }

    /// A key went down somewhere: make sure the window being typed into
    /// is not buried under the mirror. Modifier keys are skipped, they
    /// are likely the start of a window-manager chord.
    fn on_raw_key_press(&mut self, conn: &RustConnection, keycode: u32) -> Result<()> {
        if let Some(keymap) = &self.keymap {
            if let Some(keysym) = keymap.keysym(keycode) {
                if is_modifier_keysym(keysym) {
                    return Ok(());
                }
            }
        }
        self.update_visibility(conn)
    }

    /// Fire the deferred refresh and the poll tick when due. Returns
    /// true if anything refreshed (and may thus have buffered events).
    fn fire_timers(&mut self, conn: &RustConnection, now: Instant) -> Result<bool> {
        let mut refreshed = false;

        if let Some(tag) = self.deferred.take_due(now) {
            let still_current = self
                .limiter
                .as_mut()
                .map(|limiter| limiter.on_deferred_fire(tag))
                .unwrap_or(false);
            if still_current {
                self.refresh_frame(conn)?;
                refreshed = true;
            }
        }

        let tick = self
            .poll_timer
            .as_mut()
            .map(|timer| timer.tick(now))
            .unwrap_or(false);
        if tick {
            self.refresh_frame(conn)?;
            refreshed = true;
        }
        Ok(refreshed)
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.deferred.deadline(), self.poll_timer.as_ref()) {
            (Some(a), Some(t)) => Some(a.min(t.deadline())),
            (Some(a), None) => Some(a),
            (None, Some(t)) => Some(t.deadline()),
            (None, None) => None,
        }
    }

    /// Reverse dependency order: timers, subscriptions, tracking, then
    /// owned surfaces. Notifications arriving for freed state would be
    /// routed to dead ids otherwise.
    fn teardown(&mut self, conn: &RustConnection) -> Result<()> {
        self.deferred.cancel();
        self.poll_timer = None;

        if let Some(handle) = self.damage.take() {
            let _ = conn.damage_destroy(handle);
        }
        if self.raw_motion {
            let _ = select_raw_events(conn, self.root, false);
        }

        let _ = self.focus.disable(conn);

        let _ = self.overlay.destroy(conn);
        let _ = self.surface.destroy(conn);
        conn.flush()?;
        Ok(())
    }
}

fn probe_randr(conn: &RustConnection) -> bool {
    conn.randr_query_version(1, 5)
        .ok()
        .and_then(|cookie| cookie.reply().ok())
        .is_some()
}

fn probe_damage(conn: &RustConnection) -> bool {
    conn.damage_query_version(1, 1)
        .ok()
        .and_then(|cookie| cookie.reply().ok())
        .map(|reply| reply.major_version >= 1)
        .unwrap_or(false)
}

/// Probe XInput 2.2 and subscribe to raw motion and raw key presses
/// from all master devices.
fn probe_raw_motion(conn: &RustConnection, root: Window) -> bool {
    let supported = conn
        .xinput_xi_query_version(2, 2)
        .ok()
        .and_then(|cookie| cookie.reply().ok())
        .map(|reply| reply.major_version >= 2)
        .unwrap_or(false);
    if !supported {
        return false;
    }
    select_raw_events(conn, root, true).is_ok()
}

fn select_raw_events(conn: &RustConnection, root: Window, active: bool) -> Result<()> {
    let mask = if active {
        u32::from(xinput::XIEventMask::RAW_MOTION | xinput::XIEventMask::RAW_KEY_PRESS)
    } else {
        0
    };
    conn.xinput_xi_select_events(
        root,
        &[xinput::EventMask {
            deviceid: XI_ALL_MASTER_DEVICES,
            mask: vec![mask.into()],
        }],
    )?
    .check()
    .context("Failed to select XInput raw events")?;
    Ok(())
}

fn fetch_keymap(conn: &RustConnection) -> Option<Keymap> {
    let setup = conn.setup();
    let first_keycode = setup.min_keycode;
    let count = setup.max_keycode.saturating_sub(first_keycode).saturating_add(1);
    let reply = conn
        .get_keyboard_mapping(first_keycode, count)
        .ok()?
        .reply()
        .ok()?;
    Some(Keymap {
        first_keycode,
        keysyms_per_keycode: reply.keysyms_per_keycode,
        keysyms: reply.keysyms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keymap_returns_first_keysym_per_keycode() {
        let keymap = Keymap {
            first_keycode: 8,
            keysyms_per_keycode: 2,
            keysyms: vec![0x61, 0x41, 0xffe3, 0xffe3],
        };
        assert_eq!(keymap.keysym(8), Some(0x61));
        assert_eq!(keymap.keysym(9), Some(0xffe3));
        // below the range or past the table
        assert_eq!(keymap.keysym(7), None);
        assert_eq!(keymap.keysym(10), None);
    }

    #[test]
    fn test_modifier_keysyms_are_filtered() {
        for keysym in [0xffe3, 0xffe4, 0xffe7, 0xffe8, 0xffe9, 0xffea] {
            assert!(is_modifier_keysym(keysym));
        }
        // Shift and plain letters reveal the focused window
        assert!(!is_modifier_keysym(0xffe1));
        assert!(!is_modifier_keysym(0x61));
    }

    // Needs a reachable X server; a no-op everywhere else.
    #[test]
    fn test_failed_enable_leaves_engine_disabled() {
        let config = Config {
            source_name: Some("glance-test-missing-output".to_string()),
            ..Config::default()
        };
        let Ok(mut engine) = Engine::connect(config) else {
            return;
        };

        // selection fails, and must leave nothing behind on the server
        assert!(engine.enable().is_err());
        assert!(!engine.is_enabled());
        assert!(engine.disable().is_ok());
        // a second attempt behaves the same
        assert!(engine.enable().is_err());
        assert!(!engine.is_enabled());
    }
}
