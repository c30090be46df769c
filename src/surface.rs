//! The on-screen mirror: destination window, backing pixmap, blitting
//!
//! The captured source pixels live in a pixmap sized exactly to the
//! source region. A sub-window uses that pixmap as its X11 background, so
//! presenting a frame is a ClearArea away and the server repaints from
//! the pixmap without any client-side buffering.

use anyhow::{Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ChangeWindowAttributesAux, ConfigureWindowAux, ConnectionExt, CreateGCAux,
    CreateWindowAux, Gcontext, Pixmap, PropMode, Screen, StackMode, SubwindowMode, Window,
    WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::geometry::Rect;
use crate::reflow::Offset;

/// Margin kept around the initial windowed-mode window so it never
/// completely covers the destination monitor.
const WINDOWED_MARGIN: i32 = 100;
const WINDOWED_PLACEMENT: i32 = 50;

/// Halo stroke drawn beneath the crosshair.
const HALO_COLOR: u32 = 0x00e0_e0e0;
const HALO_LINE_WIDTH: u32 = 3;

pub struct MirrorSurface {
    /// Top-level window on the destination monitor.
    pub window: Window,
    /// Sub-window whose background is the capture pixmap.
    pub mirror: Window,
    /// Off-screen buffer holding the captured source pixels.
    pub pixmap: Pixmap,
    /// Capture GC; subwindow_mode IncludeInferiors so the copy sees the
    /// composed screen content, not just the root background.
    pub gc: Gcontext,
    /// Wide light GC for the crosshair halo.
    pub halo_gc: Gcontext,
    pub depth: u8,
    root: Window,
    fullscreen: bool,
    mirror_mapped: bool,
    pub wm_protocols: Atom,
    pub wm_delete_window: Atom,
}

impl MirrorSurface {
    pub fn create(
        conn: &RustConnection,
        screen: &Screen,
        source: Rect,
        dest: Rect,
        windowed: bool,
    ) -> Result<Self> {
        let root = screen.root;
        let depth = screen.root_depth;

        let wm_protocols = intern_atom(conn, b"WM_PROTOCOLS")?;
        let wm_delete_window = intern_atom(conn, b"WM_DELETE_WINDOW")?;

        let window = conn.generate_id().context("Failed to allocate window id")?;
        if windowed {
            let width = source.width.min(dest.width - WINDOWED_MARGIN).max(1) as u16;
            let height = source.height.min(dest.height - WINDOWED_MARGIN).max(1) as u16;
            conn.create_window(
                x11rb::COPY_DEPTH_FROM_PARENT,
                window,
                root,
                (dest.x + WINDOWED_PLACEMENT) as i16,
                (dest.y + WINDOWED_PLACEMENT) as i16,
                width,
                height,
                0,
                WindowClass::INPUT_OUTPUT,
                x11rb::COPY_FROM_PARENT,
                &CreateWindowAux::new()
                    .background_pixel(screen.black_pixel)
                    .event_mask(x11rb::protocol::xproto::EventMask::STRUCTURE_NOTIFY),
            )?
            .check()
            .context("Failed to create mirror window")?;

            conn.change_property8(
                PropMode::REPLACE,
                window,
                AtomEnum::WM_NAME,
                AtomEnum::STRING,
                b"glance",
            )?;
            conn.change_property32(
                PropMode::REPLACE,
                window,
                wm_protocols,
                AtomEnum::ATOM,
                &[wm_delete_window],
            )?;

            // visible from the start, but at the bottom of the stack
            conn.map_window(window)?;
            conn.configure_window(
                window,
                &ConfigureWindowAux::new().stack_mode(StackMode::BELOW),
            )?;
        } else {
            // borderless, exactly covering the destination monitor;
            // mapped only while raised
            conn.create_window(
                x11rb::COPY_DEPTH_FROM_PARENT,
                window,
                root,
                dest.x as i16,
                dest.y as i16,
                dest.width as u16,
                dest.height as u16,
                0,
                WindowClass::INPUT_OUTPUT,
                x11rb::COPY_FROM_PARENT,
                &CreateWindowAux::new()
                    .background_pixel(screen.black_pixel)
                    .override_redirect(1),
            )?
            .check()
            .context("Failed to create mirror window")?;
        }

        // setup-time requests are checked synchronously so a server-side
        // failure (Alloc on a huge pixmap, say) fails enable() instead of
        // surfacing later as an ignorable event
        let pixmap = conn.generate_id().context("Failed to allocate pixmap id")?;
        conn.create_pixmap(
            depth,
            pixmap,
            root,
            source.width as u16,
            source.height as u16,
        )?
        .check()
        .context("Failed to create capture pixmap")?;

        let gc = conn.generate_id()?;
        conn.create_gc(
            gc,
            root,
            &CreateGCAux::new().subwindow_mode(SubwindowMode::INCLUDE_INFERIORS),
        )?
        .check()
        .context("Failed to create capture GC")?;

        let halo_gc = conn.generate_id()?;
        conn.create_gc(
            halo_gc,
            root,
            &CreateGCAux::new()
                .foreground(HALO_COLOR)
                .line_width(HALO_LINE_WIDTH),
        )?
        .check()
        .context("Failed to create halo GC")?;

        let mirror = conn.generate_id()?;
        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            mirror,
            window,
            0,
            0,
            source.width as u16,
            source.height as u16,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new().background_pixmap(pixmap),
        )?
        .check()
        .context("Failed to create mirror sub-window")?;
        conn.map_window(mirror)?;

        Ok(Self {
            window,
            mirror,
            pixmap,
            gc,
            halo_gc,
            depth,
            root,
            fullscreen: !windowed,
            mirror_mapped: true,
            wm_protocols,
            wm_delete_window,
        })
    }

    /// Copy the live source pixels into the backing pixmap.
    pub fn blit(&self, conn: &RustConnection, source: &Rect) -> Result<()> {
        conn.copy_area(
            self.root,
            self.pixmap,
            self.gc,
            source.x as i16,
            source.y as i16,
            0,
            0,
            source.width as u16,
            source.height as u16,
        )
        .context("Failed to copy source region")?;
        Ok(())
    }

    /// Repaint the whole mirror from the backing pixmap.
    pub fn present_all(&self, conn: &RustConnection) -> Result<()> {
        conn.clear_area(false, self.mirror, 0, 0, 0, 0)?;
        Ok(())
    }

    /// Repaint one square tile of the mirror.
    pub fn present_tile(&self, conn: &RustConnection, x: i32, y: i32, size: u16) -> Result<()> {
        conn.clear_area(false, self.mirror, x as i16, y as i16, size, size)?;
        Ok(())
    }

    /// Reposition the blitted content inside the destination window.
    pub fn set_offset(&self, conn: &RustConnection, offset: Offset) -> Result<()> {
        conn.configure_window(
            self.mirror,
            &ConfigureWindowAux::new().x(offset.x).y(offset.y),
        )?;
        Ok(())
    }

    /// Bring the mirror to the top of the stacking order. In fullscreen
    /// mode this also re-covers the destination monitor.
    pub fn raise(&self, conn: &RustConnection, dest: &Rect) -> Result<()> {
        if self.fullscreen {
            conn.configure_window(
                self.window,
                &ConfigureWindowAux::new()
                    .x(dest.x)
                    .y(dest.y)
                    .width(dest.width as u32)
                    .height(dest.height as u32),
            )?;
            conn.map_window(self.window)?;
        } else {
            conn.configure_window(
                self.window,
                &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
            )?;
        }
        Ok(())
    }

    pub fn lower(&self, conn: &RustConnection) -> Result<()> {
        if self.fullscreen {
            conn.unmap_window(self.window)?;
        } else {
            conn.configure_window(
                self.window,
                &ConfigureWindowAux::new().stack_mode(StackMode::BELOW),
            )?;
        }
        Ok(())
    }

    /// Map or unmap the mirror sub-window. Used in event-driven mode to
    /// stop the mirror's own repaints from generating damage when the
    /// destination overlaps the source.
    pub fn set_mirror_mapped(&mut self, conn: &RustConnection, mapped: bool) -> Result<()> {
        if mapped == self.mirror_mapped {
            return Ok(());
        }
        self.mirror_mapped = mapped;
        if mapped {
            conn.map_window(self.mirror)?;
        } else {
            conn.unmap_window(self.mirror)?;
        }
        Ok(())
    }

    pub fn destroy(&self, conn: &RustConnection) -> Result<()> {
        conn.free_gc(self.halo_gc)?;
        conn.free_gc(self.gc)?;
        // destroying the top-level takes the mirror sub-window with it
        conn.destroy_window(self.window)?;
        conn.free_pixmap(self.pixmap)?;
        Ok(())
    }
}

pub fn intern_atom(conn: &RustConnection, name: &[u8]) -> Result<Atom> {
    let reply = conn
        .intern_atom(false, name)
        .context("Failed to intern atom")?
        .reply()
        .context("Failed to get atom reply")?;
    Ok(reply.atom)
}

/// Replace this client's event mask on the root window.
pub fn set_root_event_mask(
    conn: &RustConnection,
    root: Window,
    mask: x11rb::protocol::xproto::EventMask,
) -> Result<()> {
    conn.change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(mask))
        .context("Failed to change root window event mask")?;
    Ok(())
}
