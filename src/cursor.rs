//! Cursor overlay: location tracking, image capture, compositing
//!
//! The captured frame never contains the pointer, so the overlay draws
//! one: either the real cursor image (XFixes + XRender, when the server
//! supports it) or a crosshair. Either way the pixels under the previous
//! cursor position are saved to a scratch pixmap and restored before the
//! next draw, so the overlay never leaves ghosts in the backing buffer.

use anyhow::{Context, Result};
use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::render::{self, ConnectionExt as RenderExt, PictOp, Pictformat, Picture};
use x11rb::protocol::xfixes::{self, ConnectionExt as XfixesExt};
use x11rb::protocol::xproto::{
    ConnectionExt, CreateGCAux, Gcontext, ImageFormat, ImageOrder, Pixmap, Rectangle, Screen,
    Segment, Window,
};
use x11rb::rust_connection::RustConnection;

use crate::geometry::Rect;
use crate::surface::MirrorSurface;

/// Sentinel for "pointer is outside the source region".
pub const OFF_REGION: (i32, i32) = (-1, -1);

const CROSSHAIR_ARM: i32 = 3;
/// Scratch tile around the crosshair: arm, center and halo margin.
const CROSSHAIR_TILE: u16 = 9;
/// Captured cursor images are clipped to this size.
const IMAGE_TILE: u16 = 32;

/// Resources for compositing the real cursor image.
struct ImageCompositor {
    cursor_pixmap: Pixmap,
    cursor_gc: Gcontext,
    cursor_picture: Picture,
    pixmap_picture: Picture,
    hotspot: (i32, i32),
    byte_order: ImageOrder,
}

enum Strategy {
    Crosshair,
    ImageComposite(ImageCompositor),
}

pub struct CursorOverlay {
    /// Pointer position in source-relative coordinates, or `OFF_REGION`.
    pos: (i32, i32),
    /// Tile size of the scratch buffer (overlay footprint).
    tile: u16,
    /// Where the scratch buffer content belongs in the backing pixmap.
    saved_at: Option<(i32, i32)>,
    backup_pixmap: Pixmap,
    strategy: Strategy,
}

impl CursorOverlay {
    /// Build the overlay, probing for cursor-image capture support. The
    /// probe failing is not an error; the crosshair is the baseline.
    pub fn create(
        conn: &RustConnection,
        screen: &Screen,
        surface: &MirrorSurface,
    ) -> Result<Self> {
        let (strategy, tile) = match probe_image_compositor(conn, screen, surface) {
            Ok(Some(compositor)) => {
                info!("cursor-image capture enabled (XFixes + XRender)");
                (Strategy::ImageComposite(compositor), IMAGE_TILE)
            }
            Ok(None) => {
                info!("cursor-image capture unavailable, using crosshair");
                (Strategy::Crosshair, CROSSHAIR_TILE)
            }
            Err(err) => {
                info!("cursor-image probe failed ({err:#}), using crosshair");
                (Strategy::Crosshair, CROSSHAIR_TILE)
            }
        };

        let backup_pixmap = conn.generate_id()?;
        conn.create_pixmap(screen.root_depth, backup_pixmap, screen.root, tile, tile)?
            .check()
            .context("Failed to create cursor scratch pixmap")?;

        let mut overlay = Self {
            pos: OFF_REGION,
            tile,
            saved_at: None,
            backup_pixmap,
            strategy,
        };

        if overlay.has_image_capture() {
            // subscribe to cursor changes and pick up the current image
            conn.xfixes_select_cursor_input(
                surface.window,
                xfixes::CursorNotifyMask::DISPLAY_CURSOR,
            )
            .context("Failed to select cursor notifications")?;
            overlay.refresh_image(conn)?;
        }

        Ok(overlay)
    }

    pub fn has_image_capture(&self) -> bool {
        matches!(self.strategy, Strategy::ImageComposite(_))
    }

    pub fn position(&self) -> (i32, i32) {
        self.pos
    }

    pub fn on_region(&self) -> bool {
        self.pos.0 >= 0
    }

    /// Query the absolute pointer position and translate it into
    /// source-relative coordinates. Returns true if the pointer is on
    /// the source region afterwards.
    pub fn refresh_location(
        &mut self,
        conn: &RustConnection,
        root: Window,
        source: &Rect,
    ) -> Result<bool> {
        let reply = conn
            .query_pointer(root)
            .context("Failed to query pointer")?
            .reply()
            .context("Failed to get pointer reply")?;

        let x = reply.root_x as i32 - source.x;
        let y = reply.root_y as i32 - source.y;

        self.pos = if x < 0 || y < 0 || x >= source.width || y >= source.height {
            OFF_REGION
        } else {
            (x, y)
        };

        Ok(self.on_region())
    }

    /// Fetch the current system cursor image (clipped to 32×32) into the
    /// cursor pixmap. No-op under the crosshair strategy.
    pub fn refresh_image(&mut self, conn: &RustConnection) -> Result<()> {
        let Strategy::ImageComposite(ref mut compositor) = self.strategy else {
            return Ok(());
        };

        let img = conn
            .xfixes_get_cursor_image()
            .context("Failed to request cursor image")?
            .reply()
            .context("Failed to get cursor image reply")?;

        let width = (img.width as usize).min(IMAGE_TILE as usize);
        let height = (img.height as usize).min(IMAGE_TILE as usize);

        // clip into a fixed 32x32 ARGB buffer, transparent-padded
        let mut data = vec![0u8; IMAGE_TILE as usize * IMAGE_TILE as usize * 4];
        for y in 0..height {
            for x in 0..width {
                let argb = img.cursor_image[y * img.width as usize + x];
                let bytes = if compositor.byte_order == ImageOrder::MSB_FIRST {
                    argb.to_be_bytes()
                } else {
                    argb.to_le_bytes()
                };
                let at = (y * IMAGE_TILE as usize + x) * 4;
                data[at..at + 4].copy_from_slice(&bytes);
            }
        }

        // wipe the previous image (transparent fill), then upload
        conn.poly_fill_rectangle(
            compositor.cursor_pixmap,
            compositor.cursor_gc,
            &[Rectangle {
                x: 0,
                y: 0,
                width: IMAGE_TILE,
                height: IMAGE_TILE,
            }],
        )?;
        conn.put_image(
            ImageFormat::Z_PIXMAP,
            compositor.cursor_pixmap,
            compositor.cursor_gc,
            IMAGE_TILE,
            IMAGE_TILE,
            0,
            0,
            0,
            32,
            &data,
        )
        .context("Failed to upload cursor image")?;

        compositor.hotspot = (img.xhot as i32, img.yhot as i32);
        debug!(
            serial = img.cursor_serial,
            xhot = img.xhot,
            yhot = img.yhot,
            "cursor image updated"
        );
        Ok(())
    }

    /// The backing pixmap was fully re-captured; the scratch buffer no
    /// longer holds pixels worth restoring.
    pub fn invalidate_saved(&mut self) {
        self.saved_at = None;
    }

    /// Erase the previous overlay, then draw the cursor at its current
    /// position. With `present` set, the affected tiles of the visible
    /// window are repainted (new position first to avoid flicker).
    pub fn redraw(
        &mut self,
        conn: &RustConnection,
        surface: &MirrorSurface,
        present: bool,
    ) -> Result<()> {
        let tile = self.tile;
        let stale = self.saved_at.take();

        if let Some((sx, sy)) = stale {
            conn.copy_area(
                self.backup_pixmap,
                surface.pixmap,
                surface.gc,
                0,
                0,
                sx as i16,
                sy as i16,
                tile,
                tile,
            )?;
        }

        if self.on_region() {
            let (cx, cy) = self.pos;
            let anchor = match &self.strategy {
                Strategy::ImageComposite(compositor) => {
                    (cx - compositor.hotspot.0, cy - compositor.hotspot.1)
                }
                Strategy::Crosshair => (cx - (CROSSHAIR_ARM + 1), cy - (CROSSHAIR_ARM + 1)),
            };

            // save what the overlay is about to cover
            conn.copy_area(
                surface.pixmap,
                self.backup_pixmap,
                surface.gc,
                anchor.0 as i16,
                anchor.1 as i16,
                0,
                0,
                tile,
                tile,
            )?;

            match &self.strategy {
                Strategy::ImageComposite(compositor) => {
                    conn.render_composite(
                        PictOp::OVER,
                        compositor.cursor_picture,
                        x11rb::NONE,
                        compositor.pixmap_picture,
                        0,
                        0,
                        0,
                        0,
                        anchor.0 as i16,
                        anchor.1 as i16,
                        IMAGE_TILE,
                        IMAGE_TILE,
                    )?;
                }
                Strategy::Crosshair => {
                    draw_crosshair(conn, surface, cx as i16, cy as i16)?;
                }
            }
            self.saved_at = Some(anchor);

            if present {
                surface.present_tile(conn, anchor.0, anchor.1, tile)?;
            }
        }

        // repaint the erased area after the new cursor is in place
        if present {
            if let Some((sx, sy)) = stale {
                surface.present_tile(conn, sx, sy, tile)?;
            }
        }

        Ok(())
    }

    pub fn destroy(&self, conn: &RustConnection) -> Result<()> {
        if let Strategy::ImageComposite(compositor) = &self.strategy {
            conn.render_free_picture(compositor.pixmap_picture)?;
            conn.render_free_picture(compositor.cursor_picture)?;
            conn.free_gc(compositor.cursor_gc)?;
            conn.free_pixmap(compositor.cursor_pixmap)?;
        }
        conn.free_pixmap(self.backup_pixmap)?;
        Ok(())
    }
}

/// Light halo stroke beneath a darker stroke, both centered on the
/// cursor position.
fn draw_crosshair(conn: &RustConnection, surface: &MirrorSurface, x: i16, y: i16) -> Result<()> {
    let arm = CROSSHAIR_ARM as i16;
    conn.poly_segment(
        surface.pixmap,
        surface.halo_gc,
        &[
            Segment {
                x1: x - (arm + 1),
                y1: y,
                x2: x + (arm + 2),
                y2: y,
            },
            Segment {
                x1: x,
                y1: y - (arm + 1),
                x2: x,
                y2: y + (arm + 2),
            },
        ],
    )?;
    conn.poly_segment(
        surface.pixmap,
        surface.gc,
        &[
            Segment {
                x1: x - arm,
                y1: y,
                x2: x + arm,
                y2: y,
            },
            Segment {
                x1: x,
                y1: y - arm,
                x2: x,
                y2: y + arm,
            },
        ],
    )?;
    Ok(())
}

/// Probe for everything cursor-image compositing needs: a 24-bit root,
/// 32-bit pixmap support, XFixes ≥ 1 and XRender with the standard
/// ARGB32/RGB24 formats.
fn probe_image_compositor(
    conn: &RustConnection,
    screen: &Screen,
    surface: &MirrorSurface,
) -> Result<Option<ImageCompositor>> {
    if screen.root_depth != 24 {
        return Ok(None);
    }
    if !screen.allowed_depths.iter().any(|d| d.depth == 32) {
        return Ok(None);
    }

    let xfixes = conn.xfixes_query_version(5, 0)?.reply()?;
    if xfixes.major_version < 1 {
        return Ok(None);
    }
    conn.render_query_version(0, 11)?.reply()?;

    let formats = conn.render_query_pict_formats()?.reply()?;
    let Some(argb32) = find_pict_format(&formats.formats, 32) else {
        return Ok(None);
    };
    let Some(rgb24) = find_pict_format(&formats.formats, 24) else {
        return Ok(None);
    };

    let cursor_pixmap = conn.generate_id()?;
    conn.create_pixmap(32, cursor_pixmap, screen.root, IMAGE_TILE, IMAGE_TILE)?
        .check()
        .context("Failed to create cursor pixmap")?;

    // foreground zero doubles as the transparent fill color
    let cursor_gc = conn.generate_id()?;
    conn.create_gc(cursor_gc, cursor_pixmap, &CreateGCAux::new().foreground(0))?
        .check()
        .context("Failed to create cursor GC")?;

    let cursor_picture = conn.generate_id()?;
    conn.render_create_picture(
        cursor_picture,
        cursor_pixmap,
        argb32,
        &render::CreatePictureAux::new(),
    )?;

    let pixmap_picture = conn.generate_id()?;
    conn.render_create_picture(
        pixmap_picture,
        surface.pixmap,
        rgb24,
        &render::CreatePictureAux::new(),
    )?;

    Ok(Some(ImageCompositor {
        cursor_pixmap,
        cursor_gc,
        cursor_picture,
        pixmap_picture,
        hotspot: (0, 0),
        byte_order: conn.setup().image_byte_order,
    }))
}

/// Pick a direct PictFormat of the given depth: ARGB32 needs an alpha
/// channel, RGB24 must not have one.
fn find_pict_format(formats: &[render::Pictforminfo], depth: u8) -> Option<Pictformat> {
    formats
        .iter()
        .find(|f| {
            f.type_ == render::PictType::DIRECT
                && f.depth == depth
                && if depth == 32 {
                    f.direct.alpha_mask != 0
                } else {
                    f.direct.alpha_mask == 0
                }
        })
        .map(|f| f.id)
}
