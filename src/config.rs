//! Engine configuration consumed from the command line

/// Options recognized by the mirroring engine.
///
/// `rate_fps` forces a fixed polling rate and disables damage-driven
/// refresh; `limit_fps` caps the damage-driven refresh rate (0 = no cap).
#[derive(Debug, Clone)]
pub struct Config {
    /// Monitor to capture, by RandR name. `None` picks a default.
    pub source_name: Option<String>,
    /// Monitor to mirror onto, by RandR name. `None` picks a default.
    pub dest_name: Option<String>,
    /// Run in a movable, resizable window instead of covering the
    /// destination monitor.
    pub windowed: bool,
    /// Start with mirroring disabled.
    pub disabled: bool,
    /// Fixed refresh rate in frames per second.
    pub rate_fps: Option<u32>,
    /// Maximum damage-driven refresh rate in frames per second.
    pub limit_fps: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_name: None,
            dest_name: None,
            windowed: false,
            disabled: false,
            rate_fps: None,
            limit_fps: None,
        }
    }
}
