use clap::Parser;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "glance")]
#[command(about = "Mirror one monitor onto another, stepping aside for focused work")]
#[command(version)]
pub struct Cli {
    /// Monitor to capture (RandR name, e.g. HDMI-1); "-" or omitted picks a default
    pub source: Option<String>,

    /// Monitor to mirror onto; "-" or omitted picks the primary monitor
    pub dest: Option<String>,

    /// List attached monitors and exit
    #[arg(long)]
    pub list_monitors: bool,

    /// Start with mirroring disabled
    #[arg(short, long)]
    pub disable: bool,

    /// Refresh at a fixed rate (frames per second) instead of on damage
    #[arg(short, long, value_name = "FPS", conflicts_with = "limit")]
    pub rate: Option<u32>,

    /// Cap the damage-driven refresh rate (0 = uncapped)
    #[arg(short, long, value_name = "FPS")]
    pub limit: Option<u32>,

    /// Mirror into a movable, resizable window
    #[arg(short, long)]
    pub window: bool,
}

impl Cli {
    pub fn into_config(self) -> Config {
        Config {
            source_name: self.source.filter(|name| name != "-"),
            dest_name: self.dest.filter(|name| name != "-"),
            windowed: self.window,
            disabled: self.disable,
            rate_fps: self.rate,
            limit_fps: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dash_means_default_monitor() {
        let cli = Cli::parse_from(["glance", "-", "eDP-1"]);
        let config = cli.into_config();
        assert_eq!(config.source_name, None);
        assert_eq!(config.dest_name.as_deref(), Some("eDP-1"));
    }

    #[test]
    fn test_rate_and_limit_conflict() {
        assert!(Cli::try_parse_from(["glance", "-r", "30", "-l", "50"]).is_err());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from(["glance", "-w", "-d", "-l", "0"]);
        let config = cli.into_config();
        assert!(config.windowed);
        assert!(config.disabled);
        assert_eq!(config.limit_fps, Some(0));
        assert_eq!(config.rate_fps, None);
    }
}
