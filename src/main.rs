mod cli;
mod config;
mod cursor;
mod engine;
mod focus;
mod geometry;
mod monitor;
mod reflow;
mod scheduler;
mod surface;
mod visibility;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use engine::{Engine, StopReason};

/// Pause before re-enabling after a display reconfiguration, giving the
/// server time to settle on the new layout.
const REENABLE_DELAY: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let list_monitors = cli.list_monitors;
    let config = cli.into_config();

    let mut engine = Engine::connect(config.clone())?;

    if list_monitors {
        let monitors = engine.monitors()?;
        if monitors.is_empty() {
            println!("No monitors found.");
        } else {
            println!("Available monitors:");
            for m in monitors {
                println!(
                    "  {name} {width}x{height}+{x}+{y}{primary}",
                    name = if m.name.is_empty() { "(unnamed)" } else { &m.name },
                    width = m.rect.width,
                    height = m.rect.height,
                    x = m.rect.x,
                    y = m.rect.y,
                    primary = if m.primary { " (primary)" } else { "" },
                );
            }
        }
        return Ok(());
    }

    // surface self-disable reasons on stderr even when logging is
    // filtered down
    engine.set_error_hook(|message| eprintln!("glance: {message}"));

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    if config.disabled {
        // mirroring off at startup; stay resident so logging and the
        // exit path behave the same either way
        info!("started with mirroring disabled, press Ctrl-C to exit");
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));
        }
        return Ok(());
    }

    while !shutdown.load(Ordering::Relaxed) {
        engine.enable().context("Failed to enable mirroring")?;

        match engine.run(&shutdown)? {
            Some(StopReason::DisplayChanged) => {
                info!("re-enabling against the new display configuration");
                thread::sleep(REENABLE_DELAY);
            }
            Some(StopReason::WindowClosed) => break,
            None => break,
        }
    }

    if engine.is_enabled() {
        engine.disable()?;
    }
    Ok(())
}
