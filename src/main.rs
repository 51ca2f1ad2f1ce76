// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap_lex::RawArgs;
use std::{path::PathBuf, process};
use tracing::{error, info};

use backend::kms::{CardDevice, KmsState, ScreenSetup};

pub mod backend;
pub mod config;
mod logger;

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {}", err);
        process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut config_path = None;

    // Parse the arguments
    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(());
            }
            Some("--version") | Some("-V") => {
                println!(
                    "xengfx-kms {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(());
            }
            Some("--config") | Some("-c") => {
                config_path = raw_args.next_os(&mut cursor).map(PathBuf::from);
            }
            _ => {}
        }
    }

    logger::init_logger();
    info!("xengfx-kms starting up!");

    let config = config::load_config(config_path);

    let path = config
        .device
        .clone()
        .unwrap_or_else(|| PathBuf::from("/dev/dri/card0"));
    let dev = CardDevice::open(&path)
        .with_context(|| format!("Failed to open card node {}", path.display()))?;

    let setup = ScreenSetup {
        virtual_size: config.virtual_size,
        depth: config.depth,
        bits_per_pixel: config.bits_per_pixel,
    };
    let mut state = KmsState::new(dev, setup).context("Failed to initialize mode-setting")?;

    state.assign_crtcs();
    config::apply_output_config(&config, &mut state);
    state.set_desired_modes().context("Failed to apply modes")?;

    state.map_front().context("Failed to map the front buffer")?;
    info!(
        width = state.screen.width,
        height = state.screen.height,
        stride = state.screen.display_width,
        "Scan-out surface ready"
    );

    state.teardown();
    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"xengfx-kms {version} (git commit {git_rev})

Mode-setting and buffer lifecycle core for the xengfx virtual display adapter.

Options:
  -h, --help         Show this message
  -V, --version      Show the version of xengfx-kms
  -c, --config FILE  Load the configuration from FILE"#
    );
}
