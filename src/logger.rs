// SPDX-License-Identifier: GPL-3.0-only

use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

pub fn init_logger() {
    let filter = EnvFilter::builder()
        .with_default_directive(
            if cfg!(debug_assertions) {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            }
            .into(),
        )
        .from_env_lossy();

    let journald = tracing_journald::layer()
        .map_err(|err| eprintln!("Failed to connect to journald: {}", err))
        .ok();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .with(journald)
        .init();

    log_panics::init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        info!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }
}
