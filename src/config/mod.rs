// SPDX-License-Identifier: GPL-3.0-only

use std::{fs::OpenOptions, path::PathBuf};

use tracing::{error, info, warn};
use xengfx_kms_config::{OutputRotation, XengfxKmsConfig};

use crate::backend::kms::{
    crtc::{DesiredConfig, Rotation},
    modes, KernelDisplay, KmsState,
};

pub fn static_config_file() -> Option<PathBuf> {
    let xdg = xdg::BaseDirectories::new().ok()?;
    xdg.find_config_file("xengfx-kms/config.ron")
}

/// Loads the static configuration, falling back to the defaults when
/// no file exists or it fails to parse. An explicit `path` overrides
/// the xdg lookup.
pub fn load_config(path: Option<PathBuf>) -> XengfxKmsConfig {
    let Some(path) = path.or_else(static_config_file) else {
        info!("No config file found, using defaults");
        return XengfxKmsConfig::default();
    };

    match OpenOptions::new().read(true).open(&path) {
        Ok(file) => match ron::de::from_reader(file) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(err) => {
                error!(?err, "Malformed config file '{}'", path.display());
                XengfxKmsConfig::default()
            }
        },
        Err(err) => {
            error!(?err, "Failed to read config file '{}'", path.display());
            XengfxKmsConfig::default()
        }
    }
}

fn rotation(rotation: OutputRotation) -> Rotation {
    match rotation {
        OutputRotation::Normal => Rotation::ROTATE_0,
        OutputRotation::Left => Rotation::ROTATE_90,
        OutputRotation::Inverted => Rotation::ROTATE_180,
        OutputRotation::Right => Rotation::ROTATE_270,
    }
}

/// Translates per-output configuration entries into desired CRTC
/// configurations. Outputs disabled by config lose their CRTC; unknown
/// entries are reported and skipped.
pub fn apply_output_config<D: KernelDisplay>(config: &XengfxKmsConfig, state: &mut KmsState<D>) {
    let mut desired: Vec<(u32, DesiredConfig)> = Vec::new();

    for (name, output_config) in &config.outputs {
        let Some(output) = state.outputs.iter_mut().find(|o| o.name == *name) else {
            warn!(output = %name, "Configured output not found");
            continue;
        };

        if !output_config.enabled {
            output.crtc = None;
            continue;
        }
        let Some(crtc_id) = output.crtc else {
            continue;
        };

        let mode = match output_config.mode {
            Some((width, height)) => modes::closest_mode(&output.modes, width, height),
            None => modes::preferred_mode(&output.modes),
        };
        let Some(mode) = mode.cloned() else {
            warn!(output = %name, "No usable mode for configured output");
            continue;
        };

        desired.push((
            crtc_id,
            DesiredConfig {
                mode,
                rotation: rotation(output_config.rotation),
                x: output_config.position.0.max(0) as u32,
                y: output_config.position.1.max(0) as u32,
            },
        ));
    }

    for (crtc_id, config) in desired {
        if let Some(crtc) = state.crtc_mut(crtc_id) {
            crtc.desired = Some(config);
        }
    }
    state.sync_enabled();
}
