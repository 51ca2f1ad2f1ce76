// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct XengfxKmsConfig {
    /// Device node to open. `None` picks the first card node.
    pub device: Option<PathBuf>,
    pub depth: u32,
    pub bits_per_pixel: u32,
    /// Initial virtual screen size. `None` derives it from the
    /// preferred mode of the first connected output.
    pub virtual_size: Option<(u32, u32)>,
    /// Desired configuration per output name (e.g. "LVDS-1").
    pub outputs: HashMap<String, OutputConfig>,
}

impl Default for XengfxKmsConfig {
    fn default() -> XengfxKmsConfig {
        XengfxKmsConfig {
            device: None,
            depth: 24,
            bits_per_pixel: 32,
            virtual_size: None,
            outputs: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Desired mode as (width, height). `None` picks the mode closest
    /// to the virtual screen size.
    pub mode: Option<(u32, u32)>,
    pub position: (i32, i32),
    pub rotation: OutputRotation,
    pub enabled: bool,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            mode: None,
            position: (0, 0),
            rotation: OutputRotation::Normal,
            enabled: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum OutputRotation {
    #[default]
    Normal,
    Left,
    Inverted,
    Right,
}
