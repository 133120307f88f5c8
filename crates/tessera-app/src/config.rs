// SPDX-License-Identifier: CEPL-1.0
use serde::Deserialize;
use std::{fs, io, path::Path, path::PathBuf};
use tessera_render::{RenderSettings, VsyncMode};
use tracing::{info, warn};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub assets: AssetsCfg,
    pub render: RenderCfg,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "tessera".into(),
            width: 800,
            height: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsCfg {
    pub model: PathBuf,
    pub texture: PathBuf,
}

impl Default for AssetsCfg {
    fn default() -> Self {
        Self {
            model: "assets/models/viking_room.obj".into(),
            texture: "assets/textures/viking_room.png".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VsyncModeCfg {
    Fifo,
    #[default]
    Mailbox,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub vsync_mode: VsyncModeCfg,
    pub max_msaa_samples: u32,
    /// Unset means "on in debug builds".
    pub validation: Option<bool>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            vsync_mode: VsyncModeCfg::Mailbox,
            max_msaa_samples: 8,
            validation: None,
        }
    }
}

impl RenderCfg {
    /// `validation` from the command line wins over the file.
    pub fn settings(&self, validation: Option<bool>) -> RenderSettings {
        let defaults = RenderSettings::default();
        RenderSettings {
            clear_color: self.clear_color,
            vsync_mode: match self.vsync_mode {
                VsyncModeCfg::Fifo => VsyncMode::Fifo,
                VsyncModeCfg::Mailbox => VsyncMode::Mailbox,
            },
            max_msaa_samples: self.max_msaa_samples.max(1),
            validation: validation.or(self.validation).unwrap_or(defaults.validation),
        }
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg, toml::de::Error> {
    toml::from_str(text)
}

/// Missing or malformed files fall back to defaults.
pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(text) => match parse_cfg(&text) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("{} is malformed, using defaults: {e}", path.display());
                AppCfg::default()
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("no {} found, using defaults", path.display());
            AppCfg::default()
        }
        Err(e) => {
            warn!("cannot read {}, using defaults: {e}", path.display());
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg = parse_cfg("").unwrap();
        assert_eq!(cfg.window.title, "tessera");
        assert_eq!((cfg.window.width, cfg.window.height), (800, 600));
        assert_eq!(cfg.render.vsync_mode, VsyncModeCfg::Mailbox);
        assert_eq!(cfg.render.max_msaa_samples, 8);
        assert_eq!(cfg.assets.model, PathBuf::from("assets/models/viking_room.obj"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [window]
            width = 1280

            [render]
            vsync_mode = "fifo"
            clear_color = [0.1, 0.2, 0.3, 1.0]
            validation = false
            "#,
        )
        .unwrap();
        assert_eq!((cfg.window.width, cfg.window.height), (1280, 600));
        let s = cfg.render.settings(None);
        assert_eq!(s.vsync_mode, VsyncMode::Fifo);
        assert_eq!(s.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert!(!s.validation);
    }

    #[test]
    fn cli_validation_overrides_file() {
        let cfg = parse_cfg("[render]\nvalidation = false\n").unwrap();
        assert!(cfg.render.settings(Some(true)).validation);
        assert!(!cfg.render.settings(None).validation);
    }

    #[test]
    fn unknown_vsync_mode_is_rejected() {
        assert!(parse_cfg("[render]\nvsync_mode = \"immediate\"\n").is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("definitely/not/here/tessera.toml"));
        assert_eq!(cfg.window.width, 800);
    }
}
