//! Engine configuration loaded from TOML
//!
//! Every table is optional; missing keys fall back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Environment variable naming a config file when none is given on the command line
pub const CONFIG_ENV_VAR: &str = "OCCLUSION_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub pipeline: PipelineConfig,
    pub toggles: Toggles,
    pub scene: SceneConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Occlusion Engine".to_string(),
            width: 1280,
            height: 720,
            vsync: false,
        }
    }
}

/// Load-time pipeline parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of frame slots recorded ahead of the GPU
    pub frames_in_flight: u32,

    /// Frames between writing a timestamp and reading it back
    pub timestamp_delay: u32,

    /// Edge length of the square reprojection thread group
    pub reproject_group_size: u32,

    /// Threads per group for compute compaction
    pub compaction_group_size: u32,

    /// Request conservative rasterization for the visibility test when available
    pub conservative_raster: bool,

    /// Run the resource-state validator on every submit (always on in debug builds)
    pub validate_states: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            timestamp_delay: 3,
            reproject_group_size: 32,
            compaction_group_size: 64,
            conservative_raster: true,
            validate_states: cfg!(debug_assertions),
        }
    }
}

/// Compaction variant used to build the indirect argument buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionVariant {
    Compute,
    PointStream,
}

impl CompactionVariant {
    pub fn toggled(self) -> Self {
        match self {
            Self::Compute => Self::PointStream,
            Self::PointStream => Self::Compute,
        }
    }
}

/// Reprojected depth visualization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthView {
    Off,
    Half,
    Quarter,
}

impl DepthView {
    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::Half,
            Self::Half => Self::Quarter,
            Self::Quarter => Self::Off,
        }
    }
}

/// Runtime toggles, initialized from config and flipped by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggles {
    pub occlusion: bool,
    pub wireframe: bool,
    pub downsample: bool,
    pub compaction: CompactionVariant,
    pub depth_view: DepthView,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            occlusion: true,
            wireframe: false,
            downsample: true,
            compaction: CompactionVariant::Compute,
            depth_view: DepthView::Off,
        }
    }
}

/// Parameters of the synthetic test scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub grid_x: u32,
    pub grid_z: u32,
    pub spacing: f32,
    pub occluder_walls: u32,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            grid_x: 64,
            grid_z: 64,
            spacing: 4.0,
            occluder_walls: 6,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,wgpu_core=warn,wgpu_hal=warn,naga=warn".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a config file and sanitize it
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        log::info!("[EngineConfig::load] Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> PipelineResult<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    /// Resolve the config from an optional CLI path, then the environment, then defaults
    pub fn resolve(cli_path: Option<&str>) -> PipelineResult<Self> {
        if let Some(path) = cli_path {
            return Self::load(path);
        }
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config {
            message: e.to_string(),
        })
    }

    /// Clamp values the pipeline cannot run with
    pub fn sanitize(&mut self) {
        let p = &mut self.pipeline;
        if p.frames_in_flight == 0 {
            log::warn!("[EngineConfig::sanitize] frames_in_flight = 0, using 1");
            p.frames_in_flight = 1;
        }
        if p.timestamp_delay < p.frames_in_flight {
            log::warn!(
                "[EngineConfig::sanitize] timestamp_delay {} below frames_in_flight {}, raising",
                p.timestamp_delay,
                p.frames_in_flight
            );
            p.timestamp_delay = p.frames_in_flight;
        }
        if p.reproject_group_size == 0 {
            log::warn!("[EngineConfig::sanitize] reproject_group_size = 0, using 8");
            p.reproject_group_size = 8;
        }
        if p.compaction_group_size == 0 {
            log::warn!("[EngineConfig::sanitize] compaction_group_size = 0, using 64");
            p.compaction_group_size = 64;
        }
        if self.window.width == 0 || self.window.height == 0 {
            log::warn!("[EngineConfig::sanitize] Zero window size, using defaults");
            self.window.width = WindowConfig::default().width;
            self.window.height = WindowConfig::default().height;
        }
        if !(self.scene.spacing > 0.0) {
            self.scene.spacing = SceneConfig::default().spacing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_pipeline_parameters() {
        let config = EngineConfig::default();
        assert_eq!(config.pipeline.frames_in_flight, 2);
        assert_eq!(config.pipeline.timestamp_delay, 3);
        assert_eq!(config.pipeline.reproject_group_size, 32);
        assert_eq!(config.pipeline.compaction_group_size, 64);
        assert!(config.toggles.occlusion);
        assert_eq!(config.toggles.compaction, CompactionVariant::Compute);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [toggles]
            compaction = "point_stream"
            depth_view = "quarter"

            [scene]
            grid_x = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.toggles.compaction, CompactionVariant::PointStream);
        assert_eq!(config.toggles.depth_view, DepthView::Quarter);
        assert_eq!(config.scene.grid_x, 10);
        assert_eq!(config.scene.grid_z, SceneConfig::default().grid_z);
        assert_eq!(config.window, WindowConfig::default());
    }

    #[test]
    fn test_sanitize_clamps_invalid_values() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pipeline]
            frames_in_flight = 0
            timestamp_delay = 0
            reproject_group_size = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.frames_in_flight, 1);
        assert_eq!(config.pipeline.timestamp_delay, 1);
        assert_eq!(config.pipeline.reproject_group_size, 8);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[window]\nwidth = 640\nheight = 360").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 360);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = EngineConfig::default();
        config.toggles.wireframe = true;
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = EngineConfig::from_toml_str("[window\nwidth = ").unwrap_err();
        assert!(matches!(err, PipelineError::ConfigParse(_)));
    }
}
