use rollcall_core::{DetectParams, LbphParams, SamplingPolicy, CANONICAL_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config read failed: {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which matching backend sits behind `enroll`/`recognize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite identity store plus in-process LBPH model.
    Local,
    /// Caller-supplied remote face collection.
    Remote,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" => Ok(BackendKind::Remote),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Engine configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Frontal-face cascade (OpenCV XML or JSON).
    pub frontal_cascade: PathBuf,
    /// Profile-face cascade (OpenCV XML or JSON).
    pub profile_cascade: PathBuf,
    /// Side length of stored patches, in pixels.
    pub canonical_size: u32,
    /// Largest LBPH distance still accepted as a match.
    pub acceptance_threshold: f32,
    /// Keep every Nth accepted enrollment frame.
    pub sample_stride: usize,
    /// Maximum samples stored per enrollment call.
    pub sample_cap: usize,
    pub scale_factor: f32,
    pub min_neighbors: usize,
    pub min_size: u32,
    pub lbph_radius: u32,
    pub lbph_grid_x: u32,
    pub lbph_grid_y: u32,
    pub backend: BackendKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        let detect = DetectParams::default();
        let lbph = LbphParams::default();
        let sampling = SamplingPolicy::default();
        Self {
            db_path: data_dir.join("rollcall.db"),
            frontal_cascade: data_dir.join("cascades/haarcascade_frontalface_default.xml"),
            profile_cascade: data_dir.join("cascades/haarcascade_profileface.xml"),
            canonical_size: CANONICAL_SIZE,
            acceptance_threshold: 60.0,
            sample_stride: sampling.stride,
            sample_cap: sampling.cap,
            scale_factor: detect.scale_factor,
            min_neighbors: detect.min_neighbors,
            min_size: detect.min_size,
            lbph_radius: lbph.radius,
            lbph_grid_x: lbph.grid_x,
            lbph_grid_y: lbph.grid_y,
            backend: BackendKind::Local,
        }
    }
}

impl Config {
    /// Load from `$ROLLCALL_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparseable values are
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_FRONTAL_CASCADE") {
            self.frontal_cascade = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_PROFILE_CASCADE") {
            self.profile_cascade = PathBuf::from(v);
        }
        override_parsed(&lookup, "ROLLCALL_CANONICAL_SIZE", &mut self.canonical_size);
        override_parsed(&lookup, "ROLLCALL_ACCEPTANCE_THRESHOLD", &mut self.acceptance_threshold);
        override_parsed(&lookup, "ROLLCALL_SAMPLE_STRIDE", &mut self.sample_stride);
        override_parsed(&lookup, "ROLLCALL_SAMPLE_CAP", &mut self.sample_cap);
        override_parsed(&lookup, "ROLLCALL_SCALE_FACTOR", &mut self.scale_factor);
        override_parsed(&lookup, "ROLLCALL_MIN_NEIGHBORS", &mut self.min_neighbors);
        override_parsed(&lookup, "ROLLCALL_MIN_SIZE", &mut self.min_size);
        override_parsed(&lookup, "ROLLCALL_LBPH_RADIUS", &mut self.lbph_radius);
        override_parsed(&lookup, "ROLLCALL_LBPH_GRID_X", &mut self.lbph_grid_x);
        override_parsed(&lookup, "ROLLCALL_LBPH_GRID_Y", &mut self.lbph_grid_y);
        override_parsed(&lookup, "ROLLCALL_BACKEND", &mut self.backend);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.acceptance_threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "acceptance_threshold must be >= 0, got {}",
                self.acceptance_threshold
            )));
        }
        if self.sample_stride == 0 || self.sample_cap == 0 {
            return Err(ConfigError::Invalid(
                "sample_stride and sample_cap must be positive".into(),
            ));
        }
        if self.scale_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "scale_factor must be > 1, got {}",
                self.scale_factor
            )));
        }
        let inner = self.canonical_size.saturating_sub(2 * self.lbph_radius);
        if self.lbph_radius == 0
            || self.lbph_grid_x == 0
            || self.lbph_grid_y == 0
            || inner < self.lbph_grid_x
            || inner < self.lbph_grid_y
        {
            return Err(ConfigError::Invalid(format!(
                "{}px patches cannot hold a {}x{} LBPH grid at radius {}",
                self.canonical_size, self.lbph_grid_x, self.lbph_grid_y, self.lbph_radius
            )));
        }
        Ok(())
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_size,
        }
    }

    pub fn lbph_params(&self) -> LbphParams {
        LbphParams {
            radius: self.lbph_radius,
            grid_x: self.lbph_grid_x,
            grid_y: self.lbph_grid_y,
        }
    }

    pub fn sampling(&self) -> SamplingPolicy {
        SamplingPolicy {
            stride: self.sample_stride,
            cap: self.sample_cap,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.sample_stride, 5);
        assert_eq!(config.sample_cap, 100);
        assert_eq!(config.canonical_size, 200);
        assert_eq!(config.backend, BackendKind::Local);
        assert!(config.db_path.ends_with("rollcall/rollcall.db"));
    }

    #[test]
    fn test_file_keeps_missing_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "acceptance_threshold = 42.5\nbackend = \"remote\"\ndb_path = \"/var/lib/rollcall.db\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.acceptance_threshold, 42.5);
        assert_eq!(config.backend, BackendKind::Remote);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall.db"));
        assert_eq!(config.sample_cap, 100);
    }

    #[test]
    fn test_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "sample_cap = \"lots\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(_))));

        std::fs::write(&path, "sample_stride = 0").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ROLLCALL_DB_PATH", "/tmp/x.db"),
            ("ROLLCALL_SAMPLE_CAP", "7"),
            ("ROLLCALL_ACCEPTANCE_THRESHOLD", "12.5"),
            ("ROLLCALL_BACKEND", "Remote"),
            ("ROLLCALL_MIN_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.sample_cap, 7);
        assert_eq!(config.acceptance_threshold, 12.5);
        assert_eq!(config.backend, BackendKind::Remote);
        assert_eq!(config.min_size, 30);
    }

    #[test]
    fn test_rejects_oversized_grid() {
        let config = Config {
            canonical_size: 10,
            lbph_grid_x: 16,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
