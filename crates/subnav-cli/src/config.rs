//! Configuration – reads `~/.subnav/config.toml`.
//!
//! ```toml
//! output_dir = "results"
//!
//! [llm]
//! base_url = "https://api.openai.com/v1"
//! api_key = "sk-..."
//! model = "gpt-4o"
//!
//! [controller]
//! max_steps = 500
//! early_stop_rotation = 20
//!
//! [simulator]
//! forward_step_m = 0.25
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use subnav_hal::SimConfig;
use subnav_runtime::{ControllerConfig, LlmConfig};
use subnav_types::NavError;
use zeroize::Zeroize;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Reasoning-service connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Send each reply shape as a `json_schema` response format.  Only some
    /// endpoints accept it.
    #[serde(default)]
    pub structured_output: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: String::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            structured_output: false,
        }
    }
}

impl Drop for LlmSection {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

impl std::fmt::Debug for LlmSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSection")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("structured_output", &self.structured_output)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_early_stop_rotation")]
    pub early_stop_rotation: usize,
    /// 0 = verify only on request.
    #[serde(default)]
    pub verify_every: usize,
    #[serde(default = "default_stop_confidence")]
    pub stop_confidence: f64,
    #[serde(default)]
    pub auto_stop_on_task_check: bool,
}

impl Default for ControllerSection {
    fn default() -> Self {
        let d = ControllerConfig::default();
        Self {
            max_steps: d.max_steps,
            early_stop_rotation: d.early_stop_rotation,
            verify_every: d.verify_every,
            stop_confidence: d.stop_confidence,
            auto_stop_on_task_check: d.auto_stop_on_task_check,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSection {
    #[serde(default = "default_forward_step")]
    pub forward_step_m: f64,
    #[serde(default = "default_turn_angle")]
    pub turn_angle_deg: f64,
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,
}

impl Default for SimulatorSection {
    fn default() -> Self {
        let d = SimConfig::default();
        Self {
            forward_step_m: d.forward_step_m,
            turn_angle_deg: d.turn_angle_deg,
            frame_size: d.frame_size,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    subnav_runtime::llm_driver::DEFAULT_TEMPERATURE
}
fn default_max_tokens() -> u32 {
    subnav_runtime::llm_driver::DEFAULT_MAX_TOKENS
}
fn default_timeout_secs() -> u64 {
    subnav_runtime::llm_driver::DEFAULT_TIMEOUT.as_secs()
}
fn default_max_steps() -> usize {
    ControllerConfig::default().max_steps
}
fn default_early_stop_rotation() -> usize {
    ControllerConfig::default().early_stop_rotation
}
fn default_stop_confidence() -> f64 {
    ControllerConfig::default().stop_confidence
}
fn default_forward_step() -> f64 {
    SimConfig::default().forward_step_m
}
fn default_turn_angle() -> f64 {
    SimConfig::default().turn_angle_deg
}
fn default_frame_size() -> u32 {
    SimConfig::default().frame_size
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted configuration stored in `~/.subnav/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the per-episode export tree.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub simulator: SimulatorSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            llm: LlmSection::default(),
            controller: ControllerSection::default(),
            simulator: SimulatorSection::default(),
        }
    }
}

impl Config {
    /// Reject settings no episode can run with.
    pub fn validate(&self) -> Result<(), NavError> {
        let mut problems = Vec::new();
        if self.llm.base_url.trim().is_empty() {
            problems.push("llm.base_url is not set");
        }
        if self.llm.model.trim().is_empty() {
            problems.push("llm.model is not set");
        }
        if self.llm.api_key.trim().is_empty() {
            problems.push("llm.api_key is not set (config file or SUBNAV_LLM_API_KEY)");
        }
        if self.llm.max_tokens == 0 {
            problems.push("llm.max_tokens must be positive");
        }
        if self.llm.timeout_secs == 0 {
            problems.push("llm.timeout_secs must be positive");
        }
        if self.llm.temperature.is_nan() || self.llm.temperature < 0.0 {
            problems.push("llm.temperature must be non-negative");
        }
        if self.controller.max_steps == 0 {
            problems.push("controller.max_steps must be positive");
        }
        if !(0.0..=1.0).contains(&self.controller.stop_confidence) {
            problems.push("controller.stop_confidence must be within [0, 1]");
        }
        if self.simulator.forward_step_m.is_nan() || self.simulator.forward_step_m <= 0.0 {
            problems.push("simulator.forward_step_m must be positive");
        }
        if self.simulator.turn_angle_deg.is_nan() || self.simulator.turn_angle_deg <= 0.0 {
            problems.push("simulator.turn_angle_deg must be positive");
        }
        if self.simulator.frame_size == 0 {
            problems.push("simulator.frame_size must be positive");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(NavError::Configuration(problems.join("; ")))
        }
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig::new(&self.llm.base_url, &self.llm.api_key, &self.llm.model)
            .with_temperature(self.llm.temperature)
            .with_max_tokens(self.llm.max_tokens)
            .with_timeout(Duration::from_secs(self.llm.timeout_secs))
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let c = &self.controller;
        ControllerConfig {
            max_steps: c.max_steps,
            early_stop_rotation: c.early_stop_rotation,
            verify_every: c.verify_every,
            stop_confidence: c.stop_confidence,
            auto_stop_on_task_check: c.auto_stop_on_task_check,
        }
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            forward_step_m: self.simulator.forward_step_m,
            turn_angle_deg: self.simulator.turn_angle_deg,
            frame_size: self.simulator.frame_size,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.subnav/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".subnav").join("config.toml")
}

/// Load `path` (or the defaults when it does not exist) and apply
/// environment overrides.
pub fn load(path: &Path) -> Result<Config, NavError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`.  `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, NavError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        NavError::Configuration(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw).map_err(|e| {
        NavError::Configuration(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Apply `SUBNAV_*` environment overrides.
///
/// | Variable | Config field |
/// |---|---|
/// | `SUBNAV_LLM_BASE_URL` | `llm.base_url` |
/// | `SUBNAV_LLM_MODEL` | `llm.model` |
/// | `SUBNAV_LLM_API_KEY` | `llm.api_key` |
/// | `SUBNAV_MAX_STEPS` | `controller.max_steps` |
/// | `SUBNAV_OUTPUT_DIR` | `output_dir` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SUBNAV_LLM_BASE_URL") {
        cfg.llm.base_url = v;
    }
    if let Ok(v) = std::env::var("SUBNAV_LLM_MODEL") {
        cfg.llm.model = v;
    }
    if let Ok(v) = std::env::var("SUBNAV_LLM_API_KEY") {
        cfg.llm.api_key.zeroize();
        cfg.llm.api_key = v;
    }
    if let Ok(v) = std::env::var("SUBNAV_MAX_STEPS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.controller.max_steps = n;
    }
    if let Ok(v) = std::env::var("SUBNAV_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.llm.api_key = "sk-test".to_string();
        cfg.llm.model = "gpt-4o".to_string();
        cfg
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut cfg = Config::default();
        cfg.llm.api_key = "sk-super-secret".to_string();
        let debug_str = format!("{cfg:?}");
        assert!(!debug_str.contains("sk-super-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[test]
    fn defaults_match_runtime_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.controller_config(), ControllerConfig::default());
        assert_eq!(cfg.llm.max_tokens, 2000);
        assert_eq!(cfg.llm.timeout_secs, 60);
        assert_eq!(cfg.simulator.frame_size, SimConfig::default().frame_size);
    }

    #[test]
    fn missing_credentials_are_a_configuration_error() {
        let err = Config::default().validate().unwrap_err();
        let NavError::Configuration(msg) = err else {
            panic!("expected configuration error");
        };
        assert!(msg.contains("llm.api_key"));
        assert!(msg.contains("llm.model"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn non_positive_numbers_are_rejected() {
        let mut cfg = valid();
        cfg.controller.max_steps = 0;
        cfg.simulator.forward_step_m = 0.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_steps"));
        assert!(err.to_string().contains("forward_step_m"));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "output_dir = \"out\"\n[llm]\nmodel = \"qwen-vl\"\n[controller]\nmax_steps = 40\n",
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.output_dir, PathBuf::from("out"));
        assert_eq!(cfg.llm.model, "qwen-vl");
        assert_eq!(cfg.llm.base_url, "https://api.openai.com/v1");
        assert_eq!(cfg.controller.max_steps, 40);
        assert_eq!(cfg.controller.early_stop_rotation, 20);
        assert!(!cfg.llm.structured_output);
    }

    #[test]
    fn structured_output_is_read_from_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[llm]\nmodel = \"gpt-4o\"\nstructured_output = true\n").unwrap();
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert!(cfg.llm.structured_output);
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[llm\nmodel = ").unwrap();
        assert!(matches!(
            load_from(&path),
            Err(NavError::Configuration(_))
        ));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_subnav_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".subnav"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            std::env::set_var("SUBNAV_LLM_MODEL", "override-model");
            std::env::set_var("SUBNAV_MAX_STEPS", "77");
            std::env::set_var("SUBNAV_OUTPUT_DIR", "/tmp/subnav-out");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.llm.model, "override-model");
        assert_eq!(cfg.controller.max_steps, 77);
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/subnav-out"));
        unsafe {
            std::env::remove_var("SUBNAV_LLM_MODEL");
            std::env::remove_var("SUBNAV_MAX_STEPS");
            std::env::remove_var("SUBNAV_OUTPUT_DIR");
        }
    }

    #[test]
    fn llm_config_carries_settings() {
        let cfg = valid();
        let llm = cfg.llm_config();
        assert_eq!(llm.model, "gpt-4o");
        assert_eq!(llm.timeout, Duration::from_secs(60));
    }
}
