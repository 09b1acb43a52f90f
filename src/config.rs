use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    data::{
        domain::{AnnualizationFactor, IndexCode},
        window::{Mode, WindowSpec, default_flow_windows, default_metric_windows, validate_windows},
    },
    error::{EngineResult, SetupError},
    report::io::FileExtension,
    window::metrics::MetricSettings,
};

/// Names the optional JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "FUNDMETRICS_CONFIG";
/// Overrides [`EngineConfig::source_db`].
pub const SOURCE_DB_ENV: &str = "FUNDMETRICS_SOURCE_DB";
/// Overrides [`EngineConfig::destination_db`].
pub const DEST_DB_ENV: &str = "FUNDMETRICS_DEST_DB";

const DEFAULT_DB: &str = "fundmetrics.db";

// ================================================================================================
// Sub-configurations
// ================================================================================================

/// Query cache settings. Disabled unless `enabled` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Directory for persisted entries; in-memory only when `None`.
    pub dir: Option<PathBuf>,
    pub ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs)
    }
}

/// Per-date batch export target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub dir: PathBuf,
    pub format: FileExtension,
}

// ================================================================================================
// Engine Configuration
// ================================================================================================

/// Everything a run needs beyond the stores themselves.
///
/// Defaults reproduce the production schedule: valuations from mid-2014, references from 2015,
/// month-close references until the end of 2025 and every available date afterwards.
///
/// # Example
///
/// ```no_run
/// # use fundmetrics::prelude::*;
/// # fn example() -> EngineResult<()> {
/// let cfg = EngineConfig::load()?
///     .with_modes(vec![Mode::Metrics])
///     .with_skip_empty_flows(false);
/// cfg.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    source_db: PathBuf,
    /// Falls back to `source_db` when absent.
    destination_db: Option<PathBuf>,
    modes: Vec<Mode>,

    // ========================================================================
    // Schedule
    // ========================================================================
    observation_start: NaiveDate,
    reference_start: NaiveDate,
    cutover: NaiveDate,

    // ========================================================================
    // Metrics
    // ========================================================================
    annualization_factor: AnnualizationFactor,
    metric_windows: Vec<WindowSpec>,
    flow_windows: Vec<WindowSpec>,
    risk_free_index: IndexCode,
    market_index: IndexCode,
    equity_class_markers: Vec<String>,

    // ========================================================================
    // Output
    // ========================================================================
    skip_empty_flows: bool,
    cache: CacheConfig,
    export: Option<ExportConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let settings = MetricSettings::default();
        Self {
            source_db: PathBuf::from(DEFAULT_DB),
            destination_db: None,
            modes: vec![Mode::Metrics, Mode::Flow],
            observation_start: ymd(2014, 6, 1),
            reference_start: ymd(2015, 1, 1),
            cutover: ymd(2025, 12, 31),
            annualization_factor: settings.annualization,
            metric_windows: default_metric_windows(),
            flow_windows: default_flow_windows(),
            risk_free_index: settings.risk_free_index,
            market_index: settings.market_index,
            equity_class_markers: vec![
                "Ações".to_string(),
                "Acoes".to_string(),
                "Equity".to_string(),
            ],
            skip_empty_flows: true,
            cache: CacheConfig::default(),
            export: None,
        }
    }
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

impl EngineConfig {
    /// Reads the JSON file named by `FUNDMETRICS_CONFIG` (defaults otherwise), then applies the
    /// store path overrides from the environment.
    pub fn load() -> EngineResult<Self> {
        let base = match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            SetupError::InvalidConfig(format!("cannot read '{}': {e}", path.display()))
        })?;
        let cfg = Self::from_json_str(&text)?;
        info!(path = %path.display(), "Loaded engine configuration");
        Ok(cfg)
    }

    pub fn from_json_str(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SetupError::InvalidConfig(format!("malformed configuration: {e}")).into())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = env::var(SOURCE_DB_ENV) {
            self.source_db = PathBuf::from(path);
        }
        if let Ok(path) = env::var(DEST_DB_ENV) {
            self.destination_db = Some(PathBuf::from(path));
        }
        self
    }

    /// Rejects configurations no run could complete with.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| -> EngineResult<()> { Err(SetupError::InvalidConfig(msg).into()) };

        if self.modes.is_empty() {
            return invalid("no engine mode selected".to_string());
        }
        for (name, windows) in [("metric", &self.metric_windows), ("flow", &self.flow_windows)] {
            if let Err(e) = validate_windows(windows) {
                return invalid(format!("{name} windows: {e}"));
            }
        }
        if !(self.annualization_factor.0.is_finite() && self.annualization_factor.0 > 0.0) {
            return invalid(format!(
                "annualization factor must be positive, got {}",
                self.annualization_factor.0
            ));
        }
        if self.reference_start < self.observation_start {
            return invalid(format!(
                "reference start {} precedes observation start {}",
                self.reference_start, self.observation_start
            ));
        }
        if self.cache.enabled && self.cache.ttl_secs <= 0 {
            return invalid("cache TTL must be positive".to_string());
        }
        Ok(())
    }

    // ========================================================================
    // Builders
    // ========================================================================

    pub fn with_source_db(self, path: impl Into<PathBuf>) -> Self {
        Self {
            source_db: path.into(),
            ..self
        }
    }

    pub fn with_destination_db(self, path: impl Into<PathBuf>) -> Self {
        Self {
            destination_db: Some(path.into()),
            ..self
        }
    }

    pub fn with_modes(self, modes: Vec<Mode>) -> Self {
        Self { modes, ..self }
    }

    pub fn with_observation_start(self, date: NaiveDate) -> Self {
        Self {
            observation_start: date,
            ..self
        }
    }

    pub fn with_reference_start(self, date: NaiveDate) -> Self {
        Self {
            reference_start: date,
            ..self
        }
    }

    pub fn with_cutover(self, date: NaiveDate) -> Self {
        Self {
            cutover: date,
            ..self
        }
    }

    pub fn with_annualization_factor(self, factor: f64) -> Self {
        Self {
            annualization_factor: AnnualizationFactor(factor),
            ..self
        }
    }

    pub fn with_metric_windows(self, windows: Vec<WindowSpec>) -> Self {
        Self {
            metric_windows: windows,
            ..self
        }
    }

    pub fn with_flow_windows(self, windows: Vec<WindowSpec>) -> Self {
        Self {
            flow_windows: windows,
            ..self
        }
    }

    pub fn with_benchmarks(self, risk_free: &str, market: &str) -> Self {
        Self {
            risk_free_index: IndexCode::from(risk_free),
            market_index: IndexCode::from(market),
            ..self
        }
    }

    pub fn with_equity_class_markers(self, markers: Vec<String>) -> Self {
        Self {
            equity_class_markers: markers,
            ..self
        }
    }

    pub fn with_skip_empty_flows(self, skip: bool) -> Self {
        Self {
            skip_empty_flows: skip,
            ..self
        }
    }

    pub fn with_cache(self, cache: CacheConfig) -> Self {
        Self { cache, ..self }
    }

    pub fn with_export(self, export: ExportConfig) -> Self {
        Self {
            export: Some(export),
            ..self
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn source_db(&self) -> &Path {
        &self.source_db
    }

    pub fn destination_db(&self) -> &Path {
        self.destination_db.as_deref().unwrap_or(&self.source_db)
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn observation_start(&self) -> NaiveDate {
        self.observation_start
    }

    pub fn reference_start(&self) -> NaiveDate {
        self.reference_start
    }

    pub fn cutover(&self) -> NaiveDate {
        self.cutover
    }

    pub fn windows(&self, mode: Mode) -> &[WindowSpec] {
        match mode {
            Mode::Metrics => &self.metric_windows,
            Mode::Flow => &self.flow_windows,
        }
    }

    pub fn risk_free_index(&self) -> &IndexCode {
        &self.risk_free_index
    }

    pub fn market_index(&self) -> &IndexCode {
        &self.market_index
    }

    pub fn equity_class_markers(&self) -> &[String] {
        &self.equity_class_markers
    }

    pub fn skip_empty_flows(&self) -> bool {
        self.skip_empty_flows
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn export(&self) -> Option<&ExportConfig> {
        self.export.as_ref()
    }

    pub fn metric_settings(&self) -> MetricSettings {
        MetricSettings {
            annualization: self.annualization_factor,
            risk_free_index: self.risk_free_index.clone(),
            market_index: self.market_index.clone(),
        }
    }
}
