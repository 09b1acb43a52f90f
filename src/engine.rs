use std::{
    collections::{BTreeMap, HashSet},
    time::Instant,
};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    cache::{CachedSource, QueryCache},
    config::EngineConfig,
    data::{
        domain::EntityId,
        grid::DateGrid,
        observation::{ObservationFrame, RawObservation, ValuePolicy, load_observations},
        window::{Mode, WindowSpec},
    },
    error::{EngineResult, SetupError},
    panel::{
        Panel, benchmark::BenchmarkAligner, builder::PanelBuilder, returns::DerivedSeries,
    },
    report::{
        flow_batch::FlowBatch,
        io::export_report,
        metric_batch::MetricBatch,
    },
    store::{ClassificationLookup, ObservationSource, ResultSink, equity_flags, sqlite::SqliteStore},
    window::{
        FlowRecord, MetricRecord, WindowCalculator, WindowResult, flow::FlowCalculator,
        metrics::MetricsCalculator,
    },
};

// ================================================================================================
// Run State
// ================================================================================================

/// Lifecycle of one reference date within a run.
///
/// `Pending -> Computing -> (Written | SkippedEmpty | FailedLogged)`. A failed date never
/// fails the run; it is simply picked up again by the next run's checkpoint.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DateState {
    Pending,
    Computing,
    Written,
    SkippedEmpty,
    FailedLogged,
}

impl DateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Written | Self::SkippedEmpty | Self::FailedLogged)
    }
}

/// Final state and row count of one reference date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateOutcome {
    pub reference_date: NaiveDate,
    pub state: DateState,
    pub rows: usize,
}

/// Totals of one mode's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: Mode,
    pub attempted: usize,
    pub written: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    pub rows: usize,
}

impl RunSummary {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            attempted: 0,
            written: 0,
            skipped_empty: 0,
            failed: 0,
            rows: 0,
        }
    }

    fn record(&mut self, outcome: &DateOutcome) {
        self.attempted += 1;
        match outcome.state {
            DateState::Written => {
                self.written += 1;
                self.rows += outcome.rows;
            }
            DateState::SkippedEmpty => self.skipped_empty += 1,
            DateState::FailedLogged => self.failed += 1,
            DateState::Pending | DateState::Computing => {}
        }
    }
}

// ================================================================================================
// Prepared Inputs
// ================================================================================================

/// Everything a mode needs, built once per run and read-only afterwards.
#[derive(Debug)]
pub struct PreparedRun {
    mode: Mode,
    panel: Panel,
    series: DerivedSeries,
    benchmarks: BenchmarkAligner,
    equity: Vec<bool>,
    schedule: DateGrid,
}

impl PreparedRun {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    /// Reference dates to compute, ascending.
    pub fn schedule(&self) -> &DateGrid {
        &self.schedule
    }
}

// ================================================================================================
// Engine
// ================================================================================================

/// Incremental, resumable batch runner for both modes.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs every configured mode. Only setup errors are returned.
    pub fn run<S, C, K>(
        &self,
        source: &S,
        classification: &C,
        sink: &K,
    ) -> EngineResult<Vec<RunSummary>>
    where
        S: ObservationSource,
        C: ClassificationLookup,
        K: ResultSink,
    {
        self.config
            .modes()
            .iter()
            .map(|&mode| self.run_mode(mode, source, classification, sink))
            .collect()
    }

    #[tracing::instrument(skip_all, fields(mode = %mode))]
    pub fn run_mode<S, C, K>(
        &self,
        mode: Mode,
        source: &S,
        classification: &C,
        sink: &K,
    ) -> EngineResult<RunSummary>
    where
        S: ObservationSource,
        C: ClassificationLookup,
        K: ResultSink,
    {
        let started = Instant::now();
        let prepared = self.prepare(mode, source, classification)?;
        info!(
            entities = prepared.panel.n_entities(),
            grid_dates = prepared.panel.n_dates(),
            reference_dates = prepared.schedule.len(),
            elapsed = %humantime::format_duration(started.elapsed()),
            "Setup complete"
        );

        let calculator = match &prepared.series {
            DerivedSeries::LogReturns(returns) => WindowCalculator::Metrics(MetricsCalculator::new(
                &prepared.panel,
                returns,
                &prepared.benchmarks,
                prepared.equity.clone(),
                self.config.metric_settings(),
            )?),
            DerivedSeries::Levels(levels) => {
                WindowCalculator::Flow(FlowCalculator::new(&prepared.panel, levels)?)
            }
        };

        let mut summary = RunSummary::new(mode);
        for reference_date in prepared.schedule.iter() {
            let date_started = Instant::now();
            let outcome = self.process_date(&prepared, &calculator, sink, reference_date);
            summary.record(&outcome);
            info!(
                date = %reference_date,
                state = %outcome.state,
                rows = outcome.rows,
                elapsed = %humantime::format_duration(date_started.elapsed()),
                "Reference date processed"
            );
        }

        info!(
            attempted = summary.attempted,
            written = summary.written,
            skipped = summary.skipped_empty,
            failed = summary.failed,
            rows = summary.rows,
            elapsed = %humantime::format_duration(started.elapsed()),
            "Run finished"
        );
        Ok(summary)
    }

    // ============================================================================================
    // Setup
    // ============================================================================================

    /// Loads the inputs of `mode` and builds its panel, derived series and schedule.
    #[tracing::instrument(skip_all, fields(mode = %mode))]
    pub fn prepare<S, C>(
        &self,
        mode: Mode,
        source: &S,
        classification: &C,
    ) -> EngineResult<PreparedRun>
    where
        S: ObservationSource,
        C: ClassificationLookup,
    {
        match mode {
            Mode::Metrics => self.prepare_metrics(source, classification),
            Mode::Flow => self.prepare_flow(source),
        }
    }

    fn prepare_metrics<S, C>(&self, source: &S, classification: &C) -> EngineResult<PreparedRun>
    where
        S: ObservationSource,
        C: ClassificationLookup,
    {
        let cfg = &self.config;
        let start = cfg.observation_start();

        let benchmarks = self.load_benchmarks(source)?;

        let rows = source.valuations(start)?;
        let frame = load_frame(Mode::Metrics, &rows, ValuePolicy::PositiveOnly, Some(start))?;
        let grid = DateGrid::observed(frame.dates()?);
        let panel = PanelBuilder::new(grid).build(&frame.entity_series()?)?;
        let series = DerivedSeries::derive(&panel, Mode::Metrics);

        let equity = equity_flags(classification, panel.entities(), cfg.equity_class_markers())?;
        debug!(
            equity = equity.iter().filter(|e| **e).count(),
            entities = equity.len(),
            "Classified entities"
        );

        let schedule = DateGrid::hybrid(panel.grid(), cfg.cutover(), cfg.reference_start());

        Ok(PreparedRun {
            mode: Mode::Metrics,
            panel,
            series,
            benchmarks,
            equity,
            schedule,
        })
    }

    fn prepare_flow<S: ObservationSource>(&self, source: &S) -> EngineResult<PreparedRun> {
        let rows = source.positions()?;
        let frame = load_frame(Mode::Flow, &rows, ValuePolicy::Finite, None)?;

        let dates = frame.dates()?;
        let (Some(first), Some(last)) = (dates.first().copied(), dates.last().copied()) else {
            return Err(SetupError::NoObservations(Mode::Flow.to_string()).into());
        };
        // Only month ends already covered by data: a row written for a month still open would
        // be checkpointed and never refreshed.
        let grid = DateGrid::month_ends(first, last)?;
        let panel = PanelBuilder::new(grid).build(&frame.entity_series()?)?;
        let series = DerivedSeries::derive(&panel, Mode::Flow);
        let schedule = panel.grid().since(self.config.reference_start());

        Ok(PreparedRun {
            mode: Mode::Flow,
            equity: vec![false; panel.n_entities()],
            panel,
            series,
            benchmarks: BenchmarkAligner::default(),
            schedule,
        })
    }

    fn load_benchmarks<S: ObservationSource>(&self, source: &S) -> EngineResult<BenchmarkAligner> {
        let cfg = &self.config;
        let codes = [cfg.risk_free_index(), cfg.market_index()];

        let mut rows = Vec::new();
        for code in codes {
            rows.extend(source.index_levels(code, cfg.observation_start())?);
        }
        let (frame, _) = load_observations(&rows, ValuePolicy::PositiveOnly, None)?;
        let aligner = BenchmarkAligner::from_entity_series(&frame.entity_series()?);
        aligner.require(&codes)?;
        Ok(aligner)
    }

    // ============================================================================================
    // Per-date Processing
    // ============================================================================================

    fn process_date<K: ResultSink>(
        &self,
        prepared: &PreparedRun,
        calculator: &WindowCalculator<'_>,
        sink: &K,
        reference_date: NaiveDate,
    ) -> DateOutcome {
        let mode = prepared.mode;
        let outcome = |state: DateState, rows: usize| DateOutcome {
            reference_date,
            state,
            rows,
        };

        let done = match sink.checkpoint(mode, reference_date) {
            Ok(done) => done,
            Err(e) => {
                warn!(date = %reference_date, error = %e, "Checkpoint query failed");
                return outcome(DateState::FailedLogged, 0);
            }
        };
        let candidates: HashSet<EntityId> = prepared
            .panel
            .entities()
            .iter()
            .filter(|e| !done.contains(&e.key()))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return outcome(DateState::SkippedEmpty, 0);
        }

        debug!(
            date = %reference_date,
            state = %DateState::Computing,
            candidates = candidates.len(),
            "Computing reference date"
        );
        let windows = self.config.windows(mode);
        let written = match mode {
            Mode::Metrics => {
                let records = compute_metrics(calculator, reference_date, windows, &candidates);
                self.write_metrics(sink, reference_date, &records)
            }
            Mode::Flow => {
                let mut records = compute_flows(calculator, reference_date, windows, &candidates);
                if self.config.skip_empty_flows() {
                    records.retain(|r| !r.is_empty());
                }
                self.write_flows(sink, reference_date, &records, windows)
            }
        };

        match written {
            Some(0) => outcome(DateState::SkippedEmpty, 0),
            Some(rows) => outcome(DateState::Written, rows),
            None => outcome(DateState::FailedLogged, 0),
        }
    }

    fn write_metrics<K: ResultSink>(
        &self,
        sink: &K,
        reference_date: NaiveDate,
        records: &[MetricRecord],
    ) -> Option<usize> {
        if records.is_empty() {
            return Some(0);
        }
        let rows = match sink.append_metrics(reference_date, records) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(date = %reference_date, error = %e, "Metric batch not written");
                return None;
            }
        };

        if let Some(export) = self.config.export() {
            let exported = MetricBatch::new(reference_date, records)
                .and_then(|batch| export_report(&batch, &export.dir, export.format));
            log_export(reference_date, exported.map(|p| p.display().to_string()));
        }
        Some(rows)
    }

    fn write_flows<K: ResultSink>(
        &self,
        sink: &K,
        reference_date: NaiveDate,
        records: &[FlowRecord],
        windows: &[WindowSpec],
    ) -> Option<usize> {
        if records.is_empty() {
            return Some(0);
        }
        let rows = match sink.append_flows(reference_date, records, windows) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(date = %reference_date, error = %e, "Flow batch not written");
                return None;
            }
        };

        if let Some(export) = self.config.export() {
            let exported = FlowBatch::new(reference_date, records, windows)
                .and_then(|batch| export_report(&batch, &export.dir, export.format));
            log_export(reference_date, exported.map(|p| p.display().to_string()));
        }
        Some(rows)
    }
}

fn load_frame(
    mode: Mode,
    rows: &[RawObservation],
    policy: ValuePolicy,
    since: Option<NaiveDate>,
) -> EngineResult<ObservationFrame> {
    let (frame, report) = load_observations(rows, policy, since)?;
    info!(
        mode = %mode,
        rows_read = report.rows_read,
        kept = frame.height(),
        duplicates = report.duplicates_resolved,
        dropped_entities = report.dropped_entities.len(),
        "Observations loaded"
    );
    if frame.is_empty() {
        return Err(SetupError::NoObservations(mode.to_string()).into());
    }
    Ok(frame)
}

fn log_export(reference_date: NaiveDate, exported: EngineResult<String>) {
    match exported {
        Ok(path) => debug!(date = %reference_date, filename = %path, "Batch exported"),
        Err(e) => warn!(date = %reference_date, error = %e, "Batch export failed"),
    }
}

/// Every window's rows for one date; a failing window is logged and left out.
fn compute_metrics(
    calculator: &WindowCalculator<'_>,
    reference_date: NaiveDate,
    windows: &[WindowSpec],
    candidates: &HashSet<EntityId>,
) -> Vec<MetricRecord> {
    let mut records = Vec::new();
    for window in windows {
        match calculator.compute(reference_date, window, Some(candidates)) {
            Ok(WindowResult::Metrics(rows)) => records.extend(rows),
            Ok(WindowResult::InsufficientHistory) => {
                debug!(date = %reference_date, window = window.label(), "Insufficient history");
            }
            Ok(WindowResult::Flow(_)) => {
                warn!(window = window.label(), "Flow result from a metrics calculator; ignored");
            }
            Err(e) => {
                warn!(
                    date = %reference_date,
                    window = window.label(),
                    error = %e,
                    "Window computation failed; skipping window"
                );
            }
        }
    }
    records
}

/// One wide row per entity. A failing window is logged and left out of the rows, which store it
/// as a missing flow.
fn compute_flows(
    calculator: &WindowCalculator<'_>,
    reference_date: NaiveDate,
    windows: &[WindowSpec],
    candidates: &HashSet<EntityId>,
) -> Vec<FlowRecord> {
    merge_flow_windows(
        reference_date,
        windows
            .iter()
            .map(|window| (window, calculator.compute(reference_date, window, Some(candidates)))),
    )
}

fn merge_flow_windows<'w>(
    reference_date: NaiveDate,
    results: impl IntoIterator<Item = (&'w WindowSpec, EngineResult<WindowResult>)>,
) -> Vec<FlowRecord> {
    let mut rows: BTreeMap<EntityId, FlowRecord> = BTreeMap::new();
    for (window, result) in results {
        let values = match result {
            Ok(WindowResult::Flow(values)) => values,
            Ok(other) => {
                warn!(
                    date = %reference_date,
                    window = window.label(),
                    rows = other.len(),
                    "Unexpected window result for flow mode; skipping window"
                );
                continue;
            }
            Err(e) => {
                warn!(
                    date = %reference_date,
                    window = window.label(),
                    error = %e,
                    "Flow window failed; skipping window"
                );
                continue;
            }
        };
        for value in values {
            rows.entry(value.entity.clone())
                .or_insert_with(|| FlowRecord {
                    entity: value.entity.clone(),
                    reference_date,
                    total_position: value.position,
                    flows: Vec::new(),
                })
                .flows
                .push((window.label().to_string(), value.flow));
        }
    }
    rows.into_values().collect()
}

// ================================================================================================
// Standalone Entry Point
// ================================================================================================

/// Opens the configured SQLite stores, optionally behind the query cache, and runs every mode.
pub fn run_from_config(config: EngineConfig) -> EngineResult<Vec<RunSummary>> {
    let engine = Engine::new(config)?;
    let cfg = engine.config();

    let source = SqliteStore::open_source(cfg.source_db())?;
    let destination = SqliteStore::open_destination(cfg.destination_db())?;
    info!(
        source = %cfg.source_db().display(),
        destination = %cfg.destination_db().display(),
        "Stores opened"
    );

    if cfg.cache().enabled {
        let cache = match &cfg.cache().dir {
            Some(dir) => QueryCache::persistent(cfg.cache().ttl(), dir)?,
            None => QueryCache::in_memory(cfg.cache().ttl()),
        };
        let cached = CachedSource::new(&source, &cache);
        engine.run(&cached, &source, &destination)
    } else {
        engine.run(&source, &source, &destination)
    }
}
