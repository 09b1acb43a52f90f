// 1. Traits
pub use crate::report::io::{Report, ReportName, ToCsv, ToJson, ToParquet, ToSchema};
pub use crate::store::{ClassificationLookup, ObservationSource, ResultSink};

// 2. The Core Pipeline Types
pub use crate::engine::{DateOutcome, DateState, Engine, PreparedRun, RunSummary, run_from_config};
pub use crate::panel::{
    Panel, benchmark::BenchmarkAligner, builder::PanelBuilder, returns::DerivedSeries,
};
pub use crate::window::{
    FlowRecord, FlowValue, MetricRecord, WindowCalculator, WindowResult, flow::FlowCalculator,
    metrics::{MetricSettings, MetricsCalculator},
};

// 3. Domain Types
pub use crate::data::domain::{AnnualizationFactor, AssetClass, EntityId, IndexCode};
pub use crate::data::grid::DateGrid;
pub use crate::data::observation::{
    LoadReport, ObservationFrame, RawObservation, ValuePolicy, load_observations,
};
pub use crate::data::window::{Mode, WindowSpec, default_flow_windows, default_metric_windows};

// 4. Reports
pub use crate::report::flow_batch::FlowBatch;
pub use crate::report::io::{FileExtension, export_report};
pub use crate::report::metric_batch::MetricBatch;

// 5. Errors
pub use crate::error::{
    DataError, EngineError, EngineResult, IoError, SetupError, StoreError, SystemError,
};

// 6. Stores, Cache & Config
pub use crate::cache::{CacheKey, CachedSource, QueryCache};
pub use crate::config::{CacheConfig, EngineConfig, ExportConfig};
pub use crate::store::{memory::MemoryStore, sqlite::SqliteStore};
