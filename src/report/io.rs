use std::{
    fs,
    path::{Path, PathBuf},
};

use polars::{
    frame::DataFrame,
    prelude::{
        CsvWriterOptions, IntoLazy, ParquetWriteOptions, PlPath, SchemaRef, SinkOptions,
        SinkTarget,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    error::{DataError, EngineResult, IoError},
    report::polars_ext::DataFrameExt,
};

// ================================================================================================
// Traits
// ================================================================================================

/// Common interface of the per-date result batches.
pub trait Report {
    fn as_df(&self) -> &DataFrame;
}

pub trait ReportName {
    fn base_name(&self) -> String;

    fn filename(&self, ext: FileExtension) -> String {
        format!("{}.{}", self.base_name(), ext)
    }
}

pub trait ToSchema {
    /// Returns the canonical schema for this report type.
    fn to_schema() -> SchemaRef;
}

pub trait ToJson {
    /// Serializes the report to a `Value::Array` of row objects.
    fn to_json(&self) -> EngineResult<serde_json::Value>;
}

pub trait ToCsv {
    /// Writes the report to `<dir>/<base_name>.csv`, creating `dir` if needed and
    /// overwriting an existing file.
    fn to_csv(
        &self,
        dir: impl AsRef<Path>,
        opts: Option<&CsvWriterOptions>,
        sink_opts: Option<&SinkOptions>,
    ) -> EngineResult<()>;
}

pub trait ToParquet {
    fn to_parquet(
        &self,
        dir: impl AsRef<Path>,
        opts: Option<&ParquetWriteOptions>,
        sink_opts: Option<&SinkOptions>,
    ) -> EngineResult<()>;
}

// ================================================================================================
// Blanket Implementations
// ================================================================================================

impl<T> ToJson for T
where
    T: Report,
{
    fn to_json(&self) -> EngineResult<serde_json::Value> {
        let rows = self.as_df().to_json_rows()?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }
}

impl<T> ToCsv for T
where
    T: Report + ReportName,
{
    fn to_csv(
        &self,
        dir: impl AsRef<Path>,
        opts: Option<&CsvWriterOptions>,
        sink_opts: Option<&SinkOptions>,
    ) -> EngineResult<()> {
        let file_path = prepare_target(dir.as_ref(), &self.filename(FileExtension::Csv))?;
        let target = sink_target(&file_path)?;
        let options = opts.cloned().unwrap_or_default();
        let sink_opts = sink_opts.cloned().unwrap_or_default();

        let sink_plan = self
            .as_df()
            .clone()
            .lazy()
            .sink_csv(target, options, None, sink_opts)
            .map_err(|e| DataError::DataFrame(format!("Failed to build CSV sink plan: {e}")))?;

        let _ = sink_plan.collect().map_err(|e| {
            DataError::DataFrame(format!(
                "Failed to write CSV to '{}': {e}",
                file_path.display()
            ))
        })?;

        Ok(())
    }
}

impl<T> ToParquet for T
where
    T: Report + ReportName,
{
    fn to_parquet(
        &self,
        dir: impl AsRef<Path>,
        opts: Option<&ParquetWriteOptions>,
        sink_opts: Option<&SinkOptions>,
    ) -> EngineResult<()> {
        let file_path = prepare_target(dir.as_ref(), &self.filename(FileExtension::Parquet))?;
        let target = sink_target(&file_path)?;
        let options = opts.cloned().unwrap_or_default();
        let sink_opts = sink_opts.cloned().unwrap_or_default();

        let sink_plan = self
            .as_df()
            .clone()
            .lazy()
            .sink_parquet(target, options, None, sink_opts)
            .map_err(|e| DataError::DataFrame(format!("Failed to build Parquet sink plan: {e}")))?;

        let _ = sink_plan.collect().map_err(|e| {
            DataError::DataFrame(format!(
                "Failed to write Parquet to '{}': {e}",
                file_path.display()
            ))
        })?;

        Ok(())
    }
}

// ================================================================================================
// Export
// ================================================================================================

/// Writes `report` into `dir` in the requested format and returns the file path.
pub fn export_report<T>(report: &T, dir: &Path, format: FileExtension) -> EngineResult<PathBuf>
where
    T: Report + ReportName,
{
    match format {
        FileExtension::Csv => report.to_csv(dir, None, None)?,
        FileExtension::Parquet => report.to_parquet(dir, None, None)?,
        FileExtension::Json => {
            let path = prepare_target(dir, &report.filename(FileExtension::Json))?;
            let file = fs::File::create(&path).map_err(IoError::Io)?;
            serde_json::to_writer_pretty(file, &report.to_json()?).map_err(IoError::Json)?;
        }
    }
    Ok(dir.join(report.filename(format)))
}

fn prepare_target(dir: &Path, filename: &str) -> EngineResult<PathBuf> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            IoError::FileSystem(format!(
                "Failed to create directory {}: {}",
                dir.display(),
                e
            ))
        })?;
    }
    Ok(dir.join(filename))
}

fn sink_target(file_path: &Path) -> EngineResult<SinkTarget> {
    let uri = file_path.to_str().ok_or_else(|| {
        IoError::FileSystem(format!(
            "Path contains invalid UTF-8 characters: {}",
            file_path.display()
        ))
    })?;
    Ok(SinkTarget::Path(PlPath::new(uri)))
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FileExtension {
    Csv,
    Parquet,
    Json,
}
