use polars::prelude::{DataFrame, JsonFormat, JsonWriter, SerWriter};
use serde_json::Value;

use crate::error::{DataError, EngineError, EngineResult, IoError};

pub(super) fn polars_to_engine_error(report: &str, e: polars::error::PolarsError) -> EngineError {
    EngineError::Data(DataError::DataFrame(format!(
        "Error while building {report} from records: {e}"
    )))
}

pub trait DataFrameExt {
    fn to_json_rows(&self) -> EngineResult<Vec<serde_json::Map<String, Value>>>;
}

impl DataFrameExt for DataFrame {
    fn to_json_rows(&self) -> EngineResult<Vec<serde_json::Map<String, Value>>> {
        let height = self.height();
        if height == 0 {
            return Ok(Vec::new());
        }

        // Roughly 64 bytes per cell.
        let mut buf = Vec::with_capacity(height * self.width() * (1 << 6));

        JsonWriter::new(&mut buf)
            .with_json_format(JsonFormat::Json)
            .finish(&mut self.clone())
            .map_err(|e| DataError::DataFrame(e.to_string()))?;

        let json_val: Value = serde_json::from_slice(&buf).map_err(IoError::Json)?;

        match json_val {
            Value::Array(rows) => Ok(rows
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            _ => {
                Err(DataError::DataFrame("Polars JSON output was not an array".to_string()).into())
            }
        }
    }
}
