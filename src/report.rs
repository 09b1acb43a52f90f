pub mod flow_batch;
pub mod io;
pub mod metric_batch;
pub mod polars_ext;
