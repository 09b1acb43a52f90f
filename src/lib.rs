pub mod cache;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod macros;
pub mod panel;
pub mod prelude;
pub mod report;
pub mod store;
pub mod telemetry;
pub mod window;
