pub mod context;
pub mod serde;
pub mod storage;
pub mod telemetry;
