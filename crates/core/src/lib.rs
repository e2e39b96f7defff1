pub mod config;
pub mod error;
pub mod event_bus;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{AbTrackError, AbTrackResult};
pub use event_bus::ReportSink;
pub use store::{RecordStore, StoreKeys};
