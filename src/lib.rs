pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod normalizer;
pub mod reconciler;
pub mod schema;
pub mod singer;
pub mod sink;
pub mod sql;
pub mod target;
pub mod transport;
pub mod version;
pub mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::TargetConfig;
pub use destination::{ClickhouseLikeDestination, Destination};
pub use error::{Result, TargetError};
pub use target::{RunSummary, Target};
