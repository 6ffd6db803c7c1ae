#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod context;
pub mod types;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../vocab/mod.rs"]
pub mod vocab;

#[path = "../data/mod.rs"]
pub mod data;

#[path = "../encode/mod.rs"]
pub mod encode;

#[path = "../metrics/mod.rs"]
pub mod metrics;

#[path = "../learn/mod.rs"]
pub mod learn;

pub use context::RunContext;
pub use types::{DemographicField, RecordKind, Split};
