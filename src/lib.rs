#[allow(clippy::all, dead_code)]
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/chromeos_update_engine.rs"));
}

pub mod bspatch;
pub mod cmd;
pub mod error;
pub mod extent;
pub mod extract;
pub mod manifest;
pub mod operation;
pub mod payload;
pub mod stream;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::extract::{
    ExtractOptions, ExtractReport, ExtractionPlan, PartitionSummary, extract, extract_to_dir,
    list_partitions,
};
pub use crate::manifest::Manifest;
pub use crate::payload::Payload;
