//! Bundle build pipeline.
//!
//! Packages an interpreted-script application and its vendored dependencies
//! into a single self-executing phar bundle. The pipeline is a fixed
//! sequence of stages: configuration resolution, source enumeration,
//! autoloader dump, prefixing, compaction, requirement collection,
//! assembly, compression, signing and finalization. Stages mutate a shared
//! build context; output is byte-reproducible for a fixed input tree.
//!
//! The container format itself lives in `carton-phar`; this crate decides
//! what goes into it and in which order.

pub mod compact;
pub mod composer;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod requirements;
pub mod scoper;
pub mod sources;

pub use config::{discover, load_file, BuildConfig, LoadedConfig};
pub use error::{Error, Result};
pub use pipeline::{BuildReport, Builder, CancelToken};
