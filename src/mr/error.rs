//! Internal error type for the library half of this crate.
//!
//! The two binaries (`mrcoordinator`, `mrworker`) convert everything to
//! `anyhow::Error` at the top level; this enum exists so call sites inside
//! `mr::coordinator` and `mr::worker` can match on failure kind.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MrError {
    #[error("failed to read input file {path:?}: {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write intermediate file {path:?}: {source}")]
    WriteIntermediate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to glob intermediate files for pattern {pattern}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("malformed intermediate record in {path:?}: {line}")]
    MalformedRecord { path: PathBuf, line: String },

    #[error("failed to write output file {path:?}: {source}")]
    WriteOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
