//! Error types for reference resolution, loading, bundling and chunk export.

use std::path::PathBuf;
use thiserror::Error;

/// Deterministic failures while canonicalizing or dereferencing a `$ref`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("empty reference")]
    EmptyReference,

    #[error("unknown external reference \"{reference}\": base URI was never indexed")]
    UnknownExternalReference { reference: String },

    #[error("unknown anchor in reference \"{reference}\"")]
    UnknownAnchor { reference: String },

    #[error("pointer not found in document: {pointer}")]
    PointerNotFound { pointer: String },

    #[error("reference \"{reference}\" is not local")]
    NotLocal { reference: String },
}

/// Errors raised by a loader while fetching a referenced document.
///
/// Cloneable because one in-flight fetch result is shared by every node that
/// references the same location.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("cannot read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to fetch {url}: {message}")]
    Network { url: String, message: String },

    #[error("failed to fetch {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid JSON or YAML in {source_ref}: {message}")]
    InvalidDocument { source_ref: String, message: String },

    #[error("{message}")]
    Exec { message: String },
}

impl LoaderError {
    /// Build an error from any loader-specific message.
    pub fn exec(message: impl Into<String>) -> Self {
        LoaderError::Exec {
            message: message.into(),
        }
    }
}

/// Why a single node could not be resolved during bundling.
///
/// Recorded on the node (`$status: "error"`) and in the bundle report, and
/// handed to `on_resolve_error` hooks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error("bundle root is not an object, external documents have nowhere to go")]
    NoMountPoint,
}

/// Errors while loading the root document of a bundle.
///
/// Failures on referenced documents never surface here; they are recorded on
/// the offending node and in the bundle report.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("no loader accepts {source_ref}")]
    NoMatchingLoader { source_ref: String },

    #[error("cannot load {source_ref}: {error}")]
    Load {
        source_ref: String,
        #[source]
        error: LoaderError,
    },
}

/// Errors during chunk export. Any of these aborts the export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("chunks can only be written to disk in static mode")]
    NotStatic,

    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize chunk: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },

    #[error("no chunk stored for {target}")]
    MissingChunk { target: String },
}
