//! Error types for portdrop.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::runtime::conf::ConfigError;

pub type Result<T, E = PortDropError> = std::result::Result<T, E>;

/// Every failure the control plane can report. Startup treats all of them as
/// fatal; during draining they are logged and skipped.
#[derive(Debug, Error)]
pub enum PortDropError {
    /// The filter object could not be read from its source.
    #[error("failed to read filter artifact {origin}: {source}")]
    ArtifactUnreadable {
        origin: String,
        #[source]
        source: io::Error,
    },

    /// The bytes were read but do not form a loadable eBPF object.
    #[error("filter artifact {origin} is malformed: {reason}")]
    ArtifactMalformed { origin: String, reason: String },

    /// RLIMIT_MEMLOCK could not be lifted before creating kernel objects.
    #[error("failed to remove limit on locked memory: {0}")]
    ResourceLimitUnavailable(#[source] io::Error),

    /// The kernel refused the object (map creation, verifier, unsupported helpers).
    #[error("failed to materialize filter collection: {0}")]
    MaterializationFailed(String),

    #[error("program '{0}' not found in the filter collection")]
    ProgramNotFound(String),

    #[error("table '{0}' not found in the filter collection")]
    TableNotFound(String),

    /// The interface does not exist or cannot host an XDP program.
    #[error("interface '{interface}' cannot host the filter: {reason}")]
    InterfaceUnsupported { interface: String, reason: String },

    /// The kernel refused the attachment (busy hook, permissions, mode).
    #[error("attaching to interface '{interface}' was rejected: {reason}")]
    AttachmentRejected { interface: String, reason: String },

    /// Detaching during drain failed; the program may still be attached.
    #[error("failed to detach from interface '{interface}': {reason}")]
    DetachFailed { interface: String, reason: String },

    #[error("failed to write table '{table}': {reason}")]
    TableWriteFailed { table: String, reason: String },

    #[error("failed to manage link pin at {path}: {reason}")]
    LinkPin { path: PathBuf, reason: String },

    /// The armed marker could not be written, read or removed.
    #[error("failed to manage armed marker at {path}: {reason}")]
    ArmedMarker { path: PathBuf, reason: String },

    /// A previous run's attachment could not be cleared from the interface.
    #[error("failed to clear stale attachment on interface '{interface}': {reason}")]
    StaleAttachment { interface: String, reason: String },

    /// `start` was called on a lifecycle that already ran.
    #[error("lifecycle cannot start from state '{0}'")]
    NotStartable(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

impl PortDropError {
    pub fn artifact_unreadable(origin: impl Into<String>, source: io::Error) -> Self {
        Self::ArtifactUnreadable {
            origin: origin.into(),
            source,
        }
    }

    pub fn artifact_malformed(origin: impl Into<String>, reason: impl ToString) -> Self {
        Self::ArtifactMalformed {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn interface_unsupported(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::InterfaceUnsupported {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    pub fn attachment_rejected(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::AttachmentRejected {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    pub fn detach_failed(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::DetachFailed {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    pub fn table_write_failed(table: impl Into<String>, reason: impl ToString) -> Self {
        Self::TableWriteFailed {
            table: table.into(),
            reason: reason.to_string(),
        }
    }

    pub fn link_pin(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::LinkPin {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn armed_marker(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ArmedMarker {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn stale_attachment(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::StaleAttachment {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    /// Short label of the stage that produced the error, used in log fields.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ArtifactUnreadable { .. } | Self::ArtifactMalformed { .. } => "load",
            Self::ResourceLimitUnavailable(_)
            | Self::MaterializationFailed(_)
            | Self::ProgramNotFound(_)
            | Self::TableNotFound(_) => "materialize",
            Self::InterfaceUnsupported { .. }
            | Self::AttachmentRejected { .. }
            | Self::LinkPin { .. }
            | Self::ArmedMarker { .. }
            | Self::StaleAttachment { .. } => "attach",
            Self::TableWriteFailed { .. } => "configure",
            Self::DetachFailed { .. } => "drain",
            Self::NotStartable(_) => "lifecycle",
            Self::Config(_) => "config",
            Self::Signal(_) => "signal",
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}
