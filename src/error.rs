//! Failure taxonomy shared by the long-running units.
//!
//! Units return `anyhow::Result`; the variants below are attached at the
//! boundary where a failure is recognised so the supervisor can log what kind
//! of failure restarted a unit.

use thiserror::Error;

use crate::buffer::BufferError;
use crate::camera::CameraId;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Camera unreachable or stream dropped. Retried forever.
    #[error("camera {camera}: connection failure: {source}")]
    ConnectionFailure {
        camera: CameraId,
        #[source]
        source: anyhow::Error,
    },
    /// Detector backend failed mid-cycle. Restarts the scheduler.
    #[error("detection backend {backend} failed: {source}")]
    DetectionBackendFailure {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
    /// File review decode/encode failed. The clip is re-queued.
    #[error("{stage} stage failed: {source}")]
    PipelineStageFailure {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Coarse failure kind for log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    DetectionBackend,
    PipelineStage,
    Buffer,
    Other,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::DetectionBackend => "detection-backend",
            FailureKind::PipelineStage => "pipeline-stage",
            FailureKind::Buffer => "buffer",
            FailureKind::Other => "other",
        }
    }
}

impl PipelineError {
    /// Walk an error chain and report the first recognised kind.
    pub fn classify(err: &anyhow::Error) -> FailureKind {
        for cause in err.chain() {
            if let Some(pipeline) = cause.downcast_ref::<PipelineError>() {
                return match pipeline {
                    PipelineError::ConnectionFailure { .. } => FailureKind::Connection,
                    PipelineError::DetectionBackendFailure { .. } => {
                        FailureKind::DetectionBackend
                    }
                    PipelineError::PipelineStageFailure { .. } => FailureKind::PipelineStage,
                };
            }
            if cause.downcast_ref::<BufferError>().is_some() {
                return FailureKind::Buffer;
            }
        }
        FailureKind::Other
    }
}
