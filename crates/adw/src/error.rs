//! Component-level error types.
//!
//! Each error implements `std::error::Error` via `thiserror` and exposes a
//! `.kind()` accessor returning the shared [`adw_types::ErrorKind`] taxonomy,
//! so the Phase Runner and Orchestrator can match on taxonomy without
//! downcasting a boxed error. The CLI binary and orchestration glue wrap
//! these in `anyhow::Result` with added context.

use adw_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("no free backend/frontend port pair available")]
    PortsExhausted,
    #[error("worktree already allocated for run {0}")]
    WorktreeAlreadyAllocated(String),
    #[error("lock is held by another process: {0}")]
    Locked(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AllocatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocatorError::PortsExhausted => ErrorKind::ResourceExhausted,
            AllocatorError::WorktreeAlreadyAllocated(_) => ErrorKind::ContractBreach,
            AllocatorError::Locked(_) => ErrorKind::ResourceExhausted,
            AllocatorError::Io(_) => ErrorKind::ExternalToolFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("run state document not found for run {0}")]
    NotFound(String),
    #[error("schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateStoreError::NotFound(_) => ErrorKind::ContractBreach,
            StateStoreError::SchemaTooNew { .. } => ErrorKind::ContractBreach,
            StateStoreError::Serde(_) => ErrorKind::ContractBreach,
            StateStoreError::Io(_) => ErrorKind::ExternalToolFailure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue entry {0} not found")]
    NotFound(String),
    #[error("expected status {expected:?} but row had {actual:?}; another writer won the race")]
    StatusMismatch {
        expected: adw_types::QueueStatus,
        actual: adw_types::QueueStatus,
    },
    #[error("phase {0} is not ready: dependency not completed")]
    DependencyNotSatisfied(u8),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::NotFound(_) => ErrorKind::ContractBreach,
            QueueError::StatusMismatch { .. } => ErrorKind::ContractBreach,
            QueueError::DependencyNotSatisfied(_) => ErrorKind::ContractBreach,
            QueueError::Sqlite(_) => ErrorKind::ExternalToolFailure,
            QueueError::Serde(_) => ErrorKind::ContractBreach,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("phase {attempted} cannot follow phase {current}: out of order")]
    OutOfOrder { current: u8, attempted: u8 },
    #[error("transition from {from:?} to {to:?} is not permitted")]
    IllegalTransition {
        from: adw_types::QueueStatus,
        to: adw_types::QueueStatus,
    },
    #[error("contract breach: {0}")]
    ContractBreach(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
}

impl ValidatorError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ContractBreach
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("external tool `{tool}` failed: {message}")]
    ExternalToolFailure { tool: String, message: String },
    #[error("repair agent could not resolve the failure: {0}")]
    AgentFailure(String),
    #[error("phase exceeded its timeout")]
    Timeout,
    #[error("identical error seen {attempts} times in a row; breaking the loop")]
    Looping { attempts: u32 },
    #[error("run was cancelled")]
    Cancelled,
    #[error("contract breach: {0}")]
    ContractBreach(String),
}

impl RunnerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunnerError::ExternalToolFailure { .. } => ErrorKind::ExternalToolFailure,
            RunnerError::AgentFailure(_) => ErrorKind::AgentFailure,
            RunnerError::Timeout => ErrorKind::Timeout,
            RunnerError::Looping { .. } => ErrorKind::Looping,
            RunnerError::Cancelled => ErrorKind::Cancelled,
            RunnerError::ContractBreach(_) => ErrorKind::ContractBreach,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("signature verification failed: {0}")]
    BadSignature(#[from] adw_webhook_crypto::SignatureError),
    #[error("payload could not be parsed: {0}")]
    MalformedPayload(String),
    #[error("webhook event store error: {0}")]
    Storage(String),
}

impl WebhookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::BadSignature(_) => ErrorKind::AuthFailure,
            WebhookError::MalformedPayload(_) => ErrorKind::ContractBreach,
            WebhookError::Storage(_) => ErrorKind::ExternalToolFailure,
        }
    }
}
