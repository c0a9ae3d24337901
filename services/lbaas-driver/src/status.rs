//! Lifecycle status values and the status-reporting seam.
//!
//! The orchestration platform owns resource status. This crate only pushes
//! transitions to it through a [`StatusReporter`]. Reporting is synchronous
//! and infallible from our side so that it can run from `Drop`, which is how
//! the operation context guarantees a terminal status on every exit path.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::resource::ResourceRef;

/// Kind of call being made against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
    Read,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Read => "read",
        }
    }

    /// Status reported on entry, `None` for reads.
    pub fn pending_status(&self) -> Option<OperationStatus> {
        match self {
            Self::Create => Some(OperationStatus::PendingCreate),
            Self::Update => Some(OperationStatus::PendingUpdate),
            Self::Delete => Some(OperationStatus::PendingDelete),
            Self::Read => None,
        }
    }

    /// Status reported when the call completes without error.
    pub fn success_status(&self) -> OperationStatus {
        match self {
            Self::Delete => OperationStatus::Deleted,
            _ => OperationStatus::Active,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource status as seen by the orchestration platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Active,
    Error,
    Deleted,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingCreate => "pending_create",
            Self::PendingUpdate => "pending_update",
            Self::PendingDelete => "pending_delete",
            Self::Active => "active",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    /// Returns true for `active`, `error` and `deleted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Active | Self::Error | Self::Deleted)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_create" => Ok(Self::PendingCreate),
            "pending_update" => Ok(Self::PendingUpdate),
            "pending_delete" => Ok(Self::PendingDelete),
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// Receives status transitions for the orchestration platform.
pub trait StatusReporter: Send + Sync {
    fn report(&self, resource: &ResourceRef, status: OperationStatus);
}

/// Reporter that only logs transitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusReporter;

impl StatusReporter for LoggingStatusReporter {
    fn report(&self, resource: &ResourceRef, status: OperationStatus) {
        info!(
            tenant_id = %resource.tenant_id,
            resource = %resource,
            status = %status,
            "Status transition"
        );
    }
}

/// A status transition, as delivered by [`ChannelStatusReporter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub resource: ResourceRef,
    pub status: OperationStatus,
    pub at: DateTime<Utc>,
}

/// Reporter that forwards transitions to an unbounded channel.
///
/// The receiving side is expected to write them to the platform. A closed
/// receiver drops updates with a warning.
#[derive(Debug, Clone)]
pub struct ChannelStatusReporter {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelStatusReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusReporter for ChannelStatusReporter {
    fn report(&self, resource: &ResourceRef, status: OperationStatus) {
        let update = StatusUpdate {
            resource: resource.clone(),
            status,
            at: Utc::now(),
        };
        if self.tx.send(update).is_err() {
            warn!(resource = %resource, status = %status, "Status receiver closed, update dropped");
        }
    }
}

/// Reporter that keeps every transition in memory (for testing).
#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    updates: Mutex<Vec<(ResourceRef, OperationStatus)>>,
}

impl RecordingStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All transitions, in report order.
    pub fn updates(&self) -> Vec<(ResourceRef, OperationStatus)> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Transitions reported for one resource, in order.
    pub fn statuses_for(&self, resource: &ResourceRef) -> Vec<OperationStatus> {
        self.updates()
            .into_iter()
            .filter(|(r, _)| r == resource)
            .map(|(_, s)| s)
            .collect()
    }

    /// Last status reported for `resource`.
    pub fn last(&self, resource: &ResourceRef) -> Option<OperationStatus> {
        self.statuses_for(resource).pop()
    }
}

impl StatusReporter for RecordingStatusReporter {
    fn report(&self, resource: &ResourceRef, status: OperationStatus) {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((resource.clone(), status));
    }
}
