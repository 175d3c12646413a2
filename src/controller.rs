use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    audit_log::{AuditLog, AuditLogError},
    domain::{DomainError, MutationRequest, State},
};

const APPLY_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
pub enum ApplyError {
    InvalidArgument(DomainError),
    Storage(AuditLogError),
    /// The writer task is gone (runtime shutting down or a panic inside it).
    Stopped,
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(e) => write!(f, "{e}"),
            Self::Storage(e) => write!(f, "failed to record mutation: {e}"),
            Self::Stopped => write!(f, "state controller is not running"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidArgument(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Stopped => None,
        }
    }
}

impl From<DomainError> for ApplyError {
    fn from(value: DomainError) -> Self {
        Self::InvalidArgument(value)
    }
}

impl From<AuditLogError> for ApplyError {
    fn from(value: AuditLogError) -> Self {
        Self::Storage(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: State,
    pub started_at: DateTime<Utc>,
}

type ComputeMutation = Box<dyn FnOnce(&State) -> MutationRequest + Send>;

struct ApplyCommand {
    compute: ComputeMutation,
    reply: oneshot::Sender<Result<State, ApplyError>>,
}

/// Sole owner of the live state.
///
/// Reads take a short read lock on the published value. Mutations are queued
/// to a single writer task which appends to the audit log and only then swaps
/// the published value, so a mutation whose caller went away still finishes
/// both steps.
#[derive(Clone)]
pub struct StateController {
    live: Arc<RwLock<State>>,
    started_at: DateTime<Utc>,
    tx: mpsc::Sender<ApplyCommand>,
}

impl StateController {
    pub async fn read(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.live.read().await.clone(),
            started_at: self.started_at,
        }
    }

    /// Overlays `req` onto the current state. An empty request is rejected by
    /// the writer before anything is appended.
    pub async fn apply(&self, req: MutationRequest) -> Result<State, ApplyError> {
        self.apply_with(move |_current| req).await
    }

    /// Computes the mutation from the current state inside the writer section.
    pub async fn apply_with<F>(&self, compute: F) -> Result<State, ApplyError>
    where
        F: FnOnce(&State) -> MutationRequest + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ApplyCommand {
                compute: Box::new(compute),
                reply,
            })
            .await
            .map_err(|_| ApplyError::Stopped)?;
        rx.await.map_err(|_| ApplyError::Stopped)?
    }
}

pub fn spawn_state_controller(
    audit_log: Arc<AuditLog>,
) -> (StateController, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ApplyCommand>(APPLY_QUEUE_DEPTH);
    let live = Arc::new(RwLock::new(State::default()));
    let controller = StateController {
        live: live.clone(),
        started_at: Utc::now(),
        tx,
    };

    let task = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            let result = apply_one(&audit_log, &live, cmd.compute).await;
            let _ = cmd.reply.send(result);
        }
        debug!("state controller stopped");
    });

    (controller, task)
}

async fn apply_one(
    audit_log: &Arc<AuditLog>,
    live: &RwLock<State>,
    compute: ComputeMutation,
) -> Result<State, ApplyError> {
    // Only this task writes `live`, so the clone is the committed value.
    let previous = live.read().await.clone();
    let req = compute(&previous);
    req.validate()?;
    let resulting = previous.overlay(&req);

    let log = audit_log.clone();
    let (prev_for_log, next_for_log) = (previous, resulting.clone());
    let appended = tokio::task::spawn_blocking(move || log.append(&prev_for_log, &next_for_log))
        .await
        .map_err(|_| ApplyError::Stopped)?;

    let record = match appended {
        Ok(record) => record,
        Err(err) => {
            warn!(error = %err, "mutation rejected: audit log append failed");
            return Err(err.into());
        }
    };

    *live.write().await = resulting.clone();
    debug!(
        record_id = record.id,
        counter = resulting.counter,
        "mutation applied"
    );
    Ok(resulting)
}
