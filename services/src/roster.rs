//! Lecturer-side live view of one session's admissions.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use db::models::attendance_record::{self, AdmissionMethod};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use util::events::{IncomingEnvelope, Receiver, attendance_session_topic};
use util::state::AppState;

pub const EVENT_SESSION_ENDED: &str = "attendance.session_ended";
pub const EVENT_SESSION_DELETED: &str = "attendance.session_deleted";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub student_id: i64,
    pub name: String,
    pub level: Option<String>,
    pub method: AdmissionMethod,
    pub timestamp: DateTime<Utc>,
}

impl From<attendance_record::Model> for RosterEntry {
    fn from(r: attendance_record::Model) -> Self {
        Self {
            student_id: r.student_id,
            name: r.name,
            level: r.level,
            method: r.method,
            timestamp: r.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Admission time ascending.
    #[default]
    FirstAttended,
    /// Name ascending, case-insensitive.
    Alphabetical,
}

/// Live admissions of one session.
///
/// The entry set is re-fetched from the ledger on every change notification
/// and the count is derived from it; the session's stored counter is never
/// consulted. The view must be [`close`](RosterView::close)d when the session
/// ends. Dropping it cancels the listener as well.
pub struct RosterView {
    session_id: String,
    entries: Arc<RwLock<Vec<RosterEntry>>>,
    revision: watch::Receiver<u64>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RosterView {
    pub async fn open(state: AppState, session_id: &str) -> Result<Self, AppError> {
        // Subscribe before the initial load so no admission slips between.
        let rx = state.bus().subscribe(&attendance_session_topic(session_id)).await;
        let initial = load(&state, session_id).await?;

        let entries = Arc::new(RwLock::new(initial));
        let (revision_tx, revision) = watch::channel(0u64);
        let token = CancellationToken::new();

        let task = tokio::spawn(listen(
            state,
            session_id.to_owned(),
            rx,
            entries.clone(),
            revision_tx,
            token.clone(),
        ));

        tracing::debug!("Roster view opened for session {session_id}");
        Ok(Self {
            session_id: session_id.to_owned(),
            entries,
            revision,
            token,
            task: Some(task),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// A fresh sort of the current set.
    pub fn entries(&self, order: SortOrder) -> Vec<RosterEntry> {
        let mut rows = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sort_entries(&mut rows, order);
        rows
    }

    pub fn count(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Bumped after every refresh.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.clone()
    }

    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops listening and waits until the subscription is released.
    pub async fn close(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
            tracing::debug!("Roster view closed for session {}", self.session_id);
        }
    }
}

impl Drop for RosterView {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub fn sort_entries(rows: &mut [RosterEntry], order: SortOrder) {
    match order {
        SortOrder::FirstAttended => rows.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.student_id.cmp(&b.student_id))
        }),
        SortOrder::Alphabetical => rows.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.name.cmp(&b.name))
                .then(a.student_id.cmp(&b.student_id))
        }),
    }
}

async fn load(state: &AppState, session_id: &str) -> Result<Vec<RosterEntry>, AppError> {
    let rows = attendance_record::Model::find_for_session(state.db(), session_id).await?;
    Ok(rows.into_iter().map(RosterEntry::from).collect())
}

async fn listen(
    state: AppState,
    session_id: String,
    mut rx: Receiver,
    entries: Arc<RwLock<Vec<RosterEntry>>>,
    revision: watch::Sender<u64>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            msg = rx.recv() => msg,
        };

        match msg {
            Ok(raw) => {
                let Some(env) = IncomingEnvelope::parse(&raw) else {
                    tracing::warn!("Ignoring malformed event on session {session_id}");
                    continue;
                };
                if env.event == EVENT_SESSION_ENDED || env.event == EVENT_SESSION_DELETED {
                    tracing::debug!("Roster of {session_id} saw {}, stopping", env.event);
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                tracing::debug!("Roster of {session_id} lagged by {n} events, reloading");
            }
            Err(RecvError::Closed) => break,
        }

        match load(&state, &session_id).await {
            Ok(rows) => {
                *entries.write().unwrap_or_else(PoisonError::into_inner) = rows;
                revision.send_modify(|r| *r += 1);
            }
            Err(e) => tracing::error!("Failed to refresh roster of {session_id}: {e}"),
        }
    }
}
