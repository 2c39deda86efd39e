use crate::error::AppError;
use crate::identity::{Principal, Profile};
use chrono::{DateTime, Utc};
use db::models::attendance_record::{self, AdmissionMethod, NewRecord};
use db::models::attendance_session::{self, Model as AttendanceSession};
use sea_orm::{DbErr, TransactionTrait};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use util::events::{attendance_session_topic, attendance_student_topic, emit};
use util::state::AppState;

pub const EVENT_MARKED: &str = "attendance.marked";
pub const EVENT_DELETED: &str = "attendance.deleted";

/// Result of a successful call to [`LedgerWriter::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Recorded(attendance_record::Model),
    /// Nothing written; this client or the store already had the admission.
    AlreadyAdmitted,
}

/// Payload of `attendance.marked` and `attendance.deleted`.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionEvent {
    pub session_id: String,
    pub student_id: i64,
    pub name: String,
    pub level: Option<String>,
    pub method: Option<AdmissionMethod>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Ledger rows for the session after the change.
    pub count: u64,
}

/// Writes admissions at most once per client.
///
/// `recorded` is raised before the write goes out so that a geo sample and a
/// code submission landing together only issue one write. Storage-level
/// uniqueness covers the cross-client case.
#[derive(Clone)]
pub struct LedgerWriter {
    state: AppState,
    recorded: Arc<AtomicBool>,
}

impl LedgerWriter {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            recorded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::SeqCst)
    }

    /// Raises the flag for an admission found on the ledger at discovery.
    pub fn mark_recorded(&self) {
        self.recorded.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.recorded.store(false, Ordering::SeqCst);
    }

    pub async fn admit(
        &self,
        session: &AttendanceSession,
        principal: &Principal,
        profile: &Profile,
        method: AdmissionMethod,
    ) -> Result<Admission, AppError> {
        if self.recorded.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                "Admission of {} to {} already in flight, skipping {method} write",
                principal.id,
                session.id
            );
            return Ok(Admission::AlreadyAdmitted);
        }

        let new = NewRecord {
            session_id: session.id.clone(),
            student_id: principal.id,
            name: profile.name.clone(),
            level: profile.level.clone(),
            method,
        };

        let record = match self.write_if_open(new).await {
            Ok(WriteOutcome::Written(record)) => record,
            Ok(WriteOutcome::Present) => {
                tracing::info!(
                    "Student {} already on the ledger for session {}",
                    principal.id,
                    session.id
                );
                return Ok(Admission::AlreadyAdmitted);
            }
            Ok(WriteOutcome::SessionClosed) => {
                self.recorded.store(false, Ordering::SeqCst);
                tracing::info!(
                    "Session {} no longer admits, dropping {method} admission of {}",
                    session.id,
                    principal.id
                );
                return Err(AppError::NoActiveSession);
            }
            Err(e) => {
                self.recorded.store(false, Ordering::SeqCst);
                tracing::error!(
                    "Failed to record attendance of {} for {}: {e}",
                    principal.id,
                    session.id
                );
                return Err(AppError::WriteFailed);
            }
        };

        tracing::info!(
            "Recorded {} attendance of student {} for session {}",
            record.method,
            record.student_id,
            record.session_id
        );

        let db = self.state.db();
        let count = match attendance_record::Model::count_for_session(db, &session.id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Could not count records of {}: {e}", session.id);
                0
            }
        };

        let event = AdmissionEvent {
            session_id: record.session_id.clone(),
            student_id: record.student_id,
            name: record.name.clone(),
            level: record.level.clone(),
            method: Some(record.method),
            timestamp: Some(record.timestamp),
            count,
        };
        let bus = self.state.bus();
        emit(bus, &attendance_session_topic(&session.id), EVENT_MARKED, &event).await;
        emit(bus, &attendance_student_topic(principal.id), EVENT_MARKED, &event).await;

        Ok(Admission::Recorded(record))
    }

    /// Re-reads the session row and inserts only while it still admits.
    /// Closing a session counts its rows in a transaction of its own, so a
    /// write either lands before that count or not at all.
    async fn write_if_open(&self, new: NewRecord) -> Result<WriteOutcome, DbErr> {
        let txn = self.state.db().begin().await?;
        let open = attendance_session::Model::get(&txn, &new.session_id)
            .await?
            .is_some_and(|s| s.is_open_at(Utc::now()));
        if !open {
            txn.rollback().await?;
            return Ok(WriteOutcome::SessionClosed);
        }

        let outcome = match attendance_record::Model::insert_if_absent(&txn, new).await? {
            Some(record) => WriteOutcome::Written(record),
            None => WriteOutcome::Present,
        };
        txn.commit().await?;
        Ok(outcome)
    }
}

enum WriteOutcome {
    Written(attendance_record::Model),
    Present,
    SessionClosed,
}
