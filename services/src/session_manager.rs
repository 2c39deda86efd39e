//! Lecturer dashboard: session lifecycle, live roster and reports.
//!
//! A lecturer client holds at most one session at a time in its
//! [`LecturerContext`]. Creating one captures the reference point, writes the
//! session in two phases, opens the roster and arms the expiry timer. Ending it,
//! by hand or by the timer, tears all of that down before the row is closed.

use crate::error::{AppError, format_validation_errors};
use crate::geolocation::{GeoAcquisition, Geolocator, acquire_reference_point};
use crate::identity::IdentityService;
use crate::roster::{EVENT_SESSION_DELETED, EVENT_SESSION_ENDED, RosterEntry, RosterView, SortOrder};
use chrono::{DateTime, SecondsFormat, Utc};
use db::models::attendance_record;
use db::models::attendance_session::{self, Model as AttendanceSession, NewSession};
use db::models::user::Role;
use sea_orm::TransactionTrait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use util::config;
use util::events::{attendance_session_topic, emit};
use util::state::AppState;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewSessionRequest {
    #[validate(range(min = 1, max = 1000, message = "Radius must be between 1 and 1000 meters"))]
    pub radius: i32,
    #[validate(range(min = 1, max = 480, message = "Duration must be between 1 and 480 minutes"))]
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LecturerOptions {
    /// Bound on the one-shot location request at creation.
    pub acquire_timeout: Duration,
}

impl LecturerOptions {
    pub fn from_config() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(config::geo_acquire_timeout_ms().max(1)),
        }
    }
}

/// Client-side state of the lecturer dashboard.
#[derive(Default)]
pub struct LecturerContext {
    session: Option<AttendanceSession>,
    roster: Option<RosterView>,
    expiry: Option<CancellationToken>,
}

impl LecturerContext {
    pub fn session(&self) -> Option<&AttendanceSession> {
        self.session.as_ref()
    }

    /// Cancels the timer, releases the roster and forgets the session.
    pub async fn reset(&mut self) {
        if let Some(token) = self.expiry.take() {
            token.cancel();
        }
        if let Some(mut roster) = self.roster.take() {
            roster.close().await;
        }
        self.session = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    pub session: AttendanceSession,
    pub records: Vec<attendance_record::Model>,
    /// Counted from `records`, not the stored counter.
    pub count: usize,
}

#[derive(Debug, Serialize)]
struct SessionClosedEvent<'a> {
    session_id: &'a str,
    attendance_count: i64,
}

pub struct SessionManager<G> {
    state: AppState,
    identity: IdentityService,
    geo: Arc<G>,
    options: LecturerOptions,
    context: Arc<Mutex<LecturerContext>>,
}

impl<G> Clone for SessionManager<G> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            identity: self.identity.clone(),
            geo: self.geo.clone(),
            options: self.options,
            context: self.context.clone(),
        }
    }
}

impl<G: Geolocator> SessionManager<G> {
    pub fn new(state: AppState, identity: IdentityService, geo: Arc<G>, options: LecturerOptions) -> Self {
        Self {
            state,
            identity,
            geo,
            options,
            context: Arc::new(Mutex::new(LecturerContext::default())),
        }
    }

    pub async fn current_session(&self) -> Option<AttendanceSession> {
        self.context.lock().await.session.clone()
    }

    pub async fn create_session(&self, req: NewSessionRequest) -> Result<AttendanceSession, AppError> {
        req.validate()
            .map_err(|e| AppError::Validation(format_validation_errors(&e)))?;
        let (principal, profile) = self.identity.require_profile(Role::Lecturer).await?;

        let mut ctx = self.context.lock().await;
        if ctx.session.is_some() {
            return Err(AppError::SessionAlreadyActive);
        }

        let acquisition = acquire_reference_point(&*self.geo, self.options.acquire_timeout).await;
        if let GeoAcquisition::Fallback(reason) = acquisition {
            tracing::info!("Session of lecturer {} will be code-only ({reason})", principal.id);
        }

        let new = NewSession {
            lecturer_id: principal.id,
            lecturer_name: profile.name.clone(),
            duration: chrono::Duration::minutes(req.duration_minutes),
            radius: req.radius,
            reference: acquisition.coordinate().map(|c| (c.latitude, c.longitude)),
        };

        let db = self.state.db();
        let txn = db.begin().await?;
        let open = attendance_session::Model::find_active(&txn, Utc::now()).await?;
        if let Some(existing) = open.first() {
            tracing::warn!(
                "Refusing new session for lecturer {}: session {} is still active",
                principal.id,
                existing.id
            );
            txn.rollback().await?;
            return Err(AppError::ConflictingActiveSession);
        }
        let created = attendance_session::Model::create(&txn, new).await?;
        txn.commit().await?;

        let session = attendance_session::Model::set_qr_value(db, &created.id).await?;
        let roster = RosterView::open(self.state.clone(), &session.id).await?;

        let token = CancellationToken::new();
        self.spawn_expiry(&session, token.clone());

        tracing::info!(
            "Session {} started by lecturer {} (geo: {}, radius {} m, ends {})",
            session.id,
            principal.id,
            session.geo_enabled,
            session.radius,
            session.end_time
        );

        ctx.session = Some(session.clone());
        ctx.roster = Some(roster);
        ctx.expiry = Some(token);
        Ok(session)
    }

    fn spawn_expiry(&self, session: &AttendanceSession, token: CancellationToken) {
        let manager = self.clone();
        let session_id = session.id.clone();
        let wait = (session.end_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    tracing::info!("Session {session_id} reached its end time");
                    if let Err(e) = manager.end_session_if_current(&session_id).await {
                        tracing::error!("Timed end of session {session_id} failed: {e}");
                    }
                }
            }
        });
    }

    /// Ends the held session and returns its closed row.
    pub async fn end_session(&self) -> Result<AttendanceSession, AppError> {
        let mut ctx = self.context.lock().await;
        if ctx.session.is_none() {
            return Err(AppError::NoActiveSession);
        }
        self.end_held(&mut ctx).await
    }

    /// Ends the held session only if it is still `session_id`.
    pub async fn end_session_if_current(
        &self,
        session_id: &str,
    ) -> Result<Option<AttendanceSession>, AppError> {
        let mut ctx = self.context.lock().await;
        if !ctx.session.as_ref().is_some_and(|s| s.id == session_id) {
            return Ok(None);
        }
        self.end_held(&mut ctx).await.map(Some)
    }

    async fn end_held(&self, ctx: &mut LecturerContext) -> Result<AttendanceSession, AppError> {
        let Some(session_id) = ctx.session.as_ref().map(|s| s.id.clone()) else {
            return Err(AppError::NoActiveSession);
        };

        if let Some(token) = ctx.expiry.take() {
            token.cancel();
        }
        if let Some(mut roster) = ctx.roster.take() {
            roster.close().await;
        }

        let closed = self.close_and_announce(&session_id, Utc::now()).await?;
        ctx.session = None;
        Ok(closed)
    }

    /// Counts the ledger and flips the row in one transaction, so no admission
    /// can land between the two. Listeners hear about it afterwards.
    async fn close_and_announce(
        &self,
        session_id: &str,
        closed_at: DateTime<Utc>,
    ) -> Result<AttendanceSession, AppError> {
        let txn = self.state.db().begin().await?;
        let count = attendance_record::Model::count_for_session(&txn, session_id).await?;
        let attendance_count = i64::try_from(count).unwrap_or(i64::MAX);
        let closed = attendance_session::Model::close(&txn, session_id, attendance_count, closed_at).await?;
        txn.commit().await?;

        emit(
            self.state.bus(),
            &attendance_session_topic(session_id),
            EVENT_SESSION_ENDED,
            &SessionClosedEvent {
                session_id,
                attendance_count,
            },
        )
        .await;

        tracing::info!("Session {session_id} ended with {attendance_count} attendees");
        Ok(closed)
    }

    /// Ends one of the lecturer's sessions by id, whether or not this client
    /// holds it. A row left open by a logout or restart is closed at its
    /// original end time if that has already passed.
    pub async fn end_session_by_id(&self, session_id: &str) -> Result<AttendanceSession, AppError> {
        let session = self.owned_session(session_id).await?;
        if let Some(closed) = self.end_session_if_current(session_id).await? {
            return Ok(closed);
        }
        if !session.active {
            return Err(AppError::NoActiveSession);
        }
        let closed_at = Utc::now().min(session.end_time);
        self.close_and_announce(session_id, closed_at).await
    }

    /// Takes back the lecturer's own open session, e.g. after signing in
    /// again. Re-opens the roster and re-arms the expiry timer.
    pub async fn resume_session(&self) -> Result<Option<AttendanceSession>, AppError> {
        let (principal, _) = self.identity.require_profile(Role::Lecturer).await?;
        let mut ctx = self.context.lock().await;
        if let Some(held) = &ctx.session {
            return Ok(Some(held.clone()));
        }

        let open = attendance_session::Model::find_active(self.state.db(), Utc::now()).await?;
        let Some(session) = open.into_iter().find(|s| s.lecturer_id == principal.id) else {
            return Ok(None);
        };

        let roster = RosterView::open(self.state.clone(), &session.id).await?;
        let token = CancellationToken::new();
        self.spawn_expiry(&session, token.clone());
        tracing::info!("Lecturer {} resumed session {}", principal.id, session.id);

        ctx.session = Some(session.clone());
        ctx.roster = Some(roster);
        ctx.expiry = Some(token);
        Ok(Some(session))
    }

    /// Entries of the live roster, or `None` when no session is held.
    pub async fn roster(&self, order: SortOrder) -> Option<Vec<RosterEntry>> {
        let ctx = self.context.lock().await;
        ctx.roster.as_ref().map(|r| r.entries(order))
    }

    pub async fn roster_count(&self) -> Option<usize> {
        let ctx = self.context.lock().await;
        ctx.roster.as_ref().map(RosterView::count)
    }

    /// Revision counter of the live roster; changes after every refresh.
    pub async fn roster_changes(&self) -> Option<watch::Receiver<u64>> {
        let ctx = self.context.lock().await;
        ctx.roster.as_ref().map(RosterView::changes)
    }

    pub async fn list_sessions(&self) -> Result<Vec<AttendanceSession>, AppError> {
        let (principal, _) = self.identity.require_profile(Role::Lecturer).await?;
        Ok(attendance_session::Model::find_for_lecturer(self.state.db(), principal.id).await?)
    }

    pub async fn session_details(&self, session_id: &str) -> Result<SessionDetails, AppError> {
        let session = self.owned_session(session_id).await?;
        let records = attendance_record::Model::find_for_session(self.state.db(), session_id).await?;
        Ok(SessionDetails {
            count: records.len(),
            session,
            records,
        })
    }

    /// Deletes one of the lecturer's sessions, ending it first if held.
    /// Its records stay on the ledger.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), AppError> {
        self.owned_session(session_id).await?;
        self.end_session_if_current(session_id).await?;

        if !attendance_session::Model::delete(self.state.db(), session_id).await? {
            return Err(AppError::NotFound("Session".into()));
        }

        emit(
            self.state.bus(),
            &attendance_session_topic(session_id),
            EVENT_SESSION_DELETED,
            &serde_json::json!({ "session_id": session_id }),
        )
        .await;
        tracing::info!("Session {session_id} deleted");
        Ok(())
    }

    /// CSV report of a session's records in admission order.
    pub async fn export_csv(&self, session_id: &str) -> Result<String, AppError> {
        self.owned_session(session_id).await?;
        let records = attendance_record::Model::find_for_session(self.state.db(), session_id).await?;

        fn esc(s: &str) -> String {
            if s.contains(',') || s.contains('"') || s.contains('\n') {
                format!("\"{}\"", s.replace('"', "\"\""))
            } else {
                s.to_string()
            }
        }

        let mut csv = String::from("name,level,method,time\n");
        for r in records {
            csv.push_str(&format!(
                "{},{},{},{}\n",
                esc(&r.name),
                esc(r.level.as_deref().unwrap_or("")),
                r.method,
                r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        Ok(csv)
    }

    /// Clears the dashboard, e.g. on logout. The session row is left as is.
    pub async fn reset(&self) {
        self.context.lock().await.reset().await;
    }

    /// Resets the dashboard whenever the lecturer signs out.
    pub fn reset_on_logout(&self) -> JoinHandle<()> {
        let manager = self.clone();
        self.identity.on_principal_change(move |principal| {
            if principal.is_none() {
                let manager = manager.clone();
                tokio::spawn(async move { manager.reset().await });
            }
        })
    }

    async fn owned_session(&self, session_id: &str) -> Result<AttendanceSession, AppError> {
        let (principal, _) = self.identity.require_profile(Role::Lecturer).await?;
        match attendance_session::Model::get(self.state.db(), session_id).await? {
            Some(s) if s.lecturer_id == principal.id => Ok(s),
            _ => Err(AppError::NotFound("Session".into())),
        }
    }
}
