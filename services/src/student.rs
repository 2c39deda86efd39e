//! Student dashboard: session discovery, both proof channels and history.

use crate::code_verifier::{CaptureMode, CaptureSource, CodeCapture, CodeVerifier};
use crate::error::AppError;
use crate::geolocation::Geolocator;
use crate::identity::IdentityService;
use crate::ledger::{Admission, AdmissionEvent, EVENT_DELETED, LedgerWriter};
use crate::poller::{PollHandle, PollStatus, PollTarget, PollerOptions, ProximityPoller};
use crate::roster::{EVENT_SESSION_DELETED, EVENT_SESSION_ENDED};
use chrono::Utc;
use db::models::attendance_record::{self, AdmissionMethod};
use db::models::attendance_session::{self, Model as AttendanceSession};
use db::models::user::Role;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use util::config;
use util::events::{IncomingEnvelope, Receiver, attendance_session_topic, attendance_student_topic, emit};
use util::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StudentOptions {
    pub poller: PollerOptions,
    /// Pause before the capture reopens after a rejected code.
    pub code_retry_delay: Duration,
}

impl StudentOptions {
    pub fn from_config() -> Self {
        Self {
            poller: PollerOptions::from_config(),
            code_retry_delay: Duration::from_millis(config::code_retry_delay_ms()),
        }
    }
}

/// What the dashboard offers the student right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ChannelView {
    #[default]
    NoSession,
    /// The ledger already has this student for the held session.
    AlreadyAttended,
    /// Geo polling runs; the code channel stays open alongside it.
    Geo { code_fallback: bool },
    CodeOnly,
    Recorded { method: AdmissionMethod },
}

/// Client-side state of the student dashboard.
#[derive(Default)]
pub struct StudentContext {
    session: Option<AttendanceSession>,
    poll: Option<PollHandle>,
    /// Listens for the lecturer closing the held session.
    closure: Option<CancellationToken>,
    view: ChannelView,
}

impl StudentContext {
    pub fn session(&self) -> Option<&AttendanceSession> {
        self.session.as_ref()
    }

    fn stop_polling(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
    }

    fn stop_watching(&mut self) {
        if let Some(token) = self.closure.take() {
            token.cancel();
        }
    }

    /// Cancels polling and the closure listener, forgets the session and view.
    pub fn reset(&mut self) {
        self.stop_polling();
        self.stop_watching();
        self.session = None;
        self.view = ChannelView::NoSession;
    }

    /// Folds the poller's terminal state into the view.
    fn refresh_view(&mut self) -> ChannelView {
        if let ChannelView::Geo { .. } = self.view {
            let status = self.poll.as_ref().map(PollHandle::status);
            match status {
                Some(PollStatus::Downgraded(_)) | None => self.view = ChannelView::CodeOnly,
                Some(PollStatus::Admitted) => {
                    self.view = ChannelView::Recorded {
                        method: AdmissionMethod::Geo,
                    }
                }
                _ => {}
            }
        }
        self.view
    }
}

/// One row of the student's own history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub record: attendance_record::Model,
    /// `None` once the lecturer deleted the session.
    pub session: Option<AttendanceSession>,
}

pub struct StudentDashboard<G, C> {
    state: AppState,
    identity: IdentityService,
    geo: Arc<G>,
    verifier: CodeVerifier<C>,
    ledger: LedgerWriter,
    options: StudentOptions,
    context: Arc<Mutex<StudentContext>>,
}

impl<G, C> Clone for StudentDashboard<G, C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            identity: self.identity.clone(),
            geo: self.geo.clone(),
            verifier: self.verifier.clone(),
            ledger: self.ledger.clone(),
            options: self.options,
            context: self.context.clone(),
        }
    }
}

impl<G: Geolocator, C: CodeCapture> StudentDashboard<G, C> {
    pub fn new(
        state: AppState,
        identity: IdentityService,
        geo: Arc<G>,
        capture: Arc<C>,
        options: StudentOptions,
    ) -> Self {
        Self {
            ledger: LedgerWriter::new(state.clone()),
            verifier: CodeVerifier::new(capture, options.code_retry_delay),
            state,
            identity,
            geo,
            options,
            context: Arc::new(Mutex::new(StudentContext::default())),
        }
    }

    /// Looks up the deployment's active session and arms the right channels.
    pub async fn check_for_active_session(&self) -> Result<ChannelView, AppError> {
        let (principal, profile) = self.identity.require_profile(Role::Student).await?;
        let mut ctx = self.context.lock().await;
        ctx.stop_polling();

        let active = attendance_session::Model::find_active(self.state.db(), Utc::now()).await?;
        if active.len() > 1 {
            tracing::warn!(
                "{} active sessions found, using the most recent ({})",
                active.len(),
                active[0].id
            );
        }

        let Some(session) = active.into_iter().next() else {
            ctx.reset();
            self.ledger.reset();
            return Ok(ChannelView::NoSession);
        };

        if ctx.session.as_ref().is_none_or(|s| s.id != session.id) {
            self.ledger.reset();
        }

        let existing =
            attendance_record::Model::find_one(self.state.db(), &session.id, principal.id).await?;
        let view = if existing.is_some() {
            self.ledger.mark_recorded();
            ChannelView::AlreadyAttended
        } else {
            let target = PollTarget {
                session: session.clone(),
                principal,
                profile,
            };
            match ProximityPoller::spawn(
                self.geo.clone(),
                self.ledger.clone(),
                target,
                self.options.poller,
            ) {
                Some(handle) => {
                    ctx.poll = Some(handle);
                    ChannelView::Geo {
                        code_fallback: true,
                    }
                }
                None => ChannelView::CodeOnly,
            }
        };

        ctx.stop_watching();
        let rx = self.state.bus().subscribe(&attendance_session_topic(&session.id)).await;
        let token = CancellationToken::new();
        self.watch_for_closure(session.id.clone(), rx, token.clone());

        tracing::info!("Holding session {} ({view:?})", session.id);
        ctx.session = Some(session);
        ctx.closure = Some(token);
        ctx.view = view;
        Ok(view)
    }

    fn watch_for_closure(&self, session_id: String, rx: Receiver, token: CancellationToken) {
        let dashboard = self.clone();
        tokio::spawn(async move {
            if wait_for_closure(&session_id, rx, &token).await {
                dashboard.drop_session(&session_id).await;
            }
        });
    }

    /// Forgets `session_id` if it is still the held session.
    async fn drop_session(&self, session_id: &str) {
        let mut ctx = self.context.lock().await;
        if ctx.session.as_ref().is_none_or(|s| s.id != session_id) {
            return;
        }
        ctx.reset();
        self.ledger.reset();
        self.verifier.cancel_pending_reopen();
        tracing::info!("Session {session_id} was closed by the lecturer");
    }

    pub async fn current_session(&self) -> Option<AttendanceSession> {
        self.context.lock().await.session.clone()
    }

    pub async fn view(&self) -> ChannelView {
        self.context.lock().await.refresh_view()
    }

    pub async fn poll_status(&self) -> Option<PollStatus> {
        self.context.lock().await.poll.as_ref().map(PollHandle::status)
    }

    pub async fn poll_updates(&self) -> Option<watch::Receiver<PollStatus>> {
        self.context.lock().await.poll.as_ref().map(PollHandle::subscribe)
    }

    pub async fn open_scanner(&self) -> Result<CaptureMode, AppError> {
        let ctx = self.context.lock().await;
        self.verifier.open(ctx.session.as_ref()).await
    }

    /// Stops geo polling for good and leaves only the code channel.
    pub async fn switch_to_code_channel(&self) -> Result<ChannelView, AppError> {
        let mut ctx = self.context.lock().await;
        if ctx.session.is_none() {
            return Err(AppError::NoActiveSession);
        }
        ctx.stop_polling();
        if matches!(ctx.view, ChannelView::Geo { .. }) {
            ctx.view = ChannelView::CodeOnly;
        }
        tracing::info!("Student switched to the code channel");
        Ok(ctx.view)
    }

    /// Verifies a scanned or typed code and records the admission.
    pub async fn submit_code(&self, raw: &str, source: CaptureSource) -> Result<Admission, AppError> {
        let (principal, profile) = self.identity.require_profile(Role::Student).await?;
        let mut ctx = self.context.lock().await;

        if ctx.session.as_ref().is_some_and(|s| !s.is_open_at(Utc::now())) {
            tracing::info!("Held session lapsed before the code was submitted");
            ctx.reset();
        }

        self.verifier.verify(ctx.session.as_ref(), raw, source).await?;
        let Some(session) = ctx.session.clone() else {
            return Err(AppError::NoActiveSession);
        };

        let admission = match self
            .ledger
            .admit(&session, &principal, &profile, AdmissionMethod::Qr)
            .await
        {
            Err(AppError::NoActiveSession) => {
                ctx.reset();
                return Err(AppError::NoActiveSession);
            }
            other => other?,
        };

        ctx.stop_polling();
        ctx.view = match &admission {
            Admission::Recorded(_) => ChannelView::Recorded {
                method: AdmissionMethod::Qr,
            },
            Admission::AlreadyAdmitted => ChannelView::AlreadyAttended,
        };
        Ok(admission)
    }

    /// The student's records, newest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, AppError> {
        let principal = self.identity.require_principal()?;
        let db = self.state.db();
        let mut records = attendance_record::Model::find_for_student(db, principal.id).await?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let ids: Vec<String> = records.iter().map(|r| r.session_id.clone()).collect();
        let sessions: HashMap<String, AttendanceSession> = attendance_session::Entity::find()
            .filter(attendance_session::Column::Id.is_in(ids))
            .all(db)
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        Ok(records
            .into_iter()
            .map(|record| HistoryEntry {
                session: sessions.get(&record.session_id).cloned(),
                record,
            })
            .collect())
    }

    /// Removes one of the student's own records.
    pub async fn delete_record(&self, session_id: &str) -> Result<(), AppError> {
        let principal = self.identity.require_principal()?;
        let db = self.state.db();
        let Some(record) = attendance_record::Model::find_one(db, session_id, principal.id).await? else {
            return Err(AppError::NotFound("Attendance record".into()));
        };
        if !attendance_record::Model::delete(db, session_id, principal.id).await? {
            return Err(AppError::NotFound("Attendance record".into()));
        }

        let count = attendance_record::Model::count_for_session(db, session_id).await?;
        let event = AdmissionEvent {
            session_id: record.session_id,
            student_id: record.student_id,
            name: record.name,
            level: record.level,
            method: None,
            timestamp: None,
            count,
        };
        let bus = self.state.bus();
        emit(bus, &attendance_session_topic(session_id), EVENT_DELETED, &event).await;
        emit(bus, &attendance_student_topic(principal.id), EVENT_DELETED, &event).await;

        let mut ctx = self.context.lock().await;
        if ctx.session.as_ref().is_some_and(|s| s.id == session_id) {
            self.ledger.reset();
            ctx.stop_polling();
            ctx.view = ChannelView::CodeOnly;
        }
        tracing::info!("Student {} deleted their record for {session_id}", principal.id);
        Ok(())
    }

    /// Clears the dashboard together with the ledger flag, e.g. on logout.
    pub async fn reset(&self) {
        let mut ctx = self.context.lock().await;
        ctx.reset();
        self.ledger.reset();
        self.verifier.cancel_pending_reopen();
    }

    /// Resets the dashboard whenever the student signs out.
    pub fn reset_on_logout(&self) -> JoinHandle<()> {
        let dashboard = self.clone();
        self.identity.on_principal_change(move |principal| {
            if principal.is_none() {
                let dashboard = dashboard.clone();
                tokio::spawn(async move { dashboard.reset().await });
            }
        })
    }
}

/// Resolves to `true` once the session is ended or deleted, `false` when the
/// listener is cancelled or the topic goes away.
async fn wait_for_closure(session_id: &str, mut rx: Receiver, token: &CancellationToken) -> bool {
    loop {
        let msg = tokio::select! {
            biased;
            _ = token.cancelled() => return false,
            msg = rx.recv() => msg,
        };
        match msg {
            Ok(raw) => {
                let Some(env) = IncomingEnvelope::parse(&raw) else {
                    continue;
                };
                if env.event == EVENT_SESSION_ENDED || env.event == EVENT_SESSION_DELETED {
                    return true;
                }
            }
            Err(RecvError::Lagged(n)) => {
                tracing::debug!("Closure listener of {session_id} lagged by {n} events");
            }
            Err(RecvError::Closed) => return false,
        }
    }
}
