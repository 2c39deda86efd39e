//! Geo-channel admission: periodic proximity sampling against a session's
//! fixed reference point.

use crate::error::AppError;
use crate::geodesy::{Coordinate, haversine_distance, within_radius};
use crate::geolocation::{GeoError, Geolocator, PositionOptions};
use crate::identity::{Principal, Profile};
use crate::ledger::{Admission, LedgerWriter};
use chrono::Utc;
use db::models::attendance_record::AdmissionMethod;
use db::models::attendance_session::Model as AttendanceSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use util::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerOptions {
    pub interval: Duration,
    /// Per-sample bound. Capped at `interval` when sampling.
    pub sample_timeout: Duration,
}

impl PollerOptions {
    pub fn from_config() -> Self {
        Self {
            interval: Duration::from_secs(config::geo_poll_interval_secs().max(1)),
            sample_timeout: Duration::from_millis(config::geo_sample_timeout_ms().max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Waiting,
    /// Last successful sample, out of range.
    Distance { meters: f64, radius: f64 },
    Admitted,
    /// Geo channel abandoned; only the code channel remains.
    Downgraded(GeoError),
    Stopped,
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PollStatus::Admitted | PollStatus::Downgraded(_) | PollStatus::Stopped
        )
    }
}

/// Everything one poll run needs to write an admission.
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub session: AttendanceSession,
    pub principal: Principal,
    pub profile: Profile,
}

/// A running poll. Cancelled when dropped.
pub struct PollHandle {
    token: CancellationToken,
    status: watch::Receiver<PollStatus>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn status(&self) -> PollStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Waits for the poll task to exit.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct ProximityPoller;

impl ProximityPoller {
    /// Starts polling, or returns `None` for a session without a reference point.
    ///
    /// The first sample is taken immediately. The task ends on admission, on a
    /// permission or availability error, once the session lapses or is closed,
    /// or when the handle is cancelled.
    pub fn spawn<G: Geolocator>(
        geo: Arc<G>,
        ledger: LedgerWriter,
        target: PollTarget,
        options: PollerOptions,
    ) -> Option<PollHandle> {
        let reference = Coordinate::from(target.session.reference_point()?);
        let token = CancellationToken::new();
        let (status_tx, status) = watch::channel(PollStatus::Waiting);

        let task = tokio::spawn(run(
            geo,
            ledger,
            target,
            reference,
            options,
            status_tx,
            token.clone(),
        ));

        Some(PollHandle {
            token,
            status,
            task: Some(task),
        })
    }
}

async fn run<G: Geolocator>(
    geo: Arc<G>,
    ledger: LedgerWriter,
    target: PollTarget,
    reference: Coordinate,
    options: PollerOptions,
    status: watch::Sender<PollStatus>,
    token: CancellationToken,
) {
    let session_id = target.session.id.as_str();
    let radius = f64::from(target.session.radius);
    let sample_timeout = options.sample_timeout.min(options.interval);

    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Proximity polling for session {session_id} every {:?}",
        options.interval
    );

    let last = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break PollStatus::Stopped,
            _ = ticker.tick() => {}
        }

        if ledger.is_recorded() {
            break PollStatus::Stopped;
        }
        if !target.session.is_open_at(Utc::now()) {
            tracing::info!("Session {session_id} lapsed, stopping proximity polling");
            break PollStatus::Stopped;
        }

        let request = geo.current_position(PositionOptions::fresh(sample_timeout));
        let sample = tokio::select! {
            biased;
            _ = token.cancelled() => break PollStatus::Stopped,
            r = tokio::time::timeout(sample_timeout, request) => r,
        };

        let position = match sample {
            Ok(Ok(position)) => position,
            Ok(Err(GeoError::Timeout)) | Err(_) => {
                tracing::debug!("Location sample timed out, waiting for the next poll");
                continue;
            }
            Ok(Err(e)) => {
                tracing::warn!("Location sampling failed ({e}), falling back to code proof");
                break PollStatus::Downgraded(e);
            }
        };

        let meters = haversine_distance(reference, position);
        tracing::debug!("Distance to session {session_id}: {meters:.1} m (radius {radius} m)");

        if !within_radius(meters, radius) {
            status.send_replace(PollStatus::Distance { meters, radius });
            continue;
        }

        match ledger
            .admit(&target.session, &target.principal, &target.profile, AdmissionMethod::Geo)
            .await
        {
            Ok(Admission::Recorded(_)) => break PollStatus::Admitted,
            Ok(Admission::AlreadyAdmitted) => break PollStatus::Stopped,
            Err(AppError::NoActiveSession) => {
                tracing::info!("Session {session_id} closed, stopping proximity polling");
                break PollStatus::Stopped;
            }
            Err(e) => {
                tracing::warn!("Geo admission failed ({e}), polling continues");
                status.send_replace(PollStatus::Waiting);
            }
        }
    };

    tracing::info!("Proximity polling for session {session_id} ended: {last:?}");
    status.send_replace(last);
}
