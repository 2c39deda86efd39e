//! Scripted stand-ins for the device boundaries, shared by unit and
//! integration tests.

use crate::code_verifier::{CaptureError, CodeCapture};
use crate::geodesy::Coordinate;
use crate::geolocation::{GeoError, Geolocator, PermissionState, PositionOptions};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use util::{events::EventBus, state::AppState};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store with all migrations applied, plus a fresh event bus.
pub async fn setup_test_state() -> AppState {
    AppState::new(db::test_utils::setup_test_db().await, EventBus::new())
}

/// Answers position requests from a queue, then repeats a standing answer.
pub struct ScriptedGeolocator {
    permission: Mutex<PermissionState>,
    script: Mutex<VecDeque<Result<Coordinate, GeoError>>>,
    standing: Mutex<Result<Coordinate, GeoError>>,
    delay: Option<Duration>,
    requests: AtomicUsize,
}

impl ScriptedGeolocator {
    pub fn at(position: Coordinate) -> Self {
        Self::answering(Ok(position))
    }

    pub fn failing(error: GeoError) -> Self {
        Self::answering(Err(error))
    }

    fn answering(standing: Result<Coordinate, GeoError>) -> Self {
        Self {
            permission: Mutex::new(PermissionState::Granted),
            script: Mutex::new(VecDeque::new()),
            standing: Mutex::new(standing),
            delay: None,
            requests: AtomicUsize::new(0),
        }
    }

    /// Every request takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a one-off answer ahead of the standing one.
    pub fn then(self, answer: Result<Coordinate, GeoError>) -> Self {
        lock(&self.script).push_back(answer);
        self
    }

    pub fn set_permission(&self, state: PermissionState) {
        *lock(&self.permission) = state;
    }

    pub fn set_standing(&self, answer: Result<Coordinate, GeoError>) {
        *lock(&self.standing) = answer;
    }

    pub fn position_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Geolocator for ScriptedGeolocator {
    fn permission_state(&self) -> impl Future<Output = PermissionState> + Send {
        let state = *lock(&self.permission);
        async move { state }
    }

    fn current_position(
        &self,
        _options: PositionOptions,
    ) -> impl Future<Output = Result<Coordinate, GeoError>> + Send {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let answer = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| *lock(&self.standing));
        let delay = self.delay;
        async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            answer
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    CameraOpened,
    ManualEntryOpened,
    Closed,
}

/// Records every open/close the verifier asks for.
pub struct RecordingCapture {
    camera: AtomicBool,
    events: Mutex<Vec<CaptureEvent>>,
    notify: Notify,
}

impl Default for RecordingCapture {
    fn default() -> Self {
        Self {
            camera: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

impl RecordingCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_camera() -> Self {
        let capture = Self::default();
        capture.camera.store(false, Ordering::SeqCst);
        capture
    }

    pub fn events(&self) -> Vec<CaptureEvent> {
        lock(&self.events).clone()
    }

    /// Waits until at least `count` events were recorded; `false` on timeout.
    pub async fn wait_for_events(&self, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.notify.notified();
            if lock(&self.events).len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return lock(&self.events).len() >= count;
            }
        }
    }

    fn record(&self, event: CaptureEvent) {
        lock(&self.events).push(event);
        self.notify.notify_waiters();
    }
}

impl CodeCapture for RecordingCapture {
    fn open(&self) -> impl Future<Output = Result<(), CaptureError>> + Send {
        let result = if self.camera.load(Ordering::SeqCst) {
            self.record(CaptureEvent::CameraOpened);
            Ok(())
        } else {
            Err(CaptureError::CameraUnavailable)
        };
        async move { result }
    }

    fn open_manual_entry(&self) -> impl Future<Output = ()> + Send {
        self.record(CaptureEvent::ManualEntryOpened);
        async {}
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        self.record(CaptureEvent::Closed);
        async {}
    }
}
