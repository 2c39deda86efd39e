//! Code-proof channel: the session id, scanned from a QR code or typed in.

use crate::error::AppError;
use db::models::attendance_session::Model as AttendanceSession;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("camera unavailable")]
    CameraUnavailable,
    #[error("camera permission denied")]
    PermissionDenied,
}

/// Where a submitted code came from. Both funnel into one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Scan,
    Manual,
}

/// What the verifier ended up opening for the student.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Camera,
    ManualEntry,
}

/// Camera decoder plus manual text input.
pub trait CodeCapture: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = Result<(), CaptureError>> + Send;

    fn open_manual_entry(&self) -> impl Future<Output = ()> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub struct CodeVerifier<C> {
    capture: Arc<C>,
    retry_delay: Duration,
    pending_reopen: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<C> Clone for CodeVerifier<C> {
    fn clone(&self) -> Self {
        Self {
            capture: self.capture.clone(),
            retry_delay: self.retry_delay,
            pending_reopen: self.pending_reopen.clone(),
        }
    }
}

impl<C: CodeCapture> CodeVerifier<C> {
    pub fn new(capture: Arc<C>, retry_delay: Duration) -> Self {
        Self {
            capture,
            retry_delay,
            pending_reopen: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the capture UI, falling back to manual entry without a camera.
    pub async fn open(&self, held: Option<&AttendanceSession>) -> Result<CaptureMode, AppError> {
        if held.is_none() {
            return Err(AppError::NoActiveSession);
        }
        Ok(open_capture(&*self.capture, CaptureSource::Scan).await)
    }

    /// Checks `raw` against the held session's id.
    ///
    /// On a mismatch the capture is reopened after the retry delay and
    /// [`AppError::InvalidCode`] is returned. On a match the capture is closed.
    pub async fn verify(
        &self,
        held: Option<&AttendanceSession>,
        raw: &str,
        source: CaptureSource,
    ) -> Result<(), AppError> {
        let Some(session) = held else {
            return Err(AppError::NoActiveSession);
        };

        let code = raw.trim();
        if code.is_empty() {
            return Err(AppError::Validation("Please enter the session code.".into()));
        }

        if code != session.id {
            tracing::info!("Rejected {source:?} code for session {}", session.id);
            self.schedule_reopen(source);
            return Err(AppError::InvalidCode);
        }

        self.cancel_pending_reopen();
        self.capture.close().await;
        Ok(())
    }

    pub fn cancel_pending_reopen(&self) {
        let pending = self
            .pending_reopen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = pending {
            task.abort();
        }
    }

    fn schedule_reopen(&self, source: CaptureSource) {
        let capture = self.capture.clone();
        let delay = self.retry_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            open_capture(&*capture, source).await;
        });

        let previous = self
            .pending_reopen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

async fn open_capture<C: CodeCapture>(capture: &C, source: CaptureSource) -> CaptureMode {
    if source == CaptureSource::Manual {
        capture.open_manual_entry().await;
        return CaptureMode::ManualEntry;
    }

    match capture.open().await {
        Ok(()) => CaptureMode::Camera,
        Err(e) => {
            tracing::warn!("Camera capture unavailable ({e}), switching to manual entry");
            capture.open_manual_entry().await;
            CaptureMode::ManualEntry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CaptureEvent, RecordingCapture};
    use chrono::Utc;

    fn session(id: &str) -> AttendanceSession {
        let now = Utc::now();
        AttendanceSession {
            id: id.into(),
            lecturer_id: 1,
            lecturer_name: "Dr Dlamini".into(),
            start_time: now,
            end_time: now + chrono::Duration::minutes(30),
            latitude: None,
            longitude: None,
            radius: 50,
            active: true,
            geo_enabled: false,
            qr_only: true,
            attendance_count: 0,
            qr_value: Some(id.into()),
        }
    }

    fn verifier(capture: &Arc<RecordingCapture>) -> CodeVerifier<RecordingCapture> {
        CodeVerifier::new(capture.clone(), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn no_session_rejects_without_opening_the_capture() {
        let capture = Arc::new(RecordingCapture::new());
        let v = verifier(&capture);

        assert!(matches!(v.open(None).await, Err(AppError::NoActiveSession)));
        assert!(matches!(
            v.verify(None, "abc", CaptureSource::Scan).await,
            Err(AppError::NoActiveSession)
        ));
        assert!(capture.events().is_empty());
    }

    #[tokio::test]
    async fn missing_camera_falls_back_to_manual_entry() {
        let capture = Arc::new(RecordingCapture::without_camera());
        let v = verifier(&capture);
        let s = session("abc123");

        assert_eq!(v.open(Some(&s)).await.unwrap(), CaptureMode::ManualEntry);
        assert_eq!(capture.events(), vec![CaptureEvent::ManualEntryOpened]);
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_ignored() {
        let capture = Arc::new(RecordingCapture::new());
        let v = verifier(&capture);
        let s = session("abc123");

        v.verify(Some(&s), "  abc123\n", CaptureSource::Manual).await.unwrap();
        assert_eq!(capture.events(), vec![CaptureEvent::Closed]);
    }

    #[tokio::test]
    async fn empty_input_is_a_validation_error() {
        let capture = Arc::new(RecordingCapture::new());
        let v = verifier(&capture);
        let s = session("abc123");

        let err = v.verify(Some(&s), "   ", CaptureSource::Manual).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn mismatch_reopens_the_capture_after_the_delay() {
        let capture = Arc::new(RecordingCapture::new());
        let v = verifier(&capture);
        let s = session("abc123");

        let err = v.verify(Some(&s), "ABC123", CaptureSource::Scan).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCode));
        assert!(capture.events().is_empty());

        assert!(capture.wait_for_events(1, Duration::from_secs(2)).await);
        assert_eq!(capture.events(), vec![CaptureEvent::CameraOpened]);
    }

    #[tokio::test]
    async fn success_cancels_a_pending_reopen() {
        let capture = Arc::new(RecordingCapture::new());
        let v = CodeVerifier::new(capture.clone(), Duration::from_millis(100));
        let s = session("abc123");

        let _ = v.verify(Some(&s), "wrong", CaptureSource::Scan).await;
        v.verify(Some(&s), "abc123", CaptureSource::Scan).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(capture.events(), vec![CaptureEvent::Closed]);
    }
}
