#![allow(dead_code)]

use db::models::user::Role;
use services::geodesy::{Coordinate, EARTH_RADIUS_M};
use services::identity::{IdentityService, RegisterUser};
use services::poller::{PollStatus, PollerOptions};
use services::session_manager::{LecturerOptions, NewSessionRequest, SessionManager};
use services::student::{StudentDashboard, StudentOptions};
use services::test_utils::{RecordingCapture, ScriptedGeolocator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use util::state::AppState;

pub use services::test_utils::setup_test_state;

pub const HALL: Coordinate = Coordinate {
    latitude: -25.7545,
    longitude: 28.2314,
};

/// A point `meters` due north of the hall.
pub fn north_of(meters: f64) -> Coordinate {
    Coordinate::new(
        HALL.latitude + (meters / EARTH_RADIUS_M).to_degrees(),
        HALL.longitude,
    )
}

pub fn lecturer_options() -> LecturerOptions {
    LecturerOptions {
        acquire_timeout: Duration::from_millis(200),
    }
}

pub fn student_options() -> StudentOptions {
    StudentOptions {
        poller: PollerOptions {
            interval: Duration::from_millis(30),
            sample_timeout: Duration::from_millis(20),
        },
        code_retry_delay: Duration::from_millis(20),
    }
}

pub fn request(radius: i32, duration_minutes: i64) -> NewSessionRequest {
    NewSessionRequest {
        radius,
        duration_minutes,
    }
}

/// A signed-in client of the given role, on its own identity instance.
pub async fn sign_up(state: &AppState, email: &str, name: &str, role: Role) -> IdentityService {
    let ids = IdentityService::new(state.db().clone());
    ids.register(RegisterUser {
        email: email.into(),
        password: "secret1".into(),
        name: name.into(),
        role,
        level: (role == Role::Student).then(|| "200".to_string()),
    })
    .await
    .unwrap();
    ids
}

pub struct LecturerClient {
    pub ids: IdentityService,
    pub geo: Arc<ScriptedGeolocator>,
    pub manager: SessionManager<ScriptedGeolocator>,
}

pub async fn lecturer(state: &AppState, email: &str) -> LecturerClient {
    let ids = sign_up(state, email, "Dr Mokoena", Role::Lecturer).await;
    let geo = Arc::new(ScriptedGeolocator::at(HALL));
    let manager = SessionManager::new(state.clone(), ids.clone(), geo.clone(), lecturer_options());
    LecturerClient { ids, geo, manager }
}

pub struct StudentClient {
    pub ids: IdentityService,
    pub geo: Arc<ScriptedGeolocator>,
    pub capture: Arc<RecordingCapture>,
    pub dashboard: StudentDashboard<ScriptedGeolocator, RecordingCapture>,
}

/// A student standing `meters` north of the hall.
pub async fn student(state: &AppState, email: &str, name: &str, meters: f64) -> StudentClient {
    let ids = sign_up(state, email, name, Role::Student).await;
    student_on(state, ids, meters)
}

/// Another device of an already registered student.
pub fn student_on(state: &AppState, ids: IdentityService, meters: f64) -> StudentClient {
    let geo = Arc::new(ScriptedGeolocator::at(north_of(meters)));
    let capture = Arc::new(RecordingCapture::new());
    let dashboard = StudentDashboard::new(
        state.clone(),
        ids.clone(),
        geo.clone(),
        capture.clone(),
        student_options(),
    );
    StudentClient {
        ids,
        geo,
        capture,
        dashboard,
    }
}

/// Waits until the poller reports a terminal status.
pub async fn settle(mut rx: watch::Receiver<PollStatus>) -> PollStatus {
    let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(PollStatus::is_terminal))
        .await
        .expect("poller never settled")
        .expect("poller dropped its status")
        .clone();
    status
}

/// Waits until the roster revision moves past `seen`.
pub async fn roster_moved(rx: &mut watch::Receiver<u64>, seen: u64) -> u64 {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|r| *r > seen))
        .await
        .expect("roster never refreshed")
        .map(|r| *r)
        .expect("roster listener gone")
}

/// Waits until nothing listens on `topic` any more.
pub async fn listeners_drained(state: &AppState, topic: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while state.bus().listener_count(topic).await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("topic still has listeners");
}

/// Waits until the student's client has let go of its session.
pub async fn session_dropped(client: &StudentClient) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.dashboard.current_session().await.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("student still holds the session");
}
