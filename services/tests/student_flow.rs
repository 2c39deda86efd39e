mod common;

use common::*;
use db::models::attendance_record::{self, AdmissionMethod};
use db::models::attendance_session::{self, NewSession};
use services::AppError;
use services::code_verifier::{CaptureMode, CaptureSource};
use services::geolocation::{GeoError, PermissionState};
use services::ledger::Admission;
use services::poller::PollStatus;
use services::student::ChannelView;
use services::test_utils::CaptureEvent;
use std::time::Duration;
use util::events::{IncomingEnvelope, attendance_student_topic};

#[tokio::test]
async fn nothing_to_attend_without_a_session() {
    let state = setup_test_state().await;
    let s = student(&state, "s@uni.ac.za", "Lindiwe", 0.0).await;

    assert_eq!(s.dashboard.check_for_active_session().await.unwrap(), ChannelView::NoSession);
    assert!(matches!(s.dashboard.open_scanner().await, Err(AppError::NoActiveSession)));
    assert!(matches!(
        s.dashboard.submit_code("anything", CaptureSource::Manual).await,
        Err(AppError::NoActiveSession)
    ));
    assert!(s.capture.events().is_empty());
    assert_eq!(s.geo.position_requests(), 0);
}

#[tokio::test]
async fn lapsed_session_is_not_discovered() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let lecturer_id = lect.ids.current_principal().unwrap().id;

    // Never closed, but its end time is already behind us.
    attendance_session::Model::create(
        state.db(),
        NewSession {
            lecturer_id,
            lecturer_name: "Dr Mokoena".into(),
            duration: chrono::Duration::minutes(-1),
            radius: 50,
            reference: None,
        },
    )
    .await
    .unwrap();

    let s = student(&state, "s@uni.ac.za", "Lindiwe", 0.0).await;
    assert_eq!(s.dashboard.check_for_active_session().await.unwrap(), ChannelView::NoSession);
}

#[tokio::test]
async fn standing_inside_the_radius_admits_through_geo() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let session = lect.manager.create_session(request(100, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Sibusiso", 99.5).await;
    let mut own = state
        .bus()
        .subscribe(&attendance_student_topic(s.ids.current_principal().unwrap().id))
        .await;

    let view = s.dashboard.check_for_active_session().await.unwrap();
    assert_eq!(view, ChannelView::Geo { code_fallback: true });

    let status = settle(s.dashboard.poll_updates().await.unwrap()).await;
    assert_eq!(status, PollStatus::Admitted);
    assert_eq!(
        s.dashboard.view().await,
        ChannelView::Recorded {
            method: AdmissionMethod::Geo
        }
    );

    let rec = attendance_record::Model::find_one(state.db(), &session.id, s.ids.current_principal().unwrap().id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rec.method, AdmissionMethod::Geo);
    assert_eq!(rec.name, "Sibusiso");
    assert_eq!(rec.level.as_deref(), Some("200"));

    let env = IncomingEnvelope::parse(&own.recv().await.unwrap()).unwrap();
    assert_eq!(env.event, "attendance.marked");
}

#[tokio::test]
async fn just_outside_the_radius_keeps_polling() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.manager.create_session(request(100, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Sibusiso", 100.5).await;

    s.dashboard.check_for_active_session().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(s.geo.position_requests() >= 2);
    match s.dashboard.poll_status().await.unwrap() {
        PollStatus::Distance { meters, radius } => {
            assert!(meters > radius);
            assert_eq!(radius, 100.0);
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(s.dashboard.view().await, ChannelView::Geo { code_fallback: true });
}

#[tokio::test]
async fn wrong_code_is_retryable_and_right_code_admits() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Naledi", 800.0).await;
    s.dashboard.check_for_active_session().await.unwrap();

    assert_eq!(s.dashboard.open_scanner().await.unwrap(), CaptureMode::Camera);

    let err = s
        .dashboard
        .submit_code("not-the-session", CaptureSource::Scan)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidCode));
    assert!(err.is_retryable());
    assert!(s.capture.wait_for_events(2, Duration::from_secs(2)).await);
    assert_eq!(
        s.capture.events(),
        vec![CaptureEvent::CameraOpened, CaptureEvent::CameraOpened]
    );

    let admitted = s
        .dashboard
        .submit_code(&format!(" {} ", session.id), CaptureSource::Scan)
        .await
        .unwrap();
    assert!(matches!(admitted, Admission::Recorded(ref r) if r.method == AdmissionMethod::Qr));
    assert_eq!(
        s.dashboard.view().await,
        ChannelView::Recorded {
            method: AdmissionMethod::Qr
        }
    );
    assert!(s.dashboard.poll_status().await.is_none());
}

#[tokio::test]
async fn code_submitted_twice_records_once() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.geo.set_permission(PermissionState::Denied);
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Naledi", 0.0).await;
    assert_eq!(s.dashboard.check_for_active_session().await.unwrap(), ChannelView::CodeOnly);

    let first = s.dashboard.submit_code(&session.id, CaptureSource::Manual).await.unwrap();
    let second = s.dashboard.submit_code(&session.id, CaptureSource::Scan).await.unwrap();

    assert!(matches!(first, Admission::Recorded(_)));
    assert_eq!(second, Admission::AlreadyAdmitted);
    let n = attendance_record::Model::count_for_session(state.db(), &session.id)
        .await
        .unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn unavailable_position_downgrades_to_code_only() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Palesa", 0.0).await;
    s.geo.set_standing(Err(GeoError::PositionUnavailable));

    s.dashboard.check_for_active_session().await.unwrap();
    let status = settle(s.dashboard.poll_updates().await.unwrap()).await;

    assert_eq!(status, PollStatus::Downgraded(GeoError::PositionUnavailable));
    assert_eq!(s.dashboard.view().await, ChannelView::CodeOnly);

    // The code channel still works after the downgrade.
    let admitted = s.dashboard.submit_code(&session.id, CaptureSource::Manual).await.unwrap();
    assert!(matches!(admitted, Admission::Recorded(_)));
}

#[tokio::test]
async fn switching_channels_stops_polling_for_good() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Palesa", 300.0).await;
    s.dashboard.check_for_active_session().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let view = s.dashboard.switch_to_code_channel().await.unwrap();
    assert_eq!(view, ChannelView::CodeOnly);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let seen = s.geo.position_requests();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.geo.position_requests(), seen);

    // Walking into the hall afterwards changes nothing.
    s.geo.set_standing(Ok(HALL));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(s.dashboard.view().await, ChannelView::CodeOnly);
}

#[tokio::test]
async fn returning_student_is_already_attended() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Musa", 500.0).await;
    s.dashboard.check_for_active_session().await.unwrap();
    s.dashboard.submit_code(&session.id, CaptureSource::Manual).await.unwrap();

    // Same account on a fresh device.
    let again = student_on(&state, s.ids.clone(), 0.0);
    assert_eq!(
        again.dashboard.check_for_active_session().await.unwrap(),
        ChannelView::AlreadyAttended
    );
    assert!(again.dashboard.poll_status().await.is_none());
    assert_eq!(again.geo.position_requests(), 0);
}

#[tokio::test]
async fn ended_session_is_dropped_on_rediscovery() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.geo.set_permission(PermissionState::Denied);
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Musa", 0.0).await;
    s.dashboard.check_for_active_session().await.unwrap();

    lect.manager.end_session().await.unwrap();

    // Rediscovery sees the closed row, whether or not the client heard the end.
    assert_eq!(s.dashboard.check_for_active_session().await.unwrap(), ChannelView::NoSession);
    assert!(matches!(
        s.dashboard.submit_code(&session.id, CaptureSource::Manual).await,
        Err(AppError::NoActiveSession)
    ));
}

#[tokio::test]
async fn history_is_newest_first_and_records_can_be_removed() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.geo.set_permission(PermissionState::Denied);
    let s = student(&state, "s@uni.ac.za", "Refilwe", 0.0).await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let session = lect.manager.create_session(request(50, 30)).await.unwrap();
        s.dashboard.check_for_active_session().await.unwrap();
        s.dashboard.submit_code(&session.id, CaptureSource::Manual).await.unwrap();
        lect.manager.end_session().await.unwrap();
        ids.push(session.id);
    }

    let history = s.dashboard.history().await.unwrap();
    let order: Vec<_> = history.iter().map(|h| h.record.session_id.clone()).collect();
    assert_eq!(order, vec![ids[1].clone(), ids[0].clone()]);
    assert!(history.iter().all(|h| h.session.is_some()));

    s.dashboard.delete_record(&ids[0]).await.unwrap();
    assert_eq!(s.dashboard.history().await.unwrap().len(), 1);
    assert!(matches!(
        s.dashboard.delete_record(&ids[0]).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn deleting_the_current_record_allows_attending_again() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.geo.set_permission(PermissionState::Denied);
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let mut changes = lect.manager.roster_changes().await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Refilwe", 0.0).await;
    s.dashboard.check_for_active_session().await.unwrap();

    s.dashboard.submit_code(&session.id, CaptureSource::Manual).await.unwrap();
    let seen = roster_moved(&mut changes, 0).await;
    assert_eq!(lect.manager.roster_count().await, Some(1));

    s.dashboard.delete_record(&session.id).await.unwrap();
    let seen = roster_moved(&mut changes, seen).await;
    assert_eq!(lect.manager.roster_count().await, Some(0));
    assert_eq!(s.dashboard.view().await, ChannelView::CodeOnly);

    let again = s.dashboard.submit_code(&session.id, CaptureSource::Manual).await.unwrap();
    assert!(matches!(again, Admission::Recorded(_)));
    roster_moved(&mut changes, seen).await;
    assert_eq!(lect.manager.roster_count().await, Some(1));
}

#[tokio::test]
async fn logout_clears_session_poller_and_flag_together() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Karabo", 300.0).await;
    let _watch = s.dashboard.reset_on_logout();
    s.dashboard.check_for_active_session().await.unwrap();
    let updates = s.dashboard.poll_updates().await.unwrap();

    s.ids.logout();

    assert_eq!(settle(updates).await, PollStatus::Stopped);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while s.dashboard.current_session().await.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "dashboard was not reset");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(s.dashboard.view().await, ChannelView::NoSession);
    assert!(s.dashboard.poll_status().await.is_none());
}

#[tokio::test]
async fn code_submitted_after_a_manual_end_is_refused() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    lect.geo.set_permission(PermissionState::Denied);
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Palesa", 0.0).await;
    s.dashboard.check_for_active_session().await.unwrap();

    let closed = lect.manager.end_session().await.unwrap();
    let err = s
        .dashboard
        .submit_code(&session.id, CaptureSource::Scan)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NoActiveSession));
    let rows = attendance_record::Model::count_for_session(state.db(), &session.id)
        .await
        .unwrap();
    assert_eq!(rows, 0);
    assert_eq!(closed.attendance_count, 0);
    session_dropped(&s).await;
    assert_eq!(s.dashboard.view().await, ChannelView::NoSession);
}

#[tokio::test]
async fn walking_in_after_a_manual_end_admits_nobody() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Kagiso", 500.0).await;
    s.dashboard.check_for_active_session().await.unwrap();
    let updates = s.dashboard.poll_updates().await.unwrap();

    lect.manager.end_session().await.unwrap();
    s.geo.set_standing(Ok(north_of(0.0)));

    assert_eq!(settle(updates).await, PollStatus::Stopped);
    session_dropped(&s).await;
    assert_eq!(s.dashboard.poll_status().await, None);
    // Give a stray sample time to land before counting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let rows = attendance_record::Model::count_for_session(state.db(), &session.id)
        .await
        .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn deleting_the_held_session_drops_it() {
    let state = setup_test_state().await;
    let lect = lecturer(&state, "lect@uni.ac.za").await;
    let session = lect.manager.create_session(request(50, 30)).await.unwrap();
    let s = student(&state, "s@uni.ac.za", "Neo", 800.0).await;
    s.dashboard.check_for_active_session().await.unwrap();

    lect.manager.delete_session(&session.id).await.unwrap();

    session_dropped(&s).await;
    assert!(matches!(
        s.dashboard.submit_code(&session.id, CaptureSource::Manual).await,
        Err(AppError::NoActiveSession)
    ));
}
