//! Device geolocation boundary.
//!
//! The platform location API stays outside the workspace; dashboards talk to
//! it through [`Geolocator`]. The one-shot acquisition used when a lecturer
//! opens a session lives here too.

use crate::geodesy::Coordinate;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Platform permission for location access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Prompt,
    Denied,
    /// The platform cannot report a permission state.
    Unknown,
}

/// Error codes of a single position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub timeout: Duration,
    pub enable_high_accuracy: bool,
    /// Oldest cached fix the platform may return.
    pub maximum_age: Duration,
}

impl PositionOptions {
    /// Fresh, high accuracy fix bounded by `timeout`.
    pub fn fresh(timeout: Duration) -> Self {
        Self {
            timeout,
            enable_high_accuracy: true,
            maximum_age: Duration::ZERO,
        }
    }
}

pub trait Geolocator: Send + Sync + 'static {
    fn permission_state(&self) -> impl Future<Output = PermissionState> + Send;

    fn current_position(
        &self,
        options: PositionOptions,
    ) -> impl Future<Output = Result<Coordinate, GeoError>> + Send;
}

/// Outcome of [`acquire_reference_point`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoAcquisition {
    Captured(Coordinate),
    /// The session goes ahead code-only.
    Fallback(GeoError),
}

impl GeoAcquisition {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            GeoAcquisition::Captured(c) => Some(*c),
            GeoAcquisition::Fallback(_) => None,
        }
    }
}

/// Captures a session's fixed reference point.
///
/// Never fails: a denied permission, an unavailable position or a timeout all
/// degrade to [`GeoAcquisition::Fallback`]. `timeout` also bounds platforms
/// that ignore the timeout in [`PositionOptions`].
pub async fn acquire_reference_point<G: Geolocator>(geo: &G, timeout: Duration) -> GeoAcquisition {
    let permission = geo.permission_state().await;
    tracing::debug!("Location permission state: {permission:?}");

    if permission == PermissionState::Denied {
        tracing::info!("Location permission denied, creating a code-only session");
        return GeoAcquisition::Fallback(GeoError::PermissionDenied);
    }

    let request = geo.current_position(PositionOptions::fresh(timeout));
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(coordinate)) => {
            tracing::info!(
                "Captured reference point ({:.6}, {:.6})",
                coordinate.latitude,
                coordinate.longitude
            );
            GeoAcquisition::Captured(coordinate)
        }
        Ok(Err(e)) => {
            tracing::warn!("Location request failed ({e}), creating a code-only session");
            GeoAcquisition::Fallback(e)
        }
        Err(_) => {
            tracing::warn!("Location request exceeded {timeout:?}, creating a code-only session");
            GeoAcquisition::Fallback(GeoError::Timeout)
        }
    }
}
