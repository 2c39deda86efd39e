//! Attendance tracking core: the lecturer and student dashboards and the
//! components they drive.
//!
//! - [`session_manager`]: lecturer side session lifecycle, roster and reports
//! - [`student`]: discovery, geo and code proof channels, history
//! - [`poller`], [`code_verifier`], [`ledger`], [`roster`]: the pieces in between
//! - [`identity`]: accounts and the signed-in principal

pub mod code_verifier;
pub mod error;
pub mod geodesy;
pub mod geolocation;
pub mod identity;
pub mod ledger;
pub mod poller;
pub mod roster;
pub mod session_manager;
pub mod student;
pub mod test_utils;

pub use error::AppError;
