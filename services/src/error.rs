use sea_orm::DbErr;
use thiserror::Error;
use validator::ValidationErrors;

/// Every failure a dashboard operation can surface.
///
/// The `Display` text is for logs. What an end user sees comes from
/// [`AppError::user_message`], which never carries backend error text.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("a session is already held by this client")]
    SessionAlreadyActive,

    #[error("another attendance session is still active")]
    ConflictingActiveSession,

    #[error("no active attendance session")]
    NoActiveSession,

    #[error("code does not match the active session")]
    InvalidCode,

    #[error("not signed in")]
    NotAuthenticated,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("email already registered")]
    EmailTaken,

    #[error("account role does not allow this action")]
    RoleMismatch,

    #[error("user profile not found")]
    ProfileMissing,

    #[error("attendance write failed")]
    WriteFailed,

    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl AppError {
    /// Fixed end-user text for this error.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::SessionAlreadyActive => {
                "A session is already active. End it before starting a new one.".into()
            }
            AppError::ConflictingActiveSession => {
                "Another attendance session is currently active.".into()
            }
            AppError::NoActiveSession => "No active session found.".into(),
            AppError::InvalidCode => "Invalid QR code. Please try again.".into(),
            AppError::NotAuthenticated => "Please sign in first.".into(),
            AppError::InvalidCredentials => "Invalid email or password.".into(),
            AppError::EmailTaken => "An account with this email already exists.".into(),
            AppError::RoleMismatch => "Your account cannot perform this action.".into(),
            AppError::ProfileMissing => "User profile not found.".into(),
            AppError::NotFound(what) => format!("{what} not found."),
            AppError::WriteFailed | AppError::Database(_) => {
                "Something went wrong. Please try again.".into()
            }
        }
    }

    /// Errors after which the same action may simply be tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::InvalidCode | AppError::WriteFailed)
    }
}

/// Joins the messages of every failed field, ordered by field name.
pub fn format_validation_errors(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    fields
        .into_iter()
        .flat_map(|(_, errs)| {
            errs.iter()
                .filter_map(|e| e.message.as_ref().map(|m| m.to_string()))
        })
        .collect::<Vec<_>>()
        .join("; ")
}
