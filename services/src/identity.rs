//! Account store and signed-in principal.
//!
//! Accounts live in the `users` table with argon2 hashes. The signed-in
//! principal is held in a watch channel so dashboards can react to logout.

use crate::error::{AppError, format_validation_errors};
use db::models::user::{self, Role};
use sea_orm::{DatabaseConnection, SqlErr};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use validator::Validate;

/// The signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: i64,
    pub email: String,
}

/// Profile document of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub user_id: i64,
    pub role: Role,
    pub name: String,
    pub email: String,
    pub level: Option<String>,
}

impl From<&user::Model> for Principal {
    fn from(u: &user::Model) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
        }
    }
}

impl From<user::Model> for Profile {
    fn from(u: user::Model) -> Self {
        Self {
            user_id: u.id,
            role: u.role,
            name: u.name,
            email: u.email,
            level: u.level,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterUser {
    #[validate(email(message = "Please enter a valid email address"))]
    pub email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,
    #[validate(length(min = 1, message = "Name is required"))]
    pub name: String,
    pub role: Role,
    pub level: Option<String>,
}

/// Merge-patch of a profile. Unset fields stay as they are.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ProfileUpdate {
    #[validate(length(min = 1, message = "Name is required"))]
    pub name: Option<String>,
    pub level: Option<String>,
}

#[derive(Clone)]
pub struct IdentityService {
    db: DatabaseConnection,
    principal: Arc<watch::Sender<Option<Principal>>>,
}

impl IdentityService {
    pub fn new(db: DatabaseConnection) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            db,
            principal: Arc::new(tx),
        }
    }

    /// Creates the account and its profile, then signs it in.
    pub async fn register(&self, req: RegisterUser) -> Result<Principal, AppError> {
        let req = RegisterUser {
            email: user::normalize_email(&req.email),
            name: req.name.trim().to_owned(),
            level: req
                .level
                .map(|l| l.trim().to_owned())
                .filter(|l| !l.is_empty()),
            ..req
        };

        req.validate()
            .map_err(|e| AppError::Validation(format_validation_errors(&e)))?;
        if req.role == Role::Student && req.level.is_none() {
            return Err(AppError::Validation("Please select your level".into()));
        }

        if user::Model::find_by_email(&self.db, &req.email).await?.is_some() {
            return Err(AppError::EmailTaken);
        }

        let created = user::Model::create(
            &self.db,
            &req.email,
            &req.password,
            &req.name,
            req.role,
            req.level.as_deref(),
        )
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => AppError::EmailTaken,
            _ => AppError::from(e),
        })?;

        tracing::info!("Registered {} account {}", created.role, created.id);
        let principal = Principal::from(&created);
        self.principal.send_replace(Some(principal.clone()));
        Ok(principal)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        let found = user::Model::find_by_email(&self.db, email).await?;
        let account = match found {
            Some(u) if u.verify_password(password) => u,
            _ => return Err(AppError::InvalidCredentials),
        };

        tracing::info!("User {} signed in", account.id);
        let principal = Principal::from(&account);
        self.principal.send_replace(Some(principal.clone()));
        Ok(principal)
    }

    pub fn logout(&self) {
        if let Some(p) = self.principal.send_replace(None) {
            tracing::info!("User {} signed out", p.id);
        }
    }

    pub fn current_principal(&self) -> Option<Principal> {
        self.principal.borrow().clone()
    }

    pub fn require_principal(&self) -> Result<Principal, AppError> {
        self.current_principal().ok_or(AppError::NotAuthenticated)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.principal.subscribe()
    }

    /// Calls `callback` with the new principal after every sign-in or sign-out.
    pub fn on_principal_change<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Option<Principal>) + Send + 'static,
    {
        let mut rx = self.principal.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                callback(current);
            }
        })
    }

    pub async fn profile(&self, user_id: i64) -> Result<Option<Profile>, AppError> {
        Ok(user::Model::get(&self.db, user_id).await?.map(Profile::from))
    }

    /// Updates the signed-in account's own name or level.
    pub async fn update_profile(&self, user_id: i64, update: ProfileUpdate) -> Result<Profile, AppError> {
        let principal = self.require_principal()?;
        if principal.id != user_id {
            return Err(AppError::NotFound("Profile".into()));
        }

        let update = ProfileUpdate {
            name: update.name.map(|n| n.trim().to_owned()),
            level: update.level.map(|l| l.trim().to_owned()),
        };
        update
            .validate()
            .map_err(|e| AppError::Validation(format_validation_errors(&e)))?;

        let current = self.profile(user_id).await?.ok_or(AppError::ProfileMissing)?;
        if current.role == Role::Student && update.level.as_deref() == Some("") {
            return Err(AppError::Validation("Please select your level".into()));
        }

        let updated = user::Model::update_profile(
            &self.db,
            user_id,
            update.name.as_deref(),
            update.level.as_deref(),
        )
        .await?;
        tracing::info!("User {user_id} updated their profile");
        Ok(Profile::from(updated))
    }

    /// Profile of the signed-in account, which must hold `role`.
    pub async fn require_profile(&self, role: Role) -> Result<(Principal, Profile), AppError> {
        let principal = self.require_principal()?;
        let profile = self
            .profile(principal.id)
            .await?
            .ok_or(AppError::ProfileMissing)?;
        if profile.role != role {
            return Err(AppError::RoleMismatch);
        }
        Ok((principal, profile))
    }

    pub async fn verify_role_match(&self, user_id: i64, role: Role) -> Result<bool, AppError> {
        Ok(self
            .profile(user_id)
            .await?
            .is_some_and(|p| p.role == role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::test_utils::setup_test_db;
    use std::time::Duration;

    fn student(email: &str) -> RegisterUser {
        RegisterUser {
            email: email.into(),
            password: "secret1".into(),
            name: "Lerato".into(),
            role: Role::Student,
            level: Some("200".into()),
        }
    }

    #[tokio::test]
    async fn register_signs_in_and_creates_the_profile() {
        let ids = IdentityService::new(setup_test_db().await);

        let p = ids.register(student(" Lerato@Uni.ac.za")).await.unwrap();
        assert_eq!(p.email, "lerato@uni.ac.za");
        assert_eq!(ids.current_principal(), Some(p.clone()));

        let profile = ids.profile(p.id).await.unwrap().unwrap();
        assert_eq!(profile.role, Role::Student);
        assert_eq!(profile.level.as_deref(), Some("200"));
        assert!(ids.verify_role_match(p.id, Role::Student).await.unwrap());
        assert!(!ids.verify_role_match(p.id, Role::Lecturer).await.unwrap());
    }

    #[tokio::test]
    async fn register_rejects_bad_input() {
        let ids = IdentityService::new(setup_test_db().await);

        let short = RegisterUser {
            password: "12345".into(),
            ..student("a@b.co")
        };
        assert!(matches!(ids.register(short).await, Err(AppError::Validation(_))));

        let no_level = RegisterUser {
            level: Some("  ".into()),
            ..student("a@b.co")
        };
        assert!(matches!(ids.register(no_level).await, Err(AppError::Validation(_))));

        ids.register(student("a@b.co")).await.unwrap();
        assert!(matches!(
            ids.register(student("A@B.CO")).await,
            Err(AppError::EmailTaken)
        ));
    }

    #[tokio::test]
    async fn login_checks_the_password_and_logout_clears() {
        let ids = IdentityService::new(setup_test_db().await);
        ids.register(student("x@y.za")).await.unwrap();
        ids.logout();
        assert_eq!(ids.current_principal(), None);

        assert!(matches!(
            ids.login("x@y.za", "wrong!").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            ids.login("nobody@y.za", "secret1").await,
            Err(AppError::InvalidCredentials)
        ));

        let p = ids.login("  X@Y.ZA ", "secret1").await.unwrap();
        assert_eq!(ids.require_principal().unwrap(), p);
    }

    #[tokio::test]
    async fn lecturer_without_level_is_fine_but_wrong_role_is_refused() {
        let ids = IdentityService::new(setup_test_db().await);
        ids.register(RegisterUser {
            email: "prof@uni.ac.za".into(),
            password: "secret1".into(),
            name: "Prof Botha".into(),
            role: Role::Lecturer,
            level: None,
        })
        .await
        .unwrap();

        assert!(ids.require_profile(Role::Lecturer).await.is_ok());
        assert!(matches!(
            ids.require_profile(Role::Student).await,
            Err(AppError::RoleMismatch)
        ));
    }

    #[tokio::test]
    async fn principal_change_callback_sees_login_and_logout() {
        let ids = IdentityService::new(setup_test_db().await);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _watcher = ids.on_principal_change(move |p| {
            let _ = tx.send(p.map(|p| p.id));
        });

        let p = ids.register(student("cb@uni.ac.za")).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(Some(p.id)));

        ids.logout();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(second, Some(None));
    }

    #[tokio::test]
    async fn profile_update_merges_and_validates() {
        let ids = IdentityService::new(setup_test_db().await);
        let p = ids.register(student("up@uni.ac.za")).await.unwrap();

        let renamed = ids
            .update_profile(
                p.id,
                ProfileUpdate {
                    name: Some(" Lerato Dlamini ".into()),
                    level: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Lerato Dlamini");
        assert_eq!(renamed.level.as_deref(), Some("200"));

        let moved = ids
            .update_profile(
                p.id,
                ProfileUpdate {
                    level: Some("300".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.name, "Lerato Dlamini");
        assert_eq!(ids.profile(p.id).await.unwrap(), Some(moved));

        let blank = ProfileUpdate {
            name: Some("   ".into()),
            ..Default::default()
        };
        assert!(matches!(
            ids.update_profile(p.id, blank).await,
            Err(AppError::Validation(_))
        ));
        let no_level = ProfileUpdate {
            level: Some("".into()),
            ..Default::default()
        };
        assert!(matches!(
            ids.update_profile(p.id, no_level).await,
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            ids.update_profile(p.id + 1, ProfileUpdate::default()).await,
            Err(AppError::NotFound(_))
        ));
        ids.logout();
        assert!(matches!(
            ids.update_profile(p.id, ProfileUpdate::default()).await,
            Err(AppError::NotAuthenticated)
        ));
    }
}
