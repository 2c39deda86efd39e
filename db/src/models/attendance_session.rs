use chrono::{DateTime, Duration, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, QueryFilter};
use serde::{Deserialize, Serialize};

/// One lecturer-initiated attendance window.
///
/// `id` is generated here, by the persistence layer, and doubles as the code
/// students scan or type. Only `active`, `end_time`, `attendance_count` and
/// `qr_value` are ever written after the initial insert.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "attendance_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub lecturer_id: i64,
    pub lecturer_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Admission radius in meters.
    pub radius: i32,
    pub active: bool,
    pub geo_enabled: bool,
    pub qr_only: bool,
    /// Denormalized; only authoritative once the session is closed.
    pub attendance_count: i64,
    pub qr_value: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::LecturerId",
        to = "super::user::Column::Id"
    )]
    Lecturer,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lecturer.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Insert parameters for [`Model::create`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub lecturer_id: i64,
    pub lecturer_name: String,
    pub duration: Duration,
    pub radius: i32,
    /// Fixed reference point `(latitude, longitude)`; `None` for a code-only session.
    pub reference: Option<(f64, f64)>,
}

impl Model {
    /// Writes the session document. `start_time` is stamped with the store's
    /// clock and `end_time` is derived from it, so `end_time - start_time`
    /// equals the requested duration exactly.
    pub async fn create<C>(db: &C, new: NewSession) -> Result<Model, DbErr>
    where
        C: ConnectionTrait,
    {
        let start = Utc::now();
        let (latitude, longitude) = match new.reference {
            Some((lat, lon)) => (Some(lat), Some(lon)),
            None => (None, None),
        };

        let active_model = ActiveModel {
            id: Set(uuid::Uuid::new_v4().simple().to_string()),
            lecturer_id: Set(new.lecturer_id),
            lecturer_name: Set(new.lecturer_name),
            start_time: Set(start),
            end_time: Set(start + new.duration),
            latitude: Set(latitude),
            longitude: Set(longitude),
            radius: Set(new.radius),
            active: Set(true),
            geo_enabled: Set(new.reference.is_some()),
            qr_only: Set(new.reference.is_none()),
            attendance_count: Set(0),
            qr_value: Set(None),
        };

        active_model.insert(db).await
    }

    /// Second phase of creation: publish the generated id as the code payload.
    pub async fn set_qr_value(db: &DbConn, id: &str) -> Result<Model, DbErr> {
        let model = Self::require(db, id).await?;
        let mut active_model: ActiveModel = model.into();
        active_model.qr_value = Set(Some(id.to_owned()));
        active_model.update(db).await
    }

    pub async fn get<C>(db: &C, id: &str) -> Result<Option<Model>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find_by_id(id.to_owned()).one(db).await
    }

    async fn require<C>(db: &C, id: &str) -> Result<Model, DbErr>
    where
        C: ConnectionTrait,
    {
        Self::get(db, id)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("Attendance session {id} not found")))
    }

    /// All sessions of a lecturer, newest first.
    pub async fn find_for_lecturer(db: &DbConn, lecturer_id: i64) -> Result<Vec<Model>, DbErr> {
        let mut rows = Entity::find()
            .filter(Column::LecturerId.eq(lecturer_id))
            .all(db)
            .await?;
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(rows)
    }

    /// Sessions that currently admit students: `active` and not yet past
    /// `end_time`, most recently started first.
    pub async fn find_active<C>(db: &C, now: DateTime<Utc>) -> Result<Vec<Model>, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut rows: Vec<Model> = Entity::find()
            .filter(Column::Active.eq(true))
            .all(db)
            .await?
            .into_iter()
            .filter(|s| s.is_open_at(now))
            .collect();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(rows)
    }

    /// The only transition out of `active`.
    pub async fn close<C>(
        db: &C,
        id: &str,
        attendance_count: i64,
        closed_at: DateTime<Utc>,
    ) -> Result<Model, DbErr>
    where
        C: ConnectionTrait,
    {
        let model = Self::require(db, id).await?;
        let mut active_model: ActiveModel = model.into();
        active_model.active = Set(false);
        active_model.end_time = Set(closed_at);
        active_model.attendance_count = Set(attendance_count);
        active_model.update(db).await
    }

    /// Returns `false` when nothing was deleted.
    pub async fn delete(db: &DbConn, id: &str) -> Result<bool, DbErr> {
        let res = Entity::delete_by_id(id.to_owned()).exec(db).await?;
        Ok(res.rows_affected > 0)
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.end_time > now
    }

    pub fn reference_point(&self) -> Option<(f64, f64)> {
        match (self.geo_enabled, self.latitude, self.longitude) {
            (true, Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}
