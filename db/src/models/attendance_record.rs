use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, PaginatorTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One student's admission to one session. The `(session_id, student_id)`
/// primary key is the uniqueness guarantee; name and level are copied from the
/// profile at write time.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "attendance_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub session_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub student_id: i64,

    pub name: String,
    pub level: Option<String>,
    pub method: AdmissionMethod,
    /// Stamped by the store, never by the caller.
    pub timestamp: DateTime<Utc>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
pub enum AdmissionMethod {
    #[sea_orm(string_value = "Geo")]
    Geo,

    #[sea_orm(string_value = "QR")]
    #[serde(rename = "QR")]
    #[strum(serialize = "QR")]
    Qr,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::attendance_session::Entity",
        from = "Column::SessionId",
        to = "super::attendance_session::Column::Id"
    )]
    Session,
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::StudentId",
        to = "super::user::Column::Id"
    )]
    Student,
}

impl Related<super::attendance_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Student.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Insert parameters for [`Model::insert_if_absent`].
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub session_id: String,
    pub student_id: i64,
    pub name: String,
    pub level: Option<String>,
    pub method: AdmissionMethod,
}

impl Model {
    /// Create-if-absent on the composite key, as one statement.
    ///
    /// Returns `Ok(None)` when a row for `(session_id, student_id)` already
    /// existed; the existing row is left untouched.
    pub async fn insert_if_absent<C>(db: &C, new: NewRecord) -> Result<Option<Model>, DbErr>
    where
        C: ConnectionTrait,
    {
        let key = (new.session_id.clone(), new.student_id);
        let active_model = ActiveModel {
            session_id: Set(new.session_id),
            student_id: Set(new.student_id),
            name: Set(new.name),
            level: Set(new.level),
            method: Set(new.method),
            timestamp: Set(Utc::now()),
        };

        let inserted = Entity::insert(active_model)
            .on_conflict(
                OnConflict::columns([Column::SessionId, Column::StudentId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;

        if inserted == 0 {
            return Ok(None);
        }
        Entity::find_by_id(key).one(db).await
    }

    pub async fn find_one<C>(db: &C, session_id: &str, student_id: i64) -> Result<Option<Model>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find_by_id((session_id.to_owned(), student_id))
            .one(db)
            .await
    }

    /// Records of one session in admission order.
    pub async fn find_for_session(db: &DbConn, session_id: &str) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::SessionId.eq(session_id))
            .order_by_asc(Column::Timestamp)
            .all(db)
            .await
    }

    pub async fn find_for_student(db: &DbConn, student_id: i64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::StudentId.eq(student_id))
            .all(db)
            .await
    }

    pub async fn count_for_session<C>(db: &C, session_id: &str) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::SessionId.eq(session_id))
            .count(db)
            .await
    }

    /// Returns `false` when nothing was deleted.
    pub async fn delete(db: &DbConn, session_id: &str, student_id: i64) -> Result<bool, DbErr> {
        let res = Entity::delete_by_id((session_id.to_owned(), student_id))
            .exec(db)
            .await?;
        Ok(res.rows_affected > 0)
    }
}
