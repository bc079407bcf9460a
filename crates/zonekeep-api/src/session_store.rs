use std::{collections::HashSet, sync::Arc};

use anyhow::Context;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::Expr,
};
use serde::Serialize;
use zonekeep_console::{MachineName, SessionStatus};
use zonekeep_db::entities::console_sessions;

/// Queryable mirror of console sessions. Never authoritative for liveness.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<DatabaseConnection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub machine: String,
    pub port: u16,
    pub host: String,
    pub pid: u32,
    pub status: String,
    pub created_at: String,
    pub last_accessed_at: String,
}

impl From<console_sessions::Model> for SessionRecord {
    fn from(m: console_sessions::Model) -> Self {
        Self {
            machine: m.machine,
            port: u16::try_from(m.port).unwrap_or_default(),
            host: m.host,
            pid: u32::try_from(m.pid).unwrap_or_default(),
            status: m.status,
            created_at: m.created_at.to_rfc3339(),
            last_accessed_at: m.last_accessed_at.to_rfc3339(),
        }
    }
}

fn now() -> sea_orm::prelude::DateTimeWithTimeZone {
    chrono::Utc::now().into()
}

impl SessionStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Drops every record for `machine` and inserts a fresh one.
    pub async fn replace(
        &self,
        machine: &MachineName,
        port: u16,
        host: &str,
        pid: u32,
        status: SessionStatus,
    ) -> anyhow::Result<console_sessions::Model> {
        let db = &*self.db;
        console_sessions::Entity::delete_many()
            .filter(console_sessions::Column::Machine.eq(machine.as_str()))
            .exec(db)
            .await
            .context("delete previous session records")?;

        let at = now();
        let model = console_sessions::ActiveModel {
            id: Set(sea_orm::prelude::Uuid::new_v4()),
            machine: Set(machine.to_string()),
            port: Set(i32::from(port)),
            host: Set(host.to_string()),
            pid: Set(i64::from(pid)),
            status: Set(status.as_str().to_string()),
            created_at: Set(at),
            last_accessed_at: Set(at),
        };
        model.insert(db).await.context("insert session record")
    }

    pub async fn set_status(&self, machine: &MachineName, status: SessionStatus) -> anyhow::Result<u64> {
        let res = console_sessions::Entity::update_many()
            .col_expr(console_sessions::Column::Status, Expr::value(status.as_str()))
            .filter(console_sessions::Column::Machine.eq(machine.as_str()))
            .exec(&*self.db)
            .await
            .context("update session status")?;
        Ok(res.rows_affected)
    }

    /// Like [`set_status`](Self::set_status) but only for the record owned by `pid`.
    pub async fn set_status_if_pid(
        &self,
        machine: &str,
        pid: u32,
        status: SessionStatus,
    ) -> anyhow::Result<u64> {
        let res = console_sessions::Entity::update_many()
            .col_expr(console_sessions::Column::Status, Expr::value(status.as_str()))
            .filter(console_sessions::Column::Machine.eq(machine))
            .filter(console_sessions::Column::Pid.eq(i64::from(pid)))
            .exec(&*self.db)
            .await
            .context("update session status")?;
        Ok(res.rows_affected)
    }

    /// Exit hook: marks a still-live record owned by `pid` as stopped.
    pub async fn mark_exited(&self, machine: &str, pid: u32) -> anyhow::Result<u64> {
        let res = console_sessions::Entity::update_many()
            .col_expr(
                console_sessions::Column::Status,
                Expr::value(SessionStatus::Stopped.as_str()),
            )
            .filter(console_sessions::Column::Machine.eq(machine))
            .filter(console_sessions::Column::Pid.eq(i64::from(pid)))
            .filter(console_sessions::Column::Status.is_in([
                SessionStatus::Connecting.as_str(),
                SessionStatus::Active.as_str(),
            ]))
            .exec(&*self.db)
            .await
            .context("mark session exited")?;
        Ok(res.rows_affected)
    }

    pub async fn touch(&self, machine: &MachineName) -> anyhow::Result<()> {
        console_sessions::Entity::update_many()
            .col_expr(console_sessions::Column::LastAccessedAt, Expr::value(now()))
            .filter(console_sessions::Column::Machine.eq(machine.as_str()))
            .filter(console_sessions::Column::Status.eq(SessionStatus::Active.as_str()))
            .exec(&*self.db)
            .await
            .context("touch session record")?;
        Ok(())
    }

    pub async fn find(&self, machine: &MachineName) -> anyhow::Result<Option<console_sessions::Model>> {
        console_sessions::Entity::find()
            .filter(console_sessions::Column::Machine.eq(machine.as_str()))
            .order_by_desc(console_sessions::Column::CreatedAt)
            .one(&*self.db)
            .await
            .context("load session record")
    }

    pub async fn list_all(&self) -> anyhow::Result<Vec<console_sessions::Model>> {
        console_sessions::Entity::find()
            .order_by_asc(console_sessions::Column::Machine)
            .all(&*self.db)
            .await
            .context("list session records")
    }

    pub async fn list_by_status(
        &self,
        status: SessionStatus,
    ) -> anyhow::Result<Vec<console_sessions::Model>> {
        console_sessions::Entity::find()
            .filter(console_sessions::Column::Status.eq(status.as_str()))
            .all(&*self.db)
            .await
            .context("list session records by status")
    }

    pub async fn active_ports(&self) -> anyhow::Result<HashSet<u16>> {
        Ok(self
            .list_by_status(SessionStatus::Active)
            .await?
            .into_iter()
            .filter_map(|m| u16::try_from(m.port).ok())
            .collect())
    }

    pub async fn delete_by_status(&self, status: SessionStatus) -> anyhow::Result<u64> {
        let res = console_sessions::Entity::delete_many()
            .filter(console_sessions::Column::Status.eq(status.as_str()))
            .exec(&*self.db)
            .await
            .context("delete session records")?;
        Ok(res.rows_affected)
    }

    #[cfg(test)]
    pub(crate) async fn set_last_accessed(
        &self,
        machine: &MachineName,
        at: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<()> {
        let at: sea_orm::prelude::DateTimeWithTimeZone = at.into();
        console_sessions::Entity::update_many()
            .col_expr(console_sessions::Column::LastAccessedAt, Expr::value(at))
            .filter(console_sessions::Column::Machine.eq(machine.as_str()))
            .exec(&*self.db)
            .await
            .context("update last access time")?;
        Ok(())
    }
}
