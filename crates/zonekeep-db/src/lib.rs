pub use sea_orm;

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_string());
    opts.connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    // Every pooled connection to `sqlite::memory:` would open its own database.
    if database_url.contains(":memory:") {
        opts.max_connections(1).min_connections(1);
    }
    Database::connect(opts).await
}
