use tracing::info;

use crate::{config::DatabaseOptions, database::PostgresConnection};

/// Apply any migrations bundled into the binary that the database has not
/// seen yet.
pub async fn run_migrations(opts: &DatabaseOptions) -> anyhow::Result<()> {
    let connection = PostgresConnection::connect(opts).await?;

    sqlx::migrate!("./migrations-sqlx").run(&*connection).await?;

    info!("Database migrations complete.");

    Ok(())
}
