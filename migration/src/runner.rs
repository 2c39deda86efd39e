use colored::*;
use futures::FutureExt;
use migration::Migrator;
use sea_orm_migration::prelude::*;
use std::io::{self, Write};
use std::time::Instant;

const STATUS_COLUMN: usize = 72;

/// Applies every attendance schema step in order and stops at the first
/// failure. Each step creates its tables only if they are missing, so running
/// this against an existing database is a no-op.
pub async fn apply_schema(url: &str) -> Result<usize, DbErr> {
    let db = sea_orm::Database::connect(url).await?;
    let schema = SchemaManager::new(&db);
    let steps = <Migrator as MigratorTrait>::migrations();
    let total = steps.len();

    println!("{} ({total} steps)", "Preparing attendance schema".bold());
    let started = Instant::now();
    for (i, step) in steps.into_iter().enumerate() {
        apply_step(&schema, step, i + 1, total).await?;
    }

    println!(
        "Attendance schema ready {}",
        format!("({:.2?})", started.elapsed()).dimmed()
    );
    tracing::info!("Attendance schema ready, {total} steps applied");
    Ok(total)
}

async fn apply_step(
    schema: &SchemaManager<'_>,
    step: Box<dyn MigrationTrait>,
    n: usize,
    total: usize,
) -> Result<(), DbErr> {
    let label = format!("[{n}/{total}] {}", step.name());
    let pad = ".".repeat(STATUS_COLUMN.saturating_sub(label.len()));
    print!("{label} {pad} ");
    io::stdout().flush().ok();

    let started = Instant::now();
    let outcome = std::panic::AssertUnwindSafe(step.up(schema))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(DbErr::Custom(format!("step {} panicked", step.name()))));

    match outcome {
        Ok(()) => {
            println!("{} {}", "ok".green(), format!("({:.2?})", started.elapsed()).dimmed());
            tracing::info!(step = step.name(), "schema step applied");
            Ok(())
        }
        Err(e) => {
            println!("{}", "error".red());
            tracing::error!(step = step.name(), "schema step failed: {e}");
            Err(e)
        }
    }
}
