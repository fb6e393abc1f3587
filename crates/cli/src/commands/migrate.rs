use serde_json::json;
use sqlx::Row;

use crate::commands::{with_store, CommandResult};

/// Opening the store applies pending migrations; this reports what the schema now holds.
pub fn run() -> CommandResult {
    with_store("migrate", |_config, pool| async move {
        let rows = match sqlx::query(
            "SELECT version, description FROM _sqlx_migrations WHERE success = 1 ORDER BY version",
        )
        .fetch_all(&pool)
        .await
        {
            Ok(rows) => rows,
            Err(error) => {
                return CommandResult::failure("migrate", "migration", error.to_string(), 5);
            }
        };

        let applied: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "version": row.get::<i64, _>("version"),
                    "description": row.get::<String, _>("description"),
                })
            })
            .collect();

        CommandResult::success_with_data(
            "migrate",
            format!("schema up to date ({} migrations applied)", applied.len()),
            Some(json!({ "applied": applied })),
        )
    })
}
