pub mod pool;

use pool::DbPool;

const MIGRATIONS: &[(&str, &str)] = &[
    ("001_sessions", include_str!("migrations/001_sessions.sql")),
    (
        "002_known_numbers",
        include_str!("migrations/002_known_numbers.sql"),
    ),
];

pub fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    pool.write(|conn| {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            )",
        )?;

        for (name, sql) in MIGRATIONS {
            let applied: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )?;

            if !applied {
                conn.execute_batch(sql)?;
                conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])?;
                tracing::info!("applied migration: {}", name);
            }
        }
        Ok(())
    })
}
