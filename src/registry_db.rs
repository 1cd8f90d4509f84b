use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init.sql",
    include_str!("../db/migrations/0001_init.sql"),
)];

/// Квартира из реестра. Реестр ведётся административно и для ядра только читается.
#[derive(Debug, Clone, Serialize)]
pub struct Apartment {
    pub id: i64,
    pub number: u32,
    pub owner_name: Option<String>,
    pub area: f64,
    pub radio: f64,
    pub antenna: f64,
    pub intercom_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct DbStatus {
    pub db_path: String,
    pub exists: bool,
    pub migration_files: Vec<String>,
    pub applied_versions: Vec<String>,
    pub pending_versions: Vec<String>,
    pub schema_migrations_table_exists: bool,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct MigrateResult {
    pub db_path: String,
    pub created: bool,
    pub applied_now: Vec<String>,
    pub skipped: Vec<String>,
    pub applied_total: usize,
    pub pending_total: usize,
}

pub fn open_db(db_path: &Path) -> Result<Connection, String> {
    let conn =
        Connection::open(db_path).map_err(|e| format!("не удалось открыть базу данных: {e}"))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| format!("не удалось включить foreign_keys: {e}"))?;
    Ok(conn)
}

fn ensure_schema_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
}

fn has_schema_migrations_table(conn: &Connection) -> rusqlite::Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_migrations')",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|v| v != 0)?;
    Ok(exists)
}

fn load_applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

pub fn inspect_status_at_path(db_path: &Path) -> Result<DbStatus, String> {
    let migration_files = MIGRATIONS
        .iter()
        .map(|(v, _)| (*v).to_string())
        .collect::<Vec<_>>();
    let exists = db_path.exists();
    if !exists {
        return Ok(DbStatus {
            db_path: db_path.to_string_lossy().to_string(),
            exists: false,
            migration_files: migration_files.clone(),
            applied_versions: Vec::new(),
            pending_versions: migration_files,
            schema_migrations_table_exists: false,
            ready: false,
        });
    }

    let conn =
        Connection::open(db_path).map_err(|e| format!("не удалось открыть базу данных: {e}"))?;
    let schema_table_exists = has_schema_migrations_table(&conn)
        .map_err(|e| format!("не удалось проверить schema_migrations: {e}"))?;

    let applied_versions = if schema_table_exists {
        load_applied_versions(&conn)
            .map_err(|e| format!("не удалось прочитать schema_migrations: {e}"))?
    } else {
        Vec::new()
    };
    let applied_set = applied_versions.iter().cloned().collect::<HashSet<_>>();
    let pending_versions = migration_files
        .iter()
        .filter(|v| !applied_set.contains(*v))
        .cloned()
        .collect::<Vec<_>>();

    Ok(DbStatus {
        db_path: db_path.to_string_lossy().to_string(),
        exists: true,
        migration_files,
        applied_versions,
        pending_versions: pending_versions.clone(),
        schema_migrations_table_exists: schema_table_exists,
        ready: pending_versions.is_empty(),
    })
}

pub fn apply_embedded_migrations(db_path: &Path) -> Result<MigrateResult, String> {
    let created = !db_path.exists();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("не удалось создать каталог базы данных: {e}"))?;
    }

    let mut conn = open_db(db_path)?;
    ensure_schema_migrations_table(&conn)
        .map_err(|e| format!("не удалось создать schema_migrations: {e}"))?;

    let already = load_applied_versions(&conn)
        .map_err(|e| format!("не удалось прочитать применённые миграции: {e}"))?
        .into_iter()
        .collect::<HashSet<_>>();

    let mut applied_now = Vec::new();
    let mut skipped = Vec::new();

    for (version, sql) in MIGRATIONS {
        if already.contains(*version) {
            skipped.push((*version).to_string());
            continue;
        }
        let tx = conn
            .transaction()
            .map_err(|e| format!("не удалось начать транзакцию миграции ({version}): {e}"))?;
        tx.execute_batch(sql)
            .map_err(|e| format!("не удалось выполнить миграцию ({version}): {e}"))?;
        tx.execute(
            "INSERT INTO schema_migrations(version) VALUES (?1)",
            [*version],
        )
        .map_err(|e| format!("не удалось записать schema_migrations ({version}): {e}"))?;
        tx.commit()
            .map_err(|e| format!("не удалось завершить миграцию ({version}): {e}"))?;
        applied_now.push((*version).to_string());
    }

    let applied_total = load_applied_versions(&conn)
        .map_err(|e| format!("не удалось прочитать итог миграций: {e}"))?
        .len();
    let pending_total = MIGRATIONS.len().saturating_sub(applied_total);

    Ok(MigrateResult {
        db_path: db_path.to_string_lossy().to_string(),
        created,
        applied_now,
        skipped,
        applied_total,
        pending_total,
    })
}

/// Реестр квартир по возрастанию номера — порядок обхода при расчётах.
pub fn load_apartments(conn: &Connection) -> Result<Vec<Apartment>, String> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT id, number, owner_name, area, radio, antenna, intercom_cents
            FROM apartments
            ORDER BY number ASC
            "#,
        )
        .map_err(|e| format!("не удалось прочитать реестр квартир: {e}"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Apartment {
                id: row.get(0)?,
                number: row.get(1)?,
                owner_name: row.get(2)?,
                area: row.get(3)?,
                radio: row.get(4)?,
                antenna: row.get(5)?,
                intercom_cents: row.get(6)?,
            })
        })
        .map_err(|e| format!("не удалось прочитать реестр квартир: {e}"))?;

    let mut apartments = Vec::new();
    for row in rows {
        apartments.push(row.map_err(|e| format!("не удалось прочитать квартиру: {e}"))?);
    }
    Ok(apartments)
}
