use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Works: the identifier records and their consolidated answer
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS works (
            id TEXT PRIMARY KEY,
            rand REAL NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            title TEXT,
            normalized_title TEXT,
            scrape_updated INTEGER,
            scrape_evidence TEXT,
            scrape_pdf_url TEXT,
            scrape_metadata_url TEXT,
            scrape_license TEXT,
            response_json TEXT,
            response_is_oa INTEGER NOT NULL DEFAULT 0,
            response_best_url TEXT,
            response_best_evidence TEXT,
            response_best_version TEXT,
            response_best_host TEXT,
            response_color TEXT,
            response_updated INTEGER,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Separate-table queues share one layout
    for table in ["work_queue", "page_queue"] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                rand REAL NOT NULL,
                enqueued INTEGER NOT NULL DEFAULT 1,
                started INTEGER,
                finished INTEGER,
                owner_tag TEXT
            )
            "#
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_claim ON {table}(finished, started, rand)"
        ))
        .execute(pool)
        .await?;
    }

    // Endpoints carry their own lease columns (flag-on-base queue)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS endpoints (
            id TEXT PRIMARY KEY,
            base_url TEXT NOT NULL,
            pmh_set TEXT,
            rand REAL NOT NULL,
            owner_tag TEXT,
            last_harvest_started INTEGER,
            last_harvest_finished INTEGER,
            most_recent_date_harvested TEXT,
            error TEXT,
            ready_to_run INTEGER NOT NULL DEFAULT 1,
            UNIQUE(base_url, pmh_set)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Harvested pages: one row per (record, url)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            endpoint_id TEXT NOT NULL,
            pmh_id TEXT NOT NULL,
            url TEXT NOT NULL,
            doi TEXT,
            title TEXT,
            normalized_title TEXT,
            authors_json TEXT NOT NULL DEFAULT '[]',
            source_tag TEXT NOT NULL DEFAULT 'repository',
            created_at INTEGER NOT NULL,
            scrape_updated INTEGER,
            scrape_pdf_url TEXT,
            scrape_metadata_url TEXT,
            scrape_license TEXT,
            scrape_version TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_doi ON pages(doi)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_title ON pages(normalized_title)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS open_locations (
            id TEXT PRIMARY KEY,
            work_id TEXT NOT NULL,
            pdf_url TEXT,
            metadata_url TEXT,
            license TEXT,
            evidence TEXT NOT NULL,
            version TEXT,
            host_type TEXT,
            endpoint_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_open_locations_work ON open_locations(work_id)")
        .execute(pool)
        .await?;

    // Repository cross-references (e.g. PMC)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repository_links (
            work_id TEXT NOT NULL,
            repository TEXT NOT NULL,
            record_id TEXT NOT NULL,
            release TEXT NOT NULL DEFAULT 'live',
            landing_url TEXT,
            pdf_url TEXT,
            version TEXT,
            PRIMARY KEY (work_id, repository, record_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pmc_manuscripts (
            pmcid TEXT PRIMARY KEY,
            author_manuscript INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Rule tables
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS journal_rules (
            kind TEXT NOT NULL,
            value TEXT NOT NULL,
            license TEXT,
            from_year INTEGER,
            PRIMARY KEY (kind, value)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS license_patterns (
            pattern TEXT PRIMARY KEY,
            normalized TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS manual_overrides (
            work_id TEXT PRIMARY KEY,
            pdf_url TEXT,
            metadata_url TEXT,
            license TEXT,
            version TEXT,
            host_type TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS noncompliant_urls (
            work_id TEXT NOT NULL,
            url_fragment TEXT NOT NULL,
            PRIMARY KEY (work_id, url_fragment)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
