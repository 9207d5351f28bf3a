use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::Rng;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, Transaction, params};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{
    DiscoveredJob, EnrichmentOutcome, JobDetail, JobRow, StateCounts,
};

const BUSY_RETRY_LIMIT: u32 = 5;
const BUSY_RETRY_BASE: Duration = Duration::from_millis(50);

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open() -> Result<Self> {
        Self::open_at(&Self::default_path()?)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        // Company associations may land before their company row, and
        // company rows are rewritten with INSERT OR REPLACE while
        // children reference them. The foreign keys in the schema stay
        // declarative; the bundled SQLite enforces them by default.
        conn.pragma_update(None, "foreign_keys", false)?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "trawl") {
            Ok(proj_dirs.data_dir().join("trawl.db"))
        } else {
            // Fallback to current directory
            Ok(PathBuf::from("trawl.db"))
        }
    }

    /// Provision the schema. Safe to call on every process start: all
    /// statements are IF NOT EXISTS and existing rows are never touched.
    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id INTEGER PRIMARY KEY,
                scraped INTEGER NOT NULL DEFAULT 0,
                company_id INTEGER,
                work_type TEXT,
                formatted_work_type TEXT,
                location TEXT,
                job_posting_url TEXT,
                applies INTEGER,
                original_listed_time TEXT,
                remote_allowed INTEGER,
                application_url TEXT,
                application_type TEXT,
                expiry TEXT,
                closed_time TEXT,
                formatted_experience_level TEXT,
                description TEXT,
                title TEXT,
                skills_desc TEXT,
                views INTEGER,
                listed_time TEXT,
                posting_domain TEXT,
                sponsored INTEGER,
                applicant_tracking_system TEXT,
                job_state TEXT,
                workplace_type TEXT
            );

            CREATE TABLE IF NOT EXISTS skills (
                skill_abr TEXT PRIMARY KEY,
                skill_name TEXT
            );

            CREATE TABLE IF NOT EXISTS job_skills (
                job_id INTEGER,
                skill_abr TEXT,
                FOREIGN KEY (job_id) REFERENCES jobs(job_id),
                FOREIGN KEY (skill_abr) REFERENCES skills(skill_abr),
                PRIMARY KEY (job_id, skill_abr)
            );

            CREATE TABLE IF NOT EXISTS industries (
                industry_id INTEGER PRIMARY KEY,
                industry_name TEXT
            );

            CREATE TABLE IF NOT EXISTS job_industries (
                job_id INTEGER,
                industry_id INTEGER,
                FOREIGN KEY (job_id) REFERENCES jobs(job_id),
                FOREIGN KEY (industry_id) REFERENCES industries(industry_id),
                PRIMARY KEY (job_id, industry_id)
            );

            CREATE TABLE IF NOT EXISTS companies (
                company_id INTEGER PRIMARY KEY,
                name TEXT,
                country TEXT,
                url TEXT
            );

            CREATE TABLE IF NOT EXISTS company_specialities (
                company_id INTEGER NOT NULL,
                speciality INTEGER NOT NULL,
                FOREIGN KEY (company_id) REFERENCES companies (company_id),
                PRIMARY KEY (company_id, speciality)
            );

            CREATE TABLE IF NOT EXISTS company_industries (
                company_id INTEGER NOT NULL,
                industry INTEGER NOT NULL,
                FOREIGN KEY (company_id) REFERENCES companies (company_id),
                PRIMARY KEY (company_id, industry)
            );
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'trawl init' first."));
        }
        Ok(())
    }

    // --- Job Registry (discovery producer side) ---

    /// Record newly discovered job ids as pending work. Rows that already
    /// exist are left completely untouched, whatever their state: the
    /// enrichment consumer may have advanced them since the last scan,
    /// and registration must never undo that. Returns the number of rows
    /// actually created.
    pub fn register_discovered(&mut self, jobs: &BTreeMap<i64, DiscoveredJob>) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        for (job_id, job) in jobs {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO jobs (job_id, title, sponsored) VALUES (?1, ?2, ?3)",
                params![job_id, job.title, job.sponsored as i64],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    // --- Detail Merger (enrichment consumer side) ---

    /// Reconcile a batch of enrichment outcomes into the store. One
    /// transaction per call; identifiers are processed independently so
    /// a bad payload for one job never blocks its batch siblings.
    pub fn apply_enrichment(
        &mut self,
        results: &BTreeMap<i64, EnrichmentOutcome>,
    ) -> Result<MergeStats> {
        let tx = self.conn.transaction()?;
        let mut stats = MergeStats::default();
        for (&job_id, outcome) in results {
            match outcome {
                EnrichmentOutcome::Error(_) => {
                    tx.execute("UPDATE jobs SET scraped = -1 WHERE job_id = ?1", [job_id])?;
                    stats.errored += 1;
                }
                EnrichmentOutcome::Detail(detail) => {
                    // Savepoint per identifier: a failed merge must not
                    // leave that job's earlier statements (notably the
                    // terminal-success UPDATE) in the transaction.
                    tx.execute_batch("SAVEPOINT merge_item")?;
                    match merge_detail(&tx, job_id, detail) {
                        Ok(()) => {
                            tx.execute_batch("RELEASE merge_item")?;
                            stats.merged += 1;
                        }
                        // Contention is batch-fatal, not per-item: abort
                        // so the caller's busy retry sees it.
                        Err(err) if is_busy_error(&err) => return Err(err),
                        Err(err) => {
                            tx.execute_batch("ROLLBACK TO merge_item; RELEASE merge_item")?;
                            tracing::warn!(job_id, error = %err, "skipping unmergeable enrichment result");
                            stats.failed += 1;
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(stats)
    }

    // --- Read side ---

    /// The enrichment consumer's backlog: ids still awaiting detail.
    pub fn pending_ids(&self, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT job_id FROM jobs WHERE scraped = 0 ORDER BY job_id LIMIT ?1")?;
        let rows = stmt.query_map([limit as i64], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list pending jobs")
    }

    pub fn list_pending(&self, limit: usize) -> Result<Vec<JobRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT job_id, scraped, title, company_id, location, sponsored
             FROM jobs WHERE scraped = 0 ORDER BY job_id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list pending jobs")
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<JobRow>> {
        let result = self.conn.query_row(
            "SELECT job_id, scraped, title, company_id, location, sponsored
             FROM jobs WHERE job_id = ?1",
            [job_id],
            Self::row_to_job,
        );
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state_counts(&self) -> Result<StateCounts> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FILTER (WHERE scraped = 0),
                        COUNT(*) FILTER (WHERE scraped > 0),
                        COUNT(*) FILTER (WHERE scraped = -1)
                 FROM jobs",
                [],
                |row| {
                    Ok(StateCounts {
                        pending: row.get(0)?,
                        scraped: row.get(1)?,
                        errored: row.get(2)?,
                    })
                },
            )
            .context("Failed to count job states")
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
        Ok(JobRow {
            job_id: row.get(0)?,
            scraped: row.get(1)?,
            title: row.get(2)?,
            company_id: row.get(3)?,
            location: row.get(4)?,
            sponsored: row.get(5)?,
        })
    }
}

/// Counts for one `apply_enrichment` call, for operator logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub merged: usize,
    pub errored: usize,
    pub failed: usize,
}

fn merge_detail(tx: &Transaction, job_id: i64, detail: &JobDetail) -> Result<()> {
    // The company link rides in the jobs section; company-side sections
    // are only meaningful once it resolved.
    let company_id = detail.jobs.as_ref().and_then(|fields| fields.company_id);

    if let Some(fields) = &detail.jobs {
        let (columns, mut values): (Vec<&'static str>, Vec<Value>) =
            fields.assignments().into_iter().unzip();
        // An empty section carries no columns and must not flip the
        // lifecycle state on its own.
        if !columns.is_empty() {
            let mut sql = String::from("UPDATE jobs SET ");
            for (i, column) in columns.iter().enumerate() {
                write!(sql, "{} = ?{}, ", column, i + 1)?;
            }
            write!(
                sql,
                "scraped = ?{} WHERE job_id = ?{}",
                columns.len() + 1,
                columns.len() + 2
            )?;
            values.push(Value::Integer(Utc::now().timestamp()));
            values.push(Value::Integer(job_id));
            tx.execute(&sql, rusqlite::params_from_iter(values))?;
        }
    }

    if let Some(section) = &detail.industries {
        let names = paired_names(section.industry_ids.len(), section.industry_names.as_deref());
        for (industry_id, name) in section.industry_ids.iter().zip(names) {
            tx.execute(
                "INSERT INTO industries (industry_id, industry_name) VALUES (?1, ?2)
                 ON CONFLICT(industry_id)
                 DO UPDATE SET industry_name = COALESCE(industry_name, excluded.industry_name)",
                params![industry_id, name],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO job_industries (job_id, industry_id) VALUES (?1, ?2)",
                params![job_id, industry_id],
            )?;
        }
    }

    if let Some(section) = &detail.skills {
        let names = paired_names(section.skill_abrs.len(), section.skill_name.as_deref());
        for (skill_abr, name) in section.skill_abrs.iter().zip(names) {
            tx.execute(
                "INSERT INTO skills (skill_abr, skill_name) VALUES (?1, ?2)
                 ON CONFLICT(skill_abr)
                 DO UPDATE SET skill_name = COALESCE(skill_name, excluded.skill_name)",
                params![skill_abr, name],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO job_skills (job_id, skill_abr) VALUES (?1, ?2)",
                params![job_id, skill_abr],
            )?;
        }
    }

    if let (Some(company), Some(company_id)) = (&detail.companies, company_id) {
        // The source sends the whole company record or nothing, so a
        // plain replace is correct here.
        tx.execute(
            "INSERT OR REPLACE INTO companies (company_id, name, country, url)
             VALUES (?1, ?2, ?3, ?4)",
            params![company_id, company.name, company.country, company.url],
        )?;
    }

    if let (Some(section), Some(company_id)) = (&detail.company_industries, company_id) {
        for industry in &section.industries {
            tx.execute(
                "INSERT OR IGNORE INTO company_industries (company_id, industry) VALUES (?1, ?2)",
                params![company_id, industry],
            )?;
        }
    }

    if let (Some(section), Some(company_id)) = (&detail.company_specialities, company_id) {
        for speciality in &section.specialities {
            tx.execute(
                "INSERT OR IGNORE INTO company_specialities (company_id, speciality) VALUES (?1, ?2)",
                params![company_id, speciality],
            )?;
        }
    }

    Ok(())
}

/// Pair a name list with an id list positionally. A length mismatch
/// means the fetch layer handed us garbage for the names; drop them all
/// and keep the ids rather than guessing at alignment.
fn paired_names(len: usize, names: Option<&[Option<String>]>) -> Vec<Option<&str>> {
    match names {
        Some(names) if names.len() == len => names.iter().map(|n| n.as_deref()).collect(),
        _ => vec![None; len],
    }
}

/// Retry `op` while it fails with SQLITE_BUSY / SQLITE_LOCKED, sleeping
/// a jittered, doubling delay between attempts. The other process holds
/// the write lock only for short batch transactions, so contention is
/// expected and transient; anything else propagates immediately.
pub fn with_busy_retry<T, F>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = BUSY_RETRY_BASE;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < BUSY_RETRY_LIMIT && is_busy_error(&err) => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
                tracing::warn!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "store busy, backing off"
                );
                std::thread::sleep(delay + jitter);
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_busy_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<rusqlite::Error>()
            .is_some_and(|e| {
                matches!(
                    e.sqlite_error_code(),
                    Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
                )
            })
    })
}
