use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::browser::Clock;

const DB_PATH: &str = "data/zauba.sqlite";
const MAX_WRITE_RETRIES: u32 = 3;

pub fn connect() -> Result<Connection> {
    std::fs::create_dir_all("data")?;
    let conn = Connection::open(DB_PATH)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS companies_raw (
            id         INTEGER PRIMARY KEY,
            cin        TEXT NOT NULL,
            source_url TEXT NOT NULL,
            scraped_at TEXT NOT NULL,
            raw_data   TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_cin ON companies_raw(cin);
        CREATE INDEX IF NOT EXISTS idx_raw_scraped_at ON companies_raw(scraped_at);

        CREATE TABLE IF NOT EXISTS companies_cleaned (
            cin                   TEXT PRIMARY KEY,
            name                  TEXT NOT NULL,
            company_status        TEXT NOT NULL,
            date_of_incorporation TEXT NOT NULL,
            listed_status         TEXT,
            roc                   TEXT,
            registration_number   INTEGER,
            company_category      TEXT,
            company_sub_category  TEXT,
            company_class         TEXT,
            authorized_capital    INTEGER,
            paid_up_capital       INTEGER,
            company_age_years     INTEGER,
            nic_code              INTEGER,
            nic_description       TEXT,
            number_of_members     INTEGER,
            source_url            TEXT,
            scraped_at            TEXT,
            cleaned_at            TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ── Raw store ──

/// What happened to one scraped record at the write boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    /// A record with this CIN already exists. Not an error: uniqueness is
    /// enforced by the store, so a repeat fetch counts as delivered.
    Duplicate,
    /// No CIN in the extracted fields; nothing was written.
    Skipped,
    Failed,
}

impl WriteOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, WriteOutcome::Inserted | WriteOutcome::Duplicate)
    }
}

/// Insert one raw company document keyed by its CIN.
///
/// Transient store errors (busy/locked) are retried up to 3 times with
/// `2^attempt` seconds of backoff; anything else fails immediately.
pub async fn insert_raw(
    conn: &Connection,
    clock: &dyn Clock,
    raw_data: &BTreeMap<String, String>,
    source_url: &str,
) -> WriteOutcome {
    let Some(cin) = raw_data
        .get("CIN")
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
    else {
        warn!("CIN missing, skipping {source_url}");
        return WriteOutcome::Skipped;
    };

    let raw_json = match serde_json::to_string(raw_data) {
        Ok(json) => json,
        Err(e) => {
            warn!("Could not encode raw data for CIN {cin}: {e}");
            return WriteOutcome::Failed;
        }
    };
    let scraped_at = fmt_ts(Utc::now());

    for attempt in 1..=MAX_WRITE_RETRIES {
        let result = conn.execute(
            "INSERT INTO companies_raw (cin, source_url, scraped_at, raw_data)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![cin, source_url, scraped_at, raw_json],
        );

        match result {
            Ok(_) => {
                info!("Inserted CIN: {cin}");
                return WriteOutcome::Inserted;
            }
            Err(e) if is_unique_violation(&e) => {
                warn!("Duplicate CIN skipped: {cin}");
                return WriteOutcome::Duplicate;
            }
            Err(e) if is_transient(&e) && attempt < MAX_WRITE_RETRIES => {
                warn!("Store retry {attempt} for CIN {cin}: {e}");
                clock.sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }
            Err(e) if is_transient(&e) => {
                warn!("Store retries exhausted for CIN {cin}: {e}");
                return WriteOutcome::Failed;
            }
            Err(e) => {
                warn!("Store error for CIN {cin}: {e}");
                return WriteOutcome::Failed;
            }
        }
    }

    WriteOutcome::Failed
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// One stored raw document. `raw_data` stays JSON-encoded here; the cleaner
/// decodes it so a corrupt document is a counted skip, not a crash.
pub struct RawDoc {
    pub cin: String,
    pub source_url: String,
    pub scraped_at: Option<DateTime<Utc>>,
    pub raw_json: String,
}

pub fn count_raw(conn: &Connection) -> Result<usize> {
    let n = conn.query_row("SELECT COUNT(*) FROM companies_raw", [], |r| r.get(0))?;
    Ok(n)
}

/// All raw documents, oldest fetch first, so the latest fetch of a key wins
/// the upsert.
pub fn fetch_raw(conn: &Connection) -> Result<Vec<RawDoc>> {
    let mut stmt = conn.prepare(
        "SELECT cin, source_url, scraped_at, raw_data
         FROM companies_raw
         ORDER BY scraped_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let scraped_at: String = row.get(2)?;
            Ok(RawDoc {
                cin: row.get(0)?,
                source_url: row.get(1)?,
                scraped_at: parse_ts(&scraped_at),
                raw_json: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Cleaned store ──

/// Typed projection of one raw document. Mandatory fields stay `Option` until
/// `is_valid` gates the write; optional fields that failed coercion are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanCompany {
    pub cin: Option<String>,
    pub name: Option<String>,
    pub company_status: Option<String>,
    pub date_of_incorporation: Option<NaiveDate>,
    pub listed_status: Option<String>,
    pub roc: Option<String>,
    pub registration_number: Option<i64>,
    pub company_category: Option<String>,
    pub company_sub_category: Option<String>,
    pub company_class: Option<String>,
    pub authorized_capital: Option<i64>,
    pub paid_up_capital: Option<i64>,
    pub company_age_years: Option<i64>,
    pub nic_code: Option<i64>,
    pub nic_description: Option<String>,
    pub number_of_members: Option<i64>,
    pub source_url: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub cleaned_at: Option<DateTime<Utc>>,
}

impl CleanCompany {
    /// Mandatory fields: CIN, name, status, incorporation date.
    pub fn is_valid(&self) -> bool {
        fn filled(v: &Option<String>) -> bool {
            v.as_deref().is_some_and(|s| !s.is_empty())
        }
        filled(&self.cin)
            && filled(&self.name)
            && filled(&self.company_status)
            && self.date_of_incorporation.is_some()
    }
}

/// The lookup response shape. `registration_number` goes out as text so very
/// large identifiers survive JSON number handling; no storage id is exposed.
#[derive(Debug, Serialize)]
pub struct CompanyResponse {
    pub cin: Option<String>,
    pub name: Option<String>,
    pub company_status: Option<String>,
    pub date_of_incorporation: Option<NaiveDate>,
    pub roc: Option<String>,
    pub registration_number: Option<String>,
    pub company_category: Option<String>,
    pub company_sub_category: Option<String>,
    pub company_class: Option<String>,
    pub authorized_capital: Option<i64>,
    pub paid_up_capital: Option<i64>,
    pub listed_status: Option<String>,
    pub nic_code: Option<i64>,
    pub nic_description: Option<String>,
    pub number_of_members: Option<i64>,
    pub company_age_years: Option<i64>,
    pub source_url: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub cleaned_at: Option<DateTime<Utc>>,
}

impl From<CleanCompany> for CompanyResponse {
    fn from(c: CleanCompany) -> Self {
        Self {
            cin: c.cin,
            name: c.name,
            company_status: c.company_status,
            date_of_incorporation: c.date_of_incorporation,
            roc: c.roc,
            registration_number: c.registration_number.map(|n| n.to_string()),
            company_category: c.company_category,
            company_sub_category: c.company_sub_category,
            company_class: c.company_class,
            authorized_capital: c.authorized_capital,
            paid_up_capital: c.paid_up_capital,
            listed_status: c.listed_status,
            nic_code: c.nic_code,
            nic_description: c.nic_description,
            number_of_members: c.number_of_members,
            company_age_years: c.company_age_years,
            source_url: c.source_url,
            scraped_at: c.scraped_at,
            cleaned_at: c.cleaned_at,
        }
    }
}

pub struct UpsertCounts {
    pub inserted: usize,
    pub modified: usize,
}

/// Bulk upsert keyed by CIN, one transaction for the whole batch.
///
/// A row is only rewritten when its payload actually changed (`cleaned_at`
/// excluded from the comparison), so re-running the cleaner against an
/// unchanged raw store is a no-op with `modified == 0`.
pub fn upsert_cleaned(conn: &Connection, docs: &[CleanCompany]) -> Result<UpsertCounts> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    let mut modified = 0;
    {
        let mut select = tx.prepare(&format!(
            "SELECT {CLEAN_COLUMNS} FROM companies_cleaned WHERE cin = ?1"
        ))?;
        let mut upsert = tx.prepare(
            "INSERT INTO companies_cleaned
             (cin, name, company_status, date_of_incorporation, listed_status, roc,
              registration_number, company_category, company_sub_category, company_class,
              authorized_capital, paid_up_capital, company_age_years, nic_code,
              nic_description, number_of_members, source_url, scraped_at, cleaned_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)
             ON CONFLICT(cin) DO UPDATE SET
                 name = excluded.name,
                 company_status = excluded.company_status,
                 date_of_incorporation = excluded.date_of_incorporation,
                 listed_status = excluded.listed_status,
                 roc = excluded.roc,
                 registration_number = excluded.registration_number,
                 company_category = excluded.company_category,
                 company_sub_category = excluded.company_sub_category,
                 company_class = excluded.company_class,
                 authorized_capital = excluded.authorized_capital,
                 paid_up_capital = excluded.paid_up_capital,
                 company_age_years = excluded.company_age_years,
                 nic_code = excluded.nic_code,
                 nic_description = excluded.nic_description,
                 number_of_members = excluded.number_of_members,
                 source_url = excluded.source_url,
                 scraped_at = excluded.scraped_at,
                 cleaned_at = excluded.cleaned_at",
        )?;

        for doc in docs {
            let existing = select
                .query_row(rusqlite::params![doc.cin], row_to_company)
                .optional()?;

            match existing {
                Some(old) if !payload_changed(&old, doc) => continue,
                Some(_) => modified += 1,
                None => inserted += 1,
            }

            upsert.execute(rusqlite::params![
                doc.cin,
                doc.name,
                doc.company_status,
                doc.date_of_incorporation.map(|d| d.to_string()),
                doc.listed_status,
                doc.roc,
                doc.registration_number,
                doc.company_category,
                doc.company_sub_category,
                doc.company_class,
                doc.authorized_capital,
                doc.paid_up_capital,
                doc.company_age_years,
                doc.nic_code,
                doc.nic_description,
                doc.number_of_members,
                doc.source_url,
                doc.scraped_at.map(fmt_ts),
                doc.cleaned_at.map(fmt_ts),
            ])?;
        }
    }
    tx.commit()?;
    Ok(UpsertCounts { inserted, modified })
}

fn payload_changed(old: &CleanCompany, new: &CleanCompany) -> bool {
    let mut probe = new.clone();
    probe.cleaned_at = old.cleaned_at;
    probe != *old
}

const CLEAN_COLUMNS: &str = "cin, name, company_status, date_of_incorporation, listed_status, \
     roc, registration_number, company_category, company_sub_category, company_class, \
     authorized_capital, paid_up_capital, company_age_years, nic_code, nic_description, \
     number_of_members, source_url, scraped_at, cleaned_at";

fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<CleanCompany> {
    let date_of_incorporation: Option<String> = row.get(3)?;
    let scraped_at: Option<String> = row.get(17)?;
    let cleaned_at: Option<String> = row.get(18)?;
    Ok(CleanCompany {
        cin: row.get(0)?,
        name: row.get(1)?,
        company_status: row.get(2)?,
        date_of_incorporation: date_of_incorporation
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        listed_status: row.get(4)?,
        roc: row.get(5)?,
        registration_number: row.get(6)?,
        company_category: row.get(7)?,
        company_sub_category: row.get(8)?,
        company_class: row.get(9)?,
        authorized_capital: row.get(10)?,
        paid_up_capital: row.get(11)?,
        company_age_years: row.get(12)?,
        nic_code: row.get(13)?,
        nic_description: row.get(14)?,
        number_of_members: row.get(15)?,
        source_url: row.get(16)?,
        scraped_at: scraped_at.as_deref().and_then(parse_ts),
        cleaned_at: cleaned_at.as_deref().and_then(parse_ts),
    })
}

pub fn fetch_cleaned(conn: &Connection, cin: &str) -> Result<Option<CleanCompany>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CLEAN_COLUMNS} FROM companies_cleaned WHERE cin = ?1"
    ))?;
    let company = stmt
        .query_row(rusqlite::params![cin], row_to_company)
        .optional()?;
    Ok(company)
}

// ── Stats ──

pub struct Stats {
    pub raw: usize,
    pub cleaned: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let raw = count_raw(conn)?;
    let cleaned: usize =
        conn.query_row("SELECT COUNT(*) FROM companies_cleaned", [], |r| r.get(0))?;
    Ok(Stats { raw, cleaned })
}

// ── Tests ──
