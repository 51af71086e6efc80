use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::db::{self, CleanCompany, RawDoc};
use crate::error::PipelineError;

static YEARS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+years?").unwrap());

// ── Field coercion ──

/// Collapse whitespace runs and trim; empty after trimming means absent.
fn clean_string(value: Option<&str>) -> Option<String> {
    let collapsed = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// The source mostly uses DD/MM/YYYY but older records show ISO dates; try
/// both, first match wins.
fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    let value = value?.trim();
    for fmt in ["%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return Some(date);
        }
    }
    None
}

/// Whole years out of "23 years, 5 months, 10 days". Months and days are not
/// modeled.
fn extract_years(value: Option<&str>) -> Option<i64> {
    YEARS_RE
        .captures(value?)
        .and_then(|caps| caps[1].parse().ok())
}

/// Integer out of noisy text: currency symbols, separators, and stray words
/// are stripped. Signs and decimal points are stripped too, so "-50" reads as
/// 50 (see tests).
fn safe_int(value: Option<&str>) -> Option<i64> {
    let digits: String = value?.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

// ── Transformation ──

/// Project one raw field map onto the typed record. Pure and total: a field
/// that will not coerce comes out as `None`, never as an error.
pub fn transform(
    raw: &BTreeMap<String, String>,
    source_url: &str,
    scraped_at: Option<DateTime<Utc>>,
    cleaned_at: DateTime<Utc>,
) -> CleanCompany {
    let get = |key: &str| raw.get(key).map(String::as_str);

    CleanCompany {
        // Mandatory
        cin: clean_string(get("CIN")),
        name: clean_string(get("Name")),
        company_status: clean_string(get("Company Status")),
        date_of_incorporation: parse_date(get("Date of Incorporation")),

        // Optional core fields
        listed_status: clean_string(get("Listed on Stock Exchange")),
        roc: clean_string(get("ROC")),
        registration_number: safe_int(get("Registration Number")),
        company_category: clean_string(get("Company Category")),
        company_sub_category: clean_string(get("Company Sub Category")),
        company_class: clean_string(get("Class of Company")),

        // Financials
        authorized_capital: safe_int(get("Authorized Capital")),
        paid_up_capital: safe_int(get("Paid-up Capital")),

        // Industry
        company_age_years: extract_years(get("Age of Company")),
        nic_code: safe_int(get("NIC Code")),
        nic_description: clean_string(get("NIC Description")),
        number_of_members: safe_int(get("Number of Members")),

        // Metadata
        source_url: Some(source_url.to_string()),
        scraped_at,
        cleaned_at: Some(cleaned_at),
    }
}

// ── Orchestration ──

#[derive(Debug)]
pub struct CleanSummary {
    pub raw: usize,
    pub upserts: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub modified: usize,
}

impl CleanSummary {
    fn print(&self) {
        println!("\n================ CLEANING SUMMARY ================");
        println!("Raw documents        : {}", self.raw);
        println!("Cleaned (upserts)    : {}", self.upserts);
        println!("Skipped invalid docs : {}", self.skipped);
        println!("Inserted             : {}", self.inserted);
        println!("Updated              : {}", self.modified);
    }
}

/// Normalize every raw document into the cleaned store as one bulk upsert.
///
/// Empty raw store and zero valid output are both fatal; an individual
/// document that fails to decode or validate is a counted skip.
pub fn clean_pipeline(conn: &Connection) -> Result<CleanSummary> {
    let raw_count = db::count_raw(conn)?;
    info!("Raw documents found: {raw_count}");

    if raw_count == 0 {
        return Err(PipelineError::NoRawInput.into());
    }

    let docs = db::fetch_raw(conn)?;
    let cleaned_at = Utc::now();

    let pb = ProgressBar::new(docs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len}")?
            .progress_chars("=> "),
    );

    let mut batch = Vec::new();
    let mut skipped = 0usize;

    for doc in &docs {
        pb.inc(1);
        let Some(cleaned) = transform_doc(doc, cleaned_at) else {
            skipped += 1;
            continue;
        };
        if cleaned.is_valid() {
            batch.push(cleaned);
        } else {
            skipped += 1;
        }
    }
    pb.finish_and_clear();

    if batch.is_empty() {
        return Err(PipelineError::NoValidOutput.into());
    }

    let counts = db::upsert_cleaned(conn, &batch)?;

    let summary = CleanSummary {
        raw: raw_count,
        upserts: batch.len(),
        skipped,
        inserted: counts.inserted,
        modified: counts.modified,
    };
    summary.print();
    Ok(summary)
}

fn transform_doc(doc: &RawDoc, cleaned_at: DateTime<Utc>) -> Option<CleanCompany> {
    match serde_json::from_str::<BTreeMap<String, String>>(&doc.raw_json) {
        Ok(raw) => Some(transform(&raw, &doc.source_url, doc.scraped_at, cleaned_at)),
        Err(e) => {
            warn!("Undecodable raw data for CIN {}: {e}", doc.cin);
            None
        }
    }
}

// ── Tests ──
