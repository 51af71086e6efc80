use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::browser::{Browser, Clock, PageSession};
use crate::db;
use crate::error::{FetchError, PipelineError};

/// Fixed delay after navigation so challenge scripts can finish.
const SETTLE: Duration = Duration::from_secs(6);
/// Pause between scroll steps while waiting for lazy content.
const SCROLL_PAUSE: Duration = Duration::from_millis(1200);
/// Upper bound on waiting for the company information container.
const CONTENT_WAIT: Duration = Duration::from_secs(25);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_FAILURE_THRESHOLD: usize = 10;
const PACING_MS: std::ops::Range<u64> = 4000..7000;

const INFO_CONTAINER: &str = "#company-information";

/// Load the newline-delimited links file. Missing or empty file is fatal
/// before any fetch happens.
pub fn read_links(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Err(PipelineError::LinksMissing(path.to_path_buf()).into());
    }

    let links: Vec<String> = std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if links.is_empty() {
        return Err(PipelineError::LinksEmpty(path.to_path_buf()).into());
    }

    Ok(links)
}

// ── Fetching ──

/// Fetch one company page and harvest its information table.
///
/// navigate → settle → scroll until the page height stabilizes → wait for the
/// content container → read every two-column row into the field map.
pub async fn fetch_company(
    session: &dyn PageSession,
    clock: &dyn Clock,
    url: &str,
) -> Result<BTreeMap<String, String>, FetchError> {
    session.navigate(url).await?;
    clock.sleep(SETTLE).await;

    auto_scroll(session, clock).await?;
    wait_for_container(session, clock).await?;

    let rows = session.table_rows(INFO_CONTAINER).await?;
    let mut data = BTreeMap::new();
    for (key, value) in rows {
        let key = key.trim();
        let value = value.trim();
        if key == "Activity" {
            split_activity(value, &mut data);
        } else {
            data.insert(key.to_string(), value.to_string());
        }
    }

    if data.is_empty() {
        return Err(FetchError::Empty);
    }

    Ok(data)
}

/// Scroll to the bottom until the content height stops growing between
/// consecutive checks. Lazy-rendered pages give no completion signal, so a
/// stable height is the best available proxy; the loop is bounded by the
/// content wait either way.
async fn auto_scroll(session: &dyn PageSession, clock: &dyn Clock) -> Result<(), FetchError> {
    let deadline = clock.now() + CONTENT_WAIT;
    let mut last_height = session.content_height().await?;

    loop {
        session.scroll_to_bottom().await?;
        clock.sleep(SCROLL_PAUSE).await;
        let new_height = session.content_height().await?;
        if new_height == last_height || clock.now() >= deadline {
            return Ok(());
        }
        last_height = new_height;
    }
}

async fn wait_for_container(
    session: &dyn PageSession,
    clock: &dyn Clock,
) -> Result<(), FetchError> {
    let deadline = clock.now() + CONTENT_WAIT;
    loop {
        if session.has_element(INFO_CONTAINER).await? {
            return Ok(());
        }
        if clock.now() >= deadline {
            return Err(FetchError::Timeout);
        }
        clock.sleep(POLL_INTERVAL).await;
    }
}

/// The Activity cell packs NIC code and description into one line-delimited
/// value; split them into their own keys. The composite key itself is dropped.
fn split_activity(value: &str, data: &mut BTreeMap<String, String>) {
    for line in value.lines() {
        if line.contains("NIC Code") {
            data.insert(
                "NIC Code".to_string(),
                line.replace("NIC Code", "").replace(':', "").trim().to_string(),
            );
        } else if line.contains("NIC Description") {
            data.insert(
                "NIC Description".to_string(),
                line.replace("NIC Description", "").replace(':', "").trim().to_string(),
            );
        }
    }
}

// ── Orchestration ──

#[derive(Debug)]
pub struct ScrapeStats {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
}

/// Scrape every link sequentially into the raw store.
///
/// One bad page is counted and skipped; the run only dies when failures pass
/// the threshold, or when nothing at all succeeded.
pub async fn scrape_pipeline(
    browser: &dyn Browser,
    conn: &Connection,
    clock: &dyn Clock,
    links: &[String],
) -> Result<ScrapeStats> {
    let total = links.len();
    let mut success = 0usize;
    let mut failure = 0usize;

    info!("Total links: {total}");

    for (i, url) in links.iter().enumerate() {
        println!("[{}/{}] {}", i + 1, total, url);

        match scrape_one(browser, clock, url).await {
            Ok(data) => {
                if db::insert_raw(conn, clock, &data, url).await.is_success() {
                    success += 1;
                } else {
                    failure += 1;
                }
                // Pacing between page loads, randomized to look less mechanical.
                let pause = fastrand::u64(PACING_MS);
                clock.sleep(Duration::from_millis(pause)).await;
            }
            Err(e) => {
                failure += 1;
                warn!("Failed: {url}");
                warn!("Reason: {e}");
            }
        }

        if failure > MAX_FAILURE_THRESHOLD {
            return Err(PipelineError::TooManyFailures { failed: failure, total }.into());
        }
    }

    println!("\n=========== SUMMARY ===========");
    println!("Success: {success}");
    println!("Failed:  {failure}");

    if success == 0 {
        return Err(PipelineError::TotalFailure.into());
    }

    Ok(ScrapeStats { total, success, failure })
}

/// One isolated page session per link, torn down on every exit path.
async fn scrape_one(
    browser: &dyn Browser,
    clock: &dyn Clock,
    url: &str,
) -> Result<BTreeMap<String, String>, FetchError> {
    let session = browser.open().await?;
    let result = fetch_company(session.as_ref(), clock, url).await;
    session.close().await;
    result
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{FakeBrowser, FakePage, TestClock};
    use std::io::Write;
    use std::sync::atomic::Ordering;

    fn company_rows() -> Vec<(String, String)> {
        vec![
            ("CIN".to_string(), "U72200MH2001PTC123456".to_string()),
            ("Name".to_string(), "ACME PRIVATE LIMITED".to_string()),
            ("Company Status".to_string(), "Active".to_string()),
            (
                "Activity".to_string(),
                "NIC Code: 72200\nNIC Description: Software consultancy".to_string(),
            ),
        ]
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn read_links_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "https://example.com/a\n\n  \nhttps://example.com/b").unwrap();

        let links = read_links(file.path()).unwrap();
        assert_eq!(links, vec!["https://example.com/a", "https://example.com/b"]);
    }

    #[test]
    fn read_links_missing_and_empty_are_fatal() {
        let err = read_links(Path::new("does/not/exist.txt")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::LinksMissing(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "\n   \n").unwrap();
        let err = read_links(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::LinksEmpty(_))
        ));
    }

    #[tokio::test]
    async fn fetch_splits_activity_into_nic_fields() {
        let page = FakePage {
            rows: Some(company_rows()),
        };
        let clock = TestClock::new();

        let data = fetch_company(&page, &clock, "https://example.com/acme")
            .await
            .unwrap();

        assert_eq!(data.get("NIC Code").map(String::as_str), Some("72200"));
        assert_eq!(
            data.get("NIC Description").map(String::as_str),
            Some("Software consultancy")
        );
        assert!(!data.contains_key("Activity"));
        assert_eq!(data.get("CIN").map(String::as_str), Some("U72200MH2001PTC123456"));
    }

    #[tokio::test]
    async fn fetch_times_out_when_container_never_appears() {
        let page = FakePage { rows: None };
        let clock = TestClock::new();

        let err = fetch_company(&page, &clock, "https://example.com/acme")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }

    #[tokio::test]
    async fn fetch_with_no_rows_is_empty() {
        let page = FakePage { rows: Some(vec![]) };
        let clock = TestClock::new();

        let err = fetch_company(&page, &clock, "https://example.com/acme")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Empty));
    }

    #[tokio::test]
    async fn pipeline_stores_scraped_companies() {
        let browser = FakeBrowser::new(Some(company_rows()));
        let conn = test_conn();
        let clock = TestClock::new();
        let links = vec!["https://example.com/acme".to_string()];

        let stats = scrape_pipeline(&browser, &conn, &clock, &links)
            .await
            .unwrap();

        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 0);
        assert_eq!(crate::db::count_raw(&conn).unwrap(), 1);
    }

    #[tokio::test]
    async fn circuit_breaker_stops_the_run() {
        // Every fetch times out; the 11th failure crosses the threshold.
        let browser = FakeBrowser::new(None);
        let conn = test_conn();
        let clock = TestClock::new();
        let links: Vec<String> = (0..50).map(|i| format!("https://example.com/{i}")).collect();

        let err = scrape_pipeline(&browser, &conn, &clock, &links)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::TooManyFailures { failed: 11, total: 50 })
        ));
        // No fetches happen past the breach.
        assert_eq!(browser.opened.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn all_failed_below_threshold_is_total_failure() {
        let browser = FakeBrowser::new(None);
        let conn = test_conn();
        let clock = TestClock::new();
        let links: Vec<String> = (0..3).map(|i| format!("https://example.com/{i}")).collect();

        let err = scrape_pipeline(&browser, &conn, &clock, &links)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::TotalFailure)
        ));
    }
}
