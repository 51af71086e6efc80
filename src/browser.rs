use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Injectable time source so the poll loops in the fetcher and the backoff in
/// the store writer can be tested without real waiting.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used by the binary.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// One isolated browser page. Everything the fetcher needs from the
/// automation driver: navigate, measure content height, scroll, probe for an
/// element, and read a two-column table.
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&self, url: &str) -> Result<(), FetchError>;
    async fn content_height(&self) -> Result<i64, FetchError>;
    async fn scroll_to_bottom(&self) -> Result<(), FetchError>;
    async fn has_element(&self, selector: &str) -> Result<bool, FetchError>;
    /// Text of the first two `<td>` cells of every row under `container`.
    async fn table_rows(&self, container: &str) -> Result<Vec<(String, String)>, FetchError>;
    async fn close(self: Box<Self>);
}

/// Session factory: one page per fetch, torn down after each.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageSession>, FetchError>;
}

fn browser_err(e: impl ToString) -> FetchError {
    FetchError::Browser(e.to_string())
}

// ── Headless Chrome ──

/// Chromium driven over CDP. Launched once per scrape run; the event handler
/// runs on its own task until the browser is closed.
pub struct HeadlessChrome {
    browser: chromiumoxide::Browser,
    handler: tokio::task::JoinHandle<()>,
}

impl HeadlessChrome {
    pub async fn launch() -> anyhow::Result<Self> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!("--user-agent={USER_AGENT}"))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to configure browser: {e}"))?;

        let (browser, mut handler) = chromiumoxide::Browser::launch(config).await?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        Ok(Self { browser, handler })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser: {e}");
        }
        self.handler.abort();
    }
}

#[async_trait]
impl Browser for HeadlessChrome {
    async fn open(&self) -> Result<Box<dyn PageSession>, FetchError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(browser_err)?;
        Ok(Box::new(ChromePage::new(page)))
    }
}

/// A single CDP page with guaranteed teardown: explicit `close()` on the
/// normal path, a spawned close from `Drop` on error paths. Pages leak CDP
/// connections if never closed.
struct ChromePage {
    page: Option<Page>,
    runtime: tokio::runtime::Handle,
}

impl ChromePage {
    fn new(page: Page) -> Self {
        Self {
            page: Some(page),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    fn page(&self) -> &Page {
        self.page.as_ref().expect("page already closed")
    }
}

#[async_trait]
impl PageSession for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        let page = self.page();
        page.goto(url).await.map_err(browser_err)?;
        page.wait_for_navigation().await.map_err(browser_err)?;
        Ok(())
    }

    async fn content_height(&self) -> Result<i64, FetchError> {
        self.page()
            .evaluate("document.body.scrollHeight")
            .await
            .map_err(browser_err)?
            .into_value::<i64>()
            .map_err(browser_err)
    }

    async fn scroll_to_bottom(&self) -> Result<(), FetchError> {
        self.page()
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await
            .map_err(browser_err)?;
        Ok(())
    }

    async fn has_element(&self, selector: &str) -> Result<bool, FetchError> {
        Ok(self.page().find_element(selector).await.is_ok())
    }

    async fn table_rows(&self, container: &str) -> Result<Vec<(String, String)>, FetchError> {
        let script = format!(
            "Array.from(document.querySelectorAll('{container} table tbody tr'))\
                 .map(tr => Array.from(tr.querySelectorAll('td')).slice(0, 2)\
                 .map(td => td.innerText))"
        );
        let cells: Vec<Vec<String>> = self
            .page()
            .evaluate(script)
            .await
            .map_err(browser_err)?
            .into_value()
            .map_err(browser_err)?;

        Ok(cells
            .into_iter()
            .filter_map(|row| {
                let mut cells = row.into_iter();
                Some((cells.next()?, cells.next()?))
            })
            .collect())
    }

    async fn close(mut self: Box<Self>) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close page: {e}");
            } else {
                debug!("Page closed");
            }
        }
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.runtime.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

// ── Test doubles ──

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Clock that never blocks: `sleep` just advances the simulated instant.
    pub struct TestClock {
        now: Mutex<Instant>,
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }
    }

    /// Scripted page: `rows: Some(..)` means the content anchor appears and
    /// yields those rows; `None` means it never appears (timeout path).
    pub struct FakePage {
        pub rows: Option<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PageSession for FakePage {
        async fn navigate(&self, _url: &str) -> Result<(), FetchError> {
            Ok(())
        }

        async fn content_height(&self) -> Result<i64, FetchError> {
            Ok(1080)
        }

        async fn scroll_to_bottom(&self) -> Result<(), FetchError> {
            Ok(())
        }

        async fn has_element(&self, _selector: &str) -> Result<bool, FetchError> {
            Ok(self.rows.is_some())
        }

        async fn table_rows(&self, _container: &str) -> Result<Vec<(String, String)>, FetchError> {
            Ok(self.rows.clone().unwrap_or_default())
        }

        async fn close(self: Box<Self>) {}
    }

    pub struct FakeBrowser {
        pub rows: Option<Vec<(String, String)>>,
        pub opened: Arc<AtomicUsize>,
    }

    impl FakeBrowser {
        pub fn new(rows: Option<Vec<(String, String)>>) -> Self {
            Self {
                rows,
                opened: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Browser for FakeBrowser {
        async fn open(&self) -> Result<Box<dyn PageSession>, FetchError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage {
                rows: self.rows.clone(),
            }))
        }
    }
}
