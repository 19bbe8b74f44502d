use std::future::Future;
use std::time::Duration;

use qlb_remote::{GatewayError, Page};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Cooperative stop signal observed at every inter-request delay.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested; never resolves for [`Shutdown::never`].
    pub async fn triggered(mut self) {
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleeps for `delay` unless shutdown is requested first. Returns `false`
    /// when the caller should stop.
    pub async fn pause(&self, delay: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_triggered(),
            changed = rx.changed() => match changed {
                Ok(()) if *rx.borrow() => false,
                // Sender gone or spurious change: finish the delay.
                _ => {
                    tokio::time::sleep(delay).await;
                    !self.is_triggered()
                }
            },
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::never()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: u32,
    pub max_pages: u32,
    pub delay: Duration,
}

#[derive(Debug)]
pub struct PagedFetch<T> {
    pub items: Vec<T>,
    /// Records the server sent that could not be decoded.
    pub rejected: Vec<String>,
    pub pages_fetched: u32,
    /// Error that cut the loop short, if any.
    pub error: Option<String>,
    pub failed_on_first_page: bool,
    pub interrupted: bool,
}

impl<T> PagedFetch<T> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.interrupted
    }
}

/// Pulls pages `1..` until an empty page, a page shorter than `page_size`,
/// or `max_pages` is reached. The server's `has_more` hint is ignored.
/// A failing page ends the loop; the items gathered so far are kept.
/// Undecodable records still count towards the page size.
pub async fn fetch_all_pages<T, F, Fut>(
    limits: PageLimits,
    shutdown: &Shutdown,
    mut fetch: F,
) -> PagedFetch<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page<T>, GatewayError>>,
{
    let mut out = PagedFetch {
        items: Vec::new(),
        rejected: Vec::new(),
        pages_fetched: 0,
        error: None,
        failed_on_first_page: false,
        interrupted: false,
    };
    let page_size = limits.page_size.max(1) as usize;

    for page in 1..=limits.max_pages.max(1) {
        if page > 1 && !shutdown.pause(limits.delay).await {
            debug!(page, "shutdown requested, stopping pagination");
            out.interrupted = true;
            break;
        }
        match fetch(page).await {
            Ok(batch) => {
                out.pages_fetched += 1;
                let count = batch.served();
                out.items.extend(batch.items);
                out.rejected.extend(batch.rejected);
                if count < page_size {
                    break;
                }
                if page == limits.max_pages {
                    warn!(max_pages = limits.max_pages, "page limit reached, stopping");
                }
            }
            Err(err) => {
                warn!(page, error = %err, "page request failed, keeping fetched items");
                out.failed_on_first_page = page == 1;
                out.error = Some(format!("page {page}: {err}"));
                break;
            }
        }
    }
    out
}
