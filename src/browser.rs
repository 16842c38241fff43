//! Browser sessions as a scoped, pooled resource.
//!
//! The lookup engine only sees [`BrowserSession`] and [`BrowserLauncher`]; the
//! WebDriver implementation talks the W3C protocol to a chromedriver-style
//! endpoint over plain HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::error::StageError;

#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), StageError>;
    /// Rendered page source after navigation.
    async fn page_source(&mut self) -> Result<String, StageError>;
    async fn close(self: Box<Self>) -> Result<(), StageError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, StageError>;
}

/// Lazily launched, reused sessions, at most `capacity` alive at once.
///
/// A session is held by one task at a time through a [`BrowserLease`]. Leases
/// dropped without [`BrowserPool::release`] (cancelled or failed tasks) retire
/// their session; [`BrowserPool::shutdown`] closes everything.
pub struct BrowserPool {
    launcher: Arc<dyn BrowserLauncher>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BrowserSession>>>,
    retired: Arc<Mutex<Vec<Box<dyn BrowserSession>>>>,
    launched: AtomicUsize,
}

pub struct BrowserLease {
    session: Option<Box<dyn BrowserSession>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    retired: Arc<Mutex<Vec<Box<dyn BrowserSession>>>>,
}

impl BrowserLease {
    pub fn session(&mut self) -> &mut dyn BrowserSession {
        // only None after release/discard, which consume the lease
        self.session.as_deref_mut().expect("lease holds a session until consumed")
    }

    /// Marks the session as broken; it is closed at shutdown, never reused.
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.retired.lock().unwrap_or_else(|p| p.into_inner()).push(session);
        }
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Browser lease dropped without release, retiring session");
            self.retired.lock().unwrap_or_else(|p| p.into_inner()).push(session);
        }
    }
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, capacity: usize) -> Self {
        BrowserPool {
            launcher,
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            idle: Mutex::new(Vec::new()),
            retired: Arc::new(Mutex::new(Vec::new())),
            launched: AtomicUsize::new(0),
        }
    }

    /// Waits for a free slot, then reuses an idle session or launches one.
    pub async fn acquire(&self) -> Result<BrowserLease, StageError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StageError::BrowserLaunch("browser pool is shut down".into()))?;

        let reused = self.idle.lock().unwrap_or_else(|p| p.into_inner()).pop();
        let session = match reused {
            Some(session) => session,
            None => {
                let session = self.launcher.launch().await?;
                let n = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Launched browser session #{}", n);
                session
            }
        };

        Ok(BrowserLease {
            session: Some(session),
            _permit: permit,
            retired: self.retired.clone(),
        })
    }

    pub fn release(&self, mut lease: BrowserLease) {
        if let Some(session) = lease.session.take() {
            self.idle.lock().unwrap_or_else(|p| p.into_inner()).push(session);
        }
    }

    /// Sessions launched over the pool's lifetime.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Closes idle and retired sessions and refuses new leases.
    pub async fn shutdown(&self) {
        self.slots.close();
        let mut sessions: Vec<Box<dyn BrowserSession>> =
            std::mem::take(&mut *self.idle.lock().unwrap_or_else(|p| p.into_inner()));
        sessions.extend(std::mem::take(
            &mut *self.retired.lock().unwrap_or_else(|p| p.into_inner()),
        ));
        let count = sessions.len();
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("Failed to close browser session: {}", e);
            }
        }
        if count > 0 {
            info!("Closed {} browser session(s)", count);
        }
    }
}

/// Launches sessions on a W3C WebDriver endpoint (chromedriver, selenium grid).
pub struct WebDriverLauncher {
    client: Client,
    endpoint: String,
}

impl WebDriverLauncher {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, StageError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::BrowserLaunch(e.to_string()))?;
        Ok(WebDriverLauncher {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn capabilities() -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": [
                            "--headless=new",
                            "--no-sandbox",
                            "--disable-dev-shm-usage",
                            "--disable-blink-features=AutomationControlled"
                        ],
                        "excludeSwitches": ["enable-automation"]
                    }
                }
            }
        })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, StageError> {
        let resp = self
            .client
            .post(format!("{}/session", self.endpoint))
            .json(&Self::capabilities())
            .send()
            .await
            .map_err(|e| StageError::BrowserLaunch(e.to_string()))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| StageError::BrowserLaunch(e.to_string()))?;
        if let Some(message) = webdriver_error(&body) {
            return Err(StageError::BrowserLaunch(message));
        }
        let id = body["value"]["sessionId"]
            .as_str()
            .or_else(|| body["sessionId"].as_str())
            .ok_or_else(|| StageError::BrowserLaunch("no sessionId in WebDriver response".into()))?;

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.endpoint, id),
        }))
    }
}

pub struct WebDriverSession {
    client: Client,
    base: String,
}

fn webdriver_error(body: &Value) -> Option<String> {
    let error = body["value"]["error"].as_str()?;
    let message = body["value"]["message"].as_str().unwrap_or("");
    Some(format!("{}: {}", error, message))
}

impl WebDriverSession {
    async fn checked(&self, resp: reqwest::Response) -> Result<Value, StageError> {
        let body: Value = resp
            .json()
            .await
            .map_err(|e| StageError::Browser(e.to_string()))?;
        match webdriver_error(&body) {
            Some(message) if message.starts_with("timeout") => Err(StageError::Transient(message)),
            Some(message) => Err(StageError::Browser(message)),
            None => Ok(body),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), StageError> {
        let resp = self
            .client
            .post(format!("{}/url", self.base))
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(|e| StageError::Browser(e.to_string()))?;
        self.checked(resp).await.map(|_| ())
    }

    async fn page_source(&mut self) -> Result<String, StageError> {
        let resp = self
            .client
            .get(format!("{}/source", self.base))
            .send()
            .await
            .map_err(|e| StageError::Browser(e.to_string()))?;
        let body = self.checked(resp).await?;
        body["value"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StageError::Browser("page source missing from response".into()))
    }

    async fn close(self: Box<Self>) -> Result<(), StageError> {
        self.client
            .delete(&self.base)
            .send()
            .await
            .map_err(|e| StageError::Browser(e.to_string()))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeBrowser;
    use super::*;

    #[tokio::test]
    async fn sessions_are_launched_lazily_and_reused() {
        let browser = Arc::new(FakeBrowser::default());
        let pool = BrowserPool::new(browser.clone(), 2);
        assert_eq!(pool.launched(), 0);

        let mut lease = pool.acquire().await.unwrap();
        lease.session().navigate("https://example.com").await.unwrap();
        pool.release(lease);

        let lease = pool.acquire().await.unwrap();
        pool.release(lease);
        assert_eq!(pool.launched(), 1);

        pool.shutdown().await;
        assert_eq!(browser.closes.load(Ordering::SeqCst), 1);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn dropped_and_discarded_leases_are_closed_at_shutdown() {
        let browser = Arc::new(FakeBrowser::default());
        let pool = BrowserPool::new(browser.clone(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        b.discard();

        // neither is reused
        let c = pool.acquire().await.unwrap();
        pool.release(c);
        assert_eq!(pool.launched(), 3);

        pool.shutdown().await;
        assert_eq!(browser.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn launch_failure_surfaces_as_browser_launch_error() {
        let browser = Arc::new(FakeBrowser {
            fail_launch: true,
            ..FakeBrowser::default()
        });
        let pool = BrowserPool::new(browser, 1);
        assert!(matches!(pool.acquire().await, Err(StageError::BrowserLaunch(_))));
        // the slot is given back after a failed launch
        assert!(matches!(pool.acquire().await, Err(StageError::BrowserLaunch(_))));
    }

    #[test]
    fn webdriver_error_bodies_are_recognised() {
        let body = json!({"value": {"error": "session not created", "message": "no chrome binary"}});
        assert_eq!(
            webdriver_error(&body).as_deref(),
            Some("session not created: no chrome binary")
        );
        assert!(webdriver_error(&json!({"value": {"sessionId": "abc"}})).is_none());
    }
}
