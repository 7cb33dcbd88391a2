use anyhow::{Context, Result};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Chrome driven by the agent. Created once, reused for the whole run.
pub struct BrowserSession {
    _browser: Browser,
    pub tab: Arc<Tab>,
}

impl BrowserSession {
    /// Attach to a Chrome already listening on `debug_url`, or start one.
    pub fn launch(debug_url: Option<String>, headless: bool, window: (u32, u32)) -> Result<Self> {
        if let Some(url) = debug_url {
            info!(%url, "attaching to running chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| anyhow::anyhow!("tab list lock poisoned"))?
                        .first()
                        .cloned();
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    return Ok(Self { _browser: browser, tab });
                }
                Err(e) => warn!(%url, error = %e, "could not attach, launching a new browser"),
            }
        }

        let options = LaunchOptions {
            headless,
            path: std::env::var_os("CHROME_PATH").map(PathBuf::from),
            window_size: Some(window),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("chrome ready");

        Ok(Self { _browser: browser, tab })
    }

    pub fn navigate(&self, url: &str) -> Result<()> {
        self.tab.navigate_to(url)?;
        self.tab.wait_until_navigated()?;
        Ok(())
    }
}
