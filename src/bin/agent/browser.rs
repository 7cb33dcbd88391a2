use headless_chrome::protocol::cdp::Page;
use rpa_trace::observation::encode_screenshot;
use rpa_trace::{AgentCommand, BBox, Result, Surface, TraceError, Viewport};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::dom;
use crate::hands::BrowserSession;

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);

fn surface_error(e: anyhow::Error) -> TraceError {
    TraceError::Surface(format!("{e:#}"))
}

/// The agent's Chrome tab seen through the recorder's capability interface.
pub struct BrowserSurface {
    session: BrowserSession,
    /// Pause after every recorded action before waiting for the page load.
    wait: Duration,
}

impl BrowserSurface {
    pub fn new(session: BrowserSession, wait: Duration) -> Self {
        Self { session, wait }
    }

    /// Carry out a model command on the page.
    pub fn execute(&mut self, command: &AgentCommand) -> anyhow::Result<()> {
        let tab = &self.session.tab;
        match command {
            AgentCommand::ClickAt(bbox) => dom::click_at(tab, bbox.center()),
            AgentCommand::Input(text) => {
                tab.type_str(text)?;
                Ok(())
            }
            AgentCommand::Scroll => {
                let height = dom::viewport(tab)?.height;
                dom::scroll_by(tab, height / 2)
            }
            AgentCommand::Key(keys) => {
                // "Control+a" style chords are typed key by key
                for key in keys.split('+').map(str::trim).filter(|k| !k.is_empty()) {
                    tab.press_key(key)?;
                }
                Ok(())
            }
            AgentCommand::End | AgentCommand::Unknown(_) => Ok(()),
        }
    }

    pub fn current_url(&self) -> String {
        dom::get_current_url(&self.session.tab).unwrap_or_else(|_| "unknown".into())
    }
}

impl Surface for BrowserSurface {
    fn is_open(&mut self) -> bool {
        self.session.tab.evaluate("1", false).is_ok()
    }

    fn capture_screenshot(&mut self, region: Option<BBox>) -> Result<String> {
        let clip = region.map(|b| Page::Viewport {
            x: f64::from(b.x),
            y: f64::from(b.y),
            width: f64::from(b.width),
            height: f64::from(b.height),
            scale: 1.0,
        });
        let png = self
            .session
            .tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, clip, true)
            .map_err(surface_error)?;
        Ok(encode_screenshot(&png))
    }

    fn dom_snapshot(&mut self) -> Result<String> {
        dom::capture_dom(&self.session.tab).map_err(surface_error)
    }

    fn resolve_locator(&mut self, locator: &str) -> Result<Option<(BBox, (i32, i32))>> {
        let bbox = dom::element_rect(&self.session.tab, locator).map_err(surface_error)?;
        Ok(bbox.map(|b| (b, b.center())))
    }

    fn viewport(&mut self) -> Result<Viewport> {
        dom::viewport(&self.session.tab).map_err(surface_error)
    }

    fn scroll_into_view(&mut self, locator: &str) -> Result<()> {
        dom::scroll_into_view(&self.session.tab, locator).map_err(surface_error)
    }

    fn scroll_to_top(&mut self) -> Result<()> {
        dom::scroll_to_top(&self.session.tab).map_err(surface_error)
    }

    fn settle(&mut self) -> Result<()> {
        std::thread::sleep(self.wait);
        let started = Instant::now();
        while !dom::is_loaded(&self.session.tab).map_err(surface_error)? {
            if started.elapsed() > LOAD_TIMEOUT {
                debug!("page still loading, giving up waiting");
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }
}
