#![allow(dead_code)]

use rpa_trace::classify::KeywordEvent;
use rpa_trace::{BBox, Result, Surface, Viewport};
use std::collections::HashMap;

/// Scriptable page: every screenshot is `shot-<n>`, locators map to fixed
/// boxes that move when the page scrolls.
pub struct FakePage {
    pub open: bool,
    pub shots: u32,
    pub boxes: HashMap<String, BBox>,
    pub viewport: Viewport,
    pub resolved: Vec<String>,
    pub scrolled_into_view: Vec<String>,
    pub scrolled_to_top: usize,
    pub settled: usize,
}

impl FakePage {
    pub fn open() -> Self {
        Self {
            open: true,
            shots: 0,
            boxes: HashMap::new(),
            viewport: Viewport {
                width: 1280,
                height: 720,
            },
            resolved: Vec::new(),
            scrolled_into_view: Vec::new(),
            scrolled_to_top: 0,
            settled: 0,
        }
    }

    pub fn with_box(mut self, locator: &str, bbox: BBox) -> Self {
        self.boxes.insert(locator.to_string(), bbox);
        self
    }
}

impl Surface for FakePage {
    fn is_open(&mut self) -> bool {
        self.open
    }

    fn capture_screenshot(&mut self, _region: Option<BBox>) -> Result<String> {
        self.shots += 1;
        Ok(format!("shot-{}", self.shots))
    }

    fn dom_snapshot(&mut self) -> Result<String> {
        Ok("<html><body></body></html>".to_string())
    }

    fn resolve_locator(&mut self, locator: &str) -> Result<Option<(BBox, (i32, i32))>> {
        self.resolved.push(locator.to_string());
        Ok(self.boxes.get(locator).map(|b| (*b, b.center())))
    }

    fn viewport(&mut self) -> Result<Viewport> {
        Ok(self.viewport)
    }

    fn scroll_into_view(&mut self, locator: &str) -> Result<()> {
        self.scrolled_into_view.push(locator.to_string());
        let half = self.viewport.height / 2;
        if let Some(bbox) = self.boxes.get_mut(locator) {
            bbox.y = half;
        }
        Ok(())
    }

    fn scroll_to_top(&mut self) -> Result<()> {
        self.scrolled_to_top += 1;
        for bbox in self.boxes.values_mut() {
            bbox.y += 400;
        }
        Ok(())
    }

    fn settle(&mut self) -> Result<()> {
        self.settled += 1;
        Ok(())
    }
}

/// A user keyword, recorded as a Task.
pub fn task(name: &str) -> KeywordEvent {
    KeywordEvent::keyword(None, name)
}

/// A browser keyword registered as page content, recorded as an Action.
pub fn page_action(name: &str, args: &[&str]) -> KeywordEvent {
    KeywordEvent::keyword(Some("Browser"), name)
        .with_tags(&["PageContent"])
        .with_args(args)
}

pub fn passed(event: &KeywordEvent) -> KeywordEvent {
    event.clone().with_status("PASS")
}
