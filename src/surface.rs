//! Capability interface to the driven surface (browser page, desktop).

use serde::{Deserialize, Serialize};

use crate::bbox::BBox;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: i32,
    pub height: i32,
}

/// What the recorder needs from a browser or desktop driver.
///
/// Lookups that can legitimately fail (locator not on the page) return
/// `Option`; transport failures return `Err`.
pub trait Surface {
    fn is_open(&mut self) -> bool;

    /// Base64 PNG of the whole surface, or of `region` when given.
    fn capture_screenshot(&mut self, region: Option<BBox>) -> Result<String>;

    fn dom_snapshot(&mut self) -> Result<String>;

    /// Box of the element matched by `locator` and the pointer position an
    /// interaction with it would use.
    fn resolve_locator(&mut self, locator: &str) -> Result<Option<(BBox, (i32, i32))>>;

    fn viewport(&mut self) -> Result<Viewport>;

    fn scroll_into_view(&mut self, locator: &str) -> Result<()>;

    fn scroll_to_top(&mut self) -> Result<()>;

    /// Wait for the surface to finish reacting to the last interaction.
    fn settle(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A surface that is never open. Used when replaying recorded event logs,
/// where no screenshots can be taken.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl Surface for NullSurface {
    fn is_open(&mut self) -> bool {
        false
    }

    fn capture_screenshot(&mut self, _region: Option<BBox>) -> Result<String> {
        Ok(String::new())
    }

    fn dom_snapshot(&mut self) -> Result<String> {
        Ok(String::new())
    }

    fn resolve_locator(&mut self, _locator: &str) -> Result<Option<(BBox, (i32, i32))>> {
        Ok(None)
    }

    fn viewport(&mut self) -> Result<Viewport> {
        Ok(Viewport {
            width: 0,
            height: 0,
        })
    }

    fn scroll_into_view(&mut self, _locator: &str) -> Result<()> {
        Ok(())
    }

    fn scroll_to_top(&mut self) -> Result<()> {
        Ok(())
    }
}
