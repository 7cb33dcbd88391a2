//! Page-state snapshots taken before and after each recorded step.
//!
//! Screenshots are kept as base64-encoded PNG strings, the form both the
//! drivers and the inference service exchange. Two observations are equal
//! when their screenshots have the same perceptual average hash, so
//! near-identical screens fold together without comparing raw bytes.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use image::ImageFormat;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use crate::error::{Result, TraceError};

/// 64-bit perceptual average hash of a screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHash(pub u64);

impl ImageHash {
    const SIDE: u32 = 8;

    /// Hash a base64-encoded image. Returns `None` when the payload is empty
    /// or not a decodable image.
    pub fn from_base64(encoded: &str) -> Option<Self> {
        if encoded.is_empty() {
            return None;
        }
        let bytes = BASE64_STANDARD.decode(encoded.trim()).ok()?;
        let image = image::load_from_memory(&bytes).ok()?;
        let small = image
            .grayscale()
            .resize_exact(Self::SIDE, Self::SIDE, FilterType::Triangle)
            .to_luma8();

        let pixels: Vec<u32> = small.pixels().map(|p| u32::from(p.0[0])).collect();
        let mean = pixels.iter().sum::<u32>() / pixels.len() as u32;
        let bits = pixels
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, value)| if *value > mean { acc | (1 << i) } else { acc });
        Some(Self(bits))
    }

    /// Hamming distance between two hashes.
    pub fn distance(&self, other: &ImageHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Captured screenshot, DOM and pointer position at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    /// Base64-encoded PNG.
    pub screenshot: Arc<str>,
    pub dom_snapshot: Arc<str>,
    pub pointer: (i32, i32),
}

impl Observation {
    pub fn new(
        timestamp: DateTime<Utc>,
        screenshot: impl Into<Arc<str>>,
        dom_snapshot: impl Into<Arc<str>>,
        pointer: (i32, i32),
    ) -> Self {
        Self {
            timestamp,
            screenshot: screenshot.into(),
            dom_snapshot: dom_snapshot.into(),
            pointer,
        }
    }

    /// The empty observation a session starts with, before any surface is open.
    pub fn placeholder() -> Self {
        Self::new(Utc::now(), "", "", (0, 0))
    }

    pub fn is_placeholder(&self) -> bool {
        self.screenshot.is_empty()
    }

    /// Timestamp and screenshot are present. The DOM is optional: desktop
    /// surfaces and the HTTP backend never provide one.
    pub fn is_complete(&self) -> bool {
        !self.screenshot.is_empty()
    }

    pub fn image_hash(&self) -> Option<ImageHash> {
        ImageHash::from_base64(&self.screenshot)
    }

    /// Hamming distance between the screenshot hashes, `None` if either
    /// screenshot cannot be hashed.
    pub fn similarity(&self, other: &Observation) -> Option<u32> {
        Some(self.image_hash()?.distance(&other.image_hash()?))
    }
}

impl PartialEq for Observation {
    fn eq(&self, other: &Self) -> bool {
        self.image_hash() == other.image_hash()
    }
}

/// Interning pool for DOM snapshots.
///
/// Pages re-render the same markup over and over; every snapshot is stored
/// once and later identical snapshots share the stored `Arc`.
#[derive(Debug, Default, Clone)]
pub struct DomSet {
    doms: HashSet<Arc<str>>,
}

impl DomSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dom(&mut self, dom: &str) -> Arc<str> {
        if let Some(existing) = self.doms.get(dom) {
            return Arc::clone(existing);
        }
        let stored: Arc<str> = Arc::from(dom);
        self.doms.insert(Arc::clone(&stored));
        stored
    }

    pub fn len(&self) -> usize {
        self.doms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doms.is_empty()
    }
}

/// Encode raw image bytes the way observations store them.
pub fn encode_screenshot(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(bytes)
}

/// Strip a `data:image/png;base64,` style prefix if present.
pub fn strip_data_uri(screenshot: &str) -> &str {
    match screenshot.split_once(',') {
        Some((prefix, payload)) if prefix.starts_with("data:") => payload,
        _ => screenshot,
    }
}

/// Resize a base64 PNG to exactly `width`x`height`. Returns the new payload
/// and the x/y factors to apply to boxes measured on the original.
pub fn resize_screenshot(encoded: &str, width: u32, height: u32) -> Result<(String, f64, f64)> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|e| TraceError::Parse(format!("screenshot is not base64: {e}")))?;
    let original = image::load_from_memory(&bytes)
        .map_err(|e| TraceError::Parse(format!("screenshot is not an image: {e}")))?;
    let sx = f64::from(width) / f64::from(original.width().max(1));
    let sy = f64::from(height) / f64::from(original.height().max(1));

    let resized = original.resize_exact(width, height, FilterType::Triangle);
    let mut out = Cursor::new(Vec::new());
    resized
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| TraceError::Parse(format!("could not encode resized screenshot: {e}")))?;
    Ok((encode_screenshot(out.get_ref()), sx, sy))
}
