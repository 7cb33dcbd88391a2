use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TraceError};

/// Axis-aligned pixel rectangle describing an interaction target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a box from two corners. The second corner is exclusive.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.x.saturating_add(self.width / 2),
            self.y.saturating_add(self.height / 2),
        )
    }

    /// `(x1, y1, x2, y2)`, the form image libraries crop with.
    pub fn corners(&self) -> (i32, i32, i32, i32) {
        (self.x, self.y, self.right(), self.bottom())
    }

    /// Euclidean distance between the two centers.
    pub fn distance(&self, other: &BBox) -> f64 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        let dx = f64::from(ax) - f64::from(bx);
        let dy = f64::from(ay) - f64::from(by);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_above_of(&self, other: &BBox) -> bool {
        self.y < other.bottom()
    }

    pub fn is_left_of(&self, other: &BBox) -> bool {
        self.x < other.right()
    }

    /// Bottom edge, used to decide whether a target is below the viewport.
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    /// Rescale the box, e.g. after the screenshot it refers to was resized.
    pub fn scale(&self, sx: f64, sy: f64) -> Self {
        Self::new(
            (f64::from(self.x) * sx) as i32,
            (f64::from(self.y) * sy) as i32,
            (f64::from(self.width) * sx) as i32,
            (f64::from(self.height) * sy) as i32,
        )
    }

    /// Parse the constructor-call form keywords receive their boxes in.
    ///
    /// Accepted forms:
    /// - `BBox(x=0, y=0, width=100, height=100)`
    /// - `BBox(0, 0, 100, 200)`
    /// - `BBox(x1=0, y1=0, x2=100, y2=50)`: width and height are `x2 - x1`
    ///   and `y2 - y1`.
    ///
    /// Anything before the opening parenthesis is ignored, so model output
    /// such as `Click At BBox (x1=87, y1=146, x2=197, y2=175)` parses too.
    pub fn from_rf_string(input: &str) -> Result<Self> {
        let open = input
            .find('(')
            .ok_or_else(|| TraceError::Parse(format!("no '(' in bbox string: {input}")))?;
        let close = input[open..]
            .find(')')
            .map(|offset| open + offset)
            .ok_or_else(|| TraceError::Parse(format!("no ')' in bbox string: {input}")))?;

        let mut keyed: Vec<(Option<String>, i32)> = Vec::new();
        for raw in input[open + 1..close].split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (key, value) = match raw.split_once('=') {
                Some((key, value)) => (Some(key.trim().to_lowercase()), value),
                None => (None, raw),
            };
            keyed.push((key, parse_number(value)?));
        }

        if keyed.len() != 4 {
            return Err(TraceError::Parse(format!(
                "expected 4 bbox arguments, found {}: {input}",
                keyed.len()
            )));
        }

        let lookup = |name: &str| {
            keyed
                .iter()
                .find(|(key, _)| key.as_deref() == Some(name))
                .map(|(_, value)| *value)
        };

        if let (Some(x1), Some(y1), Some(x2), Some(y2)) =
            (lookup("x1"), lookup("y1"), lookup("x2"), lookup("y2"))
        {
            return Ok(Self::from_corners(x1, y1, x2, y2));
        }
        if let (Some(x), Some(y), Some(width), Some(height)) =
            (lookup("x"), lookup("y"), lookup("width"), lookup("height"))
        {
            return Ok(Self::new(x, y, width, height));
        }
        if keyed.iter().all(|(key, _)| key.is_none()) {
            return Ok(Self::new(keyed[0].1, keyed[1].1, keyed[2].1, keyed[3].1));
        }
        Err(TraceError::Parse(format!("unrecognized bbox arguments: {input}")))
    }
}

fn parse_number(raw: &str) -> Result<i32> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-' || *c == '.')
        .collect();
    cleaned
        .parse::<f64>()
        .map(|value| value as i32)
        .map_err(|_| TraceError::Parse(format!("invalid bbox number: {raw}")))
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BBox(x={}, y={}, width={}, height={})",
            self.x, self.y, self.width, self.height
        )
    }
}
