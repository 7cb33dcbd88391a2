use anyhow::{Context, Result};
use headless_chrome::Tab;
use rpa_trace::{BBox, Viewport};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// JavaScript expression evaluating to the element `locator` designates, or
/// `null`. Understands the `css=`, `id=`, `xpath=` and `text=` strategies;
/// anything else is a CSS selector.
fn element_js(locator: &str) -> String {
    let literal = |s: &str| serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string());
    let xpath = |expr: &str| {
        format!(
            "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue",
            literal(expr)
        )
    };

    if let Some(css) = locator.strip_prefix("css=") {
        format!("document.querySelector({})", literal(css))
    } else if let Some(id) = locator.strip_prefix("id=") {
        format!("document.getElementById({})", literal(id))
    } else if let Some(expr) = locator.strip_prefix("xpath=") {
        xpath(expr)
    } else if locator.starts_with("//") {
        xpath(locator)
    } else if let Some(text) = locator.strip_prefix("text=") {
        let text = text.trim_matches('"');
        xpath(&format!("//*[normalize-space(text())='{}']", text.replace('\'', "")))
    } else {
        format!("document.querySelector({})", literal(locator))
    }
}

/// Evaluate `script`, which must return a JSON string (or `null`).
fn eval_json<T: DeserializeOwned>(tab: &Arc<Tab>, script: &str) -> Result<Option<T>> {
    let result = tab.evaluate(script, false)?;
    match result.value.and_then(|v| v.as_str().map(String::from)) {
        Some(raw) => Ok(Some(serde_json::from_str(&raw).context("page returned malformed JSON")?)),
        None => Ok(None),
    }
}

/// Full page markup.
pub fn capture_dom(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("document.documentElement.outerHTML", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default())
}

/// Box of the element in viewport coordinates, `None` when nothing matches.
pub fn element_rect(tab: &Arc<Tab>, locator: &str) -> Result<Option<BBox>> {
    let script = format!(
        r#"(() => {{
  try {{
    const el = {};
    if (!el) return null;
    const r = el.getBoundingClientRect();
    return JSON.stringify([r.left, r.top, r.width, r.height]);
  }} catch (e) {{ return null; }}
}})()"#,
        element_js(locator)
    );
    let rect: Option<[f64; 4]> = eval_json(tab, &script)?;
    Ok(rect.map(|[x, y, w, h]| BBox::new(x as i32, y as i32, w as i32, h as i32)))
}

pub fn viewport(tab: &Arc<Tab>) -> Result<Viewport> {
    let size: Option<[i32; 2]> = eval_json(tab, "JSON.stringify([window.innerWidth, window.innerHeight])")?;
    let [width, height] = size.context("page did not report its size")?;
    Ok(Viewport { width, height })
}

pub fn scroll_into_view(tab: &Arc<Tab>, locator: &str) -> Result<()> {
    let script = format!(
        "(() => {{ const el = {}; if (el) el.scrollIntoView({{block: 'center'}}); }})()",
        element_js(locator)
    );
    tab.evaluate(&script, false)?;
    Ok(())
}

pub fn scroll_to_top(tab: &Arc<Tab>) -> Result<()> {
    tab.evaluate("window.scrollTo(0, 0)", false)?;
    Ok(())
}

pub fn scroll_by(tab: &Arc<Tab>, pixels: i32) -> Result<()> {
    tab.evaluate(&format!("window.scrollBy(0, {pixels})"), false)?;
    Ok(())
}

/// Click whatever element is under the viewport point.
pub fn click_at(tab: &Arc<Tab>, (x, y): (i32, i32)) -> Result<()> {
    let script = format!(
        r#"(() => {{
  const el = document.elementFromPoint({x}, {y});
  if (!el) return false;
  if (el.focus) el.focus();
  el.click();
  return true;
}})()"#
    );
    let clicked = tab.evaluate(&script, false)?.value.and_then(|v| v.as_bool());
    anyhow::ensure!(clicked == Some(true), "nothing to click at ({x}, {y})");
    Ok(())
}

pub fn is_loaded(tab: &Arc<Tab>) -> Result<bool> {
    let result = tab.evaluate("document.readyState", false)?;
    Ok(result.value.and_then(|v| v.as_str().map(|s| s == "complete")).unwrap_or(false))
}

pub fn get_current_url(tab: &Arc<Tab>) -> Result<String> {
    let result = tab.evaluate("window.location.href", false)?;
    Ok(result
        .value
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "unknown".to_string()))
}
