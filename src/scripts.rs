//! Scripts evaluated inside the exported page.
//!
//! DOM normalization is data: [`NORMALIZATION_RULES`] is serialized to JSON
//! and handed to a single generic applier, so the whole pass is one
//! evaluation.

use crate::error::ExportResult;
use serde::{Deserialize, Serialize};

/// CJK-capable fallback faces. Local fonts first, then the Noto families.
pub const CJK_FONT_FACES: &str = r#"
@font-face {
  font-family: 'Export Font';
  src: local('PingFang SC'), local('Microsoft YaHei'), local('Noto Sans CJK SC'), local('Noto Sans SC'), local('Source Han Sans SC'), local('WenQuanYi Micro Hei');
  unicode-range: U+4E00-9FFF, U+3400-4DBF, U+3000-303F, U+FF00-FFEF;
}
@font-face {
  font-family: 'Export Font';
  src: local('PingFang TC'), local('Noto Sans CJK TC'), local('Noto Sans TC'), local('Source Han Sans TC');
  unicode-range: U+3100-312F, U+31A0-31BF;
}
@font-face {
  font-family: 'Export Font';
  src: local('Hiragino Sans'), local('Noto Sans CJK JP'), local('Noto Sans JP'), local('Source Han Sans JP');
  unicode-range: U+3040-309F, U+30A0-30FF, U+31F0-31FF;
}
body, p, span, div, h1, h2, h3, h4, h5, h6, li, td, th, a, label, button, input, textarea {
  font-family: 'Export Font', 'Noto Sans CJK SC', 'Noto Sans CJK TC', 'Noto Sans CJK JP', Arial, sans-serif !important;
}
"#;

const MOTION_FREEZE_CSS: &str = r#"
*, *::before, *::after {
  animation-duration: 0.001s !important;
  animation-delay: 0s !important;
  transition-duration: 0.001s !important;
  transition-delay: 0s !important;
  animation-iteration-count: 1 !important;
  scroll-behavior: auto !important;
}
"#;

/// Canonical export stylesheet applied after lazy content has loaded.
pub const EXPORT_STYLE_CSS: &str = r#"
body, p, span, div, h1, h2, h3, h4, h5, h6, li, td, th, a, label {
  font-family: 'Export Font', 'Noto Sans CJK SC', Arial, sans-serif !important;
}
@page { margin: 1cm; size: A4; }
* {
  -webkit-print-color-adjust: exact !important;
  print-color-adjust: exact !important;
}
@media print {
  body {
    -webkit-print-color-adjust: exact !important;
    print-color-adjust: exact !important;
    color-adjust: exact !important;
    margin: 0 !important;
    padding: 0 !important;
  }
  .page-break { page-break-after: always; }
}
.bg-base-100 { background-color: transparent !important; }
"#;

/// Evaluates to `true` once the document finished loading and the body has
/// at least one element.
pub const READY_STATE_PROBE: &str =
    "document.readyState === 'complete' && !!document.body && document.body.children.length > 0";

/// Evaluates to `true` when every `<img>` reports `complete`, including pages
/// without images.
pub const IMAGES_COMPLETE_PROBE: &str =
    "Array.from(document.images).every((img) => img.complete)";

/// Number of `<img>` elements on the page.
pub const IMAGE_COUNT_PROBE: &str = "document.images.length";

/// Resolves `true` after `document.fonts.ready`, `false` when the font loading
/// API is unavailable.
pub const FONTS_READY_SCRIPT: &str = r#"
(async () => {
  if (document.fonts && document.fonts.ready) {
    await document.fonts.ready;
    return true;
  }
  return false;
})()
"#;

/// Largest of the body/root scroll and offset extents.
pub const MEASURE_DIMENSIONS_SCRIPT: &str = r#"
(() => {
  const body = document.body;
  const html = document.documentElement;
  return {
    width: Math.max(body ? body.scrollWidth : 0, body ? body.offsetWidth : 0, html.clientWidth, html.scrollWidth, html.offsetWidth),
    height: Math.max(body ? body.scrollHeight : 0, body ? body.offsetHeight : 0, html.clientHeight, html.scrollHeight, html.offsetHeight),
  };
})()
"#;

pub const CONTENT_CHECK_SCRIPT: &str = r#"
(() => {
  const body = document.body;
  return {
    hasBody: !!body,
    htmlLength: body ? body.innerHTML.length : 0,
    images: document.querySelectorAll('img').length,
    divs: document.querySelectorAll('div').length,
  };
})()
"#;

/// Result of [`CONTENT_CHECK_SCRIPT`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContentCheck {
    pub has_body: bool,
    pub html_length: usize,
    pub images: usize,
    pub divs: usize,
}

/// Script registered before any page script runs: freezes motion and installs
/// the CJK fallback faces as soon as the document has a root element.
pub fn init_script() -> ExportResult<String> {
    let css = serde_json::to_string(&format!("{MOTION_FREEZE_CSS}{CJK_FONT_FACES}"))?;
    Ok(format!(
        r#"(() => {{
  const install = () => {{
    if (document.getElementById('__export_init_style')) return;
    const style = document.createElement('style');
    style.id = '__export_init_style';
    style.textContent = {css};
    (document.head || document.documentElement).appendChild(style);
  }};
  if (document.documentElement) {{
    install();
  }} else {{
    document.addEventListener('DOMContentLoaded', install, {{ once: true }});
  }}
}})()"#
    ))
}

/// Append a `<style>` element with `css` to the live document.
pub fn add_style_script(css: &str) -> ExportResult<String> {
    let css = serde_json::to_string(css)?;
    Ok(format!(
        r#"(() => {{
  const style = document.createElement('style');
  style.textContent = {css};
  (document.head || document.documentElement).appendChild(style);
  return true;
}})()"#
    ))
}

/// Scroll down in `step_px` increments, pausing `interval_ms` between steps,
/// for at most `max_steps` steps, then return to the top. Resolves to the
/// number of steps taken.
pub fn auto_scroll_script(step_px: u32, interval_ms: u64, max_steps: u32) -> String {
    format!(
        r#"new Promise((resolve) => {{
  let travelled = 0;
  let steps = 0;
  const timer = setInterval(() => {{
    const scrollHeight = document.body ? document.body.scrollHeight : 0;
    window.scrollBy(0, {step_px});
    travelled += {step_px};
    steps += 1;
    if (travelled >= scrollHeight || steps >= {max_steps}) {{
      clearInterval(timer);
      window.scrollTo(0, 0);
      resolve(steps);
    }}
  }}, {interval_ms});
}})"#
    )
}

/// Regex rewrite applied to the text of every inline `<style>` block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleRewrite {
    pub pattern: &'static str,
    pub replacement: &'static str,
}

/// Inline style override applied to every element matching `selector`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineOverride {
    pub selector: &'static str,
    pub property: &'static str,
    pub value: &'static str,
    /// Only override when the current inline value equals this.
    pub when: Option<&'static str>,
    /// Leave elements hidden with an inline `display: none` untouched.
    pub skip_hidden: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationRules {
    pub remove_selector: &'static str,
    pub stylesheet_rewrites: &'static [StyleRewrite],
    pub overrides: &'static [InlineOverride],
    pub icon_selector: &'static str,
    pub vector_icon_selector: &'static str,
    pub default_icon_size_px: u32,
}

const fn rule(selector: &'static str, property: &'static str, value: &'static str) -> InlineOverride {
    InlineOverride {
        selector,
        property,
        value,
        when: None,
        skip_hidden: false,
    }
}

const fn visible_rule(
    selector: &'static str,
    property: &'static str,
    value: &'static str,
) -> InlineOverride {
    InlineOverride {
        selector,
        property,
        value,
        when: None,
        skip_hidden: true,
    }
}

pub const NORMALIZATION_RULES: NormalizationRules = NormalizationRules {
    remove_selector: ".no-export",
    stylesheet_rewrites: &[
        StyleRewrite {
            pattern: r"overflow\s*:\s*hidden",
            replacement: "overflow: visible",
        },
        StyleRewrite {
            pattern: r"max-height\s*:",
            replacement: "min-height:",
        },
        StyleRewrite {
            pattern: r"position\s*:\s*fixed",
            replacement: "position: absolute",
        },
        StyleRewrite {
            pattern: r"break-inside\s*:\s*avoid",
            replacement: "break-inside: auto",
        },
    ],
    overrides: &[
        rule("*", "max-height", "none"),
        rule("*", "overflow", "visible"),
        visible_rule("*", "page-break-inside", "auto"),
        visible_rule("*", "break-inside", "auto"),
        InlineOverride {
            selector: "*",
            property: "position",
            value: "absolute",
            when: Some("fixed"),
            skip_hidden: true,
        },
        rule("img", "max-width", "100%"),
        rule("img", "height", "auto"),
        rule("iframe", "width", "100%"),
        rule("iframe", "height", "auto"),
        rule("html", "height", "auto"),
        rule("html", "overflow", "visible"),
        rule("body", "height", "auto"),
        rule("body", "overflow", "visible"),
    ],
    icon_selector: "i[class*='icon'], span[class*='icon'], i[class*='fa-'], .fa, .fas, .far, .fab, .material-icons, .iconfont, .glyphicon",
    vector_icon_selector: "svg",
    default_icon_size_px: 24,
};

const NORMALIZE_FN: &str = r#"(rules) => {
  const report = { removed: 0, rewrittenStyles: 0, overrides: 0, icons: 0, error: null };
  try {
    document.querySelectorAll(rules.removeSelector).forEach((el) => {
      el.remove();
      report.removed += 1;
    });
    document.querySelectorAll('style').forEach((style) => {
      const original = style.textContent || '';
      let next = original;
      for (const rewrite of rules.stylesheetRewrites) {
        next = next.replace(new RegExp(rewrite.pattern, 'gi'), rewrite.replacement);
      }
      if (next !== original) {
        style.textContent = next;
        report.rewrittenStyles += 1;
      }
    });
    for (const rule of rules.overrides) {
      document.querySelectorAll(rule.selector).forEach((el) => {
        if (!el.style) return;
        if (rule.skipHidden && el.style.display === 'none') return;
        if (rule.when !== null && el.style.getPropertyValue(rule.property) !== rule.when) return;
        el.style.setProperty(rule.property, rule.value);
        report.overrides += 1;
      });
    }
    document.querySelectorAll(rules.iconSelector).forEach((el) => {
      el.style.setProperty('visibility', 'visible');
      el.style.setProperty('opacity', '1');
      if (window.getComputedStyle(el).display === 'none') {
        el.style.setProperty('display', 'inline-block');
      }
      report.icons += 1;
    });
    const size = rules.defaultIconSizePx + 'px';
    document.querySelectorAll(rules.vectorIconSelector).forEach((svg) => {
      svg.style.setProperty('visibility', 'visible');
      const rect = svg.getBoundingClientRect();
      if (rect.width === 0 || rect.height === 0) {
        svg.style.setProperty('width', size);
        svg.style.setProperty('height', size);
        report.icons += 1;
      }
    });
    if (document.body) {
      window.scrollTo(0, document.body.scrollHeight);
    }
  } catch (err) {
    report.error = String(err);
  }
  return report;
}"#;

/// Counts reported by the normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizationReport {
    pub removed: usize,
    pub rewritten_styles: usize,
    pub overrides: usize,
    pub icons: usize,
    pub error: Option<String>,
}

/// Build the single evaluation that applies `rules` to the live DOM.
pub fn normalization_script(rules: &NormalizationRules) -> ExportResult<String> {
    let rules = serde_json::to_string(rules)?;
    Ok(format!("({NORMALIZE_FN})({rules})"))
}
