//! Headless browser interface.
//!
//! The actual browser automation is an external collaborator. The gate
//! talks to it through [`BrowserDriver`]; when no driver is wired in, the
//! browser step is skipped with a visible warning instead of failing the
//! run.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors from the browser layer.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("no browser driver available")]
    Unavailable,

    #[error("browser navigation failed: {0}")]
    Navigation(String),

    #[error("browser evaluation failed: {0}")]
    Evaluation(String),
}

/// What a page probe observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageProbe {
    /// Console messages of type error.
    pub console_errors: Vec<String>,
    /// Length of `document.body.innerText`.
    pub body_text_len: usize,
    /// Length of `document.body.innerHTML`.
    pub body_html_len: usize,
    /// Count of visible elements in the body.
    pub visible_element_count: u32,
    /// Whether a framework error overlay was detected.
    pub error_overlay: bool,
    /// Saved screenshot path, when the driver captured one.
    pub screenshot: Option<String>,
}

impl PageProbe {
    /// Empty-page heuristic: almost no markup and no visible text.
    pub fn is_empty_page(&self) -> bool {
        self.body_html_len < 50 && self.body_text_len < 10
    }
}

/// Driver contract: load a URL, wait for DOM content + network idle,
/// collect console errors, take a screenshot, evaluate the page state.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<PageProbe, BrowserError>;
}

/// Fallback driver used when no browser is configured: every probe
/// reports unavailability so the gate can degrade gracefully.
pub struct NullBrowser;

#[async_trait]
impl BrowserDriver for NullBrowser {
    async fn probe(&self, _url: &str, _timeout: Duration) -> Result<PageProbe, BrowserError> {
        Err(BrowserError::Unavailable)
    }
}
