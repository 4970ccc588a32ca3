//! Browser channel over the Chrome DevTools Protocol.
//!
//! Chromium is launched on first use and reused for later actions.

use crate::error::ExecutorError;
use crate::outcome::{ActionExecutor, ActionOutcome};
use async_trait::async_trait;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use deskpilot_core::Params;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Actions served by the browser channel. `browser_` prefixed spellings are
/// accepted as well.
pub const BROWSER_ACTIONS: [&str; 6] = ["navigate", "click", "fill", "read_text", "screenshot", "evaluate"];

/// Strip the optional `browser_` prefix.
pub fn browser_action(action: &str) -> &str {
    action.strip_prefix("browser_").unwrap_or(action)
}

/// Whether `action` should be routed to the browser. A bare `click` only
/// counts when it targets a CSS selector.
pub fn is_browser_action(action: &str, params: &Params) -> bool {
    if action.starts_with("browser_") {
        return BROWSER_ACTIONS.contains(&browser_action(action));
    }
    match action {
        "navigate" | "fill" | "read_text" | "evaluate" => true,
        "click" | "screenshot" => params.contains_key("selector") || params.contains_key("full_page"),
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            user_data_dir: None,
        }
    }
}

struct BrowserSession {
    _browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

pub struct BrowserExecutor {
    settings: BrowserSettings,
    session: Mutex<Option<BrowserSession>>,
}

fn str_param<'a>(params: &'a Params, key: &str) -> Result<&'a str, ExecutorError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ExecutorError::InvalidParams(format!("missing '{}'", key)))
}

fn browser_err(e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Browser(e.to_string())
}

impl BrowserExecutor {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    async fn launch(&self) -> Result<BrowserSession, ExecutorError> {
        let mut builder = BrowserConfig::builder().no_sandbox();
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.settings.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(dir) = &self.settings.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        let config = builder.build().map_err(ExecutorError::Browser)?;

        info!("Launching browser (headless: {})", self.settings.headless);
        let (browser, mut handler) = Browser::launch(config).await.map_err(browser_err)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser handler error: {}", e);
                }
            }
        });
        let page = browser.new_page("about:blank").await.map_err(browser_err)?;
        Ok(BrowserSession {
            _browser: browser,
            handler_task,
            page,
        })
    }

    async fn run(&self, action: &str, params: &Params) -> Result<Value, ExecutorError> {
        if !BROWSER_ACTIONS.contains(&action) {
            return Err(ExecutorError::UnknownAction(action.to_string()));
        }

        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.launch().await?);
        }
        let page = match session.as_ref() {
            Some(session) => session.page.clone(),
            None => return Err(ExecutorError::NotConfigured("browser session".to_string())),
        };
        drop(session);

        match action {
            "navigate" => {
                let url = str_param(params, "url")?;
                page.goto(url).await.map_err(browser_err)?;
                let current = page.url().await.map_err(browser_err)?;
                Ok(json!({ "url": current.unwrap_or_else(|| url.to_string()) }))
            }
            "click" => {
                let selector = str_param(params, "selector")?;
                page.find_element(selector)
                    .await
                    .map_err(browser_err)?
                    .click()
                    .await
                    .map_err(browser_err)?;
                Ok(json!({ "clicked": selector }))
            }
            "fill" => {
                let selector = str_param(params, "selector")?;
                let text = params
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExecutorError::InvalidParams("missing 'text'".to_string()))?;
                page.find_element(selector)
                    .await
                    .map_err(browser_err)?
                    .click()
                    .await
                    .map_err(browser_err)?
                    .type_str(text)
                    .await
                    .map_err(browser_err)?;
                Ok(json!({ "filled": selector, "chars": text.chars().count() }))
            }
            "read_text" => {
                let selector = str_param(params, "selector")?;
                let text = page
                    .find_element(selector)
                    .await
                    .map_err(browser_err)?
                    .inner_text()
                    .await
                    .map_err(browser_err)?;
                Ok(json!({ "selector": selector, "text": text.unwrap_or_default() }))
            }
            "screenshot" => {
                let full_page = params.get("full_page").and_then(Value::as_bool).unwrap_or(false);
                let shot = ScreenshotParams::builder().full_page(full_page).build();
                let bytes = match params.get("path").and_then(Value::as_str) {
                    Some(path) => page.save_screenshot(shot, path).await.map_err(browser_err)?,
                    None => page.screenshot(shot).await.map_err(browser_err)?,
                };
                Ok(json!({
                    "bytes": bytes.len(),
                    "path": params.get("path").cloned().unwrap_or(Value::Null),
                }))
            }
            "evaluate" => {
                let script = str_param(params, "script")?;
                let result = page.evaluate(script).await.map_err(browser_err)?;
                Ok(json!({ "value": result.value().cloned().unwrap_or(Value::Null) }))
            }
            other => Err(ExecutorError::UnknownAction(other.to_string())),
        }
    }
}

#[async_trait]
impl ActionExecutor for BrowserExecutor {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn execute(&self, action: &str, params: &Params) -> ActionOutcome {
        match self.run(browser_action(action), params).await {
            Ok(output) => ActionOutcome::ok(output),
            Err(e) => ActionOutcome::failed(e.to_string()),
        }
    }
}
