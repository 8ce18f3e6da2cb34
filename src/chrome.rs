//! Chrome implementations of the browser process traits
//!
//! Each pooled instance is one Chromium process driven over the DevTools
//! protocol. Every request gets its own CDP browser context, so cookies and
//! storage never leak between requests sharing a process.

use crate::{
    create_browser_config, BrowserLauncher, BrowserProcess, BrowsingContext, ContextSettings,
    FetchError, LaunchConfig, NavigationResponse,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetScriptExecutionDisabledParams,
};
use chromiumoxide::cdp::browser_protocol::page::SetBypassCspParams;
use chromiumoxide::cdp::browser_protocol::security::SetIgnoreCertificateErrorsParams;
use chromiumoxide::cdp::browser_protocol::system_info::GetProcessInfoParams;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PID_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches Chromium processes with one profile directory per instance.
pub struct ChromeLauncher {
    launch: LaunchConfig,
    root_dir: PathBuf,
}

impl ChromeLauncher {
    pub fn new(launch: LaunchConfig) -> Self {
        let root_dir = std::env::temp_dir().join(format!(
            "pagefetch-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        Self { launch, root_dir }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, instance_id: usize) -> Result<Box<dyn BrowserProcess>, FetchError> {
        // Replacements get a fresh profile; the old one may still be locked
        // by a process that is being killed.
        let user_data_dir = self.root_dir.join(format!(
            "instance-{}-{}",
            instance_id,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&user_data_dir).await.map_err(|e| {
            FetchError::BrowserLaunchFailed(format!("Failed to create profile dir: {e}"))
        })?;

        let config = create_browser_config(&self.launch, &user_data_dir)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::BrowserLaunchFailed(e.to_string()))?;

        // The handler drives all CDP traffic and must be polled for the
        // lifetime of the browser.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {}", e);
                }
            }
            debug!("Browser handler stream ended");
        });

        let pid = lookup_browser_pid(&browser).await;
        info!("Launched browser instance {} (pid {:?})", instance_id, pid);

        Ok(Box::new(ChromeProcess {
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
            pid,
            user_data_dir,
        }))
    }

    async fn shutdown(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.root_dir.display(), e);
            }
        }
    }
}

async fn lookup_browser_pid(browser: &Browser) -> Option<u32> {
    let response = timeout(PID_LOOKUP_TIMEOUT, browser.execute(GetProcessInfoParams::default()))
        .await
        .ok()?
        .ok()?;
    response
        .result
        .process_info
        .iter()
        .find(|p| p.r#type == "browser")
        .and_then(|p| u32::try_from(p.id).ok())
}

pub struct ChromeProcess {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
    pid: Option<u32>,
    user_data_dir: PathBuf,
}

impl ChromeProcess {
    async fn cleanup_profile(&self) {
        let _ = tokio::fs::remove_dir_all(&self.user_data_dir).await;
    }
}

#[async_trait]
impl BrowserProcess for ChromeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn is_responsive(&self) -> bool {
        if self.handler.is_finished() {
            return false;
        }
        self.browser.lock().await.version().await.is_ok()
    }

    async fn open_context(
        &self,
        settings: &ContextSettings,
    ) -> Result<Box<dyn BrowsingContext>, FetchError> {
        let page_and_context = {
            let browser = self.browser.lock().await;
            let context_id = browser
                .execute(CreateBrowserContextParams::default())
                .await?
                .result
                .browser_context_id;

            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(FetchError::RenderingFailed)?;

            match browser.new_page(target).await {
                Ok(page) => (page, context_id),
                Err(e) => {
                    let _ = browser
                        .execute(DisposeBrowserContextParams::new(context_id))
                        .await;
                    return Err(e.into());
                }
            }
        };

        let context = ChromeContext {
            page: page_and_context.0,
            context_id: page_and_context.1,
            browser: self.browser.clone(),
        };

        if let Err(e) = context.configure(settings).await {
            let _ = context.close().await;
            return Err(e);
        }

        Ok(Box::new(context))
    }

    async fn close(&self) -> Result<(), FetchError> {
        {
            let mut browser = self.browser.lock().await;
            browser.close().await?;
            let _ = browser.wait().await;
        }
        self.handler.abort();
        self.cleanup_profile().await;
        Ok(())
    }

    async fn kill(&self) -> Result<(), FetchError> {
        {
            let mut browser = self.browser.lock().await;
            match browser.kill().await {
                Some(Ok(())) => {}
                Some(Err(e)) => return Err(FetchError::Internal(format!("kill failed: {e}"))),
                None => {
                    return Err(FetchError::Internal(
                        "browser has no child process to kill".to_string(),
                    ))
                }
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();
        self.cleanup_profile().await;
        Ok(())
    }
}

pub struct ChromeContext {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<Mutex<Browser>>,
}

impl ChromeContext {
    async fn configure(&self, settings: &ContextSettings) -> Result<(), FetchError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(settings.viewport.width)
            .height(settings.viewport.height)
            .device_scale_factor(settings.viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(FetchError::RenderingFailed)?;
        self.page.execute(metrics).await?;
        self.page.set_user_agent(settings.user_agent.as_str()).await?;
        self.page.execute(SetScriptExecutionDisabledParams::new(false)).await?;
        self.page.execute(SetBypassCspParams::new(false)).await?;
        self.page.execute(SetIgnoreCertificateErrorsParams::new(false)).await?;
        Ok(())
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T, FetchError> {
        self.page
            .evaluate(script)
            .await?
            .into_value::<T>()
            .map_err(|e| FetchError::RenderingFailed(format!("unexpected script result: {e}")))
    }
}

#[async_trait]
impl BrowsingContext for ChromeContext {
    async fn navigate(&self, url: &str) -> Result<NavigationResponse, FetchError> {
        self.page.goto(url).await?;

        let status: Option<i64> = self.eval(NAVIGATION_STATUS_SCRIPT.to_string()).await?;
        match status {
            None => Err(FetchError::RenderingFailed(format!(
                "navigation to {url} produced no response"
            ))),
            Some(code) => Ok(NavigationResponse {
                status: u16::try_from(code).ok().filter(|c| *c > 0),
            }),
        }
    }

    async fn wait_for_network_idle(&self, idle: Duration, limit: Duration) -> Result<bool, FetchError> {
        let script = network_idle_script(idle, limit);
        let result: serde_json::Value = self.eval(script).await?;
        Ok(result.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn selector_visible(&self, selector: &str) -> Result<bool, FetchError> {
        let selector = serde_json::to_string(selector)?;
        self.eval(format!(
            r#"(() => {{
                const el = document.querySelector({selector});
                if (!el) return false;
                const style = window.getComputedStyle(el);
                const rect = el.getBoundingClientRect();
                return style.display !== 'none'
                    && style.visibility !== 'hidden'
                    && (rect.width > 0 || rect.height > 0);
            }})()"#
        ))
        .await
    }

    async fn dismiss_overlays(&self) -> Result<(), FetchError> {
        let dismissed: i64 = self.eval(DISMISS_OVERLAYS_SCRIPT.to_string()).await?;
        if dismissed > 0 {
            debug!("Dismissed {} overlay element(s)", dismissed);
        }
        Ok(())
    }

    async fn content(&self) -> Result<String, FetchError> {
        Ok(self.page.content().await?)
    }

    async fn close(&self) -> Result<(), FetchError> {
        let page_result = self.page.clone().close().await;
        let dispose_result = self
            .browser
            .lock()
            .await
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await;
        page_result?;
        dispose_result?;
        Ok(())
    }
}

const NAVIGATION_STATUS_SCRIPT: &str = r#"(() => {
    const entry = performance.getEntriesByType('navigation')[0];
    if (!entry) return null;
    return typeof entry.responseStatus === 'number' ? entry.responseStatus : 0;
})()"#;

fn network_idle_script(idle: Duration, limit: Duration) -> String {
    let idle_ms = idle.as_millis().min(u128::from(u64::MAX)) as u64;
    let limit_ms = limit.as_millis().min(u128::from(u64::MAX)) as u64;
    format!(
        r#"(async () => {{
            const limitMs = {limit_ms};
            const idleMs = {idle_ms};
            const interval = 100;
            const start = Date.now();
            const count = () => {{
                try {{ return performance.getEntriesByType('resource').length; }} catch (_) {{ return 0; }}
            }};
            let last = count();
            let quietMs = 0;
            while (Date.now() - start < limitMs) {{
                await new Promise(r => setTimeout(r, interval));
                const current = count();
                if (document.readyState === 'complete' && current === last) {{
                    quietMs += interval;
                    if (quietMs >= idleMs) return {{ ok: true, waitedMs: Date.now() - start }};
                }} else {{
                    quietMs = 0;
                }}
                last = current;
            }}
            return {{ ok: false, waitedMs: Date.now() - start }};
        }})()"#
    )
}

const DISMISS_OVERLAYS_SCRIPT: &str = r#"(() => {
    let dismissed = 0;
    const containers = document.querySelectorAll(
        '[id*="cookie" i], [class*="cookie" i], [id*="consent" i], [class*="consent" i], ' +
        '[id*="newsletter" i], [class*="newsletter" i], [class*="modal" i], [class*="popup" i], ' +
        '[role="dialog"]'
    );
    const accept = /^(accept|accept all|agree|i agree|got it|ok|okay|allow all|close|no thanks|dismiss|×|x)$/i;
    containers.forEach((container) => {
        const buttons = container.querySelectorAll('button, a[role="button"], [aria-label*="close" i]');
        for (const button of buttons) {
            const label = (button.innerText || button.getAttribute('aria-label') || '').trim();
            if (accept.test(label) || /close/i.test(button.getAttribute('aria-label') || '')) {
                try { button.click(); dismissed += 1; break; } catch (_) {}
            }
        }
    });
    document.documentElement.style.overflow = '';
    if (document.body) document.body.style.overflow = '';
    return dismissed;
})()"#;
