//! Headless-Chromium raster engine.
//!
//! The engine keeps a persistent sentinel browser process whose liveness
//! backs `is_connected` and whose lifecycle follows the manager's
//! start/stop/restart calls. Individual renders do not share that process:
//! each one runs as an isolated one-shot screenshot invocation with its own
//! temporary profile directory, torn down unconditionally with the temp
//! directory. The flag set disables sandboxing, GPU and site isolation —
//! required for `data:` URL rendering without CORS restriction.

use crate::backend::{RasterEngine, RenderRequest};
use crate::error::EngineError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Environment variable naming the Chromium/Chrome executable.
pub const CHROMIUM_EXECUTABLE_ENV: &str = "CHROMIUM_EXECUTABLE_PATH";

/// Flags shared by the sentinel process and every screenshot invocation.
const COMMON_FLAGS: &[&str] = &[
    "--headless=new",
    "--no-sandbox",
    "--disable-gpu",
    "--disable-software-rasterizer",
    "--disable-dev-shm-usage",
    "--disable-web-security",
    "--disable-features=IsolateOrigins,site-per-process",
    "--hide-scrollbars",
];

/// A [`RasterEngine`] backed by headless Chromium.
pub struct ChromiumEngine {
    executable: PathBuf,
    child: Mutex<Option<Child>>,
    version: Mutex<Option<String>>,
}

impl ChromiumEngine {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        ChromiumEngine {
            executable: executable.into(),
            child: Mutex::new(None),
            version: Mutex::new(None),
        }
    }

    /// Build an engine from `CHROMIUM_EXECUTABLE_PATH`.
    pub fn from_env() -> Result<Self, EngineError> {
        match std::env::var(CHROMIUM_EXECUTABLE_ENV) {
            Ok(path) if !path.is_empty() => Ok(Self::new(path)),
            _ => Err(EngineError::ExecutableNotFound(format!(
                "{CHROMIUM_EXECUTABLE_ENV} is not set"
            ))),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Arguments for one isolated screenshot render.
    fn screenshot_args(
        &self,
        page: &Path,
        profile_dir: &Path,
        output: &Path,
        request: &RenderRequest,
    ) -> Vec<String> {
        let mut args: Vec<String> = COMMON_FLAGS.iter().map(|s| s.to_string()).collect();
        args.push("--default-background-color=00000000".to_string());
        args.push(format!(
            "--force-device-scale-factor={}",
            request.scale_factor
        ));
        args.push(format!("--user-data-dir={}", profile_dir.display()));
        args.push(format!("--screenshot={}", output.display()));
        args.push(format!("--window-size={},{}", request.width, request.height));
        args.push(page_url(page));
        args
    }

    /// HTML shell centring the content at the exact viewport size on a
    /// transparent background.
    fn wrapper_html(content_b64: &str, width: u32, height: u32) -> String {
        format!(
            "<!DOCTYPE html>\n\
             <html>\n\
             <head>\n\
             <meta charset=\"UTF-8\">\n\
             <style>\n\
             * {{ margin: 0; padding: 0; box-sizing: border-box; }}\n\
             html, body {{ width: {width}px; height: {height}px; overflow: hidden; }}\n\
             body {{ background: transparent; display: flex; align-items: center; justify-content: center; }}\n\
             img {{ display: block; max-width: 100%; max-height: 100%; }}\n\
             </style>\n\
             </head>\n\
             <body>\n\
             <img src=\"data:image/svg+xml;base64,{content_b64}\" alt=\"\" />\n\
             </body>\n\
             </html>\n"
        )
    }
}

fn page_url(page: &Path) -> String {
    url::Url::from_file_path(page)
        .map(String::from)
        .unwrap_or_else(|_| format!("file://{}", page.display()))
}

#[async_trait]
impl RasterEngine for ChromiumEngine {
    async fn launch(&self) -> Result<(), EngineError> {
        if !self.executable.exists() {
            return Err(EngineError::ExecutableNotFound(
                self.executable.display().to_string(),
            ));
        }

        // Capture the version string once per launch.
        let output = Command::new(&self.executable)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !version.is_empty() {
            debug!(version, "chromium version probed");
            *self.version.lock().await = Some(version);
        }

        let child = Command::new(&self.executable)
            .args(COMMON_FLAGS)
            .arg("--remote-debugging-port=0")
            .arg("about:blank")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let taken = self.child.lock().await.take();
        if let Some(mut child) = taken {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to signal chromium sentinel");
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "failed to reap chromium sentinel");
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            // try_wait returning Ok(None) means the process has not exited.
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn version(&self) -> Option<String> {
        self.version.lock().await.clone()
    }

    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, EngineError> {
        let workspace = tempfile::Builder::new().prefix("inkpress-render-").tempdir()?;
        let page = workspace.path().join("page.html");
        let profile = workspace.path().join("profile");
        let output = workspace.path().join("shot.png");

        let content_b64 = STANDARD.encode(&request.content);
        tokio::fs::write(
            &page,
            Self::wrapper_html(&content_b64, request.width, request.height),
        )
        .await?;

        let args = self.screenshot_args(&page, &profile, &output, request);
        debug!(
            width = request.width,
            height = request.height,
            scale = request.scale_factor,
            "running chromium screenshot"
        );
        let result = Command::new(&self.executable)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            return Err(EngineError::NonZeroExit {
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.exists() {
            return Err(EngineError::MissingOutput);
        }
        let bytes = tokio::fs::read(&output).await?;
        // `workspace` drops here, removing page, profile and screenshot.
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screenshot_args_carry_required_flags() {
        let engine = ChromiumEngine::new("/usr/bin/chromium");
        let request = RenderRequest {
            content: Vec::new(),
            width: 640,
            height: 480,
            scale_factor: 2.0,
        };
        let args = engine.screenshot_args(
            Path::new("/tmp/x/page.html"),
            Path::new("/tmp/x/profile"),
            Path::new("/tmp/x/shot.png"),
            &request,
        );

        for flag in [
            "--headless=new",
            "--no-sandbox",
            "--disable-gpu",
            "--disable-web-security",
            "--disable-features=IsolateOrigins,site-per-process",
            "--default-background-color=00000000",
            "--force-device-scale-factor=2",
            "--window-size=640,480",
        ] {
            assert!(
                args.iter().any(|a| a == flag),
                "missing flag {flag} in {args:?}"
            );
        }
        assert!(args.iter().any(|a| a.starts_with("--screenshot=")));
        assert!(args.iter().any(|a| a.starts_with("--user-data-dir=")));
        assert!(args.last().unwrap().starts_with("file://"));
    }

    #[test]
    fn wrapper_html_pins_viewport_and_embeds_payload() {
        let html = ChromiumEngine::wrapper_html("QUJD", 300, 150);
        assert!(html.contains("width: 300px; height: 150px"));
        assert!(html.contains("data:image/svg+xml;base64,QUJD"));
        assert!(html.contains("background: transparent"));
    }

    #[tokio::test]
    async fn from_env_requires_the_variable() {
        // Only exercise the missing/empty branch; mutating the process
        // environment would race other tests.
        if std::env::var(CHROMIUM_EXECUTABLE_ENV).is_err() {
            assert!(ChromiumEngine::from_env().is_err());
        }
    }

    #[tokio::test]
    async fn unlaunched_engine_is_disconnected() {
        let engine = ChromiumEngine::new("/does/not/exist");
        assert!(!engine.is_connected().await);
        assert!(engine.version().await.is_none());
        assert!(matches!(
            engine.launch().await,
            Err(EngineError::ExecutableNotFound(_))
        ));
    }
}
