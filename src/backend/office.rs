//! Office-suite VSDX→PNG conversion.
//!
//! Diagram conversion is a one-shot CLI invocation: write the payload into
//! an isolated temporary directory, run the converter, read the PNG it
//! leaves next to the input. Availability is probed exactly once at
//! construction and cached for the process lifetime — if no office suite is
//! installed, the whole VSDX path stays disabled without per-request
//! probing.

use crate::error::VsdxError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Environment variable overriding the office-suite executable.
pub const OFFICE_EXECUTABLE_ENV: &str = "OFFICE_EXECUTABLE_PATH";

const DEFAULT_EXECUTABLE: &str = "libreoffice";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// ZIP local-file-header magic; VSDX is a ZIP container.
const ZIP_MAGIC: &[u8] = b"PK";

/// One-shot VSDX converter with cached availability.
pub struct OfficeConverter {
    executable: String,
    conversion_timeout: Duration,
    available: bool,
    version: Option<String>,
}

impl OfficeConverter {
    /// Probe the default (or `OFFICE_EXECUTABLE_PATH`-configured)
    /// executable and cache the result.
    pub async fn detect(conversion_timeout: Duration) -> Self {
        let executable = std::env::var(OFFICE_EXECUTABLE_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());
        Self::detect_with(executable, conversion_timeout).await
    }

    /// Probe a specific executable.
    pub async fn detect_with(executable: impl Into<String>, conversion_timeout: Duration) -> Self {
        let executable = executable.into();
        let probe = Command::new(&executable)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();

        let (available, version) = match timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                info!(version, "office subprocess available");
                (true, Some(version))
            }
            Ok(Ok(output)) => {
                warn!(
                    code = output.status.code(),
                    "office subprocess probe exited non-zero, VSDX conversion disabled"
                );
                (false, None)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "office subprocess not found, VSDX conversion disabled");
                (false, None)
            }
            Err(_) => {
                warn!("office subprocess probe timed out, VSDX conversion disabled");
                (false, None)
            }
        };

        OfficeConverter {
            executable,
            conversion_timeout,
            available,
            version,
        }
    }

    /// A converter that is permanently unavailable (deployments without an
    /// office suite, tests).
    pub fn unavailable() -> Self {
        OfficeConverter {
            executable: DEFAULT_EXECUTABLE.to_string(),
            conversion_timeout: Duration::from_secs(30),
            available: false,
            version: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Convert VSDX bytes to PNG bytes.
    ///
    /// The payload must start with the ZIP magic; a missing magic number is
    /// structural corruption, reported before any subprocess is spawned.
    /// The conversion runs in an isolated temporary directory removed
    /// unconditionally afterwards.
    pub async fn convert_to_png(&self, vsdx: &[u8]) -> Result<Vec<u8>, VsdxError> {
        if !vsdx.starts_with(ZIP_MAGIC) {
            return Err(VsdxError::Corrupted {
                head: vsdx.iter().take(10).copied().collect(),
            });
        }
        if !self.available {
            return Err(VsdxError::Unavailable);
        }

        let workspace = tempfile::Builder::new()
            .prefix("inkpress-vsdx-")
            .tempdir()
            .map_err(|e| VsdxError::ConversionFailed(format!("tempdir: {e}")))?;
        let input = workspace.path().join("input.vsdx");
        let output = workspace.path().join("input.png");

        tokio::fs::write(&input, vsdx)
            .await
            .map_err(|e| VsdxError::ConversionFailed(format!("write input: {e}")))?;

        debug!(bytes = vsdx.len(), "running office VSDX conversion");
        let command = Command::new(&self.executable)
            .arg("--headless")
            .arg("--invisible")
            .arg("--convert-to")
            .arg("png")
            .arg("--outdir")
            .arg(workspace.path())
            .arg(&input)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let result = match timeout(self.conversion_timeout, command).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(VsdxError::ConversionFailed(e.to_string())),
            Err(_) => {
                return Err(VsdxError::Timeout {
                    secs: self.conversion_timeout.as_secs(),
                })
            }
        };

        if !result.status.success() {
            return Err(VsdxError::ConversionFailed(format!(
                "exit code {:?}: {}",
                result.status.code(),
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        if !output.exists() {
            return Err(VsdxError::ConversionFailed(
                "converter produced no output file".to_string(),
            ));
        }

        tokio::fs::read(&output)
            .await
            .map_err(|e| VsdxError::ConversionFailed(format!("read output: {e}")))
        // `workspace` drops here and removes the directory.
    }
}
