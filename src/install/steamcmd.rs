use crate::config::InstallConfig;
use crate::error::{Error, Result};
use crate::install::{DistributionSource, Stage, StageContext};
use async_process::{Command, Stdio};
use async_trait::async_trait;
use futures_lite::StreamExt;
use futures_lite::io::{AsyncBufReadExt, BufReader};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Directory inside an install path holding runner bookkeeping
pub const MARKER_DIR: &str = ".gameserver-runner";

/// Distribution source backed by Valve's `steamcmd` tool.
///
/// Each network stage is one `steamcmd` invocation. Its output is read line by
/// line: `progress: NN.NN` lines drive the download progress and `Error!`
/// lines fail the stage. Cancelling the run kills the tool.
#[derive(Debug, Clone)]
pub struct SteamCmdSource {
    steamcmd: PathBuf,
    app_id: u32,
    executable: PathBuf,
    validate: bool,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstallMarker {
    app_id: u32,
    installed_at: u64,
}

impl SteamCmdSource {
    /// Create a source for `app_id`, checking for `executable` after download
    pub fn new(steamcmd: impl Into<PathBuf>, app_id: u32, executable: impl Into<PathBuf>) -> Self {
        Self {
            steamcmd: steamcmd.into(),
            app_id,
            executable: executable.into(),
            validate: true,
            timeout: Duration::from_secs(3600),
        }
    }

    /// Create a source from the install section of the runner config
    pub fn from_config(config: &InstallConfig) -> Self {
        Self::new(&config.steamcmd_path, config.app_id, &config.executable)
            .with_validate(config.validate)
            .with_timeout(config.timeout())
    }

    /// Verify every file on update
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Bound a single `steamcmd` invocation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Server executable, relative to an install path
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    async fn verify(&self, install_path: &Path) -> Result<()> {
        if is_file(install_path).await {
            return Err(Error::InvalidPath(format!(
                "Install path is a file: {}",
                install_path.display()
            )));
        }

        tokio::fs::create_dir_all(install_path).await.map_err(|e| {
            Error::InvalidPath(format!(
                "Failed to create install directory {}: {}",
                install_path.display(),
                e
            ))
        })?;

        // Bare names are resolved through PATH when spawned
        let is_path = self.steamcmd.components().count() > 1;
        if is_path && !is_file(&self.steamcmd).await {
            return Err(Error::Other(format!(
                "steamcmd not found: {}",
                self.steamcmd.display()
            )));
        }

        Ok(())
    }

    async fn fetch_manifest(&self, ctx: &StageContext) -> Result<()> {
        let app_id = self.app_id.to_string();
        let args = vec![
            "+login".to_string(),
            "anonymous".to_string(),
            "+app_info_update".to_string(),
            "1".to_string(),
            "+app_info_print".to_string(),
            app_id.clone(),
            "+quit".to_string(),
        ];

        let mut mentioned = false;
        self.run_steamcmd(ctx, &args, |line| {
            if line.contains(&app_id) {
                mentioned = true;
            }
            Ok(())
        })
        .await?;

        if !mentioned {
            return Err(Error::Other(format!("No app info returned for app {}", self.app_id)));
        }
        ctx.report_progress(1.0);
        Ok(())
    }

    async fn download(&self, ctx: &StageContext) -> Result<()> {
        let mut args = vec![
            "+force_install_dir".to_string(),
            ctx.install_path().display().to_string(),
            "+login".to_string(),
            "anonymous".to_string(),
            "+app_update".to_string(),
            self.app_id.to_string(),
        ];
        if self.validate {
            args.push("validate".to_string());
        }
        args.push("+quit".to_string());

        let mut succeeded = false;
        let exited_cleanly = self
            .run_steamcmd(ctx, &args, |line| {
                if line.starts_with("Error!") {
                    return Err(Error::Other(line.to_string()));
                }
                if line.starts_with("Success!") {
                    succeeded = true;
                }
                if let Some(percent) = parse_progress(line) {
                    ctx.report_progress(percent / 100.0);
                }
                Ok(())
            })
            .await?;

        if !succeeded && !exited_cleanly {
            return Err(Error::Other(format!("steamcmd failed to update app {}", self.app_id)));
        }
        ctx.report_progress(1.0);
        Ok(())
    }

    async fn apply(&self, install_path: &Path) -> Result<()> {
        let executable = install_path.join(&self.executable);
        if !is_file(&executable).await {
            return Err(Error::Other(format!(
                "Server executable missing after download: {}",
                executable.display()
            )));
        }
        Ok(())
    }

    async fn finalize(&self, install_path: &Path) -> Result<()> {
        let marker_dir = install_path.join(MARKER_DIR);
        tokio::fs::create_dir_all(&marker_dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create {}: {}", marker_dir.display(), e)))?;

        let installed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let marker = InstallMarker {
            app_id: self.app_id,
            installed_at,
        };
        let content = serde_json::to_vec_pretty(&marker)
            .map_err(|e| Error::Serialization(format!("Failed to serialize install marker: {}", e)))?;

        let path = marker_dir.join("install.json");
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", path.display(), e)))
    }

    // Runs steamcmd to completion, feeding every output line to `on_line`.
    // Returns whether the tool exited successfully.
    async fn run_steamcmd<F>(&self, ctx: &StageContext, args: &[String], mut on_line: F) -> Result<bool>
    where
        F: FnMut(&str) -> Result<()> + Send,
    {
        tracing::debug!(server_id = %ctx.server_id(), stage = %ctx.stage(), args = ?args, "Running steamcmd");

        let mut child = Command::new(&self.steamcmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to start steamcmd: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("steamcmd stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                _ = ctx.cancelled() => break Err(Error::PipelineCancelled),
                _ = &mut deadline => {
                    break Err(Error::Timeout(format!("steamcmd exceeded {:?}", self.timeout)));
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        tracing::trace!(line = %line, "steamcmd");
                        if let Err(e) = on_line(line.trim()) {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(Error::Communication(format!("Failed to read steamcmd output: {}", e))),
                    None => break Ok(()),
                },
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(server_id = %ctx.server_id(), error = %e, "Stopping steamcmd");
            if let Err(kill_err) = child.kill() {
                tracing::debug!(error = %kill_err, "steamcmd already exited");
            }
            let _ = child.status().await;
            return Err(e);
        }

        let status = child
            .status()
            .await
            .map_err(|e| Error::Other(format!("Failed to wait for steamcmd: {}", e)))?;
        Ok(status.success())
    }
}

#[async_trait]
impl DistributionSource for SteamCmdSource {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<()> {
        match stage {
            Stage::VerifyLocalState => {
                self.verify(ctx.install_path()).await?;
                ctx.report_progress(1.0);
                Ok(())
            }
            Stage::FetchManifest => self.fetch_manifest(ctx).await,
            Stage::DownloadDeltas => self.download(ctx).await,
            Stage::ApplyDeltas => {
                self.apply(ctx.install_path()).await?;
                ctx.report_progress(1.0);
                Ok(())
            }
            Stage::Finalize => self.finalize(ctx.install_path()).await,
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

/// Extract the percentage from a steamcmd `progress: NN.NN` line
pub(crate) fn parse_progress(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("progress:")?;
    let percent: f64 = rest.split_whitespace().next()?.parse().ok()?;
    Some(percent.clamp(0.0, 100.0))
}
