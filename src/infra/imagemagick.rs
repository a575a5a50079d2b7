//! External post-processing tools: ImageMagick for raster transforms and svgo
//! for vector optimisation. Both run as child processes bounded by a timeout.

use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::application::raster::{RasterError, RasterTool, RasterTransform, SvgOptimizer};

/// ImageMagick `convert`-compatible CLI.
#[derive(Debug, Clone)]
pub struct ImageMagick {
    binary: PathBuf,
    timeout: Duration,
}

impl ImageMagick {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

/// Argument list for one `convert` invocation.
pub(crate) fn transform_args(
    source: &Path,
    output: &Path,
    transform: &RasterTransform,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![source.into()];
    if let Some(crop) = transform.crop {
        args.push("-crop".into());
        args.push(format!("{}x{}+{}+{}", crop.width, crop.height, crop.x, crop.y).into());
    }
    if let Some((width, height)) = transform.resize {
        args.push("-resize".into());
        args.push(format!("{width}x{height}!").into());
    }
    if let Some(border) = transform.border.as_ref() {
        args.push("-bordercolor".into());
        args.push(border.color.clone().into());
        args.push("-border".into());
        args.push(format!("{0}x{0}", border.width).into());
    }
    if let Some(palette) = transform.palette.as_ref() {
        args.push("-filter".into());
        args.push("Box".into());
        args.push("-remap".into());
        args.push(palette.into());
    }
    if let Some(colors) = transform.colors {
        args.push("-colors".into());
        args.push(colors.to_string().into());
        args.push("+dither".into());
    }
    // Drop the crop offset from the output canvas.
    if transform.crop.is_some() {
        args.push("+repage".into());
    }
    args.push(output.into());
    args
}

#[async_trait]
impl RasterTool for ImageMagick {
    async fn transform(
        &self,
        source: &Path,
        output: &Path,
        transform: &RasterTransform,
    ) -> Result<(), RasterError> {
        let args = transform_args(source, output, transform);
        run_tool(&self.binary, &args, self.timeout, "imagemagick::transform").await
    }
}

/// svgo CLI, run in place on a single file.
#[derive(Debug, Clone)]
pub struct Svgo {
    binary: PathBuf,
    timeout: Duration,
}

impl Svgo {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl SvgOptimizer for Svgo {
    async fn optimize(&self, path: &Path) -> Result<(), RasterError> {
        let args: Vec<OsString> = vec![path.into(), "-o".into(), path.into()];
        run_tool(&self.binary, &args, self.timeout, "svgo::optimize").await
    }
}

async fn run_tool(
    binary: &Path,
    args: &[OsString],
    timeout: Duration,
    op: &'static str,
) -> Result<(), RasterError> {
    let started_at = Instant::now();
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            warn!(
                target = "infra::imagemagick",
                op,
                result = "error",
                error_code = "spawn_cli",
                binary = %binary.display(),
                error = %err,
                "Failed to spawn post-processing tool"
            );
            if err.kind() == ErrorKind::NotFound {
                RasterError::NotFound(err)
            } else {
                RasterError::Io(err)
            }
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(RasterError::Io)?,
        Err(_) => {
            warn!(
                target = "infra::imagemagick",
                op,
                result = "timeout",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error_code = "cli_timeout",
                "Post-processing tool timed out"
            );
            return Err(RasterError::Timeout(timeout));
        }
    };

    if !output.status.success() {
        let exit_code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(
            target = "infra::imagemagick",
            op,
            result = "error",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            exit_code = exit_code.map(i64::from).unwrap_or(-1),
            error_code = "cli_failed",
            stderr = %stderr,
            "Post-processing tool failed"
        );
        return Err(RasterError::Cli { exit_code, stderr });
    }

    info!(
        target = "infra::imagemagick",
        op,
        result = "ok",
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Post-processing tool finished"
    );
    Ok(())
}
