//! Transcoder plumbing: filter-graph arguments, named pipes and child processes.
//!
//! The detection pipeline never decodes video itself. It asks an ffmpeg
//! process to read the monitor's stream from a named pipe, scale, pad and crop
//! it to the detector's input size, and write raw RGB24 frames to stdout.

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use crate::geometry::FrameGeometry;
use crate::supervise::CancelToken;

/// Added to the padded canvas size in the `pad` filter.
///
/// ffmpeg refuses to pad to exactly the scaled size in some cases due to
/// rounding, so the canvas is made one pixel larger. Crop offsets are still
/// computed against the un-incremented canvas.
pub const PAD_SLACK: u32 = 1;

/// Exit status ffmpeg reports after a clean interrupt.
const INTERRUPTED_EXIT_CODE: i32 = 255;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Settings that shape the transcoder invocation besides the geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSettings {
    /// Named pipe the monitor writes its stream into.
    pub input: PathBuf,
    /// Frames per second passed to the detector.
    pub sample_rate: f64,
    pub log_level: String,
    /// Hardware acceleration token string, e.g. `"vaapi"`. Empty disables it.
    pub hwaccel: String,
    /// Optional mask image overlaid on the scaled frame.
    pub mask: Option<PathBuf>,
    /// Desaturate frames for grayscale detectors.
    pub gray: bool,
}

/// Builds the filter expression.
///
/// ```text
/// fps=fps=3,scale=320:260,pad=321:321:0:0,crop=300:300:10:10
/// [0:v]fps=fps=3,scale=320:260[bg];[bg][1:v]overlay,pad=321:321:0:0,crop=300:300:10:10
/// ```
///
/// Padding comes after scaling so fewer pixels are scaled, cropping must come
/// after padding, and the mask is overlaid on the scaled frame.
pub fn build_filter(g: &FrameGeometry, s: &FilterSettings) -> String {
    let mut tail = format!(
        ",pad={}:{}:0:0,crop={}:{}:{}:{}",
        g.padded_width + PAD_SLACK,
        g.padded_height + PAD_SLACK,
        g.output_width,
        g.output_height,
        g.crop_offset_x,
        g.crop_offset_y
    );
    if s.gray {
        tail.push_str(",hue=s=0");
    }

    let scale = format!(
        "fps=fps={},scale={}:{}",
        s.sample_rate, g.scaled_width, g.scaled_height
    );
    match s.mask {
        None => format!("{}{}", scale, tail),
        Some(_) => format!("[0:v]{}[bg];[bg][1:v]overlay{}", scale, tail),
    }
}

/// Builds the complete transcoder argument list.
pub fn build_args(g: &FrameGeometry, s: &FilterSettings) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), s.log_level.clone()];

    if !s.hwaccel.trim().is_empty() {
        args.extend(parse_args(&format!("-hwaccel {}", s.hwaccel)));
    }

    args.push("-i".into());
    args.push(s.input.display().to_string());

    match &s.mask {
        None => args.push("-filter".into()),
        Some(mask) => {
            args.push("-i".into());
            args.push(mask.display().to_string());
            args.push("-filter_complex".into());
        }
    }
    args.push(build_filter(g, s));

    args.extend(
        ["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .into_iter()
            .map(String::from),
    );
    args
}

/// Arguments the monitor appends to its main transcoder to copy the video
/// stream into the detection pipe.
pub fn fifo_output_args(pipe: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-c:v",
        "copy",
        "-map",
        "0:v",
        "-f",
        "fifo",
        "-fifo_format",
        "mpegts",
        "-drop_pkts_on_overflow",
        "1",
        "-attempt_recovery",
        "1",
        "-restart_with_keyframe",
        "1",
        "-recovery_wait_time",
        "1",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push(pipe.display().to_string());
    args
}

/// Splits a whitespace separated argument string.
pub fn parse_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(String::from).collect()
}

/// Creates `dir` and its parents with owner-only permissions.
pub fn make_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .with_context(|| format!("make directory {}", dir.display()))
}

/// Creates a named pipe at `path` readable and writable by the owner only.
///
/// An existing pipe is reused. Any other file at `path` is replaced.
#[cfg(unix)]
pub fn make_pipe(path: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("set pipe permissions {}", path.display()))?;
            return Ok(());
        }
        Ok(_) => std::fs::remove_file(path)
            .with_context(|| format!("remove stale file {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    }

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("pipe path contains NUL: {}", path.display()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mkfifo {}", path.display()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn make_pipe(path: &Path) -> Result<()> {
    anyhow::bail!("named pipes are not supported on this platform: {}", path.display())
}

/// Maps the transcoder's `-loglevel` to the level its stderr is logged at.
pub fn stderr_level(log_level: &str) -> log::Level {
    match log_level {
        "quiet" | "panic" | "fatal" | "error" => log::Level::Error,
        "warning" => log::Level::Warn,
        "info" => log::Level::Info,
        _ => log::Level::Debug,
    }
}

/// Forwards each stderr line of a child process to the log.
pub fn forward_stderr<R>(stderr: R, prefix: String, level: log::Level)
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => log::log!(level, "{}: {}", prefix, line),
                Err(_) => break,
            }
        }
    });
}

/// Waits for `child` to exit. On cancellation the child is interrupted and,
/// if it is still running after `stop_timeout`, killed.
pub fn wait_or_stop(
    child: &mut Child,
    cancel: &CancelToken,
    stop_timeout: Duration,
) -> Result<ExitStatus> {
    loop {
        if let Some(status) = child.try_wait().context("wait for process")? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            return stop(child, stop_timeout);
        }
        std::thread::sleep(WAIT_POLL);
    }
}

fn stop(child: &mut Child, stop_timeout: Duration) -> Result<ExitStatus> {
    if let Err(e) = interrupt(child) {
        log::debug!("interrupt process {}: {}", child.id(), e);
    }
    let deadline = Instant::now() + stop_timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().context("wait for process")? {
            return Ok(status);
        }
        std::thread::sleep(WAIT_POLL);
    }
    if let Err(e) = child.kill() {
        log::debug!("kill process {}: {}", child.id(), e);
    }
    child.wait().context("wait for killed process")
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill has no memory safety requirements; pid belongs to our child.
    if unsafe { libc::kill(pid, libc::SIGINT) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// True for a successful exit, including ffmpeg's interrupted exit status.
pub fn exited_cleanly(status: ExitStatus) -> bool {
    status.success() || status.code() == Some(INTERRUPTED_EXIT_CODE)
}
