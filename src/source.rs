//! Frame source supervisor.
//!
//! Keeps one transcoder process running per pipeline. Each iteration starts
//! the process, hands its stdout to a fresh detection client and waits for
//! the process to exit. The loop restarts after a fixed backoff until
//! cancelled.

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::client::DetectionClient;
use crate::ffmpeg::{exited_cleanly, forward_stderr, stderr_level, wait_or_stop};
use crate::supervise::{CancelToken, TaskGroup};
use crate::PipelineError;

/// Time the transcoder gets to exit after an interrupt before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// One run of a frame source. Returns when the source exits.
pub trait FrameRunner: Send {
    fn run(&mut self, cancel: &CancelToken) -> Result<()>;
}

pub struct FrameSupervisor<F> {
    pub monitor_id: String,
    pub runner: F,
    pub cancel: CancelToken,
    pub backoff: Duration,
}

impl<F: FrameRunner + 'static> FrameSupervisor<F> {
    /// Runs the supervisor loop on its own thread, registered with `group`.
    pub fn spawn(self, group: &TaskGroup) -> JoinHandle<()> {
        let guard = group.enter();
        std::thread::spawn(move || {
            let _guard = guard;
            self.run();
        })
    }

    pub fn run(mut self) {
        let id = self.monitor_id.clone();
        loop {
            if self.cancel.is_cancelled() {
                log::debug!("{}: detector: process stopped", id);
                return;
            }
            match self.runner.run(&self.cancel) {
                Ok(()) => log::info!("{}: detector: process exited", id),
                Err(e) => log::error!("{}: detector: process crashed: {:#}", id, e),
            }
            if self.cancel.sleep(self.backoff) {
                log::debug!("{}: detector: process stopped", id);
                return;
            }
        }
    }
}

/// Runs the transcoder and a detection client reading its output.
pub struct FfmpegRunner {
    pub monitor_id: String,
    pub bin: String,
    pub args: Vec<String>,
    pub log_level: String,
    pub client: DetectionClient,
    pub group: TaskGroup,
}

impl FrameRunner for FfmpegRunner {
    fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        log::info!(
            "{}: detector: starting process: {} {}",
            self.monitor_id,
            self.bin,
            self.args.join(" ")
        );
        let mut child = Command::new(&self.bin)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::process(format!("start {}: {}", self.bin, e)))?;

        if let Some(stderr) = child.stderr.take() {
            forward_stderr(
                stderr,
                format!("{}: detector: process", self.monitor_id),
                stderr_level(&self.log_level),
            );
        }
        let stdout = child.stdout.take().context("process stdout")?;

        // The client ends with the process it reads from.
        let client_cancel = cancel.child();
        self.client
            .clone()
            .spawn(stdout, client_cancel.clone(), &self.group);

        let status = wait_or_stop(&mut child, cancel, STOP_TIMEOUT);
        client_cancel.cancel();
        let status = status?;

        if !exited_cleanly(status) {
            return Err(PipelineError::process(format!("process exited: {}", status)).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{calculate, Crop, FrameGeometryInput, FrameSize};
    use crate::monitor::Thresholds;
    use crate::rpc::{Connector, DetectStream};
    use crate::trigger::{self, TriggerFilter};
    use crate::{error_kind, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingRunner {
        runs: Arc<AtomicUsize>,
        fail: bool,
        cancel_after: usize,
        cancel: CancelToken,
    }

    impl FrameRunner for CountingRunner {
        fn run(&mut self, _cancel: &CancelToken) -> Result<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.cancel_after {
                self.cancel.cancel();
            }
            if self.fail {
                anyhow::bail!(PipelineError::process("exit status 1"));
            }
            Ok(())
        }
    }

    fn supervisor(fail: bool, cancel_after: usize) -> (FrameSupervisor<CountingRunner>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancelToken::new();
        let sup = FrameSupervisor {
            monitor_id: "cam1".to_string(),
            runner: CountingRunner {
                runs: runs.clone(),
                fail,
                cancel_after,
                cancel: cancel.clone(),
            },
            cancel,
            backoff: Duration::from_millis(10),
        };
        (sup, runs)
    }

    #[test]
    fn cancelled_before_first_iteration_never_runs() {
        let (sup, runs) = supervisor(false, usize::MAX);
        sup.cancel.cancel();
        let group = TaskGroup::new();

        let handle = sup.spawn(&group);
        assert!(group.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(group.active(), 0);
    }

    #[test]
    fn restarts_after_failure_until_cancelled() {
        let (sup, runs) = supervisor(true, 3);
        let group = TaskGroup::new();

        sup.spawn(&group).join().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(group.active(), 0);
    }

    #[test]
    fn restarts_after_clean_exit() {
        let (sup, runs) = supervisor(false, 2);
        sup.run();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    struct Refusing;

    impl Connector for Refusing {
        fn connect(&self) -> Result<Box<dyn DetectStream>> {
            Err(PipelineError::connection("refused").into())
        }
    }

    fn runner(bin: &str, script: &str) -> FfmpegRunner {
        let geometry = calculate(&FrameGeometryInput::new(
            FrameSize {
                width: 4,
                height: 4,
            },
            Crop::default(),
            4,
            4,
        ))
        .unwrap();
        let (tx, _rx) = trigger::channel(1);
        FfmpegRunner {
            monitor_id: "cam1".to_string(),
            bin: bin.to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            log_level: "error".to_string(),
            client: DetectionClient {
                monitor_id: "cam1".to_string(),
                connector: Arc::new(Refusing),
                detector_name: "default".to_string(),
                filter: TriggerFilter {
                    monitor_id: "cam1".to_string(),
                    thresholds: Thresholds::default(),
                    geometry,
                    trigger_duration: Duration::from_secs(1),
                    recording_duration: Duration::from_secs(1),
                    sender: tx,
                },
                timestamp_offset: 0,
                pipeline_delay: 0,
                backoff: Duration::from_millis(10),
            },
            group: TaskGroup::new(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn process_exit_status_decides_outcome() -> Result<()> {
        let cancel = CancelToken::new();

        let mut ok = runner("sh", "exit 0");
        ok.run(&cancel)?;
        assert!(ok.group.wait_timeout(Duration::from_secs(5)));

        runner("sh", "exit 255").run(&cancel)?;

        let mut failing = runner("sh", "exit 3");
        let err = failing.run(&cancel).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::ProcessFailure));
        assert!(failing.group.wait_timeout(Duration::from_secs(5)));
        Ok(())
    }

    #[test]
    fn missing_binary_is_process_failure() {
        let err = runner("/nonexistent/ffmpeg", "")
            .run(&CancelToken::new())
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::ProcessFailure));
    }
}
