use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::errors::ChemsimError;
use crate::workspace::path_is_file;

const OUTPUT_TAIL_LINES: usize = 20;
#[cfg(unix)]
const SIGTERM: i32 = 15;

/// One external invocation: program, arguments, working directory and the
/// files that must exist before anything is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin_file: Option<PathBuf>,
    pub required_inputs: Vec<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        ProcessSpec {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            stdin_file: None,
            required_inputs: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn requires(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_inputs.push(path.into());
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ProcessOutcome {
    Succeeded,
    StoppedByUser,
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
}

impl ProcessOutcome {
    pub fn into_result(self, program: &str) -> Result<(), ChemsimError> {
        match self {
            ProcessOutcome::Succeeded => Ok(()),
            ProcessOutcome::StoppedByUser => Err(ChemsimError::UserCancelled),
            ProcessOutcome::Failed { exit_code, message } => Err(ChemsimError::ProcessFailure {
                program: program.to_string(),
                exit_code,
                output: message,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Launched {
        job_id: String,
        pid: u32,
        command: String,
    },
    Output {
        job_id: String,
        line: String,
    },
    Finished {
        job_id: String,
        outcome: ProcessOutcome,
    },
}

impl ProcessEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ProcessEvent::Launched { job_id, .. }
            | ProcessEvent::Output { job_id, .. }
            | ProcessEvent::Finished { job_id, .. } => job_id,
        }
    }
}

/// Exit 0 wins over everything; a controller-requested stop or SIGTERM is a
/// user cancellation; the rest is a failure.
pub(crate) fn classify_exit(
    exit_code: Option<i32>,
    signal: Option<i32>,
    stop_requested: bool,
    output_tail: &str,
) -> ProcessOutcome {
    if exit_code == Some(0) {
        return ProcessOutcome::Succeeded;
    }

    #[cfg(unix)]
    let terminated = signal == Some(SIGTERM);
    #[cfg(not(unix))]
    let terminated = {
        let _ = signal;
        false
    };

    if stop_requested || terminated {
        return ProcessOutcome::StoppedByUser;
    }

    let status = match (exit_code, signal) {
        (Some(code), _) => format!("Exit code {code}"),
        (None, Some(signal)) => format!("Killed by signal {signal}"),
        (None, None) => "Process ended without an exit code".to_string(),
    };
    let message = if output_tail.trim().is_empty() {
        status
    } else {
        format!("{status}. {output_tail}")
    };

    ProcessOutcome::Failed { exit_code, message }
}

pub struct ProcessHandle {
    job_id: String,
    pid: u32,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Politely asks the process to terminate. Returns false when it had
    /// already exited.
    pub fn cancel(&self) -> Result<bool, ChemsimError> {
        if self.is_finished() {
            return Ok(false);
        }
        self.stop.store(true, Ordering::SeqCst);
        request_termination(self.pid)
    }

    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn should_treat_as_already_stopped(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such process")
        || lower.contains("not found")
        || lower.contains("not running")
}

fn request_termination(pid: u32) -> Result<bool, ChemsimError> {
    #[cfg(target_os = "windows")]
    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output();
    #[cfg(not(target_os = "windows"))]
    let output = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .output();

    let output = output.map_err(|error| ChemsimError::ProcessLaunch {
        program: "kill".to_string(),
        message: format!("Failed to request termination of PID {pid}: {error}"),
    })?;
    if output.status.success() {
        return Ok(true);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if should_treat_as_already_stopped(&stderr) {
        return Ok(false);
    }
    Err(ChemsimError::ProcessLaunch {
        program: "kill".to_string(),
        message: format!("Failed to stop PID {pid}: {}", stderr.trim()),
    })
}

fn forward_lines<R: Read>(
    reader: R,
    job_id: &str,
    events: &Sender<ProcessEvent>,
) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buffer)
            .trim_end_matches(['\r', '\n'])
            .to_string();

        log::debug!("[process] {job_id}: {line}");
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        let _ = events.send(ProcessEvent::Output {
            job_id: job_id.to_string(),
            line,
        });
    }

    tail
}

/// Spawns the process and a worker thread that streams its merged output and
/// reports exactly one terminal outcome. Nothing is spawned if a required
/// input is missing.
pub fn launch(
    spec: ProcessSpec,
    job_id: String,
    events: Sender<ProcessEvent>,
) -> Result<ProcessHandle, ChemsimError> {
    if let Some(missing) = spec.required_inputs.iter().find(|path| !path_is_file(path)) {
        return Err(ChemsimError::MissingInput(missing.display().to_string()));
    }

    let stdin = match &spec.stdin_file {
        Some(path) => Stdio::from(
            File::open(path).map_err(|_| ChemsimError::MissingInput(path.display().to_string()))?,
        ),
        None => Stdio::null(),
    };

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| ChemsimError::ProcessLaunch {
            program: spec.program.clone(),
            message: error.to_string(),
        })?;

    let pid = child.id();
    let command = spec.command_line();
    log::info!("[process] {job_id} launched pid={pid}: {command}");
    let _ = events.send(ProcessEvent::Launched {
        job_id: job_id.clone(),
        pid,
        command,
    });

    let stop = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    let finished_signal = finished.clone();
    let worker_job_id = job_id.clone();

    let worker = thread::spawn(move || {
        let stderr_reader = child.stderr.take().map(|stderr| {
            let events = events.clone();
            let job_id = worker_job_id.clone();
            thread::spawn(move || forward_lines(stderr, &job_id, &events))
        });

        let mut tail = child
            .stdout
            .take()
            .map(|stdout| forward_lines(stdout, &worker_job_id, &events))
            .unwrap_or_default();
        if let Some(reader) = stderr_reader {
            if let Ok(stderr_tail) = reader.join() {
                tail.extend(stderr_tail);
            }
        }
        let skip = tail.len().saturating_sub(OUTPUT_TAIL_LINES);
        let tail_text = tail.into_iter().skip(skip).collect::<Vec<_>>().join("\n");

        let outcome = match child.wait() {
            Ok(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;
                classify_exit(
                    status.code(),
                    signal,
                    stop_signal.load(Ordering::SeqCst),
                    &tail_text,
                )
            }
            Err(error) => ProcessOutcome::Failed {
                exit_code: None,
                message: format!("Failed while waiting for process: {error}"),
            },
        };

        finished_signal.store(true, Ordering::SeqCst);
        log::info!("[process] {worker_job_id} finished: {outcome:?}");
        let _ = events.send(ProcessEvent::Finished {
            job_id: worker_job_id,
            outcome,
        });
    });

    Ok(ProcessHandle {
        job_id,
        pid,
        stop,
        finished,
        worker: Some(worker),
    })
}
