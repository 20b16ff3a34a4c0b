use crate::config::{Limits, MemorySource, SolverConfig};
use bench_core::{evaluate_trial, extract, BenchTask, ChildExit, FailureKind, TrialOutcome};
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Runs a single trial of a task. Every failure mode is folded into the
/// returned outcome; implementations never panic or return errors.
pub trait TrialExecutor {
    fn execute(&mut self, task: &BenchTask) -> TrialOutcome;
}

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    wrapper: Vec<String>,
    memory: MemorySource,
    timeout: Duration,
}

struct CapturedRun {
    exit: ChildExit,
    stdout: String,
    stderr: String,
    elapsed: Duration,
    max_rss_kb: u64,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            wrapper: Vec::new(),
            memory: MemorySource::Rusage,
            timeout,
        }
    }

    pub fn from_config(solver: &SolverConfig, limits: &Limits) -> Self {
        Self::new(&solver.program, limits.timeout())
            .with_wrapper(solver.wrapper.clone(), solver.memory)
    }

    pub fn with_wrapper(mut self, wrapper: Vec<String>, memory: MemorySource) -> Self {
        self.wrapper = wrapper;
        self.memory = memory;
        self
    }

    fn command(&self, task: &BenchTask) -> Command {
        let mut command = match self.wrapper.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut command = Command::new(wrapper);
                command.args(wrapper_args).arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .args(task.options())
            .arg(task.input())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        command
    }

    fn run_once(&self, task: &BenchTask) -> io::Result<CapturedRun> {
        let mut command = self.command(task);
        let started = Instant::now();
        let mut child = command.spawn()?;
        let group = Arc::new(ProcessGroup::new(child.id()));
        let stdout = PipeCapture::spawn(child.stdout.take());
        let stderr = PipeCapture::spawn(child.stderr.take());

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&group);
        thread::spawn(move || {
            let _ = tx.send(waiter.reap());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(waited) => {
                let exited = waited?;
                let output_deadline = started + self.timeout + OUTPUT_GRACE;
                Ok(CapturedRun {
                    exit: ChildExit::Exited(exit_code(exited.status)),
                    stdout: stdout.collect(output_deadline),
                    stderr: stderr.collect(output_deadline),
                    elapsed: exited.finished.duration_since(started),
                    max_rss_kb: exited.max_rss_kb,
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                group.kill();
                // SIGKILL cannot be ignored, so the leader is reaped promptly.
                let _ = rx.recv();
                let output_deadline = Instant::now() + OUTPUT_GRACE;
                Ok(CapturedRun {
                    exit: ChildExit::TimedOut,
                    stdout: stdout.collect(output_deadline),
                    stderr: stderr.collect(output_deadline),
                    elapsed: started.elapsed(),
                    max_rss_kb: 0,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::Other,
                "wait thread exited without reporting a status",
            )),
        }
    }

    fn evaluate(&self, task: &BenchTask, run: &CapturedRun) -> TrialOutcome {
        let peak_memory_kb = match self.memory {
            MemorySource::Wrapper => extract::peak_memory_kb(&run.stderr),
            MemorySource::Rusage => run.max_rss_kb,
        };
        if peak_memory_kb == 0 && run.exit == ChildExit::Exited(0) {
            debug!(
                file = %task.input().display(),
                "no peak memory reading, recording 0 KB"
            );
        }
        if run.exit == ChildExit::TimedOut && !run.stdout.is_empty() {
            debug!(
                file = %task.input().display(),
                "discarding {} bytes of output from timed out trial",
                run.stdout.len()
            );
        }
        evaluate_trial(
            run.exit,
            &run.stdout,
            &run.stderr,
            run.elapsed.as_secs_f64() * 1000.0,
            peak_memory_kb,
        )
    }
}

impl TrialExecutor for ProcessExecutor {
    fn execute(&mut self, task: &BenchTask) -> TrialOutcome {
        let outcome = match self.run_once(task) {
            Ok(run) => self.evaluate(task, &run),
            Err(err) => {
                error!(
                    file = %task.input().display(),
                    program = %self.program.display(),
                    "unexpected error running solver: {}",
                    err
                );
                TrialOutcome::Failed(FailureKind::AbnormalExit { code: None })
            }
        };
        if let TrialOutcome::Failed(kind) = &outcome {
            warn!(
                file = %task.input().display(),
                configuration = task.configuration(),
                status = %kind.status(),
                "trial failed: {}",
                kind
            );
        }
        outcome
    }
}

/// The process group led by a spawned solver.
///
/// Every member is sent SIGKILL before the leader is reaped, while its
/// zombie still pins the pgid, and again on drop if the leader was never
/// reaped. Once `reaped` is set the pgid may belong to someone else and is
/// never signalled.
struct ProcessGroup {
    pgid: libc::pid_t,
    reaped: Mutex<bool>,
}

impl ProcessGroup {
    fn new(leader: u32) -> Self {
        Self {
            pgid: leader as libc::pid_t,
            reaped: Mutex::new(false),
        }
    }

    fn kill(&self) {
        let reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        if !*reaped {
            self.signal();
        }
    }

    fn reap(&self) -> io::Result<ExitRecord> {
        wait_until_exited(self.pgid)?;
        let finished = Instant::now();
        let mut reaped = self.reaped.lock().unwrap_or_else(PoisonError::into_inner);
        self.signal();
        let (status, usage) = reap_child(self.pgid)?;
        *reaped = true;
        Ok(ExitRecord {
            status,
            max_rss_kb: max_rss_kb(&usage),
            finished,
        })
    }

    fn signal(&self) {
        // SAFETY: killpg only delivers a signal; an empty group yields ESRCH.
        let rc = unsafe { libc::killpg(self.pgid, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                debug!(pgid = self.pgid, "killpg failed: {}", err);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

struct ExitRecord {
    status: libc::c_int,
    max_rss_kb: u64,
    finished: Instant,
}

fn wait_until_exited(pid: libc::pid_t) -> io::Result<()> {
    // SAFETY: siginfo_t is plain data and valid when zeroed.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: pid is a child of this process; WNOWAIT leaves it unreaped.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn reap_child(pid: libc::pid_t) -> io::Result<(libc::c_int, libc::rusage)> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data and valid when zeroed.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: pid is an unreaped child of this process and both pointers
        // outlive the call.
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            return Ok((status, usage));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(target_os = "macos")]
fn max_rss_kb(usage: &libc::rusage) -> u64 {
    // Reported in bytes on macOS.
    usage.ru_maxrss.max(0) as u64 / 1024
}

#[cfg(not(target_os = "macos"))]
fn max_rss_kb(usage: &libc::rusage) -> u64 {
    usage.ru_maxrss.max(0) as u64
}

fn exit_code(raw_status: libc::c_int) -> i32 {
    let status = ExitStatus::from_raw(raw_status);
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

// An escaped descendant may hold the pipe open forever; collect() keeps
// whatever arrived by its deadline.
struct PipeCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl PipeCapture {
    fn spawn<R: Read + Send + 'static>(pipe: Option<R>) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&buf);
        thread::spawn(move || {
            if let Some(mut pipe) = pipe {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => sink
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..n]),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            }
            let _ = tx.send(());
        });
        Self { buf, done }
    }

    fn collect(self, deadline: Instant) -> String {
        if self
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_err()
        {
            debug!("output pipe still open at deadline, keeping partial output");
        }
        let bytes = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::TrialStatus;
    use chrono::Utc;
    use std::fs;
    use std::path::Path;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sbench_exec_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        path
    }

    fn input_file(dir: &Path) -> PathBuf {
        let path = dir.join("b01.stp");
        fs::write(&path, "SECTION Graph\nEND\n").expect("write input");
        path
    }

    // Scripts are handed to /bin/sh rather than executed, so no exec races
    // with the file just written.
    fn sh_executor(script: &Path, timeout: Duration) -> ProcessExecutor {
        ProcessExecutor::new(script, timeout)
            .with_wrapper(vec!["/bin/sh".to_string()], MemorySource::Rusage)
    }

    fn run_script(tag: &str, body: &str) -> TrialOutcome {
        let dir = scratch_dir(tag);
        let solver = write_script(&dir, "solver.sh", body);
        let task = BenchTask::new("test", "", input_file(&dir));
        let outcome = sh_executor(&solver, Duration::from_secs(30)).execute(&task);
        let _ = fs::remove_dir_all(dir);
        outcome
    }

    #[test]
    fn successful_run_reports_time_memory_and_cost() {
        let outcome = run_script("ok", "echo 'Reading graph'\necho 'Total cost: 12.50'");
        let measurement = outcome.measurement().expect("success");
        assert_eq!(measurement.reported_value, 12.5);
        assert!(measurement.elapsed_ms > 0.0);
        assert!(measurement.peak_memory_kb > 0);
    }

    #[test]
    fn options_precede_the_input_path() {
        let dir = scratch_dir("args");
        let solver = write_script(
            &dir,
            "solver.sh",
            "[ \"$1\" = \"-a\" ] && [ \"$2\" = \"-c\" ] && [ -f \"$3\" ] || exit 9\necho 'Total cost: 1'",
        );
        let task = BenchTask::new("two-apx", "-a -c", input_file(&dir));
        let outcome = sh_executor(&solver, Duration::from_secs(30)).execute(&task);
        let _ = fs::remove_dir_all(dir);
        assert_eq!(outcome.status(), TrialStatus::Success);
    }

    #[test]
    fn wrapper_diagnostics_supply_peak_memory() {
        let dir = scratch_dir("wrapper");
        let solver = write_script(&dir, "solver.sh", "echo 'Total cost: 3'");
        let wrapper = write_script(
            &dir,
            "time.sh",
            "/bin/sh \"$@\"\nrc=$?\nprintf '\\tMaximum resident set size (kbytes): 4242\\n' >&2\nexit $rc",
        );
        let task = BenchTask::new("test", "", input_file(&dir));
        let mut executor = ProcessExecutor::new(&solver, Duration::from_secs(30)).with_wrapper(
            vec!["/bin/sh".to_string(), wrapper.display().to_string()],
            MemorySource::Wrapper,
        );
        let outcome = executor.execute(&task);
        let _ = fs::remove_dir_all(dir);
        assert_eq!(outcome.peak_memory_kb(), Some(4242));
        assert_eq!(outcome.reported_value(), Some(3.0));
    }

    #[test]
    fn missing_cost_line_is_parse_failure() {
        let outcome = run_script("parse", "echo 'Result is a Steiner Tree :)'");
        assert_eq!(outcome, TrialOutcome::Failed(FailureKind::ParseFailure));
    }

    #[test]
    fn exit_codes_are_classified() {
        assert_eq!(
            run_script("oom137", "exit 137").status(),
            TrialStatus::OutOfMemory
        );
        assert_eq!(
            run_script("oom2", "echo 'Error: Out of memory' >&2\nexit 2").status(),
            TrialStatus::OutOfMemory
        );
        assert_eq!(
            run_script("usage", "echo 'Usage: min-cost-ST' >&2\nexit 2"),
            TrialOutcome::Failed(FailureKind::AbnormalExit { code: Some(2) })
        );
        assert_eq!(
            run_script("abnormal", "echo 'Total cost: 4'\nexit 3"),
            TrialOutcome::Failed(FailureKind::AbnormalExit { code: Some(3) })
        );
    }

    #[test]
    fn death_by_signal_maps_to_shell_exit_code() {
        assert_eq!(
            run_script("sigkill", "kill -9 $$").status(),
            TrialStatus::OutOfMemory
        );
        assert_eq!(
            run_script("sigterm", "kill -15 $$"),
            TrialOutcome::Failed(FailureKind::AbnormalExit { code: Some(143) })
        );
    }

    #[test]
    fn spawn_failure_becomes_abnormal_exit() {
        let task = BenchTask::new("test", "-a", "graph.stp");
        let outcome = ProcessExecutor::new("/nonexistent/sbench-solver", Duration::from_secs(1))
            .execute(&task);
        assert_eq!(
            outcome,
            TrialOutcome::Failed(FailureKind::AbnormalExit { code: None })
        );
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: i32) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(true, |state| state == 'Z' || state == 'X'),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_the_whole_process_group() {
        let dir = scratch_dir("timeout");
        let solver = write_script(
            &dir,
            "solver.sh",
            "sleep 30 &\necho $! > \"$1.pid\"\necho 'Total cost: 1'\nwait",
        );
        let input = input_file(&dir);
        let task = BenchTask::new("test", "", &input);
        let started = Instant::now();
        let outcome = sh_executor(&solver, Duration::from_millis(500)).execute(&task);
        assert_eq!(outcome, TrialOutcome::Failed(FailureKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = read_pid(&input);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_gone(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(process_gone(pid), "background worker {} survived", pid);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(target_os = "linux")]
    fn read_pid(input: &Path) -> i32 {
        let pid_file = PathBuf::from(format!("{}.pid", input.display()));
        fs::read_to_string(&pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid")
    }

    #[cfg(target_os = "linux")]
    fn has_setsid() -> bool {
        Path::new("/usr/bin/setsid").exists() || Path::new("/bin/setsid").exists()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn normal_exit_kills_stragglers_left_in_the_group() {
        let dir = scratch_dir("straggler");
        let solver = write_script(
            &dir,
            "solver.sh",
            "sleep 30 &\necho $! > \"$1.pid\"\necho 'Total cost: 1'",
        );
        let input = input_file(&dir);
        let task = BenchTask::new("test", "", &input);
        let started = Instant::now();
        let outcome = sh_executor(&solver, Duration::from_secs(5)).execute(&task);
        assert_eq!(outcome.reported_value(), Some(1.0));
        assert!(started.elapsed() < Duration::from_secs(3));

        let pid = read_pid(&input);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_gone(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(process_gone(pid), "straggler {} survived", pid);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn escaped_descendant_holding_pipes_does_not_stall_timeout() {
        if !has_setsid() {
            return;
        }
        let dir = scratch_dir("escaped_timeout");
        let solver = write_script(
            &dir,
            "solver.sh",
            "setsid sleep 8 &\necho 'Total cost: 1'\nsleep 30",
        );
        let task = BenchTask::new("test", "", input_file(&dir));
        let started = Instant::now();
        let outcome = sh_executor(&solver, Duration::from_secs(1)).execute(&task);
        let took = started.elapsed();
        let _ = fs::remove_dir_all(dir);
        assert_eq!(outcome, TrialOutcome::Failed(FailureKind::Timeout));
        assert!(took < Duration::from_secs(3), "took {:?}", took);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn escaped_descendant_holding_pipes_keeps_partial_output() {
        if !has_setsid() {
            return;
        }
        let dir = scratch_dir("escaped_exit");
        let solver = write_script(&dir, "solver.sh", "setsid sleep 8 &\necho 'Total cost: 1'");
        let task = BenchTask::new("test", "", input_file(&dir));
        let started = Instant::now();
        let outcome = sh_executor(&solver, Duration::from_secs(1)).execute(&task);
        let took = started.elapsed();
        let _ = fs::remove_dir_all(dir);
        assert_eq!(outcome.reported_value(), Some(1.0));
        assert!(took < Duration::from_secs(3), "took {:?}", took);
    }
}
