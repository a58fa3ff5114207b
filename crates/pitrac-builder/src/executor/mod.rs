use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;

use crate::builder::{BuildRequest, Builder};
use crate::cache::{FingerprintCache, MemoryBackend};
use crate::dirty::{DirtyCheck, DirtyReason};
use crate::error::{Error, Result};
use crate::packages::PackageTable;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    Evaluated {
        package: String,
        reason: DirtyReason,
    },
    BuildStarted {
        package: String,
        version: String,
    },
    BuildLog {
        package: String,
        line: String,
    },
    BuildFinished {
        package: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    Skipped {
        package: String,
        cause: String,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Prints progress lines and a run summary; keeps the tail of each build's
/// output so a failed build's log can be written out.
#[derive(Default)]
pub struct StdoutSink {
    error_logs_root: Option<PathBuf>,
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    built: usize,
    clean: usize,
    failed: Vec<String>,
    skipped: Vec<String>,
    total_build_ms: u128,
    logs: BTreeMap<String, VecDeque<String>>,
    error_logs: Vec<PathBuf>,
}

impl StdoutSink {
    pub fn with_error_logs(root: PathBuf) -> Self {
        Self {
            error_logs_root: Some(root),
            state: Mutex::default(),
        }
    }
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        if s.started_at.is_none() {
            s.started_at = Some(Instant::now());
        }
        match ev {
            ExecEvent::Evaluated { package, reason } => {
                if reason.is_dirty() {
                    println!("DIRTY: {package} ({reason})");
                } else {
                    s.clean += 1;
                    println!("CLEAN: {package}");
                }
            }
            ExecEvent::BuildStarted { package, version } => {
                println!("BUILD: {package} {version}");
            }
            ExecEvent::BuildLog { package, line } => {
                let q = s.logs.entry(package.clone()).or_default();
                while q.len() >= 2000 {
                    q.pop_front();
                }
                q.push_back(line.clone());
                println!("[{package}] {line}");
            }
            ExecEvent::BuildFinished {
                package,
                ok,
                error,
                elapsed_ms,
            } => {
                s.total_build_ms = s.total_build_ms.saturating_add(elapsed_ms);
                if ok {
                    s.built += 1;
                    s.logs.remove(&package);
                    println!("DONE: {package} ({elapsed_ms}ms)");
                } else {
                    let err = error.unwrap_or_default();
                    println!("FAIL: {package} ({elapsed_ms}ms) {err}");
                    s.failed.push(package.clone());
                    match self.write_error_log(&mut s, &package, &err) {
                        Ok(Some(p)) => println!("ERROR_LOG: {package} => {}", p.display()),
                        Ok(None) => {}
                        Err(e) => println!("WARN: failed to write error log for {package}: {e}"),
                    }
                }
            }
            ExecEvent::Skipped { package, cause } => {
                println!("SKIP: {package} ({cause})");
                s.skipped.push(package);
            }
            ExecEvent::RunDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  packages: built={} clean={} failed={} skipped={}",
                    s.built,
                    s.clean,
                    s.failed.len(),
                    s.skipped.len()
                );
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                println!(
                    "  summed_build_time: {}",
                    format_elapsed_hms((s.total_build_ms / 1000) as u64)
                );
                if !s.failed.is_empty() {
                    println!("  failed: {}", s.failed.join(", "));
                }
                if !s.skipped.is_empty() {
                    println!("  skipped: {}", s.skipped.join(", "));
                }
                for p in &s.error_logs {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error {
                    println!("  error: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

impl StdoutSink {
    fn write_error_log(
        &self,
        s: &mut StdoutSinkState,
        package: &str,
        error: &str,
    ) -> Result<Option<PathBuf>> {
        let Some(root) = self.error_logs_root.as_ref() else {
            return Ok(None);
        };
        let dir = root.join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{package}.log"));
        let mut body = format!("package: {package}\nstatus: failed\nerror: {error}\n\nlogs:\n");
        if let Some(lines) = s.logs.remove(package) {
            for line in lines {
                body.push_str(&line);
                body.push('\n');
            }
        }
        fs::write(&path, body)
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))?;
        s.error_logs.push(path.clone());
        Ok(Some(path))
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_package: Option<String>,
    // Per-build flag raised when that build times out.
    abort: Arc<AtomicBool>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_package: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context for one build with its own abort flag.
    pub fn for_package(&self, package: &str) -> Self {
        Self {
            current_package: Some(package.to_string()),
            abort: Arc::new(AtomicBool::new(false)),
            ..self.clone()
        }
    }

    /// Set once the build has timed out; long-running builders must stop.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    fn abort_build(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn log(&self, msg: &str) {
        let package = self
            .current_package
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::BuildLog {
            package,
            line: msg.to_string(),
        });
    }

    /// Runs a child in its own process group, streaming sanitized output lines
    /// to the sink. An abort kills the whole group.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.aborted() {
            return Err(Error::msg("build aborted"));
        }
        if self.dry_run {
            self.log(&format!("DRY-RUN: {cmd:?}"));
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("spawn failed: {e}")))?;
        let pgid = child.id();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        let mut killed = false;
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(line) => {
                    let line = sanitize_line(&line);
                    if !line.is_empty() {
                        self.log(&line);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !killed && self.aborted() {
                kill_pgroup(pgid);
                killed = true;
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
        if killed {
            return Err(Error::msg("build process killed"));
        }
        if !status.success() {
            return Err(Error::msg(format!("command failed: {status}")));
        }
        Ok(())
    }
}

fn kill_pgroup(pgid: u32) {
    #[cfg(unix)]
    {
        // Negative pid targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
    }
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' || pending.len() >= MAX_PENDING_BYTES {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
                if b == b'\n' || b == b'\r' {
                    continue;
                }
            }
            pending.push(b);
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

const MAX_LINE_CHARS: usize = 4096;

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[PX^_][^\x1b]*\x1b\\|[@-Z\\-_])")
            .expect("static regex")
    })
}

/// Strips terminal escapes and control characters from a child output line.
pub fn sanitize_line(input: &str) -> String {
    let stripped = ansi_re().replace_all(input, "");
    let mut out = String::with_capacity(stripped.len().min(MAX_LINE_CHARS));
    for (count, c) in stripped
        .chars()
        .map(|c| if c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control() && !matches!(*c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'))
        .enumerate()
    {
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Pending,
    Clean,
    Dirty,
    Building,
    Built,
    Failed,
    /// Never evaluated because an upstream build failed.
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub order: Vec<String>,
    pub states: BTreeMap<String, PackageState>,
}

impl RunReport {
    fn new(order: &[String]) -> Self {
        Self {
            order: order.to_vec(),
            states: order
                .iter()
                .map(|p| (p.clone(), PackageState::Pending))
                .collect(),
        }
    }

    fn set(&mut self, package: &str, state: PackageState) {
        self.states.insert(package.to_string(), state);
    }

    pub fn state(&self, package: &str) -> Option<PackageState> {
        self.states.get(package).copied()
    }

    pub fn in_state(&self, state: PackageState) -> Vec<String> {
        self.order
            .iter()
            .filter(|p| self.state(p) == Some(state))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// 0 or 1 runs sequentially.
    pub max_parallel: usize,
    pub build_timeout: Option<Duration>,
}

/// What the executor needs besides the schedule and the cache.
pub struct BuildJob<'a> {
    pub table: &'a PackageTable,
    pub check: DirtyCheck<'a>,
    pub architecture: &'a str,
    pub versions: &'a BTreeMap<String, String>,
    pub builder: Arc<dyn Builder>,
}

impl BuildJob<'_> {
    fn request(&self, package: &str) -> BuildRequest {
        BuildRequest {
            package: package.to_string(),
            architecture: self.architecture.to_string(),
            version: self.versions.get(package).cloned().unwrap_or_default(),
            artifact_dir: self.check.artifacts.path().to_path_buf(),
        }
    }
}

fn build_error(package: &str, err: Error) -> Error {
    match err {
        Error::BuildTimedOut { .. } | Error::BuildFailed { .. } => err,
        other => Error::BuildFailed {
            package: package.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Invokes the builder, enforcing the optional timeout from a watcher thread.
fn run_build(
    builder: &Arc<dyn Builder>,
    req: &BuildRequest,
    ctx: &ExecCtx,
    timeout: Option<Duration>,
) -> Result<()> {
    let Some(limit) = timeout else {
        return builder
            .build(req, ctx)
            .map_err(|e| build_error(&req.package, e));
    };

    let (tx, rx) = mpsc::channel();
    let worker_builder = Arc::clone(builder);
    let worker_req = req.clone();
    let worker_ctx = ctx.clone();
    std::thread::spawn(move || {
        let _ = tx.send(worker_builder.build(&worker_req, &worker_ctx));
    });

    match rx.recv_timeout(limit) {
        Ok(res) => res.map_err(|e| build_error(&req.package, e)),
        Err(RecvTimeoutError::Timeout) => {
            ctx.abort_build();
            tracing::warn!(package = %req.package, timeout_secs = limit.as_secs(), "build timed out");
            Err(Error::BuildTimedOut {
                package: req.package.clone(),
                timeout: limit,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(Error::BuildFailed {
            package: req.package.clone(),
            reason: "builder panicked".into(),
        }),
    }
}

/// Runs the schedule one package at a time, stopping at the first failure.
pub fn execute_schedule(
    job: &BuildJob<'_>,
    order: &[String],
    cache: &mut FingerprintCache,
    ctx: &ExecCtx,
    opts: &ExecOptions,
) -> Result<RunReport> {
    // Dry runs record into a throwaway copy so the on-disk cache is never written.
    let mut scratch;
    let cache = if ctx.dry_run {
        scratch = FingerprintCache::load(Box::new(MemoryBackend::with_entries(
            cache.entries().clone(),
        )));
        &mut scratch
    } else {
        cache
    };
    let mut report = RunReport::new(order);
    for (idx, package) in order.iter().enumerate() {
        if let Err(e) = execute_one(job, package, cache, ctx, opts, &mut report) {
            for rest in &order[idx + 1..] {
                report.set(rest, PackageState::Skipped);
                ctx.sink.emit(ExecEvent::Skipped {
                    package: rest.clone(),
                    cause: format!("aborted after '{package}' failed"),
                });
            }
            ctx.sink.emit(ExecEvent::RunDone {
                ok: false,
                error: Some(e.to_string()),
            });
            return Err(e);
        }
    }
    ctx.sink.emit(ExecEvent::RunDone {
        ok: true,
        error: None,
    });
    Ok(report)
}

fn execute_one(
    job: &BuildJob<'_>,
    package: &str,
    cache: &mut FingerprintCache,
    ctx: &ExecCtx,
    opts: &ExecOptions,
    report: &mut RunReport,
) -> Result<()> {
    let spec = job.table.require(package)?;
    // Re-evaluated here, after upstream packages have updated the cache.
    let eval = job.check.evaluate(spec, cache)?;
    ctx.sink.emit(ExecEvent::Evaluated {
        package: package.to_string(),
        reason: eval.reason,
    });
    if !eval.reason.is_dirty() {
        report.set(package, PackageState::Clean);
        return Ok(());
    }
    report.set(package, PackageState::Dirty);

    let req = job.request(package);
    if ctx.dry_run {
        tracing::info!(package, version = %req.version, reason = %eval.reason, "would build");
        // Scratch cache only: lets dependents see the fingerprint a real build records.
        cache.record(package, &eval.fingerprint)?;
        return Ok(());
    }

    report.set(package, PackageState::Building);
    ctx.sink.emit(ExecEvent::BuildStarted {
        package: package.to_string(),
        version: req.version.clone(),
    });
    tracing::info!(package, version = %req.version, reason = %eval.reason, "building");
    let start = Instant::now();
    let res = run_build(&job.builder, &req, &ctx.for_package(package), opts.build_timeout);
    let elapsed_ms = start.elapsed().as_millis();

    if let Err(e) = res {
        report.set(package, PackageState::Failed);
        ctx.sink.emit(ExecEvent::BuildFinished {
            package: package.to_string(),
            ok: false,
            error: Some(e.to_string()),
            elapsed_ms,
        });
        return Err(e);
    }

    if let Err(e) = cache.record(package, &eval.fingerprint) {
        report.set(package, PackageState::Failed);
        ctx.sink.emit(ExecEvent::BuildFinished {
            package: package.to_string(),
            ok: false,
            error: Some(e.to_string()),
            elapsed_ms,
        });
        return Err(e);
    }
    report.set(package, PackageState::Built);
    ctx.sink.emit(ExecEvent::BuildFinished {
        package: package.to_string(),
        ok: true,
        error: None,
        elapsed_ms,
    });
    Ok(())
}

/// Runs independent packages concurrently.
///
/// The calling thread owns the cache: it evaluates each package right before
/// dispatch and records a build's fingerprint before releasing its
/// dependents. A failed build skips its dependents while unrelated branches
/// keep going. Evaluation and cache write errors stop all further dispatch.
pub fn execute_schedule_parallel(
    job: &BuildJob<'_>,
    order: &[String],
    cache: &mut FingerprintCache,
    ctx: &ExecCtx,
    opts: &ExecOptions,
) -> Result<RunReport> {
    if opts.max_parallel <= 1 || ctx.dry_run {
        return execute_schedule(job, order, cache, ctx, opts);
    }

    let in_run: BTreeSet<&str> = order.iter().map(String::as_str).collect();
    let mut incoming: BTreeMap<String, usize> = BTreeMap::new();
    let mut outgoing: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for package in order {
        let spec = job.table.require(package)?;
        let deps: Vec<&String> = spec
            .deps
            .iter()
            .filter(|d| in_run.contains(d.as_str()))
            .collect();
        incoming.insert(package.clone(), deps.len());
        for dep in deps {
            outgoing.entry(dep.clone()).or_default().push(package.clone());
        }
    }

    let mut report = RunReport::new(order);
    let mut ready: VecDeque<String> = order
        .iter()
        .filter(|p| incoming.get(p.as_str()) == Some(&0))
        .cloned()
        .collect();
    let mut fingerprints: BTreeMap<String, String> = BTreeMap::new();
    let mut running: HashMap<String, std::thread::JoinHandle<()>> = HashMap::new();
    let (tx, rx) = mpsc::channel::<(String, Result<()>, u128)>();
    let mut build_err: Option<Error> = None;
    let mut fatal: Option<Error> = None;

    loop {
        while fatal.is_none() && running.len() < opts.max_parallel {
            let Some(package) = ready.pop_front() else {
                break;
            };
            let eval = match job
                .table
                .require(&package)
                .and_then(|spec| job.check.evaluate(spec, cache))
            {
                Ok(eval) => eval,
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            };
            ctx.sink.emit(ExecEvent::Evaluated {
                package: package.clone(),
                reason: eval.reason,
            });
            if !eval.reason.is_dirty() {
                report.set(&package, PackageState::Clean);
                release(&package, &outgoing, &mut incoming, &mut ready);
                continue;
            }

            let req = job.request(&package);
            report.set(&package, PackageState::Building);
            fingerprints.insert(package.clone(), eval.fingerprint);
            ctx.sink.emit(ExecEvent::BuildStarted {
                package: package.clone(),
                version: req.version.clone(),
            });
            tracing::info!(package = %package, version = %req.version, reason = %eval.reason, "building");

            let tx = tx.clone();
            let builder = Arc::clone(&job.builder);
            let build_ctx = ctx.for_package(&package);
            let timeout = opts.build_timeout;
            let handle = std::thread::spawn(move || {
                let start = Instant::now();
                let res = run_build(&builder, &req, &build_ctx, timeout);
                let _ = tx.send((req.package, res, start.elapsed().as_millis()));
            });
            running.insert(package, handle);
        }

        if running.is_empty() {
            break;
        }

        let (done, res, elapsed_ms) = rx
            .recv()
            .map_err(|e| Error::msg(format!("executor recv failed: {e}")))?;
        if let Some(h) = running.remove(&done) {
            let _ = h.join();
        }

        match res {
            Ok(()) => {
                let fp = fingerprints.remove(&done).unwrap_or_default();
                if let Err(e) = cache.record(&done, &fp) {
                    report.set(&done, PackageState::Failed);
                    ctx.sink.emit(ExecEvent::BuildFinished {
                        package: done.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    });
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                    continue;
                }
                report.set(&done, PackageState::Built);
                ctx.sink.emit(ExecEvent::BuildFinished {
                    package: done.clone(),
                    ok: true,
                    error: None,
                    elapsed_ms,
                });
                release(&done, &outgoing, &mut incoming, &mut ready);
            }
            Err(e) => {
                report.set(&done, PackageState::Failed);
                ctx.sink.emit(ExecEvent::BuildFinished {
                    package: done.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                tracing::error!(package = %done, error = %e, "build failed; skipping dependents");
                if build_err.is_none() {
                    build_err = Some(e);
                }
            }
        }
    }

    for package in order {
        if report.state(package) == Some(PackageState::Pending) {
            report.set(package, PackageState::Skipped);
            ctx.sink.emit(ExecEvent::Skipped {
                package: package.clone(),
                cause: "upstream failure".into(),
            });
        }
    }

    match fatal.or(build_err) {
        Some(e) => {
            ctx.sink.emit(ExecEvent::RunDone {
                ok: false,
                error: Some(e.to_string()),
            });
            Err(e)
        }
        None => {
            ctx.sink.emit(ExecEvent::RunDone {
                ok: true,
                error: None,
            });
            Ok(report)
        }
    }
}

fn release(
    package: &str,
    outgoing: &BTreeMap<String, Vec<String>>,
    incoming: &mut BTreeMap<String, usize>,
    ready: &mut VecDeque<String>,
) {
    let Some(dependents) = outgoing.get(package) else {
        return;
    };
    for dependent in dependents {
        if let Some(n) = incoming.get_mut(dependent) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                ready.push_back(dependent.clone());
            }
        }
    }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}
