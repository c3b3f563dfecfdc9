//! Marker worker backend.
//!
//! The Marker models are loaded once, by a long-lived worker process, and
//! shared by every request. The worker speaks JSON lines over stdio:
//!
//! ```text
//! worker ─▶ {"event":"ready"}                                          once models are in memory
//! server ─▶ {"id":1,"pdf":"/tmp/upload-x.pdf","max_pages":null,"langs":["English"],"batch_multiplier":2}
//! worker ─▶ {"event":"result","id":1,"text":"…","images":["…"],"metadata":{…}}
//! worker ─▶ {"event":"error","id":1,"message":"…"}
//! ```
//!
//! Requests are written by a single writer task, so a cancelled conversion
//! never leaves half a line on the pipe. Replies are routed back by `id`; a
//! reply whose caller has gone away (timeout, disconnect) is discarded. The
//! worker handles one document at a time, in request order.
//!
//! Anything that is not a protocol line is ignored, and stderr is forwarded
//! to the log. The worker runs with `kill_on_drop`, so it exits together with
//! the [`MarkerWorker`] that owns it.

use super::{ModelBundle, ModelLoader, RawConversion};
use crate::config::{ConvertOptions, ServiceConfig};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Lines of stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

type Reply = Result<RawConversion, BackendError>;
type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Reply>>>;
type StderrTail = Arc<Mutex<VecDeque<String>>>;

// ── Protocol ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    id: u64,
    pdf: &'a Path,
    max_pages: Option<usize>,
    langs: &'a [String],
    batch_multiplier: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WorkerEvent {
    Ready {
        #[serde(default)]
        device: Option<String>,
    },
    Result {
        id: u64,
        text: String,
        #[serde(default)]
        images: Vec<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Error {
        id: u64,
        message: String,
    },
}

// ── Loader ───────────────────────────────────────────────────────────────

/// Starts the Marker worker and waits until it reports its models loaded.
#[derive(Debug, Clone)]
pub struct MarkerWorkerLoader {
    program: PathBuf,
    model_cache_dir: PathBuf,
    torch_device: Option<String>,
    startup_timeout: Duration,
}

impl MarkerWorkerLoader {
    pub fn new(program: impl Into<PathBuf>, model_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            model_cache_dir: model_cache_dir.into(),
            torch_device: None,
            startup_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(&config.worker_bin, &config.model_cache_dir)
            .torch_device(config.torch_device.clone())
            .startup_timeout(config.model_load_timeout())
    }

    pub fn torch_device(mut self, device: Option<String>) -> Self {
        self.torch_device = device;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Spawn the worker and wait for its `ready` line.
    pub async fn start(&self) -> Result<MarkerWorker, BackendError> {
        tokio::fs::create_dir_all(&self.model_cache_dir)
            .await
            .map_err(|source| BackendError::Io {
                path: self.model_cache_dir.clone(),
                source,
            })?;

        let mut cmd = Command::new(&self.program);
        cmd.env("MODEL_CACHE_DIR", &self.model_cache_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref device) = self.torch_device {
            cmd.env("TORCH_DEVICE", device);
        }

        let mut child = cmd.spawn().map_err(|source| BackendError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(i), Some(o), Some(e)) => (i, o, e),
            _ => return Err(BackendError::Failed("worker stdio was not captured".into())),
        };

        let tail: StderrTail = Arc::default();
        let stderr_task = tokio::spawn(forward_stderr(stderr, Arc::clone(&tail)));
        let mut lines = BufReader::new(stdout).lines();

        let start = Instant::now();
        match tokio::time::timeout(self.startup_timeout, wait_ready(&mut lines)).await {
            Err(_) => {
                return Err(BackendError::StartupTimeout {
                    program: self.program.clone(),
                    secs: self.startup_timeout.as_secs(),
                })
            }
            Ok(Err(source)) => return Err(BackendError::Pipe { source }),
            Ok(Ok(Some(device))) => {
                info!(
                    program = %self.program.display(),
                    cache = %self.model_cache_dir.display(),
                    device = device.as_deref().unwrap_or("default"),
                    "Marker worker ready in {}ms",
                    start.elapsed().as_millis()
                );
            }
            Ok(Ok(None)) => {
                drop(stdin);
                let status = match child.wait().await {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("unknown ({e})"),
                };
                // stderr closes with the process; collect what it said.
                let _ = tokio::time::timeout(Duration::from_secs(5), stderr_task).await;
                return Err(BackendError::ProcessFailed {
                    program: self.program.clone(),
                    status,
                    stderr: tail_text(&tail),
                });
            }
        }

        let pending: Arc<PendingMap> = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));
        let (requests, request_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_requests(stdin, request_rx));
        tokio::spawn(dispatch_replies(
            lines,
            Arc::clone(&pending),
            Arc::clone(&alive),
            self.program.clone(),
        ));

        Ok(MarkerWorker {
            program: self.program.clone(),
            requests,
            pending,
            alive,
            next_id: AtomicU64::new(1),
            _child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl ModelLoader for MarkerWorkerLoader {
    async fn load_models(&self) -> Result<Arc<dyn ModelBundle>, BackendError> {
        Ok(Arc::new(self.start().await?))
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────

/// Handle to a running worker with its models loaded.
///
/// Dropping the handle kills the worker.
pub struct MarkerWorker {
    program: PathBuf,
    requests: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    _child: Mutex<Child>,
}

impl std::fmt::Debug for MarkerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerWorker")
            .field("program", &self.program)
            .field("alive", &self.is_alive())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl MarkerWorker {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Requests sent and still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    fn exited(&self) -> BackendError {
        BackendError::WorkerExited {
            program: self.program.clone(),
        }
    }
}

/// Removes a request's reply slot when its caller stops waiting.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

#[async_trait]
impl ModelBundle for MarkerWorker {
    fn name(&self) -> &str {
        "marker"
    }

    async fn convert(
        &self,
        pdf_path: &Path,
        options: &ConvertOptions,
    ) -> Result<RawConversion, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&WorkerRequest {
            id,
            pdf: pdf_path,
            max_pages: options.max_pages,
            langs: &options.langs,
            batch_multiplier: options.batch_multiplier,
        })
        .map_err(BackendError::Encode)?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        // Checked after registering so a worker exit cannot strand the slot.
        if !self.is_alive() || self.requests.send(line).is_err() {
            return Err(self.exited());
        }
        debug!(id, pdf = %pdf_path.display(), "Sent to marker worker");

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(self.exited()),
        }
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read stdout until the worker reports ready. `Ok(None)` means it exited first.
async fn wait_ready(
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> std::io::Result<Option<Option<String>>> {
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<WorkerEvent>(&line) {
            Ok(WorkerEvent::Ready { device }) => return Ok(Some(device)),
            Ok(other) => warn!("Marker worker replied before it was ready: {:?}", other),
            Err(_) => debug!(target: "marker_worker", "{}", line),
        }
    }
    Ok(None)
}

async fn forward_stderr(stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "marker_worker", "{}", line);
        let mut tail = lock(&tail);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn tail_text(tail: &StderrTail) -> String {
    lock(tail).iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

async fn write_requests(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(line) = rx.recv().await {
        let written = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to write to marker worker: {}", e);
            return;
        }
    }
}

fn route_reply(line: &str, pending: &PendingMap) {
    let event = match serde_json::from_str::<WorkerEvent>(line) {
        Ok(event) => event,
        Err(_) => {
            debug!(target: "marker_worker", "{}", line);
            return;
        }
    };

    let (id, reply) = match event {
        WorkerEvent::Ready { .. } => {
            debug!("Ignoring repeated ready from marker worker");
            return;
        }
        WorkerEvent::Result {
            id,
            text,
            images,
            metadata,
        } => (
            id,
            Ok(RawConversion {
                text,
                images,
                metadata,
            }),
        ),
        WorkerEvent::Error { id, message } => (id, Err(BackendError::Failed(message))),
    };

    match lock(pending).remove(&id) {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => debug!(id, "Discarding reply for an abandoned request"),
    }
}

async fn dispatch_replies(
    mut lines: Lines<BufReader<ChildStdout>>,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
    program: PathBuf,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route_reply(&line, &pending),
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read from marker worker: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let orphaned: Vec<_> = lock(&pending).drain().collect();
    warn!(
        "Marker worker exited; failing {} pending request(s)",
        orphaned.len()
    );
    for (_, tx) in orphaned {
        let _ = tx.send(Err(BackendError::WorkerExited {
            program: program.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with(id: u64) -> (PendingMap, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingMap::default();
        lock(&pending).insert(id, tx);
        (pending, rx)
    }

    #[test]
    fn request_line_format() {
        let options = ConvertOptions::default();
        let line = serde_json::to_string(&WorkerRequest {
            id: 7,
            pdf: Path::new("/tmp/upload-1.pdf"),
            max_pages: options.max_pages,
            langs: &options.langs,
            batch_multiplier: options.batch_multiplier,
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"id":7,"pdf":"/tmp/upload-1.pdf","max_pages":null,"langs":["English"],"batch_multiplier":2}"#
        );
    }

    #[test]
    fn result_is_routed_by_id() {
        let (pending, mut rx) = pending_with(3);
        route_reply(
            r##"{"event":"result","id":3,"text":"# T","images":["a.png"],"metadata":{"page_count":2}}"##,
            &pending,
        );
        let raw = rx.try_recv().unwrap().unwrap();
        assert_eq!(raw.text, "# T");
        assert_eq!(raw.images, vec!["a.png"]);
        assert_eq!(raw.metadata["page_count"], 2);
        assert!(lock(&pending).is_empty());
    }

    #[test]
    fn error_event_becomes_backend_failure() {
        let (pending, mut rx) = pending_with(1);
        route_reply(r#"{"event":"error","id":1,"message":"bad xref"}"#, &pending);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "bad xref");
    }

    #[test]
    fn unknown_ids_and_noise_are_ignored() {
        let (pending, mut rx) = pending_with(1);
        route_reply(r#"{"event":"result","id":99,"text":"late"}"#, &pending);
        route_reply("Loading layout model...", &pending);
        route_reply(r#"{"event":"ready"}"#, &pending);
        assert!(rx.try_recv().is_err());
        assert_eq!(lock(&pending).len(), 1);
    }

    #[test]
    fn result_defaults_missing_fields() {
        let (pending, mut rx) = pending_with(5);
        route_reply(r#"{"event":"result","id":5,"text":"x"}"#, &pending);
        let raw = rx.try_recv().unwrap().unwrap();
        assert!(raw.images.is_empty());
        assert!(raw.metadata.is_empty());
    }

    #[tokio::test]
    async fn loader_reports_missing_executable() {
        let cache = tempfile::tempdir().unwrap();
        let loader = MarkerWorkerLoader::new(
            "/definitely/not/a/real/marker_worker",
            cache.path().join("models"),
        );
        let err = loader.load_models().await.err().expect("load should fail");
        assert!(matches!(err, BackendError::Spawn { .. }), "got: {err}");
        assert!(cache.path().join("models").is_dir());
    }

    #[cfg(unix)]
    mod script {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script standing in for the worker.
        fn fake_worker(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("marker_worker");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// Answers `# <stem>`; `slow*` documents take a second, `bad*` fail.
        const WORKING_WORKER: &str = r##"
echo started >> "$MODEL_CACHE_DIR/starts.txt"
echo "$TORCH_DEVICE" > "$MODEL_CACHE_DIR/device.txt"
echo "loading models" >&2
echo "not a protocol line"
echo '{"event":"ready","device":"cpu"}'
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$MODEL_CACHE_DIR/requests.txt"
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  pdf=$(printf '%s\n' "$line" | sed -n 's/.*"pdf":"\([^"]*\)".*/\1/p')
  name=$(basename "$pdf" .pdf)
  case "$name" in
    slow*) sleep 1; touch "$MODEL_CACHE_DIR/finished_$name" ;;
    bad*) printf '{"event":"error","id":%s,"message":"cannot parse %s"}\n' "$id" "$name"; continue ;;
  esac
  printf '{"event":"result","id":%s,"text":"# %s","images":["figure_0.png"],"metadata":{"page_count":2}}\n' "$id" "$name"
done
"##;

        struct Fixture {
            _tools: tempfile::TempDir,
            cache: tempfile::TempDir,
            work: tempfile::TempDir,
            loader: MarkerWorkerLoader,
        }

        impl Fixture {
            fn new(body: &str) -> Self {
                let tools = tempfile::tempdir().unwrap();
                let cache = tempfile::tempdir().unwrap();
                let work = tempfile::tempdir().unwrap();
                let program = fake_worker(tools.path(), body);
                let loader = MarkerWorkerLoader::new(&program, cache.path());
                Self {
                    _tools: tools,
                    cache,
                    work,
                    loader,
                }
            }

            fn pdf(&self, name: &str) -> PathBuf {
                let path = self.work.path().join(name);
                std::fs::write(&path, b"%PDF-1.4").unwrap();
                path
            }

            fn cache_file(&self, name: &str) -> PathBuf {
                self.cache.path().join(name)
            }
        }

        #[tokio::test]
        async fn models_load_once_for_many_documents() {
            let fx = Fixture::new(WORKING_WORKER);
            let worker = fx
                .loader
                .clone()
                .torch_device(Some("cuda".into()))
                .start()
                .await
                .expect("worker should start");

            let options = ConvertOptions::default();
            let a = worker.convert(&fx.pdf("a.pdf"), &options).await.unwrap();
            let b = worker.convert(&fx.pdf("b.pdf"), &options).await.unwrap();

            assert_eq!(a.text, "# a");
            assert_eq!(b.text, "# b");
            assert_eq!(a.metadata["page_count"], 2);
            assert_eq!(a.images, vec!["figure_0.png"]);

            let starts = std::fs::read_to_string(fx.cache_file("starts.txt")).unwrap();
            assert_eq!(starts.lines().count(), 1);
            let device = std::fs::read_to_string(fx.cache_file("device.txt")).unwrap();
            assert_eq!(device.trim(), "cuda");

            let requests = std::fs::read_to_string(fx.cache_file("requests.txt")).unwrap();
            assert_eq!(requests.lines().count(), 2);
            assert!(requests.contains(r#""langs":["English"],"batch_multiplier":2"#));
            assert_eq!(worker.pending_requests(), 0);
        }

        #[tokio::test]
        async fn concurrent_requests_get_their_own_replies() {
            let fx = Fixture::new(WORKING_WORKER);
            let worker = Arc::new(fx.loader.start().await.unwrap());

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let worker = Arc::clone(&worker);
                    let pdf = fx.pdf(&format!("doc{i}.pdf"));
                    tokio::spawn(async move {
                        worker.convert(&pdf, &ConvertOptions::default()).await
                    })
                })
                .collect();
            for (i, h) in handles.into_iter().enumerate() {
                assert_eq!(h.await.unwrap().unwrap().text, format!("# doc{i}"));
            }
        }

        #[tokio::test]
        async fn worker_error_is_reported() {
            let fx = Fixture::new(WORKING_WORKER);
            let worker = fx.loader.start().await.unwrap();
            let err = worker
                .convert(&fx.pdf("bad.pdf"), &ConvertOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, BackendError::Failed(_)), "got: {err}");
            assert_eq!(err.to_string(), "cannot parse bad");
            assert!(worker.is_alive());
        }

        #[tokio::test]
        async fn abandoned_request_does_not_disturb_the_next_one() {
            let fx = Fixture::new(WORKING_WORKER);
            let worker = fx.loader.start().await.unwrap();
            let options = ConvertOptions::default();

            let slow = fx.pdf("slow.pdf");
            let timed_out =
                tokio::time::timeout(Duration::from_millis(200), worker.convert(&slow, &options))
                    .await;
            assert!(timed_out.is_err());
            assert_eq!(worker.pending_requests(), 0);

            let next = worker.convert(&fx.pdf("next.pdf"), &options).await.unwrap();
            assert_eq!(next.text, "# next");
            assert!(fx.cache_file("finished_slow").exists());
            assert!(worker.is_alive());
        }

        #[tokio::test]
        async fn dropping_the_worker_kills_the_process() {
            let fx = Fixture::new(WORKING_WORKER);
            let worker = fx.loader.start().await.unwrap();

            let slow = fx.pdf("slow.pdf");
            let timed_out = tokio::time::timeout(
                Duration::from_millis(300),
                worker.convert(&slow, &ConvertOptions::default()),
            )
            .await;
            assert!(timed_out.is_err());

            drop(worker);
            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert!(
                !fx.cache_file("finished_slow").exists(),
                "worker kept running after its handle was dropped"
            );
        }

        #[tokio::test]
        async fn worker_exit_fails_pending_and_later_requests() {
            let fx = Fixture::new(
                r#"echo '{"event":"ready"}'
read -r line
exit 0"#,
            );
            let worker = fx.loader.start().await.unwrap();
            let options = ConvertOptions::default();

            let err = worker
                .convert(&fx.pdf("a.pdf"), &options)
                .await
                .unwrap_err();
            assert!(matches!(err, BackendError::WorkerExited { .. }), "got: {err}");

            let err = worker
                .convert(&fx.pdf("b.pdf"), &options)
                .await
                .unwrap_err();
            assert!(matches!(err, BackendError::WorkerExited { .. }), "got: {err}");
            assert!(!worker.is_alive());
            assert_eq!(worker.pending_requests(), 0);
        }

        #[tokio::test]
        async fn exit_during_startup_reports_stderr() {
            let fx = Fixture::new("echo 'ModuleNotFoundError: no module named torch' >&2; exit 1");
            let err = fx.loader.start().await.err().expect("start should fail");
            assert!(matches!(err, BackendError::ProcessFailed { .. }), "got: {err}");
            assert!(err.to_string().contains("no module named torch"), "got: {err}");
        }

        #[tokio::test]
        async fn slow_startup_times_out() {
            let fx = Fixture::new("sleep 5");
            let err = fx
                .loader
                .clone()
                .startup_timeout(Duration::from_millis(200))
                .start()
                .await
                .err()
                .expect("start should time out");
            assert!(matches!(err, BackendError::StartupTimeout { .. }), "got: {err}");
        }
    }
}
