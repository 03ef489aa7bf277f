//! Lua-backed implementation of [`ExtensionSource`].
//!
//! Each [`ScriptRuntime`] owns a dedicated OS thread that creates and owns
//! its Lua state; the state never leaves that thread. Async callers send
//! commands over a channel and await a oneshot reply. An async mutex keeps
//! a single call in flight per extension.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mlua::{Function, Lua, MultiValue, Value};
use tokio::sync::oneshot;

use crate::capabilities::{self, HttpCapability};
use crate::config::SandboxConfig;
use crate::error::ExtensionError;
use crate::marshal;
use crate::metadata;
use crate::sandbox::{self, CallGuard};
use crate::source::{ExtensionSource, Operation};
use crate::types::{
    AnimeDetails, AnimePage, Episode, ExtensionInfo, SearchFilters, VideoSource,
};

/// Extra wait on top of `call_timeout` before the caller gives up on a
/// worker that is stuck in a blocking request.
const REPLY_GRACE: Duration = Duration::from_secs(2);

// ─── Commands ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum CallArgs {
    Search {
        query: String,
        page: u32,
        filters: SearchFilters,
    },
    Page(u32),
    Url(String),
}

#[derive(Debug)]
enum CallOutput {
    Page(AnimePage),
    Details(Option<AnimeDetails>),
    Episodes(Vec<Episode>),
    VideoSources(Vec<VideoSource>),
}

struct Command {
    operation: Operation,
    args: CallArgs,
    cancel: Arc<AtomicBool>,
    reply: oneshot::Sender<Result<CallOutput, ExtensionError>>,
}

/// Sets the flag when dropped, interrupting the guest if the caller's
/// future goes away mid-call.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────

/// State owned by the worker thread.
struct Worker {
    lua: Lua,
    guard: CallGuard,
    extension_id: String,
}

impl Worker {
    fn start(
        script: &str,
        chunk_name: &str,
        config: &SandboxConfig,
        app_version: &semver::Version,
        closed: Arc<AtomicBool>,
        cancel: Arc<AtomicBool>,
    ) -> Result<(Self, ExtensionInfo), ExtensionError> {
        let (lua, guard) = sandbox::new_lua(config, closed)?;
        let http = HttpCapability::new(config, guard.clone())?;
        capabilities::install(&lua, http)
            .map_err(|e| ExtensionError::Runtime(format!("failed to install capabilities: {e}")))?;

        guard.begin(cancel);
        let executed = lua.load(script).set_name(chunk_name).exec();
        if let Some(reason) = guard.finish() {
            return Err(reason.into_error(chunk_name));
        }
        executed.map_err(|e| ExtensionError::Parse(e.to_string()))?;

        let info = metadata::extract(&lua, app_version)?;
        let worker = Self {
            lua,
            guard,
            extension_id: info.id.clone(),
        };
        Ok((worker, info))
    }

    fn entry_point(&self, operation: Operation) -> Result<Function, ExtensionError> {
        match self.lua.globals().raw_get::<Value>(operation.entry_point()) {
            Ok(Value::Function(f)) => Ok(f),
            _ => Err(ExtensionError::UnsupportedOperation {
                extension: self.extension_id.clone(),
                operation: operation.entry_point(),
            }),
        }
    }

    fn invoke(
        &self,
        func: &Function,
        args: CallArgs,
    ) -> Result<MultiValue, ExtensionError> {
        let result = match args {
            CallArgs::Search {
                query,
                page,
                filters,
            } => marshal::filters_table(&self.lua, &filters)
                .and_then(|filters| func.call::<MultiValue>((query, page, filters))),
            CallArgs::Page(page) => func.call::<MultiValue>(page),
            CallArgs::Url(url) => func.call::<MultiValue>(url),
        };
        result.map_err(|e| ExtensionError::Runtime(e.to_string()))
    }

    fn call(
        &self,
        operation: Operation,
        args: CallArgs,
        cancel: Arc<AtomicBool>,
    ) -> Result<CallOutput, ExtensionError> {
        let func = self.entry_point(operation)?;

        let started = Instant::now();
        self.guard.begin(cancel);
        let result = self.invoke(&func, args);
        if let Some(reason) = self.guard.finish() {
            tracing::warn!(
                extension_id = %self.extension_id,
                operation = operation.entry_point(),
                reason = ?reason,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "extension call interrupted"
            );
            return Err(reason.into_error(&self.extension_id));
        }
        let values = result?;

        let output = match operation {
            Operation::Search | Operation::GetLatest | Operation::GetPopular => {
                CallOutput::Page(marshal::anime_page(values)?)
            }
            single => {
                let first = values.into_iter().next().unwrap_or(Value::Nil);
                match single {
                    Operation::GetAnimeDetails => {
                        CallOutput::Details(marshal::anime_details_result(first)?)
                    }
                    Operation::GetEpisodes => {
                        CallOutput::Episodes(marshal::episodes_result(first)?)
                    }
                    _ => CallOutput::VideoSources(marshal::video_sources_result(first)?),
                }
            }
        };

        tracing::debug!(
            extension_id = %self.extension_id,
            operation = operation.entry_point(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extension call completed"
        );
        Ok(output)
    }
}

fn run_worker(
    worker: Worker,
    commands: mpsc::Receiver<Command>,
    closed: Arc<AtomicBool>,
) {
    while let Ok(command) = commands.recv() {
        let result = if closed.load(Ordering::Relaxed) {
            Err(ExtensionError::Closed(worker.extension_id.clone()))
        } else {
            worker.call(command.operation, command.args, command.cancel)
        };
        // The caller may have timed out or been cancelled.
        let _ = command.reply.send(result);
    }
    tracing::debug!(extension_id = %worker.extension_id, "extension worker stopped");
}

// ─── Runtime ────────────────────────────────────────────────────────────

/// A loaded extension script.
///
/// Dropping the runtime closes it.
pub struct ScriptRuntime {
    info: ExtensionInfo,
    commands: std::sync::Mutex<Option<mpsc::Sender<Command>>>,
    call_lock: tokio::sync::Mutex<()>,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("extension_id", &self.info.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ScriptRuntime {
    /// Execute `script` in a fresh sandbox and read its metadata.
    ///
    /// `chunk_name` names the script in error messages, usually its file
    /// name.
    pub async fn load(
        script: String,
        chunk_name: &str,
        config: &SandboxConfig,
        app_version: &semver::Version,
    ) -> Result<Self, ExtensionError> {
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));

        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::channel();

        let thread_name = format!("ext-{chunk_name}");
        let worker_chunk = chunk_name.to_string();
        let worker_config = config.clone();
        let worker_version = app_version.clone();
        let worker_closed = Arc::clone(&closed);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                match Worker::start(
                    &script,
                    &worker_chunk,
                    &worker_config,
                    &worker_version,
                    Arc::clone(&worker_closed),
                    cancel,
                ) {
                    Ok((worker, info)) => {
                        if ready_tx.send(Ok(info)).is_ok() {
                            run_worker(worker, command_rx, worker_closed);
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let info = match tokio::time::timeout(config.call_timeout + REPLY_GRACE, ready_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(ExtensionError::Runtime(format!(
                    "extension worker for {chunk_name} exited during load"
                )))
            }
            Err(_) => return Err(ExtensionError::Timeout(chunk_name.to_string())),
        };

        tracing::debug!(extension_id = %info.id, version = %info.version, "extension runtime started");

        Ok(Self {
            info,
            commands: std::sync::Mutex::new(Some(command_tx)),
            call_lock: tokio::sync::Mutex::new(()),
            closed,
            call_timeout: config.call_timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the worker thread and release the Lua state.
    ///
    /// Idempotent. A call in flight is interrupted at its next instruction
    /// check; later calls fail with [`ExtensionError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);
        tracing::debug!(extension_id = %self.info.id, "extension runtime closed");
    }

    async fn dispatch(
        &self,
        operation: Operation,
        args: CallArgs,
    ) -> Result<CallOutput, ExtensionError> {
        let closed = || ExtensionError::Closed(self.info.id.clone());
        if self.is_closed() {
            return Err(closed());
        }

        let _in_flight = self.call_lock.lock().await;

        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let commands = self
                .commands
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let sender = commands.as_ref().ok_or_else(closed)?;
            sender
                .send(Command {
                    operation,
                    args,
                    cancel,
                    reply: reply_tx,
                })
                .map_err(|_| closed())?;
        }

        match tokio::time::timeout(self.call_timeout + REPLY_GRACE, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(closed()),
            Err(_) => Err(ExtensionError::Timeout(self.info.id.clone())),
        }
    }

    fn mismatch(&self, operation: Operation) -> ExtensionError {
        ExtensionError::Runtime(format!(
            "extension {} returned a mismatched result for {}",
            self.info.id,
            operation.entry_point()
        ))
    }

    async fn page(&self, operation: Operation, args: CallArgs) -> Result<AnimePage, ExtensionError> {
        match self.dispatch(operation, args).await? {
            CallOutput::Page(page) => Ok(page),
            _ => Err(self.mismatch(operation)),
        }
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl ExtensionSource for ScriptRuntime {
    fn info(&self) -> &ExtensionInfo {
        &self.info
    }

    async fn search(
        &self,
        query: &str,
        page: u32,
        filters: &SearchFilters,
    ) -> Result<AnimePage, ExtensionError> {
        self.page(
            Operation::Search,
            CallArgs::Search {
                query: query.to_string(),
                page,
                filters: filters.clone(),
            },
        )
        .await
    }

    async fn get_latest(&self, page: u32) -> Result<AnimePage, ExtensionError> {
        self.page(Operation::GetLatest, CallArgs::Page(page)).await
    }

    async fn get_popular(&self, page: u32) -> Result<AnimePage, ExtensionError> {
        self.page(Operation::GetPopular, CallArgs::Page(page)).await
    }

    async fn get_anime_details(&self, url: &str) -> Result<Option<AnimeDetails>, ExtensionError> {
        let operation = Operation::GetAnimeDetails;
        match self.dispatch(operation, CallArgs::Url(url.to_string())).await? {
            CallOutput::Details(details) => Ok(details),
            _ => Err(self.mismatch(operation)),
        }
    }

    async fn get_episodes(&self, url: &str) -> Result<Vec<Episode>, ExtensionError> {
        let operation = Operation::GetEpisodes;
        match self.dispatch(operation, CallArgs::Url(url.to_string())).await? {
            CallOutput::Episodes(episodes) => Ok(episodes),
            _ => Err(self.mismatch(operation)),
        }
    }

    async fn get_video_sources(&self, url: &str) -> Result<Vec<VideoSource>, ExtensionError> {
        let operation = Operation::GetVideoSources;
        match self.dispatch(operation, CallArgs::Url(url.to_string())).await? {
            CallOutput::VideoSources(sources) => Ok(sources),
            _ => Err(self.mismatch(operation)),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
