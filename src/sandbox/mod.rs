//! Plugin execution under enforced resource ceilings
//!
//! Plugins reach the sandbox only through the [`Plugin`] capability
//! interface: either an external program speaking the JSON envelope
//! protocol, or an in-process [`Executable`] (trusted mode only).
//!
//! ## Child protocol
//!
//! The child reads `{"args": [...], "kwargs": {...}}` from stdin and prints
//! exactly one envelope on stdout:
//!
//! ```json
//! {"success": true, "result": {"pages": 3}}
//! {"success": false, "error": "unsupported encoding"}
//! ```
//!
//! Every execution failure is reported in the returned [`SandboxResult`];
//! only a failure to construct the isolation boundary is an `Err`.

#[cfg(unix)]
mod process;

use crate::config::{SandboxConfig, SandboxLimits, SandboxMode};
use crate::error::{Result, WardenError};
use crate::types::{ResourceUsage, SandboxFailure, SandboxResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Substrings in a plugin's diagnostics that indicate an allocation failure
const MEMORY_MARKERS: &[&str] = &[
    "memory allocation of",
    "MemoryError",
    "Cannot allocate memory",
    "out of memory",
    "std::bad_alloc",
];

/// Bytes of stderr quoted in a crash detail
const STDERR_TAIL: usize = 512;

// ---------------------------------------------------------------------------
// Plugin interface
// ---------------------------------------------------------------------------

/// Arguments handed to a plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginInput {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// An in-process plugin. Runs only in [`SandboxMode::Trusted`].
pub trait Executable: Send + Sync {
    /// Name used in logs and events
    fn name(&self) -> &str {
        "callable"
    }

    /// Run the plugin. `Err` carries the plugin's own failure message.
    fn call(&self, input: &PluginInput) -> std::result::Result<Value, String>;
}

/// An external program speaking the envelope protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment on top of the allow-listed variables
    pub env: Vec<(String, String)>,
}

impl PluginCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// What the sandbox can run
#[derive(Clone)]
pub enum Plugin {
    Command(PluginCommand),
    Callable(Arc<dyn Executable>),
}

impl Plugin {
    pub fn command(command: PluginCommand) -> Self {
        Plugin::Command(command)
    }

    pub fn callable(executable: impl Executable + 'static) -> Self {
        Plugin::Callable(Arc::new(executable))
    }

    pub fn name(&self) -> String {
        match self {
            Plugin::Command(command) => command.program.display().to_string(),
            Plugin::Callable(executable) => executable.name().to_string(),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plugin::Command(command) => f.debug_tuple("Command").field(command).finish(),
            Plugin::Callable(executable) => {
                f.debug_tuple("Callable").field(&executable.name()).finish()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execution control
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ControlState {
    /// The execution is over; kill requests are no-ops from here on
    finished: bool,
    watchdog_killed: bool,
    cancel_requested: bool,
    cancel_killed: bool,
}

/// Shared kill switch between a running execution and its handles
#[derive(Debug)]
struct Control {
    /// Process group of an isolated child; `None` for in-process callables
    pgid: Option<i32>,
    state: Mutex<ControlState>,
    cancelled: Notify,
}

impl Control {
    fn new(pgid: Option<i32>) -> Self {
        Self {
            pgid,
            state: Mutex::new(ControlState::default()),
            cancelled: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal the process group while holding the state lock, so a group
    /// whose leader was already reaped is never signalled.
    fn kill_locked(&self, state: &ControlState) -> bool {
        if state.finished {
            return false;
        }
        match self.pgid {
            #[cfg(unix)]
            Some(pgid) => {
                process::kill_group(pgid);
                true
            }
            _ => false,
        }
    }

    fn watchdog_kill(&self) {
        let mut state = self.lock();
        if self.kill_locked(&state) {
            state.watchdog_killed = true;
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        if state.finished || state.cancel_requested {
            return;
        }
        state.cancel_requested = true;
        if self.kill_locked(&state) {
            state.cancel_killed = true;
        }
        drop(state);
        self.cancelled.notify_one();
    }

    /// Mark the execution over. For processes this runs after the child
    /// exited but before it is reaped, and clears out stragglers left in
    /// its process group.
    fn finish(&self) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            process::kill_group(pgid);
        }
        state.finished = true;
    }

    /// Whether the watchdog or a cancellation delivered the fatal signal
    fn kill_causes(&self) -> (bool, bool) {
        let state = self.lock();
        (state.watchdog_killed, state.cancel_killed)
    }
}

/// A plugin execution in flight
pub struct RunningPlugin {
    plugin: String,
    control: Arc<Control>,
    task: JoinHandle<SandboxResult>,
}

impl RunningPlugin {
    /// Terminate the execution. Idempotent: once the execution finished,
    /// or after a first call, this does nothing.
    pub fn cancel(&self) {
        tracing::debug!(plugin = %self.plugin, "Cancelling plugin execution");
        self.control.cancel();
    }

    /// A cloneable handle that can cancel this execution from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            control: Arc::clone(&self.control),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the outcome
    pub async fn wait(self) -> SandboxResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => SandboxResult::failed(
                SandboxFailure::Crashed(format!("execution task failed: {}", e)),
                ResourceUsage::default(),
            ),
        }
    }
}

impl fmt::Debug for RunningPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningPlugin")
            .field("plugin", &self.plugin)
            .field("pgid", &self.control.pgid)
            .finish()
    }
}

/// Cancels a [`RunningPlugin`] without owning it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    control: Arc<Control>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.control.cancel();
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Executes plugins with bounded concurrency and per-execution ceilings
#[derive(Debug)]
pub struct PluginSandbox {
    config: SandboxConfig,
    permits: Arc<Semaphore>,
}

impl PluginSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self { config, permits })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn mode(&self) -> SandboxMode {
        self.config.mode
    }

    /// Executions that could start right now without waiting
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a plugin to completion under `limits`
    pub async fn execute(
        &self,
        plugin: &Plugin,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        limits: &SandboxLimits,
    ) -> Result<SandboxResult> {
        let running = self.spawn(plugin, args, kwargs, limits).await?;
        Ok(running.wait().await)
    }

    /// Run a plugin under the sandbox's default limits
    pub async fn execute_default(
        &self,
        plugin: &Plugin,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<SandboxResult> {
        let limits = self.config.default_limits;
        self.execute(plugin, args, kwargs, &limits).await
    }

    /// Start a plugin and return a handle to cancel or await it.
    ///
    /// Waits for a concurrency slot first. Fails only when the isolation
    /// boundary cannot be constructed.
    pub async fn spawn(
        &self,
        plugin: &Plugin,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        limits: &SandboxLimits,
    ) -> Result<RunningPlugin> {
        limits.validate()?;
        let input = PluginInput { args, kwargs };

        if let (SandboxMode::Isolated, Plugin::Callable(executable)) = (self.config.mode, plugin) {
            return Err(WardenError::IsolationSetup(format!(
                "in-process plugin {} cannot be isolated; run it as a command or use trusted mode",
                executable.name()
            )));
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| WardenError::IsolationSetup(format!("sandbox closed: {}", e)))?;

        match plugin {
            Plugin::Command(command) => self.spawn_command(command, &input, limits, permit),
            Plugin::Callable(executable) => {
                Ok(spawn_callable(Arc::clone(executable), input, limits, permit))
            }
        }
    }

    #[cfg(unix)]
    fn spawn_command(
        &self,
        command: &PluginCommand,
        input: &PluginInput,
        limits: &SandboxLimits,
        permit: OwnedSemaphorePermit,
    ) -> Result<RunningPlugin> {
        let isolated = self.config.mode == SandboxMode::Isolated;
        let child = process::spawn(command, input, limits, &self.config, isolated)?;
        let plugin = command.program.display().to_string();
        tracing::debug!(
            plugin = %plugin,
            pid = child.pid(),
            isolated,
            "Spawned plugin process"
        );

        let control = Arc::new(Control::new(Some(child.pid())));
        let task = tokio::spawn(supervise_process(
            plugin.clone(),
            child,
            Arc::clone(&control),
            *limits,
            self.config.max_output_bytes,
            permit,
        ));
        Ok(RunningPlugin {
            plugin,
            control,
            task,
        })
    }

    #[cfg(not(unix))]
    fn spawn_command(
        &self,
        command: &PluginCommand,
        _input: &PluginInput,
        _limits: &SandboxLimits,
        _permit: OwnedSemaphorePermit,
    ) -> Result<RunningPlugin> {
        Err(WardenError::IsolationSetup(format!(
            "process isolation for {} is not supported on this platform",
            command.program.display()
        )))
    }
}

#[cfg(unix)]
async fn supervise_process(
    plugin: String,
    child: process::SpawnedChild,
    control: Arc<Control>,
    limits: SandboxLimits,
    max_output_bytes: usize,
    _permit: OwnedSemaphorePermit,
) -> SandboxResult {
    let started = child.started();
    let reap_control = Arc::clone(&control);
    let mut waiter = tokio::task::spawn_blocking(move || child.wait(|| reap_control.finish()));

    let deadline = tokio::time::sleep(Duration::from_secs(limits.max_wall_seconds));
    tokio::pin!(deadline);

    let joined = tokio::select! {
        joined = &mut waiter => joined,
        _ = &mut deadline => {
            tracing::debug!(plugin = %plugin, "Wall-clock watchdog fired");
            control.watchdog_kill();
            (&mut waiter).await
        }
        _ = control.cancelled.notified() => (&mut waiter).await,
    };
    let wall_seconds = started.elapsed().as_secs_f64();

    let result = match joined {
        Ok(Ok(outcome)) => {
            let (watchdog_killed, cancel_killed) = control.kill_causes();
            process::classify(
                &outcome,
                process::KillCause {
                    watchdog: watchdog_killed,
                    cancel: cancel_killed,
                },
                &limits,
                max_output_bytes,
                wall_seconds,
            )
        }
        Ok(Err(e)) => {
            control.finish();
            SandboxResult::failed(
                SandboxFailure::Crashed(format!("failed to wait for plugin process: {}", e)),
                ResourceUsage {
                    wall_seconds,
                    ..Default::default()
                },
            )
        }
        Err(e) => {
            control.watchdog_kill();
            control.finish();
            SandboxResult::failed(
                SandboxFailure::Crashed(format!("process waiter failed: {}", e)),
                ResourceUsage {
                    wall_seconds,
                    ..Default::default()
                },
            )
        }
    };

    log_result(&plugin, &result);
    result
}

fn spawn_callable(
    executable: Arc<dyn Executable>,
    input: PluginInput,
    limits: &SandboxLimits,
    permit: OwnedSemaphorePermit,
) -> RunningPlugin {
    let plugin = executable.name().to_string();
    let control = Arc::new(Control::new(None));
    let task = tokio::spawn(supervise_callable(
        plugin.clone(),
        executable,
        input,
        Arc::clone(&control),
        limits.max_wall_seconds,
        permit,
    ));
    RunningPlugin {
        plugin,
        control,
        task,
    }
}

/// Run a trusted callable on its own thread under a wall-clock timeout.
///
/// A thread cannot be killed: on timeout or cancellation it is abandoned
/// and keeps running until the callable returns on its own. The thread owns
/// the concurrency permit, so an abandoned callable still occupies its slot.
async fn supervise_callable(
    plugin: String,
    executable: Arc<dyn Executable>,
    input: PluginInput,
    control: Arc<Control>,
    max_wall_seconds: u64,
    permit: OwnedSemaphorePermit,
) -> SandboxResult {
    let started = Instant::now();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let spawned = std::thread::Builder::new()
        .name(format!("warden-plugin-{}", plugin))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| executable.call(&input)));
            // free the slot before the result becomes observable
            drop(permit);
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        control.finish();
        return SandboxResult::setup_failed(format!("cannot start plugin thread: {}", e));
    }

    let deadline = tokio::time::sleep(Duration::from_secs(max_wall_seconds));
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        outcome = rx => Some(outcome),
        _ = &mut deadline => None,
        _ = control.cancelled.notified() => {
            control.finish();
            let usage = wall_usage(started);
            let result = SandboxResult::failed(SandboxFailure::Timeout("cancelled".into()), usage);
            log_result(&plugin, &result);
            return result;
        }
    };
    control.finish();
    let usage = wall_usage(started);

    let result = match outcome {
        None => {
            tracing::warn!(plugin = %plugin, "Abandoning trusted plugin thread after timeout");
            SandboxResult::failed(
                SandboxFailure::Timeout(format!(
                    "wall-clock limit of {}s exceeded",
                    max_wall_seconds
                )),
                usage,
            )
        }
        Some(Err(_)) => SandboxResult::failed(
            SandboxFailure::Crashed("plugin thread ended without a result".into()),
            usage,
        ),
        Some(Ok(Err(payload))) => SandboxResult::failed(
            SandboxFailure::Crashed(format!("plugin panicked: {}", panic_message(&*payload))),
            usage,
        ),
        Some(Ok(Ok(Ok(value)))) => SandboxResult::ok(value, usage),
        Some(Ok(Ok(Err(message)))) => SandboxResult::failed(failure_from_message(message), usage),
    };

    log_result(&plugin, &result);
    result
}

fn wall_usage(started: Instant) -> ResourceUsage {
    ResourceUsage {
        wall_seconds: started.elapsed().as_secs_f64(),
        ..Default::default()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Outcome helpers
// ---------------------------------------------------------------------------

/// The envelope a child prints on stdout
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

fn mentions_memory_exhaustion(text: &str) -> bool {
    MEMORY_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Failure for a plugin-reported error message
fn failure_from_message(message: String) -> SandboxFailure {
    if mentions_memory_exhaustion(&message) {
        SandboxFailure::MemoryExceeded(message)
    } else {
        SandboxFailure::Crashed(message)
    }
}

/// Interpret a child's stdout as an envelope
fn parse_envelope(stdout: &[u8]) -> std::result::Result<Value, SandboxFailure> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SandboxFailure::InvalidOutput(
            "plugin produced no output".into(),
        ));
    }
    let envelope: Envelope = serde_json::from_str(trimmed)
        .map_err(|e| SandboxFailure::InvalidOutput(format!("malformed envelope: {}", e)))?;
    if envelope.success {
        Ok(envelope.result)
    } else {
        Err(failure_from_message(
            envelope
                .error
                .unwrap_or_else(|| "plugin reported failure".to_string()),
        ))
    }
}

/// Last few hundred bytes of stderr, for crash details
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

fn log_result(plugin: &str, result: &SandboxResult) {
    match &result.error {
        None => tracing::debug!(
            plugin = %plugin,
            cpu_seconds = result.resource_usage.cpu_seconds,
            wall_seconds = result.resource_usage.wall_seconds,
            "Plugin execution succeeded"
        ),
        Some(failure) => tracing::warn!(
            plugin = %plugin,
            error = %failure,
            wall_seconds = result.resource_usage.wall_seconds,
            "Plugin execution failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl Executable for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn call(&self, input: &PluginInput) -> std::result::Result<Value, String> {
            Ok(json!({ "args": input.args, "kwargs": input.kwargs }))
        }
    }

    struct Sleeper(Duration);

    impl Executable for Sleeper {
        fn call(&self, _input: &PluginInput) -> std::result::Result<Value, String> {
            std::thread::sleep(self.0);
            Ok(Value::Null)
        }
    }

    struct Failing(&'static str);

    impl Executable for Failing {
        fn call(&self, _input: &PluginInput) -> std::result::Result<Value, String> {
            Err(self.0.to_string())
        }
    }

    struct Panicking;

    impl Executable for Panicking {
        fn call(&self, _input: &PluginInput) -> std::result::Result<Value, String> {
            panic!("boom");
        }
    }

    fn trusted() -> PluginSandbox {
        PluginSandbox::new(SandboxConfig {
            mode: SandboxMode::Trusted,
            ..Default::default()
        })
        .unwrap()
    }

    fn limits(wall: u64) -> SandboxLimits {
        SandboxLimits {
            max_wall_seconds: wall,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_envelope() {
        assert_eq!(
            parse_envelope(br#"{"success": true, "result": [1, 2]}"#).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            parse_envelope(b"{\"success\": false, \"error\": \"bad page\"}\n"),
            Err(SandboxFailure::Crashed("bad page".into()))
        );
        assert!(matches!(
            parse_envelope(b"{\"success\": false, \"error\": \"MemoryError\"}"),
            Err(SandboxFailure::MemoryExceeded(_))
        ));
        assert!(matches!(
            parse_envelope(b"hello"),
            Err(SandboxFailure::InvalidOutput(_))
        ));
        assert!(matches!(
            parse_envelope(b"  \n"),
            Err(SandboxFailure::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let noisy = vec![b'x'; 4096];
        assert_eq!(stderr_tail(&noisy).len(), STDERR_TAIL);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert!(matches!(
            PluginSandbox::new(config),
            Err(WardenError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_callable_refused_in_isolated_mode() {
        let sandbox = PluginSandbox::new(SandboxConfig::default()).unwrap();
        let err = sandbox
            .execute(&Plugin::callable(Echo), vec![], Map::new(), &limits(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::IsolationSetup(_)));
        assert!(err.to_string().contains("echo"));
    }

    #[tokio::test]
    async fn test_trusted_callable_success() {
        let mut kwargs = Map::new();
        kwargs.insert("dpi".into(), json!(300));
        let result = trusted()
            .execute(&Plugin::callable(Echo), vec![json!("a.pdf")], kwargs, &limits(5))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.result,
            Some(json!({ "args": ["a.pdf"], "kwargs": { "dpi": 300 } }))
        );
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_trusted_callable_timeout() {
        let started = Instant::now();
        let result = trusted()
            .execute(
                &Plugin::callable(Sleeper(Duration::from_secs(30))),
                vec![],
                Map::new(),
                &limits(1),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert!(matches!(result.error, Some(SandboxFailure::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_trusted_callable_errors() {
        let sandbox = trusted();
        let result = sandbox
            .execute(&Plugin::callable(Failing("unsupported codec")), vec![], Map::new(), &limits(5))
            .await
            .unwrap();
        assert_eq!(
            result.error,
            Some(SandboxFailure::Crashed("unsupported codec".into()))
        );

        let result = sandbox
            .execute(&Plugin::callable(Failing("out of memory")), vec![], Map::new(), &limits(5))
            .await
            .unwrap();
        assert!(matches!(result.error, Some(SandboxFailure::MemoryExceeded(_))));

        let result = sandbox
            .execute(&Plugin::callable(Panicking), vec![], Map::new(), &limits(5))
            .await
            .unwrap();
        match result.error {
            Some(SandboxFailure::Crashed(detail)) => assert!(detail.contains("boom")),
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trusted_cancel_is_idempotent() {
        let running = trusted()
            .spawn(
                &Plugin::callable(Sleeper(Duration::from_secs(30))),
                vec![],
                Map::new(),
                &limits(30),
            )
            .await
            .unwrap();
        running.cancel();
        running.cancel();
        let result = running.wait().await;
        assert_eq!(result.error, Some(SandboxFailure::Timeout("cancelled".into())));
    }

    #[tokio::test]
    async fn test_timed_out_callable_keeps_its_slot() {
        let sandbox = PluginSandbox::new(SandboxConfig {
            mode: SandboxMode::Trusted,
            max_concurrent: 1,
            ..Default::default()
        })
        .unwrap();

        let result = sandbox
            .execute(
                &Plugin::callable(Sleeper(Duration::from_millis(1500))),
                vec![],
                Map::new(),
                &limits(1),
            )
            .await
            .unwrap();
        assert!(matches!(result.error, Some(SandboxFailure::Timeout(_))));
        // the abandoned thread is still running
        assert_eq!(sandbox.available_slots(), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sandbox.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_slots() {
        let sandbox = PluginSandbox::new(SandboxConfig {
            mode: SandboxMode::Trusted,
            max_concurrent: 1,
            ..Default::default()
        })
        .unwrap();

        let running = sandbox
            .spawn(
                &Plugin::callable(Sleeper(Duration::from_millis(200))),
                vec![],
                Map::new(),
                &limits(5),
            )
            .await
            .unwrap();
        assert_eq!(sandbox.available_slots(), 0);
        assert!(running.wait().await.success);
        assert_eq!(sandbox.available_slots(), 1);
    }
}
