//! Service supervisor.
//!
//! Runs each long-lived gateway loop as an isolated failure domain. A service
//! is a factory that takes a [`CancellationToken`] and returns a future
//! resolving to a [`ServiceResult`]. Each invocation runs in its own task so a
//! panic is contained and treated like a recoverable failure.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use fieldgate_service::supervisor::{ServiceOptions, Supervisor};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let supervisor = Supervisor::new();
//! supervisor
//!     .register_service("heartbeat", ServiceOptions::default(), |token| async move {
//!         loop {
//!             tokio::select! {
//!                 _ = token.cancelled() => return Ok(()),
//!                 _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                     tracing::info!("still here");
//!                 }
//!             }
//!         }
//!     })
//!     .await?;
//!
//! supervisor.start().await?;
//! supervisor.run_until_signal(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default wait before a failed service is restarted.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Default gap between service launches.
pub const DEFAULT_STARTUP_STAGGER: Duration = Duration::from_millis(500);

/// Outcome of one service invocation.
pub type ServiceResult = Result<(), ServiceError>;

type ServiceFactory = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ServiceResult> + Send + Sync>;

/// How a service invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service may succeed if restarted.
    #[error("{0:#}")]
    Recoverable(anyhow::Error),
    /// The service must not be restarted.
    #[error("{0:#}")]
    Fatal(anyhow::Error),
}

impl ServiceError {
    /// Wrap an error as fatal.
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        ServiceError::Fatal(err.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ServiceError::Fatal(_))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Recoverable(err)
    }
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Cannot register services after the supervisor has started")]
    AlreadyRunning,
    #[error("Service '{0}' is already registered")]
    DuplicateService(String),
    #[error("Unknown service '{0}'")]
    UnknownService(String),
}

/// Restart policy for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Invoke the service again after it returns or fails recoverably.
    pub auto_restart: bool,
    /// Wait between invocations.
    pub restart_delay: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            auto_restart: true,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

impl ServiceOptions {
    #[must_use]
    pub fn auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    #[must_use]
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }
}

/// Read-only snapshot of one supervised service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    /// Whether the monitoring task is live.
    pub running: bool,
    pub auto_restart: bool,
    pub restart_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_start: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_error_at: Option<OffsetDateTime>,
}

/// Bookkeeping written by the monitoring task.
#[derive(Debug, Default)]
struct ServiceRecord {
    restart_count: u32,
    last_start: Option<OffsetDateTime>,
    last_error: Option<String>,
    last_error_at: Option<OffsetDateTime>,
}

impl ServiceRecord {
    fn record_error(&mut self, message: String) {
        self.last_error = Some(message);
        self.last_error_at = Some(OffsetDateTime::now_utc());
    }
}

struct ServiceEntry {
    name: String,
    factory: ServiceFactory,
    options: ServiceOptions,
    token: CancellationToken,
    record: Arc<RwLock<ServiceRecord>>,
    handle: Option<JoinHandle<()>>,
}

/// Runs registered services with auto-restart and graceful shutdown.
pub struct Supervisor {
    entries: Mutex<Vec<ServiceEntry>>,
    started: AtomicBool,
    startup_stagger: Duration,
    shutdown: CancellationToken,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    /// Create a supervisor with no services.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            startup_stagger: DEFAULT_STARTUP_STAGGER,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the gap between service launches in [`start`](Self::start).
    #[must_use]
    pub fn with_startup_stagger(mut self, stagger: Duration) -> Self {
        self.startup_stagger = stagger;
        self
    }

    /// Use an external token to request shutdown from
    /// [`run_until_signal`](Self::run_until_signal).
    #[must_use]
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Token that, once cancelled, makes `run_until_signal` stop every service.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a service.
    ///
    /// Fails once the supervisor has started or when the name is taken.
    pub async fn register_service<F, Fut>(
        &self,
        name: impl Into<String>,
        options: ServiceOptions,
        factory: F,
    ) -> Result<(), SupervisorError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let name = name.into();
        if self.started.load(Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.name == name) {
            return Err(SupervisorError::DuplicateService(name));
        }

        info!(service = %name, auto_restart = options.auto_restart, "Registered service");
        entries.push(ServiceEntry {
            name,
            factory: Arc::new(move |token| factory(token).boxed()),
            options,
            token: CancellationToken::new(),
            record: Arc::new(RwLock::new(ServiceRecord::default())),
            handle: None,
        });
        Ok(())
    }

    /// Launch a monitoring task for every registered service.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut entries = self.entries.lock().await;
        info!("Starting {} service(s)", entries.len());

        let count = entries.len();
        for (i, entry) in entries.iter_mut().enumerate() {
            let task = monitor(
                entry.name.clone(),
                Arc::clone(&entry.factory),
                entry.options,
                entry.token.clone(),
                Arc::clone(&entry.record),
            );
            entry.handle = Some(tokio::spawn(task));

            if i + 1 < count && !self.startup_stagger.is_zero() {
                tokio::time::sleep(self.startup_stagger).await;
            }
        }
        Ok(())
    }

    /// Stop one service.
    ///
    /// Cancels its token and waits up to `timeout` for the monitoring task to
    /// finish. The task is never aborted; `Ok(false)` means it was still
    /// running when the timeout expired.
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<bool, SupervisorError> {
        let (token, handle) = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .iter_mut()
                .find(|e| e.name == name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
            (entry.token.clone(), entry.handle.take())
        };

        token.cancel();
        let Some(handle) = handle else {
            return Ok(true);
        };

        info!(service = %name, "Stopping service");
        let stopped = self.await_handle(name, handle, timeout).await;
        Ok(stopped)
    }

    /// Stop every service, sharing one `timeout` between them.
    ///
    /// Returns `true` if all of them finished in time.
    pub async fn stop_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let pending: Vec<(String, JoinHandle<()>)> = {
            let mut entries = self.entries.lock().await;
            for entry in entries.iter() {
                entry.token.cancel();
            }
            entries
                .iter_mut()
                .rev()
                .filter_map(|e| e.handle.take().map(|h| (e.name.clone(), h)))
                .collect()
        };

        info!("Stopping {} service(s)", pending.len());
        let mut all_stopped = true;
        for (name, handle) in pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            all_stopped &= self.await_handle(&name, handle, remaining).await;
        }

        if all_stopped {
            info!("All services stopped");
        }
        all_stopped
    }

    async fn await_handle(&self, name: &str, mut handle: JoinHandle<()>, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                info!(service = %name, "Service stopped");
                true
            }
            Err(_) => {
                warn!(
                    service = %name,
                    "Service did not stop within {:?}; leaving it to finish",
                    timeout
                );
                let mut entries = self.entries.lock().await;
                if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
                    entry.handle = Some(handle);
                }
                false
            }
        }
    }

    /// Block until SIGINT, SIGTERM or the shutdown token, then stop every
    /// service.
    pub async fn run_until_signal(&self, stop_timeout: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested");
            }
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(err) => error!("Error setting up signal handler: {}", err),
                }
            }
            _ = terminate() => {
                info!("Received SIGTERM signal");
            }
        }

        self.stop_all(stop_timeout).await
    }

    /// Snapshot of every service, in registration order.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let entries = self.entries.lock().await;
        let mut statuses = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            let record = entry.record.read().await;
            statuses.push(ServiceStatus {
                name: entry.name.clone(),
                running: entry.handle.as_ref().is_some_and(|h| !h.is_finished()),
                auto_restart: entry.options.auto_restart,
                restart_count: record.restart_count,
                last_start: record.last_start,
                last_error: record.last_error.clone(),
                last_error_at: record.last_error_at,
            });
        }
        statuses
    }

    /// Snapshot of one service.
    pub async fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.status().await.into_iter().find(|s| s.name == name)
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            error!("Error setting up SIGTERM handler: {}", err);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Monitoring loop for one service.
async fn monitor(
    name: String,
    factory: ServiceFactory,
    options: ServiceOptions,
    token: CancellationToken,
    record: Arc<RwLock<ServiceRecord>>,
) {
    loop {
        record.write().await.last_start = Some(OffsetDateTime::now_utc());
        info!(service = %name, "Starting service");

        let invocation = tokio::spawn(factory(token.clone()));
        let outcome = match invocation.await {
            Ok(result) => result,
            Err(join_err) => Err(ServiceError::Recoverable(anyhow::anyhow!(
                "{}",
                describe_join_error(join_err)
            ))),
        };

        match outcome {
            Ok(()) => {
                if token.is_cancelled() || !options.auto_restart {
                    info!(service = %name, "Service finished");
                    break;
                }
                info!(
                    service = %name,
                    "Service exited; restarting in {:?}",
                    options.restart_delay
                );
            }
            Err(err @ ServiceError::Fatal(_)) => {
                error!(service = %name, "Service failed fatally: {}", err);
                record.write().await.record_error(err.to_string());
                break;
            }
            Err(err @ ServiceError::Recoverable(_)) => {
                record.write().await.record_error(err.to_string());
                if token.is_cancelled() || !options.auto_restart {
                    error!(service = %name, "Service failed: {}", err);
                    break;
                }
                warn!(
                    service = %name,
                    "Service failed: {}; restarting in {:?}",
                    err,
                    options.restart_delay
                );
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(options.restart_delay) => {}
        }
        record.write().await.restart_count += 1;
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("service panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("service panicked: {}", message)
    } else {
        "service panicked".to_string()
    }
}
