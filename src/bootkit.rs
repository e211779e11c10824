use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send>;

/// A start/stop hook pair registered by a runnable during boot.
#[derive(Default)]
pub struct LifeCycleHook {
    pub on_start: Option<HookFn>,
    pub on_stop: Option<HookFn>,
}

impl LifeCycleHook {
    pub fn on_start<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            on_start: Some(Box::new(move || f().boxed())),
            on_stop: None,
        }
    }

    pub fn on_stop<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            on_start: None,
            on_stop: Some(Box::new(move || f().boxed())),
        }
    }

    pub fn with_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move || f().boxed()));
        self
    }
}

/// Handle given to runnables for one-way hook registration. Clones share the
/// same hook list, so a filter can register its stop hook without holding the
/// whole kit.
#[derive(Clone, Default)]
pub struct LifeCycle {
    hooks: Arc<Mutex<Vec<LifeCycleHook>>>,
}

impl LifeCycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, hook: LifeCycleHook) {
        self.hooks.lock().expect("lifecycle lock").push(hook);
    }

    fn take_hooks(&self) -> Vec<LifeCycleHook> {
        std::mem::take(&mut *self.hooks.lock().expect("lifecycle lock"))
    }
}

pub type Runnable = Box<dyn FnOnce(LifeCycle) -> BoxFuture<'static, Result<(), String>> + Send>;

/// Single-process bootstrap: run factories in parallel, then start hooks, then
/// wait for a shutdown trigger and unwind stop hooks in reverse order.
pub struct BootKit {
    start_timeout: Duration,
    stop_timeout: Duration,
    runnables: Vec<Runnable>,
    lifecycle: LifeCycle,
}

impl Default for BootKit {
    fn default() -> Self {
        Self::new()
    }
}

impl BootKit {
    pub fn new() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            runnables: Vec::new(),
            lifecycle: LifeCycle::new(),
        }
    }

    pub fn with_timeouts(start_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            start_timeout,
            stop_timeout,
            ..Self::new()
        }
    }

    pub fn add<F, Fut>(&mut self, runnable: F) -> &mut Self
    where
        F: FnOnce(LifeCycle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        self.runnables
            .push(Box::new(move |lifecycle| runnable(lifecycle).boxed()));
        self
    }

    /// Run until SIGINT/SIGTERM (a second signal force-exits the process).
    pub async fn start(self) {
        self.start_with_shutdown(signal_shutdown()).await;
    }

    /// Run until the given future resolves, a start hook errors, or every
    /// start hook returns.
    pub async fn start_with_shutdown<S>(mut self, shutdown: S)
    where
        S: std::future::Future<Output = ()> + Send + 'static,
    {
        let lifecycle = self.lifecycle.clone();
        let runnables = std::mem::take(&mut self.runnables);

        let mut run_set = JoinSet::new();
        for runnable in runnables {
            run_set.spawn(runnable(lifecycle.clone()));
        }

        let run_all = async {
            while let Some(joined) = run_set.join_next().await {
                match joined {
                    Ok(result) => result?,
                    Err(err) => return Err(format!("runnable panicked: {err}")),
                }
            }
            Ok::<(), String>(())
        };

        match tokio::time::timeout(self.start_timeout, run_all).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to run");
                Self::stop_lifecycle(lifecycle.clone(), self.stop_timeout).await;
                return;
            }
            Err(_) => {
                tracing::error!(timeout = ?self.start_timeout, "start timed out");
                Self::stop_lifecycle(lifecycle.clone(), self.stop_timeout).await;
                return;
            }
        }

        let hooks = lifecycle.take_hooks();
        let mut stop_hooks = Vec::new();
        let mut start_set = JoinSet::new();
        for hook in hooks {
            if let Some(on_start) = hook.on_start {
                start_set.spawn(on_start());
            }
            if let Some(on_stop) = hook.on_stop {
                stop_hooks.push(on_stop);
            }
        }

        let wait_start = async {
            while let Some(joined) = start_set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Some(err),
                    Err(err) => return Some(format!("start hook panicked: {err}")),
                }
            }
            None
        };

        tokio::select! {
            maybe_err = wait_start => {
                if let Some(err) = maybe_err {
                    tracing::error!(error = %err, "failed to start");
                }
            }
            _ = shutdown => {
                tracing::info!("shutdown requested");
            }
        }

        stop_with_timeout(stop_hooks, self.stop_timeout).await;
    }

    async fn stop_lifecycle(lifecycle: LifeCycle, stop_timeout: Duration) {
        let hooks = lifecycle.take_hooks();
        let stop_hooks: Vec<HookFn> = hooks.into_iter().filter_map(|h| h.on_stop).collect();
        stop_with_timeout(stop_hooks, stop_timeout).await;
    }
}

/// Stop hooks run concurrently in reverse registration order. Errors are
/// logged; they never short-circuit the remaining hooks.
async fn stop_with_timeout(mut stop_hooks: Vec<HookFn>, timeout: Duration) {
    if stop_hooks.is_empty() {
        return;
    }

    stop_hooks.reverse();
    let futures: Vec<_> = stop_hooks.into_iter().map(|hook| hook()).collect();

    let run_all = async {
        let results = futures_util::future::join_all(futures).await;
        for result in results {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to stop");
            }
        }
    };

    if tokio::time::timeout(timeout, run_all).await.is_err() {
        tracing::error!(timeout = ?timeout, "stop timed out");
    }
}

async fn signal_shutdown() {
    wait_for_signal().await;
    // Double signal forces exit.
    tokio::spawn(async {
        wait_for_signal().await;
        eprintln!("received signal, force terminated");
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
