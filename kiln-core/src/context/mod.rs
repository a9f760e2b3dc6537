//! Per-invocation execution context.
//!
//! One [`ExecutionContext`] is constructed at CLI startup and passed by
//! reference through every orchestration call. It owns the event sink, the
//! original invocation arguments, and the ordered cleanup list, and it
//! provides the only sanctioned termination paths: [`ExecutionContext::exit`]
//! for explicit codes, [`ExecutionContext::fail_on`]/[`ExecutionContext::fail`]
//! for hard failures, and [`ExecutionContext::warn_on`] for conditions that
//! must not abort the run. Every path drains the cleanup list exactly once,
//! in reverse registration order, and emits a terminal event so stream
//! consumers never see a run disappear without a marker.

pub mod output;

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::exitcode::ExitCode;
use crate::ovars;
use crate::{paths, version};
use output::{OutMessage, Output, OutputFormat};

type CleanupHandler = Box<dyn FnOnce() + Send>;

/// Process-exit seam. The default hook calls `std::process::exit`; tests
/// install a panicking hook to observe termination effects.
pub type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

pub struct ExecutionContext {
    out: Output,
    args: Vec<String>,
    cleanup_handlers: Mutex<Vec<CleanupHandler>>,
    drained: AtomicBool,
    exit_hook: ExitHook,
}

impl ExecutionContext {
    /// Create a context with the default process-exit hook.
    pub fn new(
        cmd_name: &str,
        quiet: bool,
        format: OutputFormat,
        channels: HashMap<String, mpsc::UnboundedSender<OutMessage>>,
    ) -> Self {
        Self::with_exit_hook(
            cmd_name,
            quiet,
            format,
            channels,
            Box::new(|code| std::process::exit(code)),
        )
    }

    /// Create a context with a custom exit hook. The hook must not return
    /// control to the caller in production use.
    pub fn with_exit_hook(
        cmd_name: &str,
        quiet: bool,
        format: OutputFormat,
        channels: HashMap<String, mpsc::UnboundedSender<OutMessage>>,
        exit_hook: ExitHook,
    ) -> Self {
        Self {
            out: Output::new(cmd_name, quiet, format, channels),
            args: std::env::args().collect(),
            cleanup_handlers: Mutex::new(Vec::new()),
            drained: AtomicBool::new(false),
            exit_hook,
        }
    }

    pub fn out(&self) -> &Output {
        &self.out
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Register a cleanup action. Actions run in reverse registration order
    /// on every termination path.
    pub fn add_cleanup_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.cleanup_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(handler));
    }

    /// Run all termination cleanup and exit with the given code after
    /// emitting the final `exit` event.
    pub fn exit(&self, code: ExitCode) -> ! {
        self.run_cleanup();
        self.terminate(code.value())
    }

    /// Unwrap a result; on error run cleanup, log with a captured backtrace,
    /// emit the failure summary event, and terminate with the generic
    /// hard-failure code. `Ok` values pass through untouched.
    pub fn fail_on<T, E: std::fmt::Display>(&self, res: Result<T, E>) -> T {
        match res {
            Ok(value) => value,
            Err(err) => {
                self.run_cleanup();
                let stack = Backtrace::force_capture();
                error!(error = %err, stack = %stack, "terminating");
                self.out.info("fail.on", ovars! {"version" => version::current()});
                self.terminate(ExitCode::FAILURE.value())
            }
        }
    }

    /// Terminate with the generic hard-failure code for a condition detected
    /// directly rather than returned as an error.
    pub fn fail(&self, reason: &str) -> ! {
        self.run_cleanup();
        let stack = Backtrace::force_capture();
        error!(reason, stack = %stack, "terminating");
        self.out.info("fail.on", ovars! {"version" => version::current()});
        self.terminate(ExitCode::FAILURE.value())
    }

    /// Log a non-fatal condition and return control to the caller.
    pub fn warn_on<T, E: std::fmt::Display>(&self, res: Result<T, E>) -> Option<T> {
        match res {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(error = %err, "error.warning");
                None
            }
        }
    }

    /// Drain the cleanup list in reverse registration order. Single-shot: a
    /// second termination call emits its events but runs no handlers.
    fn run_cleanup(&self) {
        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }

        let handlers = {
            let mut guard = self.cleanup_handlers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        for handler in handlers.into_iter().rev() {
            handler();
        }
    }

    fn terminate(&self, code: i32) -> ! {
        self.out.info(
            "exit",
            ovars! {
                "code" => code,
                "version" => version::current(),
                "location" => paths::exe_dir(),
                "args" => format!("{:?}", self.args),
            },
        );
        output::show_support_info(self.out.format());
        (self.exit_hook)(code);
        unreachable!("exit hook returned control");
    }
}
