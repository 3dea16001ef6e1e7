//! Per-call trace logging
//!
//! When enabled, every intercepted call emits a `before` and an `after` line
//! at TRACE level under the `sqlreplay::trace` target. Lines of one call share
//! a process-wide sequence number. Arguments can be masked so statement text
//! and bound values stay out of logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sqlreplay_core::{Error, Result};
use tracing::{enabled, trace, Level};

use crate::execution::{Call, HandleId};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Arguments longer than this are truncated
const ARGUMENT_MAX_LENGTH: usize = 50;

/// Emits before/after trace lines for intercepted calls
#[derive(Debug, Clone, Copy, Default)]
pub struct CallTracer {
    enabled: bool,
    masked: bool,
}

impl CallTracer {
    /// Create a tracer; `masked` replaces every argument character with `*`
    pub fn new(enabled: bool, masked: bool) -> Self {
        CallTracer { enabled, masked }
    }

    /// Tracer that never logs
    pub fn disabled() -> Self {
        Self::default()
    }

    fn active(&self) -> bool {
        self.enabled && enabled!(target: "sqlreplay::trace", Level::TRACE)
    }

    /// Log the start of a call; returns its sequence number (0 when inactive)
    pub fn before(&self, target: HandleId, call: &dyn Call) -> u64 {
        if !self.active() {
            return 0;
        }
        let no = SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            target: "sqlreplay::trace",
            "> before [{}][conn={}] {}({})",
            no,
            target,
            call.operation(),
            self.render(call)
        );
        no
    }

    /// Log the end of a call
    pub fn after(
        &self,
        no: u64,
        target: HandleId,
        call: &dyn Call,
        elapsed: Duration,
        error: Option<&Error>,
    ) {
        if !self.active() {
            return;
        }
        let status = if error.is_some() { "fail" } else { "success" };
        let detail = match error {
            Some(e) => match e.sql_state() {
                Some(state) => format!("[error={}][sqlState={}]", e, state),
                None => format!("[error={}]", e),
            },
            None => String::new(),
        };
        trace!(
            target: "sqlreplay::trace",
            "< after [{}][{}][{:?}][conn={}]{} {}({})",
            no,
            status,
            elapsed,
            target,
            detail,
            call.operation(),
            self.render(call)
        );
    }

    /// Run `f` as the delegate call for `call`, tracing around it
    ///
    /// Returns the outcome together with the wall-clock time `f` took.
    pub fn run<T>(
        &self,
        target: HandleId,
        call: &dyn Call,
        f: impl FnOnce() -> Result<T>,
    ) -> (Result<T>, Duration) {
        let no = self.before(target, call);
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        self.after(no, target, call, elapsed, result.as_ref().err());
        (result, elapsed)
    }

    fn render(&self, call: &dyn Call) -> String {
        call.arguments()
            .iter()
            .map(|arg| render_argument(arg, self.masked))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn render_argument(arg: &str, masked: bool) -> String {
    let text = if masked {
        "*".repeat(arg.chars().count())
    } else {
        arg.to_string()
    };
    if text.chars().count() <= ARGUMENT_MAX_LENGTH {
        return text;
    }
    let mut truncated: String = text.chars().take(ARGUMENT_MAX_LENGTH - 3).collect();
    truncated.push_str("...");
    truncated
}
