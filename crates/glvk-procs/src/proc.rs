//! A single dynamically resolved GL entry point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use once_cell::sync::OnceCell;
use tracing::{error, info};

use crate::errors::{gl_error_is_fatal, gl_error_to_str};
use crate::ffi::PfnGlGetError;

/// Debug behavior applied to every entry point of a table at construction.
///
/// All three diagnostics only run in builds with `debug_assertions`; in
/// release builds the flags are stored but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcDebugOptions {
    /// Log every call (name only) on the `glvk::calls` target.
    pub log_calls: bool,
    /// Query `glGetError` after every call.
    pub check_errors: bool,
    /// Capture the first calling thread and reject calls from any other.
    pub enforce_one_thread: bool,
}

impl Default for ProcDebugOptions {
    fn default() -> Self {
        Self {
            log_calls: false,
            check_errors: cfg!(debug_assertions),
            enforce_one_thread: cfg!(debug_assertions),
        }
    }
}

/// Name and diagnostic state shared by every entry point regardless of its
/// signature.
#[derive(Debug)]
pub struct GlProcBase {
    name: &'static str,
    /// `glGetError`, if it resolved. Never set on `glGetError` itself.
    error_fn: Option<PfnGlGetError>,
    check_errors: AtomicBool,
    log_calls: AtomicBool,
    enforce_one_thread: AtomicBool,
    /// First thread to call through any entry point of the owning table.
    allowed_thread: Arc<OnceCell<ThreadId>>,
}

impl GlProcBase {
    fn new(
        name: &'static str,
        error_fn: Option<PfnGlGetError>,
        allowed_thread: Arc<OnceCell<ThreadId>>,
    ) -> Self {
        Self {
            name,
            error_fn: if name == "glGetError" { None } else { error_fn },
            check_errors: AtomicBool::new(false),
            log_calls: AtomicBool::new(false),
            enforce_one_thread: AtomicBool::new(false),
            allowed_thread,
        }
    }

    /// The GL symbol name, e.g. `"glGenTextures"`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn log_calls(&self) -> bool {
        self.log_calls.load(Ordering::Relaxed)
    }

    pub fn set_log_calls(&self, log: bool) {
        self.log_calls.store(log, Ordering::Relaxed);
    }

    /// Whether a post-call `glGetError` query will run. False when
    /// `glGetError` itself did not resolve.
    pub fn checks_errors(&self) -> bool {
        self.error_fn.is_some() && self.check_errors.load(Ordering::Relaxed)
    }

    pub fn set_error_checking(&self, check: bool) {
        self.check_errors.store(check, Ordering::Relaxed);
    }

    pub fn enforces_one_thread(&self) -> bool {
        self.enforce_one_thread.load(Ordering::Relaxed)
    }

    pub fn set_enforce_one_thread(&self, enforce: bool) {
        self.enforce_one_thread.store(enforce, Ordering::Relaxed);
    }

    pub(crate) fn apply(&self, options: ProcDebugOptions) {
        self.set_log_calls(options.log_calls);
        self.set_error_checking(options.check_errors);
        self.set_enforce_one_thread(options.enforce_one_thread);
    }

    #[cfg(debug_assertions)]
    fn before_call(&self) {
        if self.log_calls() {
            info!(target: "glvk::calls", "{}", self.name);
        }
        if self.enforces_one_thread() {
            let current = std::thread::current().id();
            let allowed = *self.allowed_thread.get_or_init(|| current);
            if allowed != current {
                panic!(
                    "{} is expected to be called from one thread, the render thread \
                     ({allowed:?}), but was called from {current:?}",
                    self.name
                );
            }
        }
    }

    #[cfg(debug_assertions)]
    fn after_call(&self) {
        if !self.check_errors.load(Ordering::Relaxed) {
            return;
        }
        let Some(get_error) = self.error_fn else {
            return;
        };
        let error = unsafe { get_error() };
        if error == gl::NO_ERROR {
            return;
        }
        if gl_error_is_fatal(error) {
            panic!(
                "Fatal GL Error {}({error:#06x}) encountered on call to {}",
                gl_error_to_str(error),
                self.name
            );
        }
        error!(
            "GL Error {}({error:#06x}) encountered on call to {}",
            gl_error_to_str(error),
            self.name
        );
    }
}

/// A resolved (or unresolved) GL function pointer of type `F`.
///
/// Calling through an unresolved entry point panics: the table reports
/// validity up front and callers must not reach optional entries without
/// checking [`GlProc::is_available`].
#[derive(Debug)]
pub struct GlProc<F: Copy> {
    base: GlProcBase,
    function: Option<F>,
}

impl<F: Copy> GlProc<F> {
    pub(crate) fn new(
        name: &'static str,
        function: Option<F>,
        error_fn: Option<PfnGlGetError>,
        allowed_thread: Arc<OnceCell<ThreadId>>,
    ) -> Self {
        Self {
            base: GlProcBase::new(name, error_fn, allowed_thread),
            function,
        }
    }

    pub fn name(&self) -> &'static str {
        self.base.name
    }

    pub fn base(&self) -> &GlProcBase {
        &self.base
    }

    pub fn is_available(&self) -> bool {
        self.function.is_some()
    }

    /// Forget the resolved pointer, e.g. after an extension turned out to be
    /// unusable on the current driver.
    pub fn reset(&mut self) {
        self.function = None;
        self.base.error_fn = None;
    }

    /// Run `invoke` with the function pointer, wrapped in the entry point's
    /// diagnostics.
    ///
    /// The call itself happens inside `invoke`, so the caller owns the
    /// `unsafe` block and the argument contract of the GL function:
    ///
    /// ```ignore
    /// let mut texture = 0;
    /// unsafe { gl.gen_textures.call(|f| f(1, &mut texture)) };
    /// ```
    #[track_caller]
    pub fn call<R>(&self, invoke: impl FnOnce(F) -> R) -> R {
        let Some(function) = self.function else {
            panic!(
                "GL function {} is not available. This is likely due to a missing extension.",
                self.base.name
            );
        };
        #[cfg(debug_assertions)]
        self.base.before_call();
        let result = invoke(function);
        #[cfg(debug_assertions)]
        self.base.after_call();
        result
    }
}
