//! Crash safety for file-backed mappings.
//!
//! Anonymous mappings die with the process, but a file-backed mapping on a
//! hugetlb filesystem pins pages of a limited, system-wide pool until its
//! descriptor is closed. The first successful file-backed allocation
//! therefore installs two hooks that release every registered mapping:
//! an `atexit` hook for normal exits and a `SIGABRT` handler for aborts,
//! which then hands the signal on to whatever disposition was there before.

use super::stats;
use super::vm::VmError;
use std::io;

/// `SIGABRT` disposition found when the handler was installed.
pub(crate) type PreviousDisposition = libc::sigaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookState {
    Uninstalled,
    Installed,
}

/// Installs the process-level cleanup hooks.
pub(crate) trait CrashHooks {
    /// Register the exit hook and the abort handler, storing the abort
    /// disposition that was replaced in `previous`.
    fn install(&self, previous: &mut Option<PreviousDisposition>) -> Result<(), VmError>;
}

/// One-way `Uninstalled → Installed` switch plus the chained disposition.
pub(crate) struct CrashSafetyState {
    state: HookState,
    previous: Option<PreviousDisposition>,
}

impl CrashSafetyState {
    pub(crate) const fn new() -> Self {
        Self {
            state: HookState::Uninstalled,
            previous: None,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> HookState {
        self.state
    }

    #[inline]
    pub(crate) fn previous(&self) -> Option<&PreviousDisposition> {
        self.previous.as_ref()
    }

    /// Install the hooks unless that already happened.
    ///
    /// Returns `true` if this call performed the installation.
    ///
    /// # Errors
    ///
    /// Whatever `hooks.install` reports. The state stays `Uninstalled`.
    pub(crate) fn ensure_installed<H: CrashHooks>(&mut self, hooks: &H) -> Result<bool, VmError> {
        if self.state == HookState::Installed {
            return Ok(false);
        }
        hooks.install(&mut self.previous)?;
        self.state = HookState::Installed;
        stats::HOOK_INSTALLS.add(1);
        log::info!("[memory] crash-safety hooks installed (atexit + SIGABRT)");
        Ok(true)
    }
}

impl Default for CrashSafetyState {
    fn default() -> Self {
        Self::new()
    }
}

/// The real hooks. They release the process-wide registry, so only the
/// global allocator uses them.
pub(crate) struct PlatformCrashHooks;

extern "C" fn release_at_exit() {
    super::global::release_all_tracked();
}

extern "C" fn release_on_abort(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    super::global::release_all_tracked();
    let previous = super::global::previous_abort_disposition();
    // Safety: running inside the handler for `sig`; arguments are the ones
    // the kernel passed us.
    unsafe { chain(previous.as_ref(), sig, info, ctx) };
}

/// Hand `sig` on to the disposition that was replaced.
///
/// A previous handler function is called directly. `SIG_IGN` swallows the
/// signal. `SIG_DFL` (or nothing recorded) is restored and the signal raised
/// again; it stays blocked until this handler returns, so the default action
/// then terminates the process.
unsafe fn chain(
    previous: Option<&PreviousDisposition>,
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    type InfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);
    type PlainHandler = extern "C" fn(libc::c_int);

    match previous {
        Some(prev) if prev.sa_sigaction == libc::SIG_IGN => {}
        Some(prev) if prev.sa_sigaction != libc::SIG_DFL => {
            if prev.sa_flags & libc::SA_SIGINFO != 0 {
                // Safety: with SA_SIGINFO set, sa_sigaction holds a three-argument handler.
                let handler = unsafe {
                    std::mem::transmute::<libc::sighandler_t, InfoHandler>(prev.sa_sigaction)
                };
                handler(sig, info, ctx);
            } else {
                // Safety: without SA_SIGINFO, sa_sigaction holds a one-argument handler.
                let handler = unsafe {
                    std::mem::transmute::<libc::sighandler_t, PlainHandler>(prev.sa_sigaction)
                };
                handler(sig);
            }
        }
        _ => {
            // Safety: FFI calls to sigaction/raise, both async-signal-safe.
            unsafe {
                let mut default: libc::sigaction = std::mem::zeroed();
                default.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut default.sa_mask);
                libc::sigaction(sig, &default, std::ptr::null_mut());
                libc::raise(sig);
            }
        }
    }
}

impl CrashHooks for PlatformCrashHooks {
    fn install(&self, previous: &mut Option<PreviousDisposition>) -> Result<(), VmError> {
        // Safety: FFI call to atexit with a plain extern "C" fn.
        if unsafe { libc::atexit(release_at_exit) } != 0 {
            return Err(VmError::HookInstallFailed {
                hook: "exit handler",
                source: io::Error::other("atexit refused the handler"),
            });
        }

        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            release_on_abort;
        // Safety: FFI calls to sigemptyset/sigaction on zero-initialised structs.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);

            let mut old: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGABRT, &action, &mut old) != 0 {
                return Err(VmError::HookInstallFailed {
                    hook: "cleanup handler",
                    source: io::Error::last_os_error(),
                });
            }
            *previous = Some(old);
        }
        Ok(())
    }
}
