//! Probe action
//!
//! The probe is an idempotent OS call that workers re-invoke over and over
//! with unchanged arguments. The default probe blocks {SIGQUIT, SIGUSR1} in the
//! calling thread's signal mask, and its wait is a `sigtimedwait` on the same
//! set, so a delivered SIGUSR1 ends the wait early and counts as a stop request.
//!
//! ```no_run
//! use threadstress::worker::probe::{create_probe, ProbeKind, WaitOutcome};
//! use std::time::Duration;
//!
//! let probe = create_probe(ProbeKind::ThreadMask);
//! probe.apply().unwrap();
//! match probe.wait(Duration::from_micros(100)) {
//!     WaitOutcome::TimedOut => {}
//!     WaitOutcome::Interrupted => {}
//!     WaitOutcome::StopRequested => {}
//! }
//! ```

use crate::Result;
use anyhow::Context;
use nix::sys::signal::{pthread_sigmask, sigprocmask, SigSet, SigmaskHow, Signal};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a probe wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full wait elapsed
    TimedOut,
    /// A signal cut the wait short
    Interrupted,
    /// SIGUSR1 arrived: the run should stop
    StopRequested,
}

/// Idempotent action exercised by the worker threads
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Re-apply the action; repeated calls must be safe and cheap
    fn apply(&self) -> Result<()>;

    /// Wait up to `timeout` before the next application
    fn wait(&self, timeout: Duration) -> WaitOutcome;
}

/// Which probe the workers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// Block signals in the calling thread's mask
    #[default]
    ThreadMask,
    /// Block signals through the process-level call
    ProcessMask,
    /// Sleep and do nothing
    None,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::ThreadMask => write!(f, "thread-mask"),
            ProbeKind::ProcessMask => write!(f, "process-mask"),
            ProbeKind::None => write!(f, "none"),
        }
    }
}

/// Build the probe for `kind`
pub fn create_probe(kind: ProbeKind) -> Box<dyn Probe> {
    match kind {
        ProbeKind::ThreadMask => Box::new(SignalMaskProbe::new(MaskScope::Thread)),
        ProbeKind::ProcessMask => Box::new(SignalMaskProbe::new(MaskScope::Process)),
        ProbeKind::None => Box::new(IdleProbe),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskScope {
    Thread,
    Process,
}

/// Blocks SIGQUIT and SIGUSR1 and waits for them synchronously
#[derive(Debug)]
pub struct SignalMaskProbe {
    set: SigSet,
    scope: MaskScope,
}

impl SignalMaskProbe {
    fn new(scope: MaskScope) -> Self {
        let mut set = SigSet::empty();
        set.add(Signal::SIGQUIT);
        set.add(Signal::SIGUSR1);
        Self { set, scope }
    }
}

impl Probe for SignalMaskProbe {
    fn name(&self) -> &'static str {
        match self.scope {
            MaskScope::Thread => "pthread_sigmask",
            MaskScope::Process => "sigprocmask",
        }
    }

    fn apply(&self) -> Result<()> {
        match self.scope {
            MaskScope::Thread => pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&self.set), None),
            MaskScope::Process => sigprocmask(SigmaskHow::SIG_BLOCK, Some(&self.set), None),
        }
        .with_context(|| format!("{} failed", self.name()))
    }

    fn wait(&self, timeout: Duration) -> WaitOutcome {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // SAFETY: the set and timespec outlive the call; siginfo is optional
        let signo = unsafe { libc::sigtimedwait(self.set.as_ref(), std::ptr::null_mut(), &ts) };

        if signo == libc::SIGUSR1 {
            return WaitOutcome::StopRequested;
        }
        if signo > 0 {
            return WaitOutcome::Interrupted;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => WaitOutcome::Interrupted,
            _ => WaitOutcome::TimedOut,
        }
    }
}

/// Plain sleep with a no-op action
#[derive(Debug, Default)]
pub struct IdleProbe;

impl Probe for IdleProbe {
    fn name(&self) -> &'static str {
        "none"
    }

    fn apply(&self) -> Result<()> {
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> WaitOutcome {
        std::thread::sleep(timeout);
        WaitOutcome::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_thread_mask_is_idempotent() {
        let probe = create_probe(ProbeKind::ThreadMask);
        for _ in 0..100 {
            probe.apply().unwrap();
        }

        let mut current = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current)).unwrap();
        assert!(current.contains(Signal::SIGQUIT));
        assert!(current.contains(Signal::SIGUSR1));
    }

    #[test]
    fn test_short_wait_times_out() {
        let probe = create_probe(ProbeKind::ThreadMask);
        probe.apply().unwrap();

        let start = Instant::now();
        assert_eq!(probe.wait(Duration::from_millis(20)), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_sigusr1_requests_stop() {
        let probe = create_probe(ProbeKind::ThreadMask);
        probe.apply().unwrap();

        // Pending on this thread only, so no other test sees it
        let rc = unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGUSR1) };
        assert_eq!(rc, 0);
        assert_eq!(probe.wait(Duration::from_secs(5)), WaitOutcome::StopRequested);
    }

    #[test]
    fn test_sigquit_interrupts_wait() {
        let probe = create_probe(ProbeKind::ThreadMask);
        probe.apply().unwrap();

        let rc = unsafe { libc::pthread_kill(libc::pthread_self(), libc::SIGQUIT) };
        assert_eq!(rc, 0);
        assert_eq!(probe.wait(Duration::from_secs(5)), WaitOutcome::Interrupted);
    }

    #[test]
    fn test_idle_probe() {
        let probe = create_probe(ProbeKind::None);
        assert_eq!(probe.name(), "none");
        probe.apply().unwrap();
        assert_eq!(probe.wait(Duration::from_millis(1)), WaitOutcome::TimedOut);
    }

    #[test]
    fn test_probe_kind_display() {
        assert_eq!(ProbeKind::default().to_string(), "thread-mask");
        assert_eq!(ProbeKind::ProcessMask.to_string(), "process-mask");
    }
}
