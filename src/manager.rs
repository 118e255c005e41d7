//! Process-wide pool manager.
//!
//! One manager per process: one-shot start behind a double-checked flag, an
//! explicit shutdown, and a post-fork detach wired to an `atfork` child hook
//! so a forked child never kills or reaps the parent's workers.

use crate::assemble::{AssemblerRef, CompileOutcome, CompileRequest, RawAssembler};
use crate::config::PoolConfig;
use crate::delegate::Delegate;
use crate::error::{Result, XccError};
use crate::pool::CompilerPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

/// The process-wide manager singleton.
static MANAGER: PoolManager = PoolManager::new();

/// Registers the atfork child hook exactly once.
static ATFORK_INIT: Once = Once::new();

/// Access the process-wide [`PoolManager`].
pub fn manager() -> &'static PoolManager {
    &MANAGER
}

/// Owns the pool, the spawn delegate, and the started flag.
pub struct PoolManager {
    started: AtomicBool,
    start_lock: Mutex<()>,
    pool: Mutex<Option<Arc<CompilerPool>>>,
    delegate: Mutex<Option<Arc<Delegate>>>,
    config: Mutex<Option<PoolConfig>>,
    assembler: Mutex<Option<AssemblerRef>>,
    username: Mutex<Option<String>>,
}

impl PoolManager {
    const fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            pool: Mutex::new(None),
            delegate: Mutex::new(None),
            config: Mutex::new(None),
            assembler: Mutex::new(None),
            username: Mutex::new(None),
        }
    }

    /// Install the pool configuration and the assembler used for replies.
    /// Takes effect at the next (first) start.
    pub fn configure(&self, config: PoolConfig, assembler: AssemblerRef) {
        *self.config.lock().expect("manager mutex poisoned") = Some(config);
        *self.assembler.lock().expect("manager mutex poisoned") = Some(assembler);
    }

    /// Set the user the workers should run as. Must be called before the
    /// first start to have an effect.
    pub fn set_user(&self, username: impl Into<String>) {
        *self.username.lock().expect("manager mutex poisoned") = Some(username.into());
    }

    /// Idempotent, thread-safe one-shot start.
    ///
    /// When configuration disables the pool (no command or zero workers)
    /// this succeeds and leaves the pool absent; callers observe
    /// [`XccError::Disabled`] from [`compile`](Self::compile) and pick their
    /// fallback.
    pub fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let _start = self.start_lock.lock().expect("manager start lock poisoned");
        if self.started.load(Ordering::Relaxed) {
            return Ok(());
        }

        let config = self
            .config
            .lock()
            .expect("manager mutex poisoned")
            .clone()
            .unwrap_or_default();
        if !config.enabled() {
            tracing::debug!("external compiler disabled, not starting pool");
            self.started.store(true, Ordering::Release);
            return Ok(());
        }

        let assembler = self
            .assembler
            .lock()
            .expect("manager mutex poisoned")
            .clone()
            .unwrap_or_else(|| Arc::new(RawAssembler));

        // The delegate must exist before any worker: it performs every
        // spawn and waitpid on our behalf once the host is multi-threaded.
        let delegate = Arc::new(Delegate::create()?);

        if let Some(username) = self.username.lock().expect("manager mutex poisoned").clone() {
            let result = delegate
                .session()
                .and_then(|session| session.change_user(&username));
            if let Err(e) = result {
                tracing::warn!(user = %username, "unable to drop worker user: {}", e);
            }
        }

        let pool = Arc::new(CompilerPool::new(config, delegate.clone(), assembler));
        if let Err(e) = pool.start() {
            pool.shutdown(false);
            delegate.shutdown();
            return Err(e);
        }

        *self.pool.lock().expect("manager mutex poisoned") = Some(pool);
        *self.delegate.lock().expect("manager mutex poisoned") = Some(delegate);
        self.started.store(true, Ordering::Release);

        // A forked child must drop the pool without touching the parent's
        // subprocesses.
        ATFORK_INIT.call_once(|| unsafe {
            nix::libc::pthread_atfork(None, None, Some(atfork_child as unsafe extern "C" fn()));
        });

        Ok(())
    }

    /// Whether a started pool is present.
    pub fn enabled(&self) -> bool {
        self.pool.lock().expect("manager mutex poisoned").is_some()
    }

    /// Compile one source file through the pool.
    pub fn compile(&self, request: &CompileRequest<'_>) -> Result<CompileOutcome> {
        self.ensure_started()?;
        let pool = self
            .pool
            .lock()
            .expect("manager mutex poisoned")
            .clone()
            .ok_or(XccError::Disabled)?;
        pool.compile(request)
    }

    /// The external compiler's version string.
    pub fn version(&self) -> Result<String> {
        self.ensure_started()?;
        let pool = self
            .pool
            .lock()
            .expect("manager mutex poisoned")
            .clone()
            .ok_or(XccError::Disabled)?;
        Ok(pool.version())
    }

    /// Stop the pool and the delegate, terminating the workers.
    pub fn shutdown(&self) {
        self.stop(false);
    }

    /// Drop the pool and delegate without killing or waiting on anything.
    /// The child side of a fork does not own the workers; the parent does.
    pub fn detach_after_fork(&self) {
        self.stop(true);
    }

    fn stop(&self, detach: bool) {
        let _start = self.start_lock.lock().expect("manager start lock poisoned");
        if let Some(pool) = self.pool.lock().expect("manager mutex poisoned").take() {
            pool.shutdown(detach);
        }
        if let Some(delegate) = self
            .delegate
            .lock()
            .expect("manager mutex poisoned")
            .take()
        {
            if detach {
                delegate.detach();
            } else {
                delegate.shutdown();
            }
        }
        self.started.store(false, Ordering::Relaxed);
    }
}

/// atfork child hook: disown everything inherited from the parent.
extern "C" fn atfork_child() {
    MANAGER.detach_after_fork();
}

#[cfg(test)]
mod tests {
    use super::*;

    // The manager is process-global, so its lifecycle is covered by one
    // sequential test; concurrent per-pool behavior is tested in pool.rs
    // and tests/pool.rs against private pools.
    #[test]
    fn test_manager_lifecycle_with_disabled_config() {
        let m = manager();

        // Unconfigured: starting succeeds, the pool stays absent.
        m.ensure_started().unwrap();
        m.ensure_started().unwrap();
        assert!(!m.enabled());

        let request = CompileRequest {
            filename: "a.hh",
            md5: "00000000000000000000000000000000".parse().unwrap(),
            source: b"x",
            systemlib: false,
        };
        assert!(matches!(m.compile(&request), Err(XccError::Disabled)));
        assert!(matches!(m.version(), Err(XccError::Disabled)));

        // Shutdown resets the one-shot flag.
        m.shutdown();
        assert!(!m.enabled());
        m.ensure_started().unwrap();
        m.shutdown();
    }
}
