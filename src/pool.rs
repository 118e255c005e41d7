//! Fixed-size pool of compiler subprocesses.
//!
//! Callers lease one compiler at a time; acquisition blocks on a condition
//! variable until a slot frees up. The pool-level compile facade owns the
//! retry policy: transport failures are retried under the same lease (the
//! crashed worker respawns on the next attempt), compile errors are returned
//! immediately.

use crate::assemble::{AssemblerRef, CompileOutcome, CompileRequest};
use crate::compiler::Compiler;
use crate::config::PoolConfig;
use crate::delegate::Delegate;
use crate::error::{Result, XccError};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Slot storage and the free count it must stay consistent with.
struct PoolState {
    /// One slot per worker; a leased slot is empty.
    slots: Vec<Option<Compiler>>,
    /// Number of non-empty slots.
    free: usize,
}

/// A fixed-size pool of [`Compiler`] workers shared across caller threads.
pub struct CompilerPool {
    config: Arc<PoolConfig>,
    state: Mutex<PoolState>,
    available: Condvar,
    /// Version string captured from the first started worker.
    version: OnceLock<String>,
    delegate: Arc<Delegate>,
    assembler: AssemblerRef,
}

impl CompilerPool {
    /// Create a pool with empty slots. Call [`start`](Self::start) to
    /// populate it.
    pub fn new(config: PoolConfig, delegate: Arc<Delegate>, assembler: AssemblerRef) -> Self {
        let slots = (0..config.workers).map(|_| None).collect();
        Self {
            config: Arc::new(config),
            state: Mutex::new(PoolState { slots, free: 0 }),
            available: Condvar::new(),
            version: OnceLock::new(),
            delegate,
            assembler,
        }
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Populate every slot and capture the compiler version from the first
    /// worker. Spawn or handshake failure aborts startup.
    pub fn start(&self) -> Result<()> {
        tracing::debug!(workers = self.config.workers, "starting compiler pool");
        {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            for slot in state.slots.iter_mut() {
                *slot = Some(Compiler::new(
                    self.config.clone(),
                    self.delegate.clone(),
                    self.assembler.clone(),
                ));
            }
            state.free = state.slots.len();
        }

        let mut lease = CompilerLease::new(self);
        let version = lease.compiler().version()?;
        let _ = self.version.set(version);
        Ok(())
    }

    /// The cached compiler version (empty before [`start`](Self::start)).
    pub fn version(&self) -> String {
        self.version.get().cloned().unwrap_or_default()
    }

    /// Compile one source file, leasing a worker for the whole retry
    /// sequence.
    ///
    /// Returns `Ok(CompileOutcome::Error(..))` both for a structured compile
    /// error (first occurrence, never retried) and for an exhausted retry
    /// budget (the accumulated transport messages). Spawn failures propagate
    /// as [`XccError::BadCompiler`].
    pub fn compile(&self, request: &CompileRequest<'_>) -> Result<CompileOutcome> {
        let mut lease = CompilerLease::new(self);
        let attempts = self.config.attempts();
        let mut transcript = String::new();

        let mut attempt = 0;
        while attempt < attempts {
            attempt += 1;
            match lease.compiler().compile(request) {
                Ok(unit) => return Ok(CompileOutcome::Unit(unit)),
                Err(XccError::Compile(message)) => {
                    // Deterministic failure; retrying would only repeat it.
                    return Ok(CompileOutcome::Error(message));
                }
                Err(XccError::Transport(message)) => {
                    // Infra failure: accumulate and retry on the same lease.
                    // The worker was stopped and respawns on the next pass.
                    transcript.push_str(&message);
                    if attempt < attempts {
                        transcript.push('\n');
                    }
                }
                Err(other) => return Err(other),
            }
        }

        if self.config.verbose_errors {
            tracing::error!(
                "external compiler encountered too many communication errors, giving up"
            );
        }
        Ok(CompileOutcome::Error(transcript))
    }

    /// Block until a worker is free, then take it. The scan is safe because
    /// a positive free count guarantees a non-empty slot.
    fn acquire(&self) -> (usize, Compiler) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        while state.free == 0 {
            state = self
                .available
                .wait(state)
                .expect("pool mutex poisoned");
        }
        state.free -= 1;
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if let Some(compiler) = slot.take() {
                return (index, compiler);
            }
        }
        unreachable!("positive free count with no occupied slot");
    }

    /// Return a worker to its slot and wake one waiter.
    fn release(&self, index: usize, compiler: Compiler) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        debug_assert!(state.slots[index].is_none());
        state.slots[index] = Some(compiler);
        state.free += 1;
        drop(state);
        self.available.notify_one();
    }

    /// Empty every slot and destroy the workers outside the pool lock.
    ///
    /// With `detach` set the workers are disowned first, so no subprocess is
    /// killed or waited on; used on the child side of a fork.
    pub fn shutdown(&self, detach: bool) {
        let drained: Vec<Compiler> = {
            let mut state = self.state.lock().expect("pool mutex poisoned");
            state.free = 0;
            state.slots.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        for mut compiler in drained {
            if detach {
                compiler.detach_from_process();
            }
            // Drop runs stop(), a no-op after detach.
        }
    }
}

/// Scoped lease of one pool worker.
///
/// Construction blocks until a worker is free; dropping the lease returns the
/// worker to its slot on every exit path. The lease is exclusive and cannot
/// be cloned.
pub struct CompilerLease<'p> {
    pool: &'p CompilerPool,
    index: usize,
    compiler: Option<Compiler>,
}

impl<'p> CompilerLease<'p> {
    /// Acquire a worker from the pool, blocking until one is free.
    pub fn new(pool: &'p CompilerPool) -> Self {
        let (index, compiler) = pool.acquire();
        Self {
            pool,
            index,
            compiler: Some(compiler),
        }
    }

    /// The leased worker.
    pub fn compiler(&mut self) -> &mut Compiler {
        self.compiler.as_mut().expect("lease holds a compiler")
    }
}

impl Drop for CompilerLease<'_> {
    fn drop(&mut self) {
        if let Some(compiler) = self.compiler.take() {
            self.pool.release(self.index, compiler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::RawAssembler;
    use crate::md5::Md5;

    fn md5() -> Md5 {
        "deadbeefdeadbeefdeadbeefdeadbeef".parse().unwrap()
    }

    fn pool_for(command: &str, workers: usize, max_retries: u64) -> (CompilerPool, Arc<Delegate>) {
        let delegate = Arc::new(Delegate::create().expect("failed to create delegate"));
        let config = PoolConfig::new(command)
            .with_workers(workers)
            .with_max_retries(max_retries)
            .with_inherit_config(false);
        (
            CompilerPool::new(config, delegate.clone(), Arc::new(RawAssembler)),
            delegate,
        )
    }

    // Mock that answers every code frame with a fixed reply.
    fn looping_mock(body_len: usize, reply: &str) -> String {
        format!(
            r#"printf '{{"version":"pool-mock"}}\n'
read -r discard
read -r cfg1
read -r cfg2
while read -r code; do
  head -c {} >/dev/null
  {}
done"#,
            body_len, reply
        )
    }

    #[test]
    fn test_start_caches_version() {
        let (pool, delegate) = pool_for(&looping_mock(0, ":"), 2, 0);
        pool.start().unwrap();
        assert_eq!(pool.version(), "pool-mock");
        pool.shutdown(false);
        delegate.shutdown();
    }

    #[test]
    fn test_lease_release_on_drop() {
        let (pool, delegate) = pool_for(&looping_mock(0, ":"), 2, 0);
        pool.start().unwrap();

        {
            let state = pool.state.lock().unwrap();
            assert_eq!(state.free, 2);
        }
        {
            let _lease = CompilerLease::new(&pool);
            let state = pool.state.lock().unwrap();
            assert_eq!(state.free, 1);
            assert_eq!(state.slots.iter().filter(|s| s.is_some()).count(), 1);
        }
        {
            let state = pool.state.lock().unwrap();
            assert_eq!(state.free, 2);
        }

        pool.shutdown(false);
        delegate.shutdown();
    }

    #[test]
    fn test_free_count_matches_occupied_slots() {
        let (pool, delegate) = pool_for(&looping_mock(0, ":"), 3, 0);
        pool.start().unwrap();

        let lease_a = CompilerLease::new(&pool);
        let lease_b = CompilerLease::new(&pool);
        {
            let state = pool.state.lock().unwrap();
            assert_eq!(state.free, 1);
            assert_eq!(
                state.slots.iter().filter(|s| s.is_some()).count(),
                state.free
            );
        }
        drop(lease_a);
        drop(lease_b);

        pool.shutdown(false);
        delegate.shutdown();
    }

    #[test]
    fn test_shutdown_empties_slots() {
        let (pool, delegate) = pool_for(&looping_mock(0, ":"), 2, 0);
        pool.start().unwrap();
        pool.shutdown(false);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.free, 0);
        assert!(state.slots.iter().all(|s| s.is_none()));
        drop(state);
        delegate.shutdown();
    }

    #[test]
    fn test_compile_error_single_attempt() {
        let source = b"<?hh bad";
        let reply =
            r#"printf '{"type":"error","bytes":0,"error":"syntax error at line 1"}\n'"#;
        let (pool, delegate) = pool_for(&looping_mock(source.len(), reply), 2, 2);
        pool.start().unwrap();

        let request = CompileRequest {
            filename: "bad.hh",
            md5: md5(),
            source,
            systemlib: false,
        };
        let outcome = pool.compile(&request).unwrap();
        assert_eq!(outcome.error().as_deref(), Some("syntax error at line 1"));

        pool.shutdown(false);
        delegate.shutdown();
    }

    #[test]
    fn test_exhausted_retries_accumulate_messages() {
        // Every incarnation dies right after reading the code frame header.
        let script = r#"printf '{"version":"mock"}\n'
read -r discard
read -r cfg1
read -r cfg2
read -r code
exit 0"#;
        let (pool, delegate) = pool_for(script, 2, 2);
        pool.start().unwrap();

        let request = CompileRequest {
            filename: "a.hh",
            md5: md5(),
            source: b"x",
            systemlib: false,
        };
        let message = pool.compile(&request).unwrap().error().unwrap();
        // max_retries = 2 means three attempts, newline-separated.
        assert_eq!(message.lines().count(), 3);

        pool.shutdown(false);
        delegate.shutdown();
    }
}
