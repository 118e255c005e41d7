//! xcc - pooled out-of-process compiler client.
//!
//! A long-lived host delegates compilation of source files to a fixed-size
//! pool of persistent external compiler subprocesses. Each worker speaks a
//! length-prefixed JSON framing protocol over its stdio pipes; the textual
//! artifact it returns is handed to a host-provided assembler which produces
//! the in-memory compiled unit.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │   Host process   │
//!                  │  (PoolManager)   │
//!                  └───┬──────────┬───┘
//!                      │          │
//!               ┌──────▼───┐  ┌───▼──────┐
//!               │ Delegate │  │   Pool   │
//!               │ (spawns) │  │ (leases) │
//!               └──────────┘  └───┬──────┘
//!                    ┌────────────┼────────────┐
//!              ┌─────▼─────┐┌─────▼─────┐┌─────▼─────┐
//!              │ Worker 1  ││ Worker 2  ││ Worker N  │
//!              │ (process) ││ (process) ││ (process) │
//!              └───────────┘└───────────┘└───────────┘
//! ```
//!
//! # Features
//!
//! - **Blocking leases**: callers queue on a condition variable when every
//!   worker is busy; a lease grants exclusive use of one worker.
//! - **Crash recovery**: transport failures kill the worker and are retried
//!   under the same lease; compile errors are returned without a retry.
//! - **Fork safety**: spawning and reaping go through a delegate subprocess,
//!   and an `atfork` hook detaches a forked child from the parent's workers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xcc::{CompileRequest, PoolConfig, RawAssembler};
//!
//! xcc::configure(
//!     PoolConfig::new("hackc --daemon").with_workers(4),
//!     Arc::new(RawAssembler),
//! );
//! xcc::ensure_started().unwrap();
//!
//! let request = CompileRequest {
//!     filename: "a.hh",
//!     md5: "deadbeefdeadbeefdeadbeefdeadbeef".parse().unwrap(),
//!     source: b"<?hh echo 1;",
//!     systemlib: false,
//! };
//! match xcc::compile(&request).unwrap() {
//!     xcc::CompileOutcome::Unit(unit) => println!("{} bytes", unit.data.len()),
//!     xcc::CompileOutcome::Error(message) => eprintln!("{}", message),
//! }
//! ```

mod assemble;
mod compiler;
mod config;
mod delegate;
mod error;
mod ipc;
mod manager;
mod md5;
mod pool;
mod protocol;

pub use assemble::{
    Assemble, AssembleError, AssemblerRef, CompileOutcome, CompileRequest, RawAssembler, Unit,
};
pub use config::{ConfigBuilder, PoolConfig};
pub use delegate::{Delegate, WaitOutcome};
pub use error::{Result, XccError};
pub use manager::{manager, PoolManager};
pub use md5::Md5;
pub use pool::{CompilerLease, CompilerPool};

/// Install the pool configuration and assembler on the process-wide manager.
/// Takes effect at the next (first) start.
pub fn configure(config: PoolConfig, assembler: AssemblerRef) {
    manager().configure(config, assembler);
}

/// Set the user workers run as. Must precede the first start.
pub fn set_user(username: impl Into<String>) {
    manager().set_user(username);
}

/// Start the process-wide pool if it is not already running. Idempotent.
pub fn ensure_started() -> Result<()> {
    manager().ensure_started()
}

/// Whether the process-wide pool is present and started.
pub fn enabled() -> bool {
    manager().enabled()
}

/// Compile one source file through the process-wide pool.
pub fn compile(request: &CompileRequest<'_>) -> Result<CompileOutcome> {
    manager().compile(request)
}

/// The external compiler's version string.
pub fn version() -> Result<String> {
    manager().version()
}

/// Stop the process-wide pool, terminating its workers.
pub fn shutdown() {
    manager().shutdown();
}

/// Drop the process-wide pool without killing or waiting on any subprocess.
/// Invoked automatically in the child after a fork.
pub fn detach_after_fork() {
    manager().detach_after_fork();
}
