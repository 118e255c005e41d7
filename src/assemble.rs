//! The assembler seam and compile request/result types.
//!
//! The external compiler replies with a textual artifact; a local assembler
//! (an external collaborator, reached through the [`Assemble`] trait) turns
//! that text into an in-memory unit.

use crate::md5::Md5;
use std::sync::Arc;
use thiserror::Error;

/// One compilation request.
#[derive(Debug, Clone, Copy)]
pub struct CompileRequest<'a> {
    /// Path of the source file, forwarded to the worker verbatim.
    pub filename: &'a str,
    /// Content hash of `source`.
    pub md5: Md5,
    /// Source bytes.
    pub source: &'a [u8],
    /// True while the host is still bootstrapping its built-in library.
    pub systemlib: bool,
}

/// An in-memory compiled unit, produced by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// Source filename the unit was compiled from.
    pub filename: String,
    /// Content hash of the source.
    pub md5: Md5,
    /// Assembled payload.
    pub data: Vec<u8>,
}

/// The outcome of a pooled compilation: either an assembled unit or a
/// compile-error message for the caller to surface.
#[derive(Debug)]
pub enum CompileOutcome {
    /// Compilation and assembly succeeded.
    Unit(Unit),
    /// The compiler rejected the source (or the retry budget was exhausted;
    /// in that case the string is the accumulated transport errors).
    Error(String),
}

impl CompileOutcome {
    /// The unit, if compilation succeeded.
    pub fn unit(self) -> Option<Unit> {
        match self {
            Self::Unit(unit) => Some(unit),
            Self::Error(_) => None,
        }
    }

    /// The error message, if compilation failed.
    pub fn error(self) -> Option<String> {
        match self {
            Self::Unit(_) => None,
            Self::Error(message) => Some(message),
        }
    }
}

/// Raised by an assembler that cannot accept the compiler's output.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct AssembleError(pub String);

/// Converts the compiler's textual reply into an in-memory [`Unit`].
pub trait Assemble: Send + Sync {
    /// Assemble one reply body.
    fn assemble(
        &self,
        filename: &str,
        md5: &Md5,
        text: &[u8],
    ) -> std::result::Result<Unit, AssembleError>;
}

/// Shared handle to an assembler.
pub type AssemblerRef = Arc<dyn Assemble>;

/// Assembler that stores the compiler's reply verbatim. Useful for hosts
/// that only want the textual artifact, and for tests.
#[derive(Debug, Default)]
pub struct RawAssembler;

impl Assemble for RawAssembler {
    fn assemble(
        &self,
        filename: &str,
        md5: &Md5,
        text: &[u8],
    ) -> std::result::Result<Unit, AssembleError> {
        Ok(Unit {
            filename: filename.to_string(),
            md5: *md5,
            data: text.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md5() -> Md5 {
        "0123456789abcdef0123456789abcdef".parse().unwrap()
    }

    #[test]
    fn test_raw_assembler_passthrough() {
        let unit = RawAssembler
            .assemble("a.hh", &md5(), b"bytecode1")
            .unwrap();
        assert_eq!(unit.filename, "a.hh");
        assert_eq!(unit.data, b"bytecode1");
    }

    #[test]
    fn test_outcome_accessors() {
        let unit = RawAssembler.assemble("a.hh", &md5(), b"x").unwrap();
        assert!(CompileOutcome::Unit(unit).unit().is_some());
        assert_eq!(
            CompileOutcome::Error("nope".into()).error().as_deref(),
            Some("nope")
        );
    }
}
