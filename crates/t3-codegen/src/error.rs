//! Compilation errors.
//!
//! Per §7.1, only genuinely fatal, single-shot failures live here: an
//! unresolved fixup or a verifier rejection are generator bugs rather than
//! user-facing mistakes, an I/O failure while writing the image aborts
//! immediately, and a speculative-eval call is refused outright. The bulk of
//! the §7 taxonomy -- bad lvalues, wrong argument counts, undefined labels,
//! and so on -- are non-fatal and accumulate in a [`crate::diagnostics::DiagnosticSink`]
//! instead, so one compilation run can surface more than one of them.

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("a fixup was never resolved: {0}")]
    UnresolvedReference(#[from] t3_bytecode::AnchorError),

    #[error("generated code failed verification: {0}")]
    Verification(#[from] t3_bytecode::VerifyError),

    #[error("method call with arguments is not permitted during speculative debugger evaluation")]
    BadSpecEval,

    #[error("image write failed: {0}")]
    Image(#[from] t3_bytecode::ImageError),

    #[error("internal compiler error: {message}")]
    Internal { message: String },
}
