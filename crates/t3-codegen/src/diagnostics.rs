//! Accumulating, non-fatal diagnostics (§7, §7.1).
//!
//! Most of the §7 error taxonomy must not abort compilation -- the
//! generator's whole point is to surface as many problems as one run can
//! find. Those are collected here, as an explicit `&mut DiagnosticSink`
//! threaded into the generator, rather than a global mutable error count
//! (Design Note, §9). The jump threader and image writer both check
//! [`DiagnosticSink::has_errors`] at their entry points and refuse to run
//! over possibly-malformed code once it's true.
//!
//! Rendering goes through `codespan-reporting` + `termcolor`, the same
//! façade the sibling parser and checker crates in this workspace use --
//! this crate owns no source text of its own, so a caller supplies the
//! `SimpleFiles` populated from whatever it parsed.

use codespan_reporting::diagnostic::{Diagnostic as CrDiagnostic, Label as CrLabel};
use codespan_reporting::files::{Error as FilesError, SimpleFiles};
use codespan_reporting::term::{self, Config};
use termcolor::{ColorChoice, StandardStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// One entry from the §7 error taxonomy, plus the Design Note's
/// `BadMetaForNew` decision (§9) and the `MMINH_UNDEF_FUNC` scenario (§8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagKind {
    InvalidLvalue,
    InvalidUnaryLvalue,
    SelfNotAvailable,
    InvalidNewExpr,
    WrongArgc,
    UndefinedLabel,
    TooManyCtorArgs,
    ExprTooComplex,
    ConstPoolOver32K,
    CodePoolOver32K,
    IntConstOverflow,
    BadMetaForNew,
    MmInhUndefFunc,
    /// A statement left the simulated operand stack at a different depth
    /// than it found it -- §4.4's per-statement balance contract. Always an
    /// internal generator bug, never a source-level error.
    StackImbalance,
}

impl DiagKind {
    pub fn code(self) -> &'static str {
        match self {
            DiagKind::InvalidLvalue => "CG0001",
            DiagKind::InvalidUnaryLvalue => "CG0002",
            DiagKind::SelfNotAvailable => "CG0003",
            DiagKind::InvalidNewExpr => "CG0004",
            DiagKind::WrongArgc => "CG0005",
            DiagKind::UndefinedLabel => "CG0006",
            DiagKind::TooManyCtorArgs => "CG0007",
            DiagKind::ExprTooComplex => "CG0008",
            DiagKind::ConstPoolOver32K => "CG0009",
            DiagKind::CodePoolOver32K => "CG0010",
            DiagKind::IntConstOverflow => "CG0011",
            DiagKind::BadMetaForNew => "BAD_META_FOR_NEW",
            DiagKind::MmInhUndefFunc => "MMINH_UNDEF_FUNC",
            DiagKind::StackImbalance => "CG0012",
        }
    }

    /// The severity a code carries unless the call site overrides it.
    /// `ConstPoolOver32K`/`CodePoolOver32K`/`IntConstOverflow` warn and
    /// continue; everything else is reported as an error (§7).
    pub fn default_severity(self) -> Severity {
        match self {
            DiagKind::ConstPoolOver32K | DiagKind::CodePoolOver32K | DiagKind::IntConstOverflow => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

/// A byte-offset range into a named source file, reported by the
/// out-of-scope parser on each AST node; this crate only carries it through.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub file_id: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagKind,
    pub message: String,
    pub span: Option<Span>,
}

#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, code: DiagKind, message: impl Into<String>, span: Option<Span>) {
        self.diagnostics.push(Diagnostic {
            severity: code.default_severity(),
            code,
            message: message.into(),
            span,
        });
    }

    pub fn error(&mut self, code: DiagKind, message: impl Into<String>) {
        self.report(code, message, None);
    }

    pub fn error_at(&mut self, code: DiagKind, message: impl Into<String>, span: Span) {
        self.report(code, message, Some(span));
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Render every accumulated diagnostic to `out`, resolving spans against
    /// `files`.
    pub fn emit(
        &self,
        files: &SimpleFiles<String, String>,
        out: &mut StandardStream,
    ) -> Result<(), FilesError> {
        let config = Config::default();
        for diag in &self.diagnostics {
            let mut rendered = match diag.severity {
                Severity::Error => CrDiagnostic::error(),
                Severity::Warning => CrDiagnostic::warning(),
            }
            .with_message(diag.message.clone())
            .with_code(diag.code.code());
            if let Some(span) = diag.span {
                rendered =
                    rendered.with_labels(vec![CrLabel::primary(span.file_id, span.start..span.end)]);
            }
            term::emit(out, &config, files, &rendered)?;
        }
        Ok(())
    }
}

/// A terminal sink that only colorizes when stderr is actually a terminal,
/// matching how the sibling parser/checker crates choose `ColorChoice`.
pub fn stderr_writer() -> StandardStream {
    StandardStream::stderr(ColorChoice::Auto)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut sink = DiagnosticSink::new();
        sink.error(DiagKind::IntConstOverflow, "promoted to BigNumber");
        assert!(!sink.has_errors());
        assert_eq!(sink.error_count(), 0);
    }

    #[test]
    fn errors_are_counted() {
        let mut sink = DiagnosticSink::new();
        sink.error(DiagKind::UndefinedLabel, "label never defined");
        sink.error(DiagKind::WrongArgc, "too many arguments");
        assert!(sink.has_errors());
        assert_eq!(sink.error_count(), 2);
    }

    #[test]
    fn bad_meta_for_new_renders_the_design_note_code() {
        assert_eq!(DiagKind::BadMetaForNew.code(), "BAD_META_FOR_NEW");
    }

    #[test]
    fn emit_does_not_error_on_an_empty_sink() {
        let sink = DiagnosticSink::new();
        let files = SimpleFiles::new();
        let mut out = StandardStream::stderr(ColorChoice::Never);
        assert!(sink.emit(&files, &mut out).is_ok());
    }
}
