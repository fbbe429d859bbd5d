//! Diagnostic reporting infrastructure.
//!
//! Effect-system faults are raised as typed errors by the passes and turned
//! into [`Diagnostic`]s at the driver boundary.
//!
//! # Error Codes
//!
//! - **E0400-E0499**: effect model and continuation-site errors
//! - **E0500-E0599**: host boundary and link errors

use std::io::{self, Write};

use ariadne::{Color, Label, Report, ReportKind, Source};

use crate::span::Span;

/// Compiler error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Effect errors (E0400-E0499)
    // ============================================================
    /// A perform or clause names an operation no effect declares.
    OperationNotFound = 400,
    /// An unqualified operation name matches several effects.
    AmbiguousOperation = 401,
    /// A reference to an effect that is not declared.
    UnknownEffect = 402,
    /// An operation with neither an owner annotation nor an enclosing effect.
    OrphanOperation = 403,
    /// Two modules declare the same effect with different operations.
    EffectShapeMismatch = 404,
    /// A site or handler refers to an undeclared function.
    UnknownFunction = 405,
    /// A continuation site captures the same value twice.
    DuplicateCapture = 406,

    // ============================================================
    // Host boundary / link errors (E0500-E0599)
    // ============================================================
    /// Two perform sites disagree on an operation's host signature.
    SignatureConflict = 500,
    /// An emitted module failed structural verification.
    InvalidModule = 501,
}

impl ErrorCode {
    /// Get the formatted error code string (e.g., "E0400").
    pub fn as_str(&self) -> String {
        format!("E{:04}", *self as u16)
    }

    /// Get a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::OperationNotFound => "operation not found",
            ErrorCode::AmbiguousOperation => "ambiguous operation",
            ErrorCode::UnknownEffect => "unknown effect",
            ErrorCode::OrphanOperation => "operation has no owning effect",
            ErrorCode::EffectShapeMismatch => "effect declared with different operations",
            ErrorCode::UnknownFunction => "unknown function",
            ErrorCode::DuplicateCapture => "duplicate captured value",
            ErrorCode::SignatureConflict => "conflicting host signatures",
            ErrorCode::InvalidModule => "emitted module is invalid",
        }
    }

    /// Get a help message suggesting how to fix the error.
    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::AmbiguousOperation => Some("qualify the operation with its effect, e.g. `Effect.op`"),
            ErrorCode::OrphanOperation => Some("declare the operation inside an effect or annotate its owner effect"),
            ErrorCode::SignatureConflict => {
                Some("every perform of a host operation must use the same parameter and result types")
            }
            ErrorCode::EffectShapeMismatch => Some("declare the effect once and import it where it is used"),
            _ => None,
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error,
    Warning,
    Note,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// The error code (e.g., "E0400").
    pub code: Option<String>,
    pub message: String,
    /// The primary span where the error occurred.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            ..Self::error(message, span)
        }
    }

    /// Set the error code and attach its help text.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code.as_str());
        if let Some(help) = code.help() {
            self.suggestions.push(help.to_string());
        }
        self
    }

    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }
}

/// A secondary label in a diagnostic.
#[derive(Debug, Clone)]
pub struct DiagnosticLabel {
    pub span: Span,
    pub message: String,
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Renders diagnostics against a source file.
///
/// When no source text is available the diagnostic is printed as a single
/// `error[E0400]: message` line followed by its suggestions.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self { filename, source }
    }

    /// Emit a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) -> io::Result<()> {
        self.write(diagnostic, io::stderr().lock())
    }

    /// Render a diagnostic into `out`.
    pub fn write<W: Write>(&self, diagnostic: &Diagnostic, mut out: W) -> io::Result<()> {
        let message = match &diagnostic.code {
            Some(code) => format!("[{}] {}", code, diagnostic.message),
            None => diagnostic.message.clone(),
        };

        if self.source.is_empty() {
            writeln!(out, "{}: {}", diagnostic.kind.as_str(), message)?;
            for suggestion in &diagnostic.suggestions {
                writeln!(out, "  = help: {}", suggestion)?;
            }
            return Ok(());
        }

        let len = self.source.len();
        let span = diagnostic.span.clamp(len);
        let mut builder = Report::build(diagnostic.kind.to_report_kind(), self.filename, span.start)
            .with_message(&message)
            .with_label(
                Label::new((self.filename, span.start..span.end))
                    .with_color(diagnostic.kind.color())
                    .with_message(&diagnostic.message),
            );

        for label in &diagnostic.labels {
            let span = label.span.clamp(len);
            let color = if label.primary {
                diagnostic.kind.color()
            } else {
                Color::Blue
            };
            builder = builder.with_label(
                Label::new((self.filename, span.start..span.end))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            builder = builder.with_help(diagnostic.suggestions.join("\n"));
        }

        builder
            .finish()
            .write((self.filename, Source::from(self.source)), out)
    }
}
