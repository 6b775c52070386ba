//! The output log sink and the pipeline's error reporter.
//!
//! Hosts that want compiler diagnostics implement [`OutputLog`] and pass
//! it to `Isolate::compile`. All user-facing pipeline output (AST/IR/ASM
//! dumps, warnings and errors) flows through one [`ErrorReporter`] so
//! that source positions are translated to line/column in a single place.

use crate::error::Error;

/// Category of an output message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// AST dump before optimization.
    AstInitial,
    /// AST dump after optimization.
    AstFinal,
    /// IR dump before the machine-independent pass.
    IrInitial,
    /// IR dump after the machine-independent pass.
    IrFinal,
    /// Disassembled machine code.
    Asm,
    /// Informational message or warning.
    Info,
    /// Compilation error.
    Error,
}

/// One log message. `line` is 1-based, `column` 0-based; both are zero
/// for messages without a source position (dumps, internal errors).
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub kind: MessageKind,
    pub line: u32,
    pub column: u32,
    pub text: &'a str,
}

/// Sink for compiler output. Implementations are driven synchronously
/// from within `compile`; the borrow ends when compilation returns.
pub trait OutputLog {
    fn log(&mut self, message: &Message<'_>);
}

/// Translates byte positions to line/column and routes messages to the
/// optional log sink. Owned by the compile driver for the duration of
/// one compilation.
pub struct ErrorReporter<'src, 'log> {
    body: &'src [u8],
    log: Option<&'log mut dyn OutputLog>,
    verbose: bool,
}

impl<'src, 'log> ErrorReporter<'src, 'log> {
    pub fn new(
        body: &'src [u8],
        log: Option<&'log mut dyn OutputLog>,
        verbose: bool,
    ) -> Self {
        Self { body, log, verbose }
    }

    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    /// Computes the 1-based line and 0-based column of a byte position by
    /// scanning backward to the preceding newline. Positions past the end
    /// of the buffer report as (0, 0).
    pub fn line_col(&self, position: u32) -> (u32, u32) {
        let pos = position as usize;
        if pos >= self.body.len() {
            return (0, 0);
        }
        let before = &self.body[..pos];
        let line = 1 + before.iter().filter(|&&b| b == b'\n').count() as u32;
        let column = match before.iter().rposition(|&b| b == b'\n') {
            Some(nl) => (pos - nl - 1) as u32,
            None => pos as u32,
        };
        (line, column)
    }

    /// Emits a positionless dump message (AST/IR/ASM).
    pub fn dump(&mut self, kind: MessageKind, text: &str) {
        if let Some(log) = self.log.as_deref_mut() {
            log.log(&Message { kind, line: 0, column: 0, text });
        }
    }

    /// Emits an info message when verbose output was requested.
    pub fn info(&mut self, text: &str) {
        if self.verbose {
            if let Some(log) = self.log.as_deref_mut() {
                log.log(&Message { kind: MessageKind::Info, line: 0, column: 0, text });
            }
        }
    }

    /// Emits a warning at a source position. Warnings never change the
    /// compile result.
    pub fn warning(&mut self, position: u32, text: &str) {
        let (line, column) = self.line_col(position);
        if let Some(log) = self.log.as_deref_mut() {
            log.log(&Message { kind: MessageKind::Info, line, column, text });
        }
    }

    /// Logs an error at a source position and passes the error through,
    /// so call sites read `return Err(reporter.error(err, pos, msg))`.
    pub fn error(&mut self, err: Error, position: u32, text: &str) -> Error {
        let (line, column) = self.line_col(position);
        if let Some(log) = self.log.as_deref_mut() {
            log.log(&Message { kind: MessageKind::Error, line, column, text });
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture {
        messages: Vec<(MessageKind, u32, u32, String)>,
    }

    impl OutputLog for Capture {
        fn log(&mut self, m: &Message<'_>) {
            self.messages.push((m.kind, m.line, m.column, m.text.to_string()));
        }
    }

    #[test]
    fn line_and_column() {
        let body = b"first line\nsecond line\nthird";
        let reporter = ErrorReporter::new(body, None, false);

        assert_eq!(reporter.line_col(0), (1, 0));
        assert_eq!(reporter.line_col(6), (1, 6));
        assert_eq!(reporter.line_col(11), (2, 0));
        assert_eq!(reporter.line_col(18), (2, 7));
        assert_eq!(reporter.line_col(23), (3, 0));
        // Past-the-end positions have no location.
        assert_eq!(reporter.line_col(1000), (0, 0));
    }

    #[test]
    fn error_routes_to_log_and_returns() {
        let body = b"float x = \"oops\";";
        let mut capture = Capture::default();
        {
            let mut reporter = ErrorReporter::new(body, Some(&mut capture), false);
            let err = reporter.error(Error::InvalidCast, 10, "cannot cast 'str' to 'float'");
            assert_eq!(err, Error::InvalidCast);
        }
        assert_eq!(capture.messages.len(), 1);
        let (kind, line, column, text) = &capture.messages[0];
        assert_eq!(*kind, MessageKind::Error);
        assert_eq!(*line, 1);
        assert_eq!(*column, 10);
        assert!(text.contains("float"));
    }

    #[test]
    fn info_respects_verbose() {
        let mut capture = Capture::default();
        {
            let mut reporter = ErrorReporter::new(b"", Some(&mut capture), false);
            reporter.info("quiet");
        }
        assert!(capture.messages.is_empty());
        {
            let mut reporter = ErrorReporter::new(b"", Some(&mut capture), true);
            reporter.info("loud");
        }
        assert_eq!(capture.messages.len(), 1);
    }
}
