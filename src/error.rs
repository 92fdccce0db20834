use std::fmt;

/// A single compile-time diagnostic, already formatted the way the CLI
/// prints it: `[line N] Error at 'lexeme': message`.
#[derive(Debug)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

/// Raised by the VM's executor loop; `main.rs` prints it together with the
/// call-stack trace accumulated in `trace` before exiting.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.trace {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
