//! Caret diagnostics for class-list lines.

use std::fmt;

const OUT_OF_SYNC: &str = "Your classlist may be out of sync with the JDK or the application.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: String,
    /// 1-based.
    pub line_no: usize,
    /// 0-based byte index into `line`.
    pub column: usize,
    pub line: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(file: &str, line_no: usize, line: &str, column: usize, message: impl Into<String>) -> Self {
        Self {
            file: file.to_string(),
            line_no,
            column,
            line: line.to_string(),
            message: message.into(),
        }
    }

    /// Column the caret points at: within the line, or 0 for an empty line.
    fn caret_index(&self) -> usize {
        self.column.min(self.line.len().saturating_sub(1))
    }

    /// The diagnostic followed by the out-of-sync hint used for
    /// constant-pool warnings.
    pub fn render_warning(&self) -> String {
        format!("{self}{OUT_OF_SYNC}")
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.caret_index();
        writeln!(
            f,
            "An error has occurred while processing class list file {} {}:{}.",
            self.file,
            self.line_no,
            index + 1
        )?;
        if self.line.is_empty() {
            return writeln!(f, "{}", self.message);
        }
        writeln!(f, "{}:", self.message)?;
        writeln!(f, "{}", self.line)?;
        writeln!(f, "{}^", " ".repeat(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caret_under_column() {
        let d = Diagnostic::new("app.classlist", 3, "app/Main id: x", 13, "Error: expected integer");
        assert_eq!(
            d.to_string(),
            "An error has occurred while processing class list file app.classlist 3:14.\n\
             Error: expected integer:\n\
             app/Main id: x\n             ^\n"
        );
    }

    #[test]
    fn test_caret_clamped_to_line() {
        let d = Diagnostic::new("f", 1, "abc", 40, "m");
        assert!(d.to_string().ends_with("abc\n  ^\n"));
        assert!(d.render_warning().ends_with("application."));
        let empty = Diagnostic::new("f", 1, "", 0, "m");
        assert_eq!(empty.to_string(), "An error has occurred while processing class list file f 1:1.\nm\n");
    }
}
