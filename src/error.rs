use miette::{Diagnostic, NamedSource, SourceSpan};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Prefix attached to every analysis error: `file:row:col: `.
///
/// The file is absent for anonymous sources and the row/column pair is absent
/// when the error is an end-of-input condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<String>,
    pub position: Option<(usize, usize)>,
}

impl Location {
    pub fn new(file: Option<String>, position: Option<(usize, usize)>) -> Self {
        Self { file, position }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
        }
        if let Some((row, col)) = self.position {
            write!(f, "{row}:{col}:")?;
        }
        if self.file.is_some() || self.position.is_some() {
            write!(f, " ")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum SteamdError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Lexer(#[from] LexerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Symbol(#[from] SymbolError),
}

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum LexerError {
    #[error("{location}invalid UTF-8 in source")]
    #[diagnostic(
        code(lexer::invalid_encoding),
        help("steamd sources must be valid UTF-8 text.")
    )]
    InvalidEncoding {
        location: Location,
        #[source_code]
        src: NamedSource<String>,
        #[label("this byte does not start a valid UTF-8 character")]
        span: SourceSpan,
    },
}

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum ParserError {
    #[error("{location}unexpected token {found:?}")]
    #[diagnostic(
        code(parser::unexpected_token),
        help("The analyzer found a token it did not expect in this position.")
    )]
    UnexpectedToken {
        location: Location,
        found: String,
        expected: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("expected {expected}, but found this")]
        span: SourceSpan,
    },

    #[error("{location}unexpected end of input")]
    #[diagnostic(
        code(parser::unexpected_eof),
        help("The file ended while the analyzer still expected {expected}.")
    )]
    UnexpectedEof {
        location: Location,
        expected: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("file ended here")]
        span: SourceSpan,
    },

    #[error("{location}cannot resolve {name:?}")]
    #[diagnostic(
        code(parser::unresolved_reference),
        help("Only the last part of a namespaced name may refer to something declared later.")
    )]
    UnresolvedReference {
        location: Location,
        name: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("{name} is not declared at this point")]
        span: SourceSpan,
    },

    #[error("{location}symbol {name:?} is already declared in {scope}")]
    #[diagnostic(
        code(parser::redeclaration),
        help("Names must be unique within a class, an enum or the top level of a file.")
    )]
    Redeclaration {
        location: Location,
        name: String,
        scope: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("second declaration of {name}")]
        span: SourceSpan,
    },
}

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum ImportError {
    #[error("{location}imported file {path:?} was not found")]
    #[diagnostic(code(import::not_found))]
    NotFound {
        location: Location,
        path: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("imported here")]
        span: SourceSpan,
    },

    #[error("{location}failed to read imported file {path:?}")]
    #[diagnostic(code(import::io))]
    Io {
        location: Location,
        path: String,
        #[source]
        source: Arc<std::io::Error>,
        #[source_code]
        src: NamedSource<String>,
        #[label("imported here")]
        span: SourceSpan,
    },

    #[error("{location}cyclic import: {cycle}")]
    #[diagnostic(
        code(import::cycle),
        help("Break the cycle by moving the shared declarations into a separate file.")
    )]
    Cycle {
        location: Location,
        cycle: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("this import closes the cycle")]
        span: SourceSpan,
    },

    #[error("{location}symbol {name:?} imported from {file} collides with an existing declaration")]
    #[diagnostic(code(import::symbol_collision))]
    SymbolCollision {
        location: Location,
        name: String,
        file: String,
        #[source_code]
        src: NamedSource<String>,
        #[label("imported here")]
        span: SourceSpan,
    },
}

/// Symbol table violations reported by [`crate::ast::Tree`] itself.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum SymbolError {
    #[error("cannot add a symbol with an empty name to {scope}")]
    #[diagnostic(code(symbol::empty_name))]
    EmptyName { scope: String },

    #[error("symbol {name:?} already exists in {scope}")]
    #[diagnostic(code(symbol::redeclared))]
    Redeclared { name: String, scope: String },
}

/// Failure reported by a [`crate::resolver::SourceLoader`].
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{} not found", path.display())]
    NotFound { path: PathBuf },

    #[error("could not read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Maps an I/O failure, keeping "not found" apart from everything else.
    pub fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            LoadError::NotFound { path }
        } else {
            LoadError::Io { path, source }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_prefix_forms() {
        let full = Location::new(Some("a.steamd".to_string()), Some((3, 7)));
        assert_eq!(full.to_string(), "a.steamd:3:7: ");

        let eof = Location::new(Some("a.steamd".to_string()), None);
        assert_eq!(eof.to_string(), "a.steamd: ");

        let anonymous = Location::new(None, Some((1, 2)));
        assert_eq!(anonymous.to_string(), "1:2: ");

        assert_eq!(Location::default().to_string(), "");
    }

    #[test]
    fn test_load_error_keeps_not_found_distinct() {
        let missing = LoadError::from_io(
            PathBuf::from("x.steamd"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(missing, LoadError::NotFound { .. }));

        let denied = LoadError::from_io(
            PathBuf::from("x.steamd"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(denied, LoadError::Io { .. }));
    }
}
