use crate::error::{LexerError, Location, SteamdError};
use crate::utils::advance_line_and_column;
use miette::NamedSource;
use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};
use std::collections::VecDeque;
use std::fmt;

/// The single composed pattern. Alternatives are tried left to right, so the
/// order of the groups decides the classification of ambiguous spans.
const PATTERN: &str = concat!(
    r"(?m:(?P<whitespace>\s+)|",
    r"(?P<terminator>;)|",
    r#""(?P<string>.+?)"|"#,
    r"//(?P<comment>.*)$|",
    r"(?P<identifier>-?[a-zA-Z_0-9][a-zA-Z0-9_.]*)|",
    r"(?P<namespace>::)|",
    r"\#(?P<preprocess>[a-zA-Z]*)|",
    r"(?P<operator>[{}<>\]=|])|",
    r"(?P<invalid>[^\s]+))",
);

static PATTERN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(PATTERN).expect("token pattern is a valid regex"));

/// Group names paired with their classification, in pattern priority order.
const GROUPS: [(&str, TokenType); 9] = [
    ("whitespace", TokenType::Whitespace),
    ("terminator", TokenType::Terminator),
    ("string", TokenType::String),
    ("comment", TokenType::Comment),
    ("identifier", TokenType::Identifier),
    ("namespace", TokenType::Namespace),
    ("preprocess", TokenType::Preprocess),
    ("operator", TokenType::Operator),
    ("invalid", TokenType::Invalid),
];

/// Classification of a lexed span.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum TokenType {
    /// Blank space. Recognized for position tracking, never emitted.
    Whitespace,
    /// Statement terminator `;`.
    Terminator,
    /// A double-quoted string. The token value excludes the quotes.
    String,
    /// `//` up to the end of the line. Recognized, never emitted.
    Comment,
    /// Names, keywords and numeric literals alike.
    Identifier,
    /// The `::` separator of namespaced identifiers.
    Namespace,
    /// `#` followed by letters, e.g. `#import`. The value excludes the `#`.
    Preprocess,
    /// One of `{ } < > ] = |`.
    Operator,
    /// Any other run of non-blank characters.
    Invalid,
}

impl TokenType {
    /// Lowercase name of the classification, as used in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Whitespace => "whitespace",
            TokenType::Terminator => "terminator",
            TokenType::String => "string",
            TokenType::Comment => "comment",
            TokenType::Identifier => "identifier",
            TokenType::Namespace => "namespace",
            TokenType::Preprocess => "preprocess",
            TokenType::Operator => "operator",
            TokenType::Invalid => "invalid",
        }
    }

    /// Whether spans of this type are dropped from the token stream.
    pub fn is_insignificant(self) -> bool {
        matches!(self, TokenType::Whitespace | TokenType::Comment)
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified span of the input with its position.
#[derive(Debug, Clone)]
pub struct Token {
    pub ttype: TokenType,
    /// The captured text, e.g. `import` for `#import` or the string contents.
    pub value: String,
    /// The full matched text.
    pub raw: String,
    /// 1-based line of the first character.
    pub row: usize,
    /// 1-based column of the first character, in characters.
    pub col: usize,
    pub pos_start: usize,
    pub pos_end: usize,
}

impl Token {
    /// Same classification and a case-insensitive equal value.
    pub fn matches(&self, ttype: TokenType, value: &str) -> bool {
        self.ttype == ttype && self.value.eq_ignore_ascii_case(value)
    }
}

/// Tokens compare by classification and case-insensitive value; position and
/// raw text are ignored.
impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.ttype, &other.value)
    }
}

/// FIFO of significant tokens, consumed front to back by the analyzer.
#[derive(Debug, Default, Clone)]
pub struct TokenStream {
    tokens: VecDeque<Token>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, token: Token) {
        self.tokens.push_back(token);
    }

    pub fn peek(&self) -> Option<&Token> {
        self.tokens.front()
    }

    pub fn dequeue(&mut self) -> Option<Token> {
        self.tokens.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The values of the remaining tokens, front first.
    pub fn values(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.value.as_str()).collect()
    }
}

impl FromIterator<Token> for TokenStream {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

impl Iterator for TokenStream {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        self.dequeue()
    }
}

/// Joins the values of a token slice, e.g. the components of `A::B`.
pub fn token_values(tokens: &[Token]) -> Vec<&str> {
    tokens.iter().map(|t| t.value.as_str()).collect()
}

pub struct Lexer<'a> {
    input: &'a [u8],
    name: Option<String>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            name: None,
            line: 1,
            column: 1,
        }
    }

    /// Attaches the file identifier reported in error messages.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Classifies the whole input in one pass over the composed pattern.
    pub fn tokenize(mut self) -> Result<TokenStream, SteamdError> {
        let mut stream = TokenStream::new();
        let mut last_end = 0;

        for caps in PATTERN_REGEX.captures_iter(self.input) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            // Bytes the pattern skipped still move the cursor.
            self.advance(last_end, whole.start())?;

            let row = self.line;
            let col = self.column;
            self.advance(whole.start(), whole.end())?;
            last_end = whole.end();

            let Some((ttype, value)) = classify(&caps) else {
                continue;
            };
            if ttype.is_insignificant() {
                continue;
            }

            stream.push(Token {
                ttype,
                value: String::from_utf8_lossy(value).into_owned(),
                raw: String::from_utf8_lossy(whole.as_bytes()).into_owned(),
                row,
                col,
                pos_start: whole.start(),
                pos_end: whole.end(),
            });
        }
        self.advance(last_end, self.input.len())?;

        Ok(stream)
    }

    fn advance(&mut self, start: usize, end: usize) -> Result<(), SteamdError> {
        if start >= end {
            return Ok(());
        }
        match std::str::from_utf8(&self.input[start..end]) {
            Ok(text) => {
                (self.line, self.column) = advance_line_and_column(text, self.line, self.column);
                Ok(())
            }
            Err(err) => {
                let valid = err.valid_up_to();
                // The prefix was just validated, so this cannot fail.
                let prefix = std::str::from_utf8(&self.input[start..start + valid]).unwrap_or("");
                let (line, column) = advance_line_and_column(prefix, self.line, self.column);
                let bad = start + valid;
                Err(LexerError::InvalidEncoding {
                    location: Location::new(self.name.clone(), Some((line, column))),
                    src: NamedSource::new(
                        self.name.clone().unwrap_or_default(),
                        String::from_utf8_lossy(self.input).into_owned(),
                    ),
                    span: (bad, err.error_len().unwrap_or(1)).into(),
                }
                .into())
            }
        }
    }
}

fn classify<'h>(caps: &Captures<'h>) -> Option<(TokenType, &'h [u8])> {
    GROUPS
        .iter()
        .find_map(|(name, ttype)| caps.name(name).map(|m| (*ttype, m.as_bytes())))
}
