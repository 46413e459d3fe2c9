pub mod api;
pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod utils;

pub use api::{analyze, analyze_file, analyze_with, Analysis};
pub use error::SteamdError;
pub use resolver::{AnalyzerOptions, FsLoader, MemoryLoader, MergePolicy, SourceLoader};
