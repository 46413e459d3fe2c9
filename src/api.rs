use crate::ast::{NodeId, NodeKind, Tree};
use crate::error::{ImportError, LoadError, Location, SteamdError};
use crate::parser::Analyzer;
use crate::resolver::{AnalyzerOptions, DroppedSymbol, FsLoader, Resolver, SourceLoader};
use miette::NamedSource;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The result of a successful analysis of a steamd file.
///
/// The tree owns every node and symbol reachable from `root`, including the
/// declarations merged in from imports.
#[derive(Debug)]
pub struct Analysis {
    pub tree: Tree,
    pub root: NodeId,
    /// Imported symbols that lost a name collision to an earlier declaration.
    pub dropped_symbols: Vec<DroppedSymbol>,
    /// Every file analyzed, the top-level file first.
    pub files: Vec<PathBuf>,
}

impl Analysis {
    /// Top-level classes in declaration order, imports included.
    #[must_use]
    pub fn classes(&self) -> Vec<NodeId> {
        self.top_level(|kind| matches!(kind, NodeKind::Class(_)))
    }

    /// Top-level enums in declaration order, imports included.
    #[must_use]
    pub fn enums(&self) -> Vec<NodeId> {
        self.top_level(|kind| matches!(kind, NodeKind::Enum(_)))
    }

    /// Resolves a `::`-separated path from the root, e.g. `EMsg::Invalid`.
    ///
    /// Unlike the analyzer this never creates placeholders, and a name that is
    /// only a placeholder does not count as found.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<NodeId> {
        name.split("::").try_fold(self.root, |scope, part| {
            let symbol = self.tree.lookup(scope, part)?;
            self.tree.resolved_node(symbol)
        })
    }

    fn top_level(&self, keep: impl Fn(&NodeKind) -> bool) -> Vec<NodeId> {
        self.tree
            .children(self.root)
            .iter()
            .copied()
            .filter(|&child| keep(&self.tree.node(child).kind))
            .collect()
    }
}

/// Analyzes `source`, following imports on the filesystem.
///
/// `file_name` names the source in error messages and anchors relative
/// imports. An empty name analyzes the source anonymously, in which case
/// imports resolve against the working directory.
pub fn analyze(source: &[u8], file_name: &str) -> Result<Analysis, SteamdError> {
    let file = (!file_name.is_empty()).then(|| Path::new(file_name));
    analyze_with(source, file, &FsLoader, AnalyzerOptions::default())
}

/// Reads `path` from the filesystem and analyzes it.
pub fn analyze_file(path: impl AsRef<Path>) -> Result<Analysis, SteamdError> {
    let path = path.as_ref();
    let source = FsLoader.load(path).map_err(|err| load_failure(path, err))?;
    analyze_with(&source, Some(path), &FsLoader, AnalyzerOptions::default())
}

/// Analyzes `source` with a caller-supplied loader and options.
pub fn analyze_with(
    source: &[u8],
    file: Option<&Path>,
    loader: &dyn SourceLoader,
    options: AnalyzerOptions,
) -> Result<Analysis, SteamdError> {
    let mut tree = Tree::new();
    let mut resolver = Resolver::new(loader, options);

    let canonical = file.map(|f| resolver.canonicalize(f));
    if let Some(canonical) = &canonical {
        resolver.enter_root(canonical.clone());
    }

    let root = Analyzer::new(source, file, &mut tree, &mut resolver)?.analyze()?;

    if canonical.is_some() {
        resolver.leave();
    }

    let (files, dropped_symbols) = resolver.into_parts();
    log::debug!(
        "analysis finished: {} nodes from {} file(s), {} dropped symbol(s)",
        tree.node_count(),
        files.len().max(1),
        dropped_symbols.len()
    );

    Ok(Analysis {
        tree,
        root,
        dropped_symbols,
        files,
    })
}

fn load_failure(path: &Path, err: LoadError) -> SteamdError {
    let name = path.to_string_lossy().to_string();
    let location = Location::new(Some(name.clone()), None);
    let src = NamedSource::new(name.clone(), String::new());
    match err {
        LoadError::NotFound { .. } => ImportError::NotFound {
            location,
            path: name,
            src,
            span: (0, 0).into(),
        },
        LoadError::Io { source, .. } => ImportError::Io {
            location,
            path: name,
            source: Arc::new(source),
            src,
            span: (0, 0).into(),
        },
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{MemoryLoader, MergePolicy};

    const SOURCE: &str = r#"
enum EMsg
{
    Invalid = 0;
    Multi = 1;
};

class MsgHdr<EMsg::Multi>
{
    EMsg msg = EMsg::Invalid;
    ulong targetJobID = ulong.MaxValue;
};
"#;

    #[test]
    fn test_analyze_collects_top_level_declarations() {
        let analysis = analyze(SOURCE.as_bytes(), "").unwrap();

        assert_eq!(analysis.classes().len(), 1);
        assert_eq!(analysis.enums().len(), 1);
        assert!(analysis.files.is_empty());
        assert!(analysis.dropped_symbols.is_empty());

        let header = analysis.classes()[0];
        assert_eq!(analysis.tree.name(header), "MsgHdr");
    }

    #[test]
    fn test_find_walks_namespaced_paths() {
        let analysis = analyze(SOURCE.as_bytes(), "").unwrap();

        let invalid = analysis.find("EMsg::Invalid").unwrap();
        assert_eq!(analysis.tree.name(invalid), "Invalid");
        assert!(analysis.find("MsgHdr::msg").is_some());
        assert!(analysis.find("EMsg::Missing").is_none());
        // `ulong` is only ever referenced, never declared.
        assert!(analysis.find("ulong").is_none());
    }

    #[test]
    fn test_analyze_with_reports_files_and_drops() {
        let loader = MemoryLoader::new().with_file("defs/other.steamd", "class A { };");
        let source = b"class A { };\n#import \"other.steamd\"\n";

        let analysis = analyze_with(
            source,
            Some(Path::new("defs/main.steamd")),
            &loader,
            AnalyzerOptions::default(),
        )
        .unwrap();

        assert_eq!(
            analysis.files,
            vec![
                PathBuf::from("defs/main.steamd"),
                PathBuf::from("defs/other.steamd")
            ]
        );
        assert_eq!(analysis.dropped_symbols.len(), 1);
        assert_eq!(analysis.classes().len(), 2);

        let strict = analyze_with(
            source,
            Some(Path::new("defs/main.steamd")),
            &loader,
            AnalyzerOptions::new().with_merge_policy(MergePolicy::Reject),
        );
        assert!(matches!(
            strict,
            Err(SteamdError::Import(ImportError::SymbolCollision { .. }))
        ));
    }

    #[test]
    fn test_analyze_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.steamd");

        match analyze_file(&missing) {
            Err(SteamdError::Import(ImportError::NotFound { location, .. })) => {
                assert_eq!(location.position, None);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
