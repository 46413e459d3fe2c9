use crate::ast::{NodeId, SymbolCollision, SymbolId, Tree};
use crate::error::LoadError;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Supplies the bytes of imported files.
///
/// The analyzer never touches storage itself; every `#import` goes through
/// this trait, which keeps "file not found" apart from other read failures.
pub trait SourceLoader {
    /// Combines the importing file's directory with the imported path.
    fn resolve(&self, base_dir: Option<&Path>, relative: &str) -> PathBuf {
        match base_dir {
            Some(dir) => dir.join(relative),
            None => PathBuf::from(relative),
        }
    }

    /// Identity used to detect cycles and repeated imports.
    fn canonicalize(&self, path: &Path) -> PathBuf {
        normalize_path(path)
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>, LoadError>;
}

/// Reads imports from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn canonicalize(&self, path: &Path) -> PathBuf {
        std::fs::canonicalize(path).unwrap_or_else(|_| normalize_path(path))
    }

    fn load(&self, path: &Path) -> Result<Vec<u8>, LoadError> {
        std::fs::read(path).map_err(|err| LoadError::from_io(path.to_path_buf(), err))
    }
}

/// Serves imports from an in-memory map keyed by normalized path.
#[derive(Debug, Default, Clone)]
pub struct MemoryLoader {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        self.files
            .insert(normalize_path(path.as_ref()), contents.into());
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }
}

impl SourceLoader for MemoryLoader {
    fn load(&self, path: &Path) -> Result<Vec<u8>, LoadError> {
        self.files
            .get(&normalize_path(path))
            .cloned()
            .ok_or_else(|| LoadError::NotFound {
                path: path.to_path_buf(),
            })
    }
}

/// Drops `.` components and folds `..` into the preceding component.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// What to do when an imported declaration reuses a name already declared in
/// the importing scope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep the existing declaration, log a warning and record the drop.
    #[default]
    FirstWins,
    /// Fail the analysis.
    Reject,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnalyzerOptions {
    pub merge_policy: MergePolicy,
}

impl AnalyzerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }
}

/// An imported symbol left out of the importing table under
/// [`MergePolicy::FirstWins`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedSymbol {
    pub name: String,
    /// The imported file that declared the dropped symbol.
    pub file: PathBuf,
    pub kept: SymbolId,
    pub dropped: SymbolId,
}

/// State shared by one top-level analysis and every import it follows.
pub struct Resolver<'l> {
    loader: &'l dyn SourceLoader,
    options: AnalyzerOptions,
    // Files currently being analyzed, outermost first, to detect cycles.
    resolving_stack: Vec<PathBuf>,
    // Files already merged into the tree, with the declarations they exported.
    imported: HashMap<PathBuf, Vec<(String, SymbolId)>>,
    files: Vec<PathBuf>,
    dropped: Vec<DroppedSymbol>,
}

impl<'l> Resolver<'l> {
    pub fn new(loader: &'l dyn SourceLoader, options: AnalyzerOptions) -> Self {
        Resolver {
            loader,
            options,
            resolving_stack: Vec::new(),
            imported: HashMap::new(),
            files: Vec::new(),
            dropped: Vec::new(),
        }
    }

    /// Where `relative` points when imported from `importing_file`.
    pub fn resolve_path(&self, importing_file: Option<&Path>, relative: &str) -> PathBuf {
        let base_dir = importing_file.and_then(Path::parent);
        self.loader.resolve(base_dir, relative)
    }

    pub fn canonicalize(&self, path: &Path) -> PathBuf {
        self.loader.canonicalize(path)
    }

    pub fn load(&self, path: &Path) -> Result<Vec<u8>, LoadError> {
        self.loader.load(path)
    }

    /// Marks `canonical` as being analyzed.
    ///
    /// Fails with the rendered import chain when the file is already on the
    /// stack.
    pub fn enter(&mut self, canonical: PathBuf) -> Result<(), String> {
        if self.resolving_stack.contains(&canonical) {
            let cycle = self
                .resolving_stack
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.to_string_lossy().to_string())
                .collect::<Vec<String>>()
                .join(" -> ");
            return Err(cycle);
        }
        if !self.files.contains(&canonical) {
            self.files.push(canonical.clone());
        }
        self.resolving_stack.push(canonical);
        Ok(())
    }

    /// Marks the top-level file as being analyzed.
    ///
    /// Nothing is on the stack yet, so this cannot close a cycle.
    pub fn enter_root(&mut self, canonical: PathBuf) {
        self.files.push(canonical.clone());
        self.resolving_stack.push(canonical);
    }

    pub fn leave(&mut self) {
        self.resolving_stack.pop();
    }

    pub fn is_imported(&self, canonical: &Path) -> bool {
        self.imported.contains_key(canonical)
    }

    /// Moves an imported file's subtree and symbols into `into`.
    ///
    /// Returns the first collision when the policy rejects collisions.
    pub fn merge(
        &mut self,
        tree: &mut Tree,
        into: NodeId,
        imported_root: NodeId,
        canonical: &Path,
    ) -> Result<(), SymbolCollision> {
        let exports = tree
            .node(imported_root)
            .symbols()
            .filter(|(_, symbol)| !tree.is_placeholder(*symbol))
            .map(|(name, symbol)| (name.to_string(), symbol))
            .collect();

        tree.adopt_children(into, imported_root);
        let collisions = tree.import_symbols(into, imported_root);
        self.imported.insert(canonical.to_path_buf(), exports);

        self.apply_policy(tree, into, canonical, collisions)
    }

    /// Makes the declarations of an already merged file visible in `into`
    /// without merging its nodes a second time.
    pub fn merge_again(
        &mut self,
        tree: &mut Tree,
        into: NodeId,
        canonical: &Path,
    ) -> Result<(), SymbolCollision> {
        let collisions = match self.imported.get(canonical) {
            Some(exports) => tree.bind_exports(into, exports),
            None => Vec::new(),
        };
        self.apply_policy(tree, into, canonical, collisions)
    }

    fn apply_policy(
        &mut self,
        tree: &Tree,
        into: NodeId,
        canonical: &Path,
        collisions: Vec<SymbolCollision>,
    ) -> Result<(), SymbolCollision> {
        for collision in collisions {
            if self.options.merge_policy == MergePolicy::Reject {
                return Err(collision);
            }
            log::warn!(
                "{}: symbol {:?} already declared in {}, keeping the first declaration",
                canonical.display(),
                collision.name,
                tree.scope_description(into),
            );
            self.dropped.push(DroppedSymbol {
                name: collision.name,
                file: canonical.to_path_buf(),
                kept: collision.kept,
                dropped: collision.dropped,
            });
        }

        Ok(())
    }

    /// Every file entered during the run, in first-visit order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn dropped_symbols(&self) -> &[DroppedSymbol] {
        &self.dropped
    }

    pub fn into_parts(self) -> (Vec<PathBuf>, Vec<DroppedSymbol>) {
        (self.files, self.dropped)
    }
}
