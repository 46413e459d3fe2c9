use crate::error::SymbolError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Index of a [`Node`] inside its [`Tree`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct NodeId(usize);

/// Index of a [`Symbol`] inside its [`Tree`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SymbolId(usize);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId({})", self.0)
    }
}

// --- Node Definitions ---

#[derive(Debug, PartialEq, Clone)]
pub enum NodeKind {
    /// The anonymous top level of one analyzed file.
    Root,
    Class(ClassNode),
    Enum(EnumNode),
    Property(PropertyNode),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ClassNode {
    pub name: String,
    pub qualifier: Option<SymbolId>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct EnumNode {
    pub name: String,
    pub qualifier: Option<SymbolId>,
    pub flags: bool,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct PropertyNode {
    pub name: String,
    /// Leading word of a three-identifier declaration, e.g. `const`.
    pub flags: Option<String>,
    /// The `<...>` qualifier following the first identifier.
    pub flags_opt: Option<SymbolId>,
    pub type_symbol: Option<SymbolId>,
    /// Symbols OR-ed together in the default value, in source order.
    pub default: Vec<SymbolId>,
    pub obsolete: bool,
    pub obsolete_reason: Option<String>,
}

impl PropertyNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_default(&mut self, symbol: SymbolId) {
        self.default.push(symbol);
    }
}

/// A tree node: its own data plus the links shared by every kind.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    symbols: BTreeMap<String, SymbolId>,
}

impl Node {
    fn new(kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            symbols: BTreeMap::new(),
        }
    }

    /// The declared name, or `None` for a root.
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Root => None,
            NodeKind::Class(class) => Some(&class.name),
            NodeKind::Enum(enum_node) => Some(&enum_node.name),
            NodeKind::Property(property) => Some(&property.name),
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The names declared directly in this node, in name order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, SymbolId)> + '_ {
        self.symbols.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Every symbol this node refers to: qualifiers, the property type and
    /// the default chain.
    pub fn references(&self) -> Vec<SymbolId> {
        match &self.kind {
            NodeKind::Root => Vec::new(),
            NodeKind::Class(class) => class.qualifier.into_iter().collect(),
            NodeKind::Enum(enum_node) => enum_node.qualifier.into_iter().collect(),
            NodeKind::Property(property) => property
                .flags_opt
                .into_iter()
                .chain(property.type_symbol)
                .chain(property.default.iter().copied())
                .collect(),
        }
    }

    fn references_mut(&mut self) -> Vec<&mut SymbolId> {
        match &mut self.kind {
            NodeKind::Root => Vec::new(),
            NodeKind::Class(class) => class.qualifier.iter_mut().collect(),
            NodeKind::Enum(enum_node) => enum_node.qualifier.iter_mut().collect(),
            NodeKind::Property(property) => property
                .flags_opt
                .iter_mut()
                .chain(property.type_symbol.iter_mut())
                .chain(property.default.iter_mut())
                .collect(),
        }
    }

    pub fn as_class(&self) -> Option<&ClassNode> {
        match &self.kind {
            NodeKind::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumNode> {
        match &self.kind {
            NodeKind::Enum(enum_node) => Some(enum_node),
            _ => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyNode> {
        match &self.kind {
            NodeKind::Property(property) => Some(property),
            _ => None,
        }
    }

    pub fn as_property_mut(&mut self) -> Option<&mut PropertyNode> {
        match &mut self.kind {
            NodeKind::Property(property) => Some(property),
            _ => None,
        }
    }
}

// --- Symbol Definitions ---

/// What a symbol denotes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SymbolTarget {
    /// Referenced before (or without) any declaration, e.g. a builtin type.
    Placeholder,
    /// A declared class, enum or property.
    Node(NodeId),
}

#[derive(Debug, PartialEq, Clone)]
pub struct Symbol {
    pub value: String,
    /// The node whose table holds this symbol.
    pub scope: NodeId,
    pub target: SymbolTarget,
}

impl Symbol {
    pub fn node(&self) -> Option<NodeId> {
        match self.target {
            SymbolTarget::Node(id) => Some(id),
            SymbolTarget::Placeholder => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.target == SymbolTarget::Placeholder
    }
}

/// Two resolved symbols of the same name met while merging an import.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SymbolCollision {
    pub name: String,
    /// The symbol that stays in the importing table.
    pub kept: SymbolId,
    /// The incoming symbol that was left out.
    pub dropped: SymbolId,
}

/// Arena holding every node and symbol of one analysis run.
///
/// Parent, child, scope and target links are plain indices, so the tree can
/// carry back-references without shared ownership.
#[derive(Debug, Default, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    symbols: Vec<Symbol>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_root(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(NodeKind::Root, None));
        id
    }

    /// Allocates a node and appends it to `parent`'s children.
    pub fn add_node(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(kind, Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Mutable access for filling in a node after its header is parsed.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    /// The declared name, or an opaque identity for roots.
    pub fn name(&self, id: NodeId) -> String {
        match self.node(id).name() {
            Some(name) => name.to_string(),
            None => format!("<root#{}>", id.0),
        }
    }

    /// Ancestors from the outermost down to the direct parent.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = self.parent(id);
        while let Some(parent) = current {
            path.push(parent);
            current = self.parent(parent);
        }
        path.reverse();
        path
    }

    /// Ancestors followed by the node itself.
    pub fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = self.ancestors(id);
        path.push(id);
        path
    }

    pub fn name_path(&self, id: NodeId) -> Vec<String> {
        self.path(id).into_iter().map(|n| self.name(n)).collect()
    }

    /// Every node below `id`, depth first, in declaration order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// The first direct child declared under `name`.
    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|child| self.node(*child).name() == Some(name))
    }

    /// Looks `name` up in `scope`'s own table only.
    pub fn lookup(&self, scope: NodeId, name: &str) -> Option<SymbolId> {
        self.node(scope).symbols.get(name).copied()
    }

    pub fn resolved_node(&self, symbol: SymbolId) -> Option<NodeId> {
        self.symbol(symbol).node()
    }

    pub fn is_placeholder(&self, symbol: SymbolId) -> bool {
        self.symbol(symbol).is_placeholder()
    }

    /// Adds an existing symbol to `scope`'s table and rebinds its scope.
    ///
    /// Shadowing a name declared further up the parent chain is allowed; only a
    /// collision inside `scope` itself is rejected.
    pub fn add_symbol(&mut self, scope: NodeId, symbol: SymbolId) -> Result<(), SymbolError> {
        let value = self.symbol(symbol).value.clone();
        if value.is_empty() {
            return Err(SymbolError::EmptyName {
                scope: self.scope_description(scope),
            });
        }
        if self.node(scope).symbols.contains_key(&value) {
            return Err(SymbolError::Redeclared {
                name: value,
                scope: self.scope_description(scope),
            });
        }
        self.symbols[symbol.0].scope = scope;
        self.nodes[scope.0].symbols.insert(value, symbol);
        Ok(())
    }

    pub fn create_symbol(
        &mut self,
        scope: NodeId,
        value: &str,
        target: SymbolTarget,
    ) -> Result<SymbolId, SymbolError> {
        if value.is_empty() {
            return Err(SymbolError::EmptyName {
                scope: self.scope_description(scope),
            });
        }
        if self.node(scope).symbols.contains_key(value) {
            return Err(SymbolError::Redeclared {
                name: value.to_string(),
                scope: self.scope_description(scope),
            });
        }
        let id = SymbolId(self.symbols.len());
        self.symbols.push(Symbol {
            value: value.to_string(),
            scope,
            target,
        });
        self.nodes[scope.0].symbols.insert(value.to_string(), id);
        Ok(id)
    }

    /// Binds `name` in `scope` to a declared node.
    ///
    /// A placeholder left in the same scope by an earlier forward reference is
    /// bound to the node instead of being treated as a redeclaration.
    pub fn declare(
        &mut self,
        scope: NodeId,
        name: &str,
        node: NodeId,
    ) -> Result<SymbolId, SymbolError> {
        match self.lookup(scope, name) {
            Some(existing) if self.is_placeholder(existing) => {
                self.symbols[existing.0].target = SymbolTarget::Node(node);
                Ok(existing)
            }
            _ => self.create_symbol(scope, name, SymbolTarget::Node(node)),
        }
    }

    /// Resolves `name` from `from` outwards through the parent chain.
    ///
    /// When nothing matches and `create` is set, a placeholder is declared in
    /// `from` itself.
    pub fn find_symbol(&mut self, from: NodeId, name: &str, create: bool) -> Option<SymbolId> {
        let mut current = Some(from);
        while let Some(scope) = current {
            if let Some(symbol) = self.lookup(scope, name) {
                return Some(symbol);
            }
            current = self.parent(scope);
        }

        if create {
            self.create_symbol(from, name, SymbolTarget::Placeholder).ok()
        } else {
            None
        }
    }

    /// Resolves a namespaced path such as `["MyEnum", "y"]`.
    ///
    /// Every component but the last must already exist. After each step the
    /// search continues inside the node the symbol denotes, or its scope when
    /// it is a placeholder.
    pub fn find_nested_symbol(&mut self, from: NodeId, path: &[&str]) -> Option<SymbolId> {
        let last = path.len().checked_sub(1)?;
        let mut scope = from;
        let mut found = None;

        for (i, value) in path.iter().enumerate() {
            let symbol = self.find_symbol(scope, value, i == last)?;
            let resolved = self.symbol(symbol);
            scope = resolved.node().unwrap_or(resolved.scope);
            found = Some(symbol);
        }

        found
    }

    /// Re-parents every child of `other` onto `into` and empties `other`.
    pub fn adopt_children(&mut self, into: NodeId, other: NodeId) {
        let children = std::mem::take(&mut self.nodes[other.0].children);
        for child in &children {
            self.nodes[child.0].parent = Some(into);
        }
        self.nodes[into.0].children.extend(children);
    }

    /// Moves every symbol of `other` into `into`, emptying `other`'s table.
    ///
    /// An incoming declaration fills a same-named placeholder already in
    /// `into`. Incoming placeholders never displace anything. Two resolved
    /// symbols of the same name keep the existing one and are reported back.
    /// Whenever the existing symbol stays, references to the incoming one
    /// under `into` and `other` are rewritten to it.
    pub fn import_symbols(&mut self, into: NodeId, other: NodeId) -> Vec<SymbolCollision> {
        let incoming = std::mem::take(&mut self.nodes[other.0].symbols);
        let mut collisions = Vec::new();
        let mut replaced = HashMap::new();

        for (name, symbol) in incoming {
            let Some(existing) = self.lookup(into, &name) else {
                if let Err(err) = self.add_symbol(into, symbol) {
                    // Only reachable for an empty name, which no table holds.
                    log::debug!("skipping symbol {name:?}: {err}");
                }
                continue;
            };

            match (self.symbol(existing).target, self.symbol(symbol).target) {
                (SymbolTarget::Placeholder, SymbolTarget::Node(node)) => {
                    self.symbols[existing.0].target = SymbolTarget::Node(node);
                }
                (SymbolTarget::Node(kept), SymbolTarget::Node(node)) if kept != node => {
                    collisions.push(SymbolCollision {
                        name,
                        kept: existing,
                        dropped: symbol,
                    });
                }
                _ => {}
            }
            replaced.insert(symbol, existing);
        }

        self.rewrite_references(&[into, other], &replaced);
        collisions
    }

    /// Binds names to nodes that already live elsewhere in the tree.
    ///
    /// Used when a file merged once is imported again: each `(name, symbol)`
    /// pair is a declaration that file exported, and `into` gets its own
    /// symbol for the same node. Placeholders are filled, and a resolved
    /// symbol denoting a different node is reported as a collision.
    pub fn bind_exports(
        &mut self,
        into: NodeId,
        exports: &[(String, SymbolId)],
    ) -> Vec<SymbolCollision> {
        let mut collisions = Vec::new();

        for (name, exported) in exports {
            let Some(node) = self.resolved_node(*exported) else {
                continue;
            };
            let Some(existing) = self.lookup(into, name) else {
                if let Err(err) = self.create_symbol(into, name, SymbolTarget::Node(node)) {
                    log::debug!("skipping symbol {name:?}: {err}");
                }
                continue;
            };

            match self.symbol(existing).target {
                SymbolTarget::Placeholder => {
                    self.symbols[existing.0].target = SymbolTarget::Node(node);
                }
                SymbolTarget::Node(kept) if kept != node => {
                    collisions.push(SymbolCollision {
                        name: name.clone(),
                        kept: existing,
                        dropped: *exported,
                    });
                }
                SymbolTarget::Node(_) => {}
            }
        }

        collisions
    }

    fn rewrite_references(&mut self, roots: &[NodeId], replaced: &HashMap<SymbolId, SymbolId>) {
        if replaced.is_empty() {
            return;
        }
        for &root in roots {
            for id in self.descendants(root) {
                for reference in self.nodes[id.0].references_mut() {
                    if let Some(&existing) = replaced.get(&*reference) {
                        *reference = existing;
                    }
                }
            }
        }
    }

    /// Human readable scope name used in diagnostics, e.g. `MyClass` or
    /// `<root#0>::MyClass::x`.
    pub fn scope_description(&self, scope: NodeId) -> String {
        self.name_path(scope).join("::")
    }
}
