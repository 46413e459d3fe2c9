use crate::ast::*;
use crate::error::{ImportError, LoadError, Location, ParserError, SteamdError, SymbolError};
use crate::lexer::{token_values, Lexer, Token, TokenStream, TokenType};
use crate::resolver::Resolver;
use miette::{NamedSource, SourceSpan};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CLASS: &str = "class";
const ENUM: &str = "enum";
const IMPORT: &str = "import";
const FLAGS: &str = "flags";
const OBSOLETE: &str = "obsolete";

/// A recursive descent analyzer for steamd sources.
///
/// It builds the tree while it parses: every declaration becomes a node and a
/// symbol in the enclosing scope, and every reference is resolved against the
/// symbols seen so far, creating placeholders for names not declared yet.
pub struct Analyzer<'a, 'l> {
    source: Arc<NamedSource<String>>,
    tokens: TokenStream,
    file: Option<PathBuf>,
    source_len: usize,
    tree: &'a mut Tree,
    resolver: &'a mut Resolver<'l>,
}

impl<'a, 'l> Analyzer<'a, 'l> {
    /// Tokenizes `input` and prepares an analyzer over it.
    ///
    /// `file` names the source in messages and anchors relative imports.
    pub fn new(
        input: &[u8],
        file: Option<&Path>,
        tree: &'a mut Tree,
        resolver: &'a mut Resolver<'l>,
    ) -> Result<Self, SteamdError> {
        let name = file.map(|f| f.to_string_lossy().to_string());
        let mut lexer = Lexer::new(input);
        if let Some(name) = &name {
            lexer = lexer.with_name(name.clone());
        }
        let tokens = lexer.tokenize()?;
        let source = Arc::new(NamedSource::new(
            name.unwrap_or_default(),
            String::from_utf8_lossy(input).into_owned(),
        ));

        Ok(Self {
            source,
            tokens,
            file: file.map(Path::to_path_buf),
            source_len: input.len(),
            tree,
            resolver,
        })
    }

    /// Analyzes the whole input under a fresh root.
    pub fn analyze(&mut self) -> Result<NodeId, SteamdError> {
        let root = self.tree.new_root();
        self.analyze_into(root)?;
        Ok(root)
    }

    /// Analyzes the whole input, declaring into an existing root.
    ///
    /// On failure the nodes built so far stay in the tree, but they are not
    /// meant to be used.
    pub fn analyze_into(&mut self, root: NodeId) -> Result<(), SteamdError> {
        log::debug!("analyzing {}", self.file_label());

        while let Some(token) = self.tokens.dequeue() {
            match token.ttype {
                TokenType::Preprocess => self.analyze_directive(&token, root)?,
                TokenType::Identifier if token.value == CLASS => self.analyze_class(root)?,
                TokenType::Identifier if token.value == ENUM => self.analyze_enum(root)?,
                _ => return Err(self.unexpected(&token, "'class', 'enum' or a directive")),
            }
        }

        log::debug!("finished {}", self.file_label());
        Ok(())
    }

    // === Grammar Productions ===

    /// Directive ::= "#" Identifier String
    fn analyze_directive(&mut self, directive: &Token, root: NodeId) -> Result<(), SteamdError> {
        let argument = self.expect_type(TokenType::String, "a string after the directive")?;

        if directive.value == IMPORT {
            self.import_file(&argument, root)
        } else {
            log::debug!(
                "{}: ignoring directive #{}",
                self.file_label(),
                directive.value
            );
            Ok(())
        }
    }

    /// ClassDecl ::= "class" Identifier [ Qualifier ] ScopeBlock ";"
    fn analyze_class(&mut self, root: NodeId) -> Result<(), SteamdError> {
        let name = self.expect_type(TokenType::Identifier, "a class name")?;
        let node = self.tree.add_node(
            root,
            NodeKind::Class(ClassNode {
                name: name.value.clone(),
                qualifier: None,
            }),
        );
        self.declare(root, &name, node)?;

        let qualifier = self.qualifier_identifier()?;
        let qualifier = self.tree.find_nested_symbol(root, &token_values(&qualifier));
        if let NodeKind::Class(class) = &mut self.tree.node_mut(node).kind {
            class.qualifier = qualifier;
        }

        self.analyze_scope(node)?;
        self.expect_type(TokenType::Terminator, "';' after the class body")?;
        Ok(())
    }

    /// EnumDecl ::= "enum" Identifier [ Qualifier ] [ "flags" ] ScopeBlock ";"
    fn analyze_enum(&mut self, root: NodeId) -> Result<(), SteamdError> {
        let name = self.expect_type(TokenType::Identifier, "an enum name")?;
        let node = self.tree.add_node(
            root,
            NodeKind::Enum(EnumNode {
                name: name.value.clone(),
                qualifier: None,
                flags: false,
            }),
        );
        self.declare(root, &name, node)?;

        let qualifier = self.qualifier_identifier()?;
        let qualifier = self.tree.find_nested_symbol(root, &token_values(&qualifier));
        let flags = self.optional_token(TokenType::Identifier, FLAGS).is_some();
        if let NodeKind::Enum(enum_node) = &mut self.tree.node_mut(node).kind {
            enum_node.qualifier = qualifier;
            enum_node.flags = flags;
        }

        self.analyze_scope(node)?;
        self.expect_type(TokenType::Terminator, "';' after the enum body")?;
        Ok(())
    }

    /// ScopeBlock ::= "{" { PropertyDecl } "}"
    fn analyze_scope(&mut self, scope: NodeId) -> Result<(), SteamdError> {
        self.expect_token(TokenType::Operator, "{", "'{'")?;

        while self.optional_token(TokenType::Operator, "}").is_none() {
            self.analyze_property(scope)?;
        }

        Ok(())
    }

    /// PropertyDecl ::= Identifier [ Qualifier ] [ Identifier ] [ Identifier ]
    ///                  [ "=" DefaultChain ] ";" [ Obsolete ]
    fn analyze_property(&mut self, scope: NodeId) -> Result<(), SteamdError> {
        let t1 = self.expect_type(TokenType::Identifier, "a property declaration")?;
        let qualifier = self.qualifier_identifier()?;
        let t2 = self.optional_type(TokenType::Identifier);
        let t3 = self.optional_type(TokenType::Identifier);

        // [flags] [type] name: the last identifier read is always the name.
        let (flags, type_name, name) = match (t2, t3) {
            (Some(t2), Some(t3)) => (Some(t1.value), Some(t2.value), t3),
            (Some(t2), None) => (None, Some(t1.value), t2),
            _ => (None, None, t1),
        };

        let node = self.tree.add_node(scope, NodeKind::Property(PropertyNode::new(&name.value)));
        self.declare(scope, &name, node)?;

        let flags_opt = self.tree.find_nested_symbol(node, &token_values(&qualifier));
        let type_symbol = type_name.and_then(|t| self.tree.find_symbol(scope, &t, true));

        let mut default = Vec::new();
        if self.optional_token(TokenType::Operator, "=").is_some() {
            loop {
                let path = self.namespaced_identifier()?;
                let symbol = self
                    .tree
                    .find_nested_symbol(node, &token_values(&path))
                    .ok_or_else(|| self.unresolved(&path))?;
                default.push(symbol);
                if self.optional_token(TokenType::Operator, "|").is_none() {
                    break;
                }
            }
        }

        self.expect_type(TokenType::Terminator, "';' after the property")?;

        let mut obsolete = false;
        let mut obsolete_reason = None;
        if self.optional_token(TokenType::Identifier, OBSOLETE).is_some() {
            obsolete = true;
            obsolete_reason = self.optional_type(TokenType::String).map(|t| t.value);
            self.optional_type(TokenType::Terminator);
        }

        if let Some(property) = self.tree.node_mut(node).as_property_mut() {
            property.flags = flags;
            property.flags_opt = flags_opt;
            property.type_symbol = type_symbol;
            for symbol in default {
                property.add_default(symbol);
            }
            property.obsolete = obsolete;
            property.obsolete_reason = obsolete_reason;
        }

        Ok(())
    }

    /// NamespacedIdentifier ::= Identifier [ "::" Identifier ]
    fn namespaced_identifier(&mut self) -> Result<Vec<Token>, SteamdError> {
        let mut path = vec![self.expect_type(TokenType::Identifier, "an identifier")?];

        if self.optional_type(TokenType::Namespace).is_some() {
            path.push(self.expect_type(TokenType::Identifier, "an identifier after '::'")?);
        }

        Ok(path)
    }

    /// Qualifier ::= "<" NamespacedIdentifier ">"
    ///
    /// Returns an empty path when no qualifier is present.
    fn qualifier_identifier(&mut self) -> Result<Vec<Token>, SteamdError> {
        if self.optional_token(TokenType::Operator, "<").is_none() {
            return Ok(Vec::new());
        }

        let path = self.namespaced_identifier()?;
        self.expect_token(TokenType::Operator, ">", "'>'")?;
        Ok(path)
    }

    // === Imports ===

    fn import_file(&mut self, argument: &Token, root: NodeId) -> Result<(), SteamdError> {
        let path = self.resolver.resolve_path(self.file.as_deref(), &argument.value);
        let canonical = self.resolver.canonicalize(&path);

        if self.resolver.is_imported(&canonical) {
            log::debug!(
                "{}: {} already imported, binding its declarations",
                self.file_label(),
                path.display()
            );
            return self
                .resolver
                .merge_again(self.tree, root, &canonical)
                .map_err(|collision| self.collision(collision, &path, argument));
        }

        if let Err(cycle) = self.resolver.enter(canonical.clone()) {
            return Err(ImportError::Cycle {
                location: self.location_of(argument),
                cycle,
                src: (*self.source).clone(),
                span: span_of(argument),
            }
            .into());
        }

        let result = self.analyze_import(&path, argument);
        self.resolver.leave();
        let imported_root = result?;

        self.resolver
            .merge(self.tree, root, imported_root, &canonical)
            .map_err(|collision| self.collision(collision, &path, argument))
    }

    /// Runs a nested analyzer over an imported file under its own root.
    fn analyze_import(&mut self, path: &Path, argument: &Token) -> Result<NodeId, SteamdError> {
        log::debug!("{}: importing {}", self.file_label(), path.display());

        let bytes = self.resolver.load(path).map_err(|err| match err {
            LoadError::NotFound { .. } => SteamdError::from(ImportError::NotFound {
                location: self.location_of(argument),
                path: path.display().to_string(),
                src: (*self.source).clone(),
                span: span_of(argument),
            }),
            LoadError::Io { source, .. } => SteamdError::from(ImportError::Io {
                location: self.location_of(argument),
                path: path.display().to_string(),
                source: Arc::new(source),
                src: (*self.source).clone(),
                span: span_of(argument),
            }),
        })?;

        let mut nested = Analyzer::new(&bytes, Some(path), self.tree, self.resolver)?;
        nested.analyze()
    }

    // === Symbols ===

    fn declare(&mut self, scope: NodeId, name: &Token, node: NodeId) -> Result<(), SteamdError> {
        match self.tree.declare(scope, &name.value, node) {
            Ok(_) => Ok(()),
            Err(SymbolError::Redeclared { name: value, scope }) => {
                Err(ParserError::Redeclaration {
                    location: self.location_of(name),
                    name: value,
                    scope,
                    src: (*self.source).clone(),
                    span: span_of(name),
                }
                .into())
            }
            Err(err) => Err(err.into()),
        }
    }

    // === Token Helper Methods ===

    /// Consumes the next token if it has the given classification.
    fn expect_type(&mut self, ttype: TokenType, expected: &str) -> Result<Token, SteamdError> {
        let Some(token) = self.tokens.peek() else {
            return Err(self.eof(expected));
        };
        if token.ttype != ttype {
            return Err(self.unexpected(token, expected));
        }
        self.tokens.dequeue().ok_or_else(|| self.eof(expected))
    }

    /// Consumes the next token if it equals `ttype`/`value`.
    fn expect_token(
        &mut self,
        ttype: TokenType,
        value: &str,
        expected: &str,
    ) -> Result<Token, SteamdError> {
        let Some(token) = self.tokens.peek() else {
            return Err(self.eof(expected));
        };
        if !token.matches(ttype, value) {
            return Err(self.unexpected(token, expected));
        }
        self.tokens.dequeue().ok_or_else(|| self.eof(expected))
    }

    fn optional_type(&mut self, ttype: TokenType) -> Option<Token> {
        if self.tokens.peek().is_some_and(|t| t.ttype == ttype) {
            self.tokens.dequeue()
        } else {
            None
        }
    }

    fn optional_token(&mut self, ttype: TokenType, value: &str) -> Option<Token> {
        if self.tokens.peek().is_some_and(|t| t.matches(ttype, value)) {
            self.tokens.dequeue()
        } else {
            None
        }
    }

    // === Errors ===

    fn file_label(&self) -> String {
        match &self.file {
            Some(file) => file.display().to_string(),
            None => "<input>".to_string(),
        }
    }

    fn location_of(&self, token: &Token) -> Location {
        Location::new(
            self.file.as_ref().map(|f| f.display().to_string()),
            Some((token.row, token.col)),
        )
    }

    fn unexpected(&self, token: &Token, expected: &str) -> SteamdError {
        ParserError::UnexpectedToken {
            location: self.location_of(token),
            found: token.raw.clone(),
            expected: expected.to_string(),
            src: (*self.source).clone(),
            span: span_of(token),
        }
        .into()
    }

    fn unresolved(&self, path: &[Token]) -> SteamdError {
        let (first, last) = (&path[0], &path[path.len() - 1]);
        ParserError::UnresolvedReference {
            location: self.location_of(first),
            name: token_values(path).join("::"),
            src: (*self.source).clone(),
            span: (first.pos_start, last.pos_end - first.pos_start).into(),
        }
        .into()
    }

    fn collision(&self, collision: SymbolCollision, path: &Path, argument: &Token) -> SteamdError {
        ImportError::SymbolCollision {
            location: self.location_of(argument),
            name: collision.name,
            file: path.display().to_string(),
            src: (*self.source).clone(),
            span: span_of(argument),
        }
        .into()
    }

    fn eof(&self, expected: &str) -> SteamdError {
        ParserError::UnexpectedEof {
            location: Location::new(self.file.as_ref().map(|f| f.display().to_string()), None),
            expected: expected.to_string(),
            src: (*self.source).clone(),
            span: (self.source_len, 0).into(),
        }
        .into()
    }
}

fn span_of(token: &Token) -> SourceSpan {
    (token.pos_start, token.pos_end - token.pos_start).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{AnalyzerOptions, MemoryLoader};
    use miette::Report;

    fn analyze_ok(source: &str) -> (Tree, NodeId) {
        let loader = MemoryLoader::new();
        let mut resolver = Resolver::new(&loader, AnalyzerOptions::default());
        let mut tree = Tree::new();
        let root = {
            let mut analyzer =
                Analyzer::new(source.as_bytes(), None, &mut tree, &mut resolver).unwrap();
            match analyzer.analyze() {
                Ok(root) => root,
                Err(err) => panic!("{:?}", Report::new(err)),
            }
        };
        (tree, root)
    }

    fn analyze_err(source: &str) -> SteamdError {
        let loader = MemoryLoader::new();
        let mut resolver = Resolver::new(&loader, AnalyzerOptions::default());
        let mut tree = Tree::new();
        let mut analyzer =
            Analyzer::new(source.as_bytes(), Some(Path::new("test.steamd")), &mut tree, &mut resolver)
                .unwrap();
        match analyzer.analyze() {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        }
    }

    fn property<'t>(tree: &'t Tree, root: NodeId, path: &[&str]) -> &'t PropertyNode {
        let mut node = root;
        for name in path {
            node = tree.find_child(node, name).unwrap();
        }
        tree.node(node).as_property().unwrap()
    }

    #[test]
    fn test_empty_input() {
        let (tree, root) = analyze_ok("// nothing here\n");
        assert!(tree.children(root).is_empty());
    }

    #[test]
    fn test_class_qualifier_resolves_to_declared_class() {
        let (tree, root) = analyze_ok("class A { }; class B<A> { };");
        let a = tree.find_child(root, "A").unwrap();
        let b = tree.find_child(root, "B").unwrap();
        let qualifier = tree.node(b).as_class().unwrap().qualifier.unwrap();
        assert_eq!(tree.resolved_node(qualifier), Some(a));
        assert_eq!(tree.name(tree.resolved_node(qualifier).unwrap()), "A");
    }

    #[test]
    fn test_enum_flags_and_values() {
        let (tree, root) = analyze_ok("enum E flags { a = 1; b = 2; };");
        let e = tree.find_child(root, "E").unwrap();
        assert!(tree.node(e).as_enum().unwrap().flags);
        assert_eq!(tree.children(e).len(), 2);
        assert!(tree.lookup(e, "a").is_some());
    }

    #[test]
    fn test_empty_scope_block() {
        let (tree, root) = analyze_ok("enum Empty { };");
        let e = tree.find_child(root, "Empty").unwrap();
        assert!(!tree.node(e).as_enum().unwrap().flags);
        assert!(tree.children(e).is_empty());
    }

    #[test]
    fn test_property_forms() {
        let (tree, root) = analyze_ok(
            "class C { const uint X = 1; uint y; z; byte<20> data; };",
        );

        let x = property(&tree, root, &["C", "X"]);
        assert_eq!(x.flags.as_deref(), Some("const"));
        assert_eq!(tree.symbol(x.type_symbol.unwrap()).value, "uint");
        assert_eq!(x.default.len(), 1);
        assert_eq!(tree.symbol(x.default[0]).value, "1");

        let y = property(&tree, root, &["C", "y"]);
        assert_eq!(y.flags, None);
        assert_eq!(tree.symbol(y.type_symbol.unwrap()).value, "uint");
        // Both properties share the placeholder declared in the class scope.
        assert_eq!(x.type_symbol, y.type_symbol);
        assert!(tree.is_placeholder(y.type_symbol.unwrap()));

        let z = property(&tree, root, &["C", "z"]);
        assert_eq!(z.type_symbol, None);

        let data = property(&tree, root, &["C", "data"]);
        assert_eq!(tree.symbol(data.flags_opt.unwrap()).value, "20");
        assert_eq!(tree.symbol(data.type_symbol.unwrap()).value, "byte");
    }

    #[test]
    fn test_namespaced_default_resolves_inside_enum() {
        let (tree, root) = analyze_ok("enum E { a; b; }; class C { uint x = E::b; };");
        let e = tree.find_child(root, "E").unwrap();
        let x = property(&tree, root, &["C", "x"]);
        assert_eq!(x.default.len(), 1);
        let b = tree.symbol(x.default[0]);
        assert_eq!(b.value, "b");
        assert_eq!(b.scope, e);
        assert_eq!(b.node(), tree.find_child(e, "b"));
    }

    #[test]
    fn test_bitwise_or_default_chain_keeps_order() {
        let (tree, root) = analyze_ok(
            "enum MyEnum2 { x; y; }; class MyClass { const uint C = 1; y = C | MyEnum2::y; };",
        );
        let my_class = tree.find_child(root, "MyClass").unwrap();
        let my_enum = tree.find_child(root, "MyEnum2").unwrap();
        let y = property(&tree, root, &["MyClass", "y"]);

        let names: Vec<&str> = y.default.iter().map(|s| tree.symbol(*s).value.as_str()).collect();
        assert_eq!(names, vec!["C", "y"]);
        assert_eq!(tree.symbol(y.default[0]).scope, my_class);
        assert_eq!(tree.symbol(y.default[1]).scope, my_enum);
    }

    #[test]
    fn test_property_qualifier_sees_sibling_properties() {
        let (tree, root) = analyze_ok("class C { uint flags; uint<flags> value; };");
        let c = tree.find_child(root, "C").unwrap();
        let value = property(&tree, root, &["C", "value"]);
        let qualifier = tree.symbol(value.flags_opt.unwrap());
        assert_eq!(qualifier.scope, c);
        assert_eq!(qualifier.node(), tree.find_child(c, "flags"));
    }

    #[test]
    fn test_obsolete_with_reason() {
        let (tree, root) = analyze_ok(r#"class C { old string; obsolete "reason"; };"#);
        let old = property(&tree, root, &["C", "old"]);
        assert!(old.obsolete);
        assert_eq!(old.obsolete_reason.as_deref(), Some("reason"));
    }

    #[test]
    fn test_bare_obsolete_consumes_terminator() {
        let (tree, root) = analyze_ok("class C { old string; obsolete; next uint; };");
        let old = property(&tree, root, &["C", "old"]);
        assert!(old.obsolete);
        assert_eq!(old.obsolete_reason, None);
        let next = property(&tree, root, &["C", "next"]);
        assert!(!next.obsolete);
    }

    #[test]
    fn test_forward_reference_binds_later_declaration() {
        let (tree, root) = analyze_ok("class B<A> { }; class A { };");
        let a = tree.find_child(root, "A").unwrap();
        let b = tree.find_child(root, "B").unwrap();
        let qualifier = tree.node(b).as_class().unwrap().qualifier.unwrap();
        assert_eq!(tree.resolved_node(qualifier), Some(a));
    }

    #[test]
    fn test_unknown_directive_is_ignored() {
        let (tree, root) = analyze_ok("#pragma \"once\" class A { };");
        assert!(tree.find_child(root, "A").is_some());
    }

    #[test]
    fn test_duplicate_class_is_rejected() {
        let err = analyze_err("class A { };\nclass A { };");
        match err {
            SteamdError::Parser(ParserError::Redeclaration { name, location, .. }) => {
                assert_eq!(name, "A");
                assert_eq!(location.to_string(), "test.steamd:2:7: ");
            }
            other => panic!("expected a redeclaration, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_property_is_rejected() {
        let err = analyze_err("enum E { a; a; };");
        assert!(matches!(
            err,
            SteamdError::Parser(ParserError::Redeclaration { .. })
        ));
    }

    #[test]
    fn test_unexpected_top_level_token() {
        let err = analyze_err("class A { };\n  struct B { };");
        match err {
            SteamdError::Parser(ParserError::UnexpectedToken { found, location, .. }) => {
                assert_eq!(found, "struct");
                assert_eq!(location.position, Some((2, 3)));
                assert_eq!(location.to_string(), "test.steamd:2:3: ");
            }
            other => panic!("expected an unexpected token, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_token_is_rejected_in_place() {
        let err = analyze_err("class A { x & y; };");
        match err {
            SteamdError::Parser(ParserError::UnexpectedToken { found, .. }) => {
                assert_eq!(found, "&");
            }
            other => panic!("expected an unexpected token, got {other:?}"),
        }
    }

    #[test]
    fn test_unexpected_eof_has_no_position() {
        let err = analyze_err("class A {");
        match err {
            SteamdError::Parser(ParserError::UnexpectedEof { location, .. }) => {
                assert_eq!(location.position, None);
                assert_eq!(location.to_string(), "test.steamd: ");
            }
            other => panic!("expected end of input, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_terminator_after_class() {
        let err = analyze_err("class A { } class B { };");
        assert!(matches!(
            err,
            SteamdError::Parser(ParserError::UnexpectedToken { ref found, .. }) if found == "class"
        ));
    }

    #[test]
    fn test_missing_import_reports_not_found() {
        let err = analyze_err("#import \"missing.steamd\"");
        assert!(matches!(err, SteamdError::Import(ImportError::NotFound { .. })));
    }

    #[test]
    fn test_unresolvable_default_is_rejected() {
        let err = analyze_err("class C { uint x = Later::a | 3; };\nenum Later { a; };");
        match err {
            SteamdError::Parser(ParserError::UnresolvedReference { name, location, .. }) => {
                assert_eq!(name, "Later::a");
                assert_eq!(location.to_string(), "test.steamd:1:20: ");
            }
            other => panic!("expected an unresolved reference, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_tree_survives_failure() {
        let loader = MemoryLoader::new();
        let mut resolver = Resolver::new(&loader, AnalyzerOptions::default());
        let mut tree = Tree::new();
        let root = tree.new_root();
        let mut analyzer =
            Analyzer::new(b"class A { }; class B {", None, &mut tree, &mut resolver).unwrap();
        assert!(analyzer.analyze_into(root).is_err());
        assert!(tree.find_child(root, "A").is_some());
        assert!(tree.find_child(root, "B").is_some());
    }
}
