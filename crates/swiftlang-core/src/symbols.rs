//! symbols.rs — Table des symboles et chaîne de portées.
//!
//! Une portée connaît sa profondeur (globale = 0) ; les portées
//! s'empilent et la profondeur est monotone à l'entrée/sortie. Le
//! shadowing est permis entre portées, pas au sein d'une même portée.

use ahash::AHashMap;

use crate::arena::{Arena, Id};
use crate::diagnostics::Span;
use crate::types::TypeId;

pub type SymbolId = Id<Symbol>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Function,
    Type,
    Class,
    Struct,
    Enum,
    Protocol,
    Parameter,
    Method,
    Property,
}

/// Données propres au genre de symbole.
#[derive(Debug, Clone)]
pub enum SymbolData {
    None,
    /// Locale : slot de pile + profondeur de déclaration.
    Local { slot: u16, depth: u32 },
    /// Fonction : arité + drapeaux de signature.
    Function { arity: u8, is_async: bool, throws: bool, mutating: bool },
    /// Membre : static/privé + type parent.
    Member { is_static: bool, is_private: bool, owner: TypeId },
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub ty: TypeId,
    pub decl_span: Span,
    pub initialized: bool,
    pub used: bool,
    pub mutable: bool,
    pub is_global: bool,
    pub captured: bool,
    pub data: SymbolData,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind, ty: TypeId, decl_span: Span) -> Self {
        Self {
            name: name.into(),
            kind,
            ty,
            decl_span,
            initialized: false,
            used: false,
            mutable: false,
            is_global: false,
            captured: false,
            data: SymbolData::None,
        }
    }
}

/* ───────────────────────── Portées ───────────────────────── */

struct Scope {
    depth: u32,
    by_name: AHashMap<String, SymbolId>,
    order: Vec<SymbolId>,
}

/// Table des symboles : arène + pile de portées.
pub struct SymbolTable {
    symbols: Arena<Symbol>,
    scopes: Vec<Scope>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Démarre avec la portée globale (profondeur 0) déjà ouverte.
    pub fn new() -> Self {
        Self {
            symbols: Arena::new("symbols"),
            scopes: vec![Scope { depth: 0, by_name: AHashMap::new(), order: Vec::new() }],
        }
    }

    pub fn depth(&self) -> u32 {
        self.scopes.last().map(|s| s.depth).unwrap_or(0)
    }

    pub fn enter_scope(&mut self) {
        let depth = self.depth() + 1;
        self.scopes.push(Scope { depth, by_name: AHashMap::new(), order: Vec::new() });
    }

    /// Ferme la portée courante et renvoie ses symboles, dans l'ordre de
    /// déclaration (pour les avertissements « jamais lu »).
    pub fn exit_scope(&mut self) -> Vec<SymbolId> {
        debug_assert!(self.scopes.len() > 1, "sortie de la portée globale");
        self.scopes.pop().map(|s| s.order).unwrap_or_default()
    }

    /// Déclare dans la portée courante. `Err` porte le symbole déjà
    /// présent si le nom y est pris (pas de shadowing intra-portée).
    pub fn declare(&mut self, mut sym: Symbol) -> Result<SymbolId, SymbolId> {
        let scope = self.scopes.last_mut().expect("au moins la portée globale");
        if let Some(&existing) = scope.by_name.get(&sym.name) {
            return Err(existing);
        }
        sym.is_global = scope.depth == 0;
        let name = sym.name.clone();
        let id = self.symbols.alloc(sym);
        let scope = self.scopes.last_mut().expect("au moins la portée globale");
        scope.by_name.insert(name, id);
        scope.order.push(id);
        Ok(id)
    }

    /// Résout en remontant la chaîne de portées (shadowing inter-portées).
    pub fn resolve(&self, name: &str) -> Option<SymbolId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&id) = scope.by_name.get(name) {
                return Some(id);
            }
        }
        None
    }

    /// Résout dans la portée courante seulement.
    pub fn resolve_current(&self, name: &str) -> Option<SymbolId> {
        self.scopes.last().and_then(|s| s.by_name.get(name).copied())
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        self.symbols.get(id)
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        self.symbols.get_mut(id)
    }
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeCtx;

    fn sym(cx: &TypeCtx, name: &str) -> Symbol {
        Symbol::new(name, SymbolKind::Variable, cx.t_int, Span::new(1, 1, name.len() as u32))
    }

    #[test]
    fn declare_and_resolve() {
        let cx = TypeCtx::new();
        let mut t = SymbolTable::new();
        let id = t.declare(sym(&cx, "x")).unwrap();
        assert_eq!(t.resolve("x"), Some(id));
        assert!(t.resolve("y").is_none());
        assert!(t.get(id).is_global);
    }

    #[test]
    fn no_shadowing_within_scope() {
        let cx = TypeCtx::new();
        let mut t = SymbolTable::new();
        let first = t.declare(sym(&cx, "x")).unwrap();
        let err = t.declare(sym(&cx, "x")).unwrap_err();
        assert_eq!(err, first);
    }

    #[test]
    fn shadowing_across_scopes_and_depth_monotone() {
        let cx = TypeCtx::new();
        let mut t = SymbolTable::new();
        let outer = t.declare(sym(&cx, "x")).unwrap();
        assert_eq!(t.depth(), 0);
        t.enter_scope();
        assert_eq!(t.depth(), 1);
        let inner = t.declare(sym(&cx, "x")).unwrap();
        assert_ne!(outer, inner);
        assert_eq!(t.resolve("x"), Some(inner));
        let dropped = t.exit_scope();
        assert_eq!(t.depth(), 0);
        assert_eq!(dropped, vec![inner]);
        // après sortie, c'est l'externe qu'on retrouve
        assert_eq!(t.resolve("x"), Some(outer));
    }

    #[test]
    fn resolve_current_ignores_parents() {
        let cx = TypeCtx::new();
        let mut t = SymbolTable::new();
        t.declare(sym(&cx, "x")).unwrap();
        t.enter_scope();
        assert!(t.resolve_current("x").is_none());
        assert!(t.resolve("x").is_some());
    }
}
