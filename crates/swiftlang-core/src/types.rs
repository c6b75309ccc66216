//! types.rs — Modèle de types nominal + contexte de types.
//!
//! Tags : void, bool, int, float, double, string, nil, any, array,
//! dictionary, optional, function, tuple, struct, class, enum, protocol,
//! generic, alias, unresolved. Les composites portent membres, méthodes,
//! supertype et protocoles conformés. Le contexte est un registre par
//! instance d'analyseur, préchargé avec les types de base.

use ahash::AHashMap;

use crate::arena::{Arena, Id};

pub type TypeId = Id<Type>;

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Void,
    Bool,
    Int,
    Float,
    Double,
    String,
    Nil,
    Any,
    Array(TypeId),
    Dictionary(TypeId, TypeId),
    Optional(TypeId),
    Function { params: Vec<TypeId>, ret: TypeId, is_async: bool, throws: bool },
    Tuple(Vec<TypeId>),
    Struct,
    Class,
    Enum,
    Protocol,
    Generic(String),
    Alias(TypeId),
    Unresolved,
}

/// Un type : tag + charge par tag. `is_optional` coexiste avec le tag
/// Optional, par commodité de consultation.
#[derive(Debug, Clone)]
pub struct Type {
    pub kind: TypeKind,
    pub name: Option<String>,
    pub is_optional: bool,
    /// Champs des composites (struct/class/enum).
    pub members: Vec<(String, TypeId)>,
    /// Méthodes des composites (nom → type fonction).
    pub methods: Vec<(String, TypeId)>,
    pub supertype: Option<TypeId>,
    pub protocols: Vec<TypeId>,
}

impl Type {
    pub fn simple(kind: TypeKind) -> Self {
        Self {
            kind,
            name: None,
            is_optional: false,
            members: Vec::new(),
            methods: Vec::new(),
            supertype: None,
            protocols: Vec::new(),
        }
    }

    pub fn named(kind: TypeKind, name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::simple(kind) }
    }
}

/* ───────────────────────── Contexte ───────────────────────── */

/// Registre de types, string-keyed, local à une instance d'analyseur.
pub struct TypeCtx {
    arena: Arena<Type>,
    by_name: AHashMap<String, TypeId>,
    pub t_void: TypeId,
    pub t_bool: TypeId,
    pub t_int: TypeId,
    pub t_float: TypeId,
    pub t_double: TypeId,
    pub t_string: TypeId,
    pub t_nil: TypeId,
    pub t_any: TypeId,
    pub t_unresolved: TypeId,
}

impl Default for TypeCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeCtx {
    pub fn new() -> Self {
        let mut arena = Arena::new("types");
        let mut by_name = AHashMap::new();
        let mut builtin = |arena: &mut Arena<Type>, by_name: &mut AHashMap<String, TypeId>, kind, name: &str| {
            let id = arena.alloc(Type::named(kind, name));
            by_name.insert(name.to_string(), id);
            id
        };
        let t_void = builtin(&mut arena, &mut by_name, TypeKind::Void, "Void");
        let t_bool = builtin(&mut arena, &mut by_name, TypeKind::Bool, "Bool");
        let t_int = builtin(&mut arena, &mut by_name, TypeKind::Int, "Int");
        let t_float = builtin(&mut arena, &mut by_name, TypeKind::Float, "Float");
        let t_double = builtin(&mut arena, &mut by_name, TypeKind::Double, "Double");
        let t_string = builtin(&mut arena, &mut by_name, TypeKind::String, "String");
        let t_any = builtin(&mut arena, &mut by_name, TypeKind::Any, "Any");
        let t_nil = arena.alloc(Type::simple(TypeKind::Nil));
        let t_unresolved = arena.alloc(Type::simple(TypeKind::Unresolved));
        Self {
            arena,
            by_name,
            t_void,
            t_bool,
            t_int,
            t_float,
            t_double,
            t_string,
            t_nil,
            t_any,
            t_unresolved,
        }
    }

    pub fn get(&self, id: TypeId) -> &Type {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut Type {
        self.arena.get_mut(id)
    }

    /// Alloue un type anonyme (array, optional, fonction…).
    pub fn alloc(&mut self, ty: Type) -> TypeId {
        self.arena.alloc(ty)
    }

    /// Enregistre un type nommé ; écrase une entrée homonyme (shadowing
    /// de déclaration utilisateur sur builtin interdit en amont).
    pub fn register(&mut self, name: &str, ty: Type) -> TypeId {
        let id = self.arena.alloc(ty);
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn optional_of(&mut self, inner: TypeId) -> TypeId {
        let mut t = Type::simple(TypeKind::Optional(inner));
        t.is_optional = true;
        self.alloc(t)
    }

    pub fn array_of(&mut self, elem: TypeId) -> TypeId {
        self.alloc(Type::simple(TypeKind::Array(elem)))
    }

    pub fn function_of(&mut self, params: Vec<TypeId>, ret: TypeId, is_async: bool, throws: bool) -> TypeId {
        self.alloc(Type::simple(TypeKind::Function { params, ret, is_async, throws }))
    }

    /* ────── prédicats ────── */

    pub fn is_numeric(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Int | TypeKind::Float | TypeKind::Double)
    }

    pub fn is_any_or_unresolved(&self, id: TypeId) -> bool {
        matches!(self.get(id).kind, TypeKind::Any | TypeKind::Unresolved)
    }

    /// Résout les alias jusqu'au type concret.
    pub fn resolve_alias(&self, mut id: TypeId) -> TypeId {
        while let TypeKind::Alias(inner) = self.get(id).kind {
            id = inner;
        }
        id
    }

    /// Égalité structurelle (les nominaux se comparent par identité d'id).
    pub fn equals(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve_alias(a);
        let b = self.resolve_alias(b);
        if a == b {
            return true;
        }
        match (&self.get(a).kind, &self.get(b).kind) {
            (TypeKind::Array(x), TypeKind::Array(y)) => self.equals(*x, *y),
            (TypeKind::Optional(x), TypeKind::Optional(y)) => self.equals(*x, *y),
            (TypeKind::Dictionary(k1, v1), TypeKind::Dictionary(k2, v2)) => {
                self.equals(*k1, *k2) && self.equals(*v1, *v2)
            }
            (
                TypeKind::Function { params: p1, ret: r1, .. },
                TypeKind::Function { params: p2, ret: r2, .. },
            ) => {
                p1.len() == p2.len()
                    && self.equals(*r1, *r2)
                    && p1.iter().zip(p2).all(|(x, y)| self.equals(*x, *y))
            }
            (TypeKind::Tuple(x), TypeKind::Tuple(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(a, b)| self.equals(*a, *b))
            }
            (x, y) => x == y && !matches!(x, TypeKind::Struct | TypeKind::Class | TypeKind::Enum | TypeKind::Protocol),
        }
    }

    /// Assignabilité : égaux, ou cible Any, ou nil vers optionnel, ou
    /// valeur vers son optionnel, ou optionnels à enveloppes assignables,
    /// ou chaîne de supertypes de classe, ou conformance de protocole.
    pub fn assignable(&self, from: TypeId, to: TypeId) -> bool {
        let from = self.resolve_alias(from);
        let to = self.resolve_alias(to);
        if self.equals(from, to) {
            return true;
        }
        if self.is_any_or_unresolved(to) || self.is_any_or_unresolved(from) {
            return true;
        }
        let fk = &self.get(from).kind;
        let tk = &self.get(to).kind;
        if let TypeKind::Optional(wrapped) = tk {
            if matches!(fk, TypeKind::Nil) {
                return true;
            }
            if let TypeKind::Optional(fw) = fk {
                return self.assignable(*fw, *wrapped);
            }
            // valeur nue vers son optionnel
            return self.assignable(from, *wrapped);
        }
        // chaîne de supertypes de classe
        if matches!(fk, TypeKind::Class) {
            let mut cur = self.get(from).supertype;
            while let Some(sup) = cur {
                if self.equals(sup, to) {
                    return true;
                }
                cur = self.get(sup).supertype;
            }
        }
        // conformance de protocole
        if matches!(tk, TypeKind::Protocol) {
            if self.get(from).protocols.iter().any(|p| self.equals(*p, to)) {
                return true;
            }
        }
        false
    }

    /// Type commun d'une opération arithmétique : Double > Float > Int.
    /// Any/Unresolved d'un côté propage Any.
    pub fn common_numeric(&self, a: TypeId, b: TypeId) -> TypeId {
        if self.is_any_or_unresolved(a) || self.is_any_or_unresolved(b) {
            return self.t_any;
        }
        let rank = |id: TypeId| match self.get(id).kind {
            TypeKind::Double => 3,
            TypeKind::Float => 2,
            TypeKind::Int => 1,
            _ => 0,
        };
        if rank(a) >= rank(b) {
            a
        } else {
            b
        }
    }

    /// Nom lisible pour les diagnostics.
    pub fn display(&self, id: TypeId) -> String {
        let t = self.get(id);
        if let Some(n) = &t.name {
            return n.clone();
        }
        match &t.kind {
            TypeKind::Nil => "Nil".into(),
            TypeKind::Unresolved => "<non résolu>".into(),
            TypeKind::Array(e) => format!("[{}]", self.display(*e)),
            TypeKind::Dictionary(k, v) => format!("[{}: {}]", self.display(*k), self.display(*v)),
            TypeKind::Optional(w) => format!("{}?", self.display(*w)),
            TypeKind::Function { params, ret, .. } => {
                let ps: Vec<String> = params.iter().map(|p| self.display(*p)).collect();
                format!("({}) -> {}", ps.join(", "), self.display(*ret))
            }
            TypeKind::Tuple(xs) => {
                let ps: Vec<String> = xs.iter().map(|p| self.display(*p)).collect();
                format!("({})", ps.join(", "))
            }
            TypeKind::Generic(n) => n.clone(),
            TypeKind::Alias(inner) => self.display(*inner),
            other => format!("{other:?}"),
        }
    }
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_preloaded() {
        let cx = TypeCtx::new();
        assert_eq!(cx.lookup("Int"), Some(cx.t_int));
        assert_eq!(cx.lookup("String"), Some(cx.t_string));
        assert_eq!(cx.lookup("Any"), Some(cx.t_any));
        assert!(cx.lookup("Banana").is_none());
    }

    #[test]
    fn assignability_rules() {
        let mut cx = TypeCtx::new();
        let opt_int = cx.optional_of(cx.t_int);
        // égalité
        assert!(cx.assignable(cx.t_int, cx.t_int));
        // cible Any
        assert!(cx.assignable(cx.t_string, cx.t_any));
        // nil vers optionnel
        assert!(cx.assignable(cx.t_nil, opt_int));
        // valeur vers son optionnel
        assert!(cx.assignable(cx.t_int, opt_int));
        // pas l'inverse
        assert!(!cx.assignable(opt_int, cx.t_int));
        // incompatibles
        assert!(!cx.assignable(cx.t_string, cx.t_int));
        assert!(!cx.assignable(cx.t_nil, cx.t_int));
    }

    #[test]
    fn class_supertype_chain() {
        let mut cx = TypeCtx::new();
        let base = cx.register("Base", Type::named(TypeKind::Class, "Base"));
        let mut mid_t = Type::named(TypeKind::Class, "Mid");
        mid_t.supertype = Some(base);
        let mid = cx.register("Mid", mid_t);
        let mut leaf_t = Type::named(TypeKind::Class, "Leaf");
        leaf_t.supertype = Some(mid);
        let leaf = cx.register("Leaf", leaf_t);
        assert!(cx.assignable(leaf, base));
        assert!(cx.assignable(mid, base));
        assert!(!cx.assignable(base, leaf));
    }

    #[test]
    fn protocol_conformance() {
        let mut cx = TypeCtx::new();
        let proto = cx.register("Printable", Type::named(TypeKind::Protocol, "Printable"));
        let mut s = Type::named(TypeKind::Struct, "Point");
        s.protocols.push(proto);
        let point = cx.register("Point", s);
        assert!(cx.assignable(point, proto));
    }

    #[test]
    fn common_numeric_ranking() {
        let cx = TypeCtx::new();
        assert_eq!(cx.common_numeric(cx.t_int, cx.t_double), cx.t_double);
        assert_eq!(cx.common_numeric(cx.t_float, cx.t_int), cx.t_float);
        assert_eq!(cx.common_numeric(cx.t_int, cx.t_int), cx.t_int);
        assert_eq!(cx.common_numeric(cx.t_any, cx.t_int), cx.t_any);
    }

    #[test]
    fn structural_equality() {
        let mut cx = TypeCtx::new();
        let a1 = cx.array_of(cx.t_int);
        let a2 = cx.array_of(cx.t_int);
        let a3 = cx.array_of(cx.t_string);
        assert!(cx.equals(a1, a2));
        assert!(!cx.equals(a1, a3));
    }

    #[test]
    fn display_names() {
        let mut cx = TypeCtx::new();
        let opt = cx.optional_of(cx.t_int);
        let arr = cx.array_of(opt);
        assert_eq!(cx.display(arr), "[Int?]");
        let f = cx.function_of(vec![cx.t_int, cx.t_string], cx.t_bool, false, false);
        assert_eq!(cx.display(f), "(Int, String) -> Bool");
    }
}
