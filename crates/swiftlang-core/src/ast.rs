//! ast.rs — Nœuds de l'arbre syntaxique, en arène indexée.
//!
//! Trois unions taguées (`Expr`, `Stmt`, `TypeExpr`) ; les enfants sont
//! référencés par id dans l'arène de leur phase, jamais par pointeur.
//! Un nœud est immuable après construction, sauf le slot `ty` d'`Expr`
//! que l'analyse sémantique remplit. Tout est libéré en bloc par le
//! reset des arènes une fois la compilation terminée.

use crate::arena::{Arena, Id};
use crate::types::TypeId;

pub type ExprId = Id<Expr>;
pub type StmtId = Id<Stmt>;
pub type TypeExprId = Id<TypeExpr>;

/* ───────────────────────── Conteneur ───────────────────────── */

/// Les trois arènes de la phase syntaxique.
pub struct Ast {
    pub exprs: Arena<Expr>,
    pub stmts: Arena<Stmt>,
    pub type_exprs: Arena<TypeExpr>,
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

impl Ast {
    pub fn new() -> Self {
        Self {
            exprs: Arena::new("ast-exprs"),
            stmts: Arena::new("ast-stmts"),
            type_exprs: Arena::new("ast-types"),
        }
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        self.exprs.get(id)
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        self.stmts.get(id)
    }

    pub fn type_expr(&self, id: TypeExprId) -> &TypeExpr {
        self.type_exprs.get(id)
    }

    pub fn add_expr(&mut self, kind: ExprKind, line: u32, col: u32) -> ExprId {
        self.exprs.alloc(Expr { kind, line, col, ty: None })
    }

    pub fn add_stmt(&mut self, kind: StmtKind, line: u32) -> StmtId {
        self.stmts.alloc(Stmt { kind, line })
    }

    pub fn add_type_expr(&mut self, kind: TypeExprKind, line: u32) -> TypeExprId {
        self.type_exprs.alloc(TypeExpr { kind, line })
    }

    /// Libération en bloc, après compilation.
    pub fn reset(&mut self) {
        self.exprs.reset();
        self.stmts.reset();
        self.type_exprs.reset();
    }
}

/// Un programme : la liste ordonnée des statements de tête.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub stmts: Vec<StmtId>,
    /// Nom déclaré par un éventuel statement `module`.
    pub module_name: Option<String>,
}

/* ───────────────────────── Expressions ───────────────────────── */

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
    pub col: u32,
    /// Type calculé, rempli par l'analyse sémantique. Seule mutation admise.
    pub ty: Option<TypeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Plus,
    PreInc,
    PreDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    /// `"a${x}b"` : `parts.len() == exprs.len() + 1`.
    Interp { parts: Vec<String>, exprs: Vec<ExprId> },
    Ident(String),
    SelfRef,
    Unary { op: UnaryOp, operand: ExprId },
    Binary { op: BinaryOp, lhs: ExprId, rhs: ExprId },
    Logical { op: LogicalOp, lhs: ExprId, rhs: ExprId },
    /// `target = value` ou composé (`op` porte alors l'opération).
    Assign { target: ExprId, op: Option<BinaryOp>, value: ExprId },
    Ternary { cond: ExprId, then_e: ExprId, else_e: ExprId },
    NilCoalesce { lhs: ExprId, rhs: ExprId },
    Call { callee: ExprId, args: Vec<ExprId> },
    Member { object: ExprId, name: String },
    OptionalChain { object: ExprId, name: String },
    Subscript { object: ExprId, index: ExprId },
    ForceUnwrap { operand: ExprId },
    Cast { operand: ExprId, ty: TypeExprId },
    ArrayLit(Vec<ExprId>),
    ObjectLit(Vec<(String, ExprId)>),
    /// `{ params in body }`
    Closure { params: Vec<Param>, body: Vec<StmtId> },
    Await { operand: ExprId },
}

/* ───────────────────────── Statements ───────────────────────── */

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Option<TypeExprId>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<TypeExprId>,
    pub body: Vec<StmtId>,
    pub is_async: bool,
    pub throws: bool,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub ty: Option<TypeExprId>,
    pub init: Option<ExprId>,
    pub line: u32,
}

/// Les cinq formes d'import, chacune avec sa charge propre.
#[derive(Debug, Clone)]
pub enum ImportDecl {
    /// `import "chemin" [as alias]`
    Whole { path: String, alias: Option<String> },
    /// `import { a, b as c } from "chemin"`
    Specific { items: Vec<(String, Option<String>)>, path: String },
    /// `import nom from "chemin"`
    Default { name: String, path: String },
    /// `import * as ns from "chemin"`
    Namespace { alias: String, path: String },
    /// `import * from "chemin"`
    Wildcard { path: String },
}

#[derive(Debug, Clone)]
pub enum ExportDecl {
    /// `export { a, b as c }`
    Named(Vec<(String, Option<String>)>),
    /// `export default expr`
    Default(ExprId),
    /// `export * from "chemin"`
    AllFrom(String),
    /// `export <déclaration>`
    Decl(StmtId),
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `let` (immuable) / `var` (mutable)
    Var { name: String, ty: Option<TypeExprId>, init: Option<ExprId>, mutable: bool },
    Expr(ExprId),
    Block(Vec<StmtId>),
    If { cond: ExprId, then_b: StmtId, else_b: Option<StmtId> },
    While { cond: ExprId, body: StmtId },
    For { init: Option<StmtId>, cond: Option<ExprId>, incr: Option<ExprId>, body: StmtId },
    ForIn { var: String, iterable: ExprId, body: StmtId },
    Return(Option<ExprId>),
    Break,
    Continue,
    Defer(StmtId),
    Guard { cond: ExprId, else_b: StmtId },
    Switch { subject: ExprId, cases: Vec<(Vec<ExprId>, Vec<StmtId>)>, default: Option<Vec<StmtId>> },
    Throw(ExprId),
    DoCatch { body: StmtId, catch_name: Option<String>, catch_body: StmtId },
    Func(FuncDecl),
    Class {
        name: String,
        superclass: Option<String>,
        protocols: Vec<String>,
        fields: Vec<FieldDecl>,
        methods: Vec<FuncDecl>,
    },
    Struct { name: String, fields: Vec<FieldDecl>, methods: Vec<FuncDecl> },
    Enum { name: String, cases: Vec<(String, Option<i64>)> },
    Protocol { name: String, requirements: Vec<(String, usize)> },
    Extension { target: String, methods: Vec<FuncDecl> },
    TypeAlias { name: String, ty: TypeExprId },
    Import(ImportDecl),
    Export(ExportDecl),
    Module { name: String },
}

/* ───────────────────────── Expressions de type ───────────────────────── */

#[derive(Debug, Clone)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum TypeExprKind {
    Named(String),
    Optional(TypeExprId),
    Array(TypeExprId),
    Dictionary(TypeExprId, TypeExprId),
    Function { params: Vec<TypeExprId>, ret: TypeExprId },
    Tuple(Vec<TypeExprId>),
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_resolve() {
        let mut ast = Ast::new();
        let one = ast.add_expr(ExprKind::Int(1), 1, 1);
        let two = ast.add_expr(ExprKind::Int(2), 1, 5);
        let sum = ast.add_expr(ExprKind::Binary { op: BinaryOp::Add, lhs: one, rhs: two }, 1, 3);
        match &ast.expr(sum).kind {
            ExprKind::Binary { op: BinaryOp::Add, lhs, rhs } => {
                assert!(matches!(ast.expr(*lhs).kind, ExprKind::Int(1)));
                assert!(matches!(ast.expr(*rhs).kind, ExprKind::Int(2)));
            }
            other => panic!("attendu Binary, trouvé {other:?}"),
        }
    }

    #[test]
    fn reset_drops_everything() {
        let mut ast = Ast::new();
        ast.add_expr(ExprKind::Nil, 1, 1);
        ast.add_stmt(StmtKind::Break, 1);
        ast.reset();
        assert!(ast.exprs.is_empty());
        assert!(ast.stmts.is_empty());
    }
}
