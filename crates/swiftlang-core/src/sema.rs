//! sema.rs — Analyse sémantique : résolution, typage, règles de contexte.
//!
//! Un visiteur sur le Programme, avec table des symboles et contexte de
//! types frais, préchargés avec les builtins. Deux passes au niveau
//! global : les en-têtes (fonctions, types) d'abord, pour autoriser les
//! références croisées, puis les corps dans l'ordre du texte.
//!
//! L'analyseur reste permissif avec `Any` et `Unresolved` : toute
//! opération qui en touche un propage `Any` plutôt que d'échouer.

use crate::ast::*;
use crate::diagnostics::{Diagnostics, Level, Phase, Span};
use crate::symbols::{Symbol, SymbolData, SymbolId, SymbolKind, SymbolTable};
use crate::types::{Type, TypeCtx, TypeId, TypeKind};

pub struct Analyzer<'a> {
    ast: &'a mut Ast,
    diags: &'a mut Diagnostics,
    pub symbols: SymbolTable,
    pub types: TypeCtx,
    fn_depth: usize,
    fn_ret: Vec<TypeId>,
    loop_depth: usize,
    self_type: Vec<TypeId>,
    /// Noms inconnus tolérés comme globaux Any (`import * from …`, REPL).
    lenient_names: bool,
}

impl<'a> Analyzer<'a> {
    pub fn new(ast: &'a mut Ast, diags: &'a mut Diagnostics) -> Self {
        let mut a = Self {
            ast,
            diags,
            symbols: SymbolTable::new(),
            types: TypeCtx::new(),
            fn_depth: 0,
            fn_ret: Vec::new(),
            loop_depth: 0,
            self_type: Vec::new(),
            lenient_names: false,
        };
        a.preload_natives();
        a
    }

    /// Les natifs exposés au niveau global par la VM. Typés `Any` :
    /// `print` est variadique, l'arité n'est pas vérifiable ici.
    fn preload_natives(&mut self) {
        for name in ["print", "clock"] {
            let mut sym = Symbol::new(name, SymbolKind::Function, self.types.t_any, Span::new(0, 0, 0));
            sym.initialized = true;
            sym.used = true;
            let _ = self.symbols.declare(sym);
        }
    }

    /// Mode indulgent : un nom non déclaré devient un global `Any` au
    /// lieu d'une erreur (REPL : les lignes précédentes ont défini des
    /// globaux que cette analyse ne voit pas).
    pub fn set_lenient(&mut self, on: bool) {
        self.lenient_names = on;
    }

    /// Analyse le programme ; `false` si une erreur a été rapportée.
    pub fn analyze(&mut self, program: &Program) -> bool {
        let errors_before = self.diags.count();

        // passe 1 : en-têtes globaux (références croisées entre fonctions/types)
        for &stmt in &program.stmts {
            self.declare_header(stmt);
        }
        // passe 2 : corps, dans l'ordre du texte
        for &stmt in &program.stmts {
            self.stmt(stmt);
        }

        self.diags.count() == errors_before && !self.diags.has_fatal()
    }

    /* ────── diagnostics ────── */

    fn error(&mut self, line: u32, msg: impl Into<String>) {
        self.diags.report(Level::Error, Phase::Sema, Some(Span::new(line, 1, 1)), msg, None);
    }

    fn warn(&mut self, line: u32, msg: impl Into<String>) {
        self.diags.report(Level::Warning, Phase::Sema, Some(Span::new(line, 1, 1)), msg, None);
    }

    /* ────── passe 1 : en-têtes ────── */

    fn declare_header(&mut self, id: StmtId) {
        let line = self.ast.stmt(id).line;
        let kind = self.ast.stmt(id).kind.clone();
        match kind {
            StmtKind::Func(f) => {
                self.declare_function_symbol(&f, line);
            }
            StmtKind::Class { name, .. } => {
                let ty = self.types.register(&name, Type::named(TypeKind::Class, &name));
                self.declare_type_symbol(&name, SymbolKind::Class, ty, line);
            }
            StmtKind::Struct { name, .. } => {
                let ty = self.types.register(&name, Type::named(TypeKind::Struct, &name));
                self.declare_type_symbol(&name, SymbolKind::Struct, ty, line);
            }
            StmtKind::Enum { name, .. } => {
                let ty = self.types.register(&name, Type::named(TypeKind::Enum, &name));
                self.declare_type_symbol(&name, SymbolKind::Enum, ty, line);
            }
            StmtKind::Protocol { name, .. } => {
                let ty = self.types.register(&name, Type::named(TypeKind::Protocol, &name));
                self.declare_type_symbol(&name, SymbolKind::Protocol, ty, line);
            }
            StmtKind::Export(ExportDecl::Decl(inner)) => self.declare_header(inner),
            _ => {}
        }
    }

    fn declare_function_symbol(&mut self, f: &FuncDecl, line: u32) -> Option<SymbolId> {
        let params: Vec<TypeId> = f
            .params
            .iter()
            .map(|p| p.ty.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any))
            .collect();
        let ret = f.ret.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any);
        let ty = self.types.function_of(params, ret, f.is_async, f.throws);
        let mut sym = Symbol::new(&f.name, SymbolKind::Function, ty, Span::new(line, 1, f.name.len() as u32));
        sym.initialized = true;
        sym.data = SymbolData::Function {
            arity: f.params.len().min(255) as u8,
            is_async: f.is_async,
            throws: f.throws,
            mutating: false,
        };
        match self.symbols.declare(sym) {
            Ok(id) => Some(id),
            Err(_) => {
                self.error(line, format!("`{}` est déjà déclaré dans cette portée", f.name));
                None
            }
        }
    }

    fn declare_type_symbol(&mut self, name: &str, kind: SymbolKind, ty: TypeId, line: u32) {
        let mut sym = Symbol::new(name, kind, ty, Span::new(line, 1, name.len() as u32));
        sym.initialized = true;
        if self.symbols.declare(sym).is_err() {
            self.error(line, format!("`{name}` est déjà déclaré dans cette portée"));
        }
    }

    /* ────── types ────── */

    fn resolve_type_expr(&mut self, id: TypeExprId) -> TypeId {
        let node = self.ast.type_expr(id).clone();
        match node.kind {
            TypeExprKind::Named(name) => match self.types.lookup(&name) {
                Some(t) => t,
                None => {
                    self.error(node.line, format!("type inconnu: `{name}`"));
                    self.types.t_unresolved
                }
            },
            TypeExprKind::Optional(inner) => {
                let t = self.resolve_type_expr(inner);
                self.types.optional_of(t)
            }
            TypeExprKind::Array(elem) => {
                let t = self.resolve_type_expr(elem);
                self.types.array_of(t)
            }
            TypeExprKind::Dictionary(k, v) => {
                let kt = self.resolve_type_expr(k);
                let vt = self.resolve_type_expr(v);
                self.types.alloc(Type::simple(TypeKind::Dictionary(kt, vt)))
            }
            TypeExprKind::Function { params, ret } => {
                let ps: Vec<TypeId> = params.iter().map(|p| self.resolve_type_expr(*p)).collect();
                let r = self.resolve_type_expr(ret);
                self.types.function_of(ps, r, false, false)
            }
            TypeExprKind::Tuple(items) => {
                let ts: Vec<TypeId> = items.iter().map(|t| self.resolve_type_expr(*t)).collect();
                self.types.alloc(Type::simple(TypeKind::Tuple(ts)))
            }
        }
    }

    /* ────── statements ────── */

    fn stmt(&mut self, id: StmtId) {
        let line = self.ast.stmt(id).line;
        let kind = self.ast.stmt(id).kind.clone();
        match kind {
            StmtKind::Var { name, ty, init, mutable } => {
                let declared = ty.map(|t| self.resolve_type_expr(t));
                let init_ty = init.map(|e| self.expr(e));
                if let (Some(d), Some(i)) = (declared, init_ty) {
                    if !self.types.assignable(i, d) {
                        self.error(
                            line,
                            format!(
                                "`{}` n'est pas assignable à `{}`",
                                self.types.display(i),
                                self.types.display(d)
                            ),
                        );
                    }
                }
                if mutable && init.is_none() {
                    self.warn(line, format!("variable mutable `{name}` non initialisée"));
                }
                let sym_ty = declared.or(init_ty).unwrap_or(self.types.t_unresolved);
                let mut sym =
                    Symbol::new(&name, SymbolKind::Variable, sym_ty, Span::new(line, 1, name.len() as u32));
                sym.mutable = mutable;
                sym.initialized = init.is_some();
                if self.symbols.declare(sym).is_err() {
                    self.error(line, format!("`{name}` est déjà déclaré dans cette portée"));
                }
            }
            StmtKind::Expr(e) => {
                self.expr(e);
            }
            StmtKind::Block(stmts) => {
                self.symbols.enter_scope();
                for s in stmts {
                    self.stmt(s);
                }
                self.leave_scope_with_warnings();
            }
            StmtKind::If { cond, then_b, else_b } => {
                self.check_bool_cond(cond, "if");
                self.stmt(then_b);
                if let Some(e) = else_b {
                    self.stmt(e);
                }
            }
            StmtKind::While { cond, body } => {
                self.check_bool_cond(cond, "while");
                self.loop_depth += 1;
                self.stmt(body);
                self.loop_depth -= 1;
            }
            StmtKind::For { init, cond, incr, body } => {
                self.symbols.enter_scope();
                if let Some(i) = init {
                    self.stmt(i);
                }
                if let Some(c) = cond {
                    self.check_bool_cond(c, "for");
                }
                if let Some(i) = incr {
                    self.expr(i);
                }
                self.loop_depth += 1;
                self.stmt(body);
                self.loop_depth -= 1;
                self.leave_scope_with_warnings();
            }
            StmtKind::ForIn { var, iterable, body } => {
                let it_ty = self.expr(iterable);
                let elem_ty = match &self.types.get(self.types.resolve_alias(it_ty)).kind {
                    TypeKind::Array(e) => *e,
                    TypeKind::String => self.types.t_string,
                    TypeKind::Dictionary(k, _) => *k,
                    TypeKind::Any | TypeKind::Unresolved => self.types.t_any,
                    _ => {
                        let shown = self.types.display(it_ty);
                        self.error(line, format!("`{shown}` n'est pas itérable"));
                        self.types.t_any
                    }
                };
                self.symbols.enter_scope();
                let mut sym =
                    Symbol::new(&var, SymbolKind::Variable, elem_ty, Span::new(line, 1, var.len() as u32));
                sym.initialized = true;
                let _ = self.symbols.declare(sym);
                self.loop_depth += 1;
                self.stmt(body);
                self.loop_depth -= 1;
                self.leave_scope_with_warnings();
            }
            StmtKind::Return(value) => {
                if self.fn_depth == 0 {
                    self.error(line, "`return` hors d'une fonction");
                }
                let vt = value.map(|e| self.expr(e)).unwrap_or(self.types.t_void);
                if let Some(&expected) = self.fn_ret.last() {
                    if !self.types.is_any_or_unresolved(expected)
                        && value.is_some()
                        && !self.types.assignable(vt, expected)
                    {
                        self.error(
                            line,
                            format!(
                                "type de retour `{}` incompatible avec `{}`",
                                self.types.display(vt),
                                self.types.display(expected)
                            ),
                        );
                    }
                }
            }
            StmtKind::Break => {
                if self.loop_depth == 0 {
                    self.error(line, "`break` hors d'une boucle");
                }
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    self.error(line, "`continue` hors d'une boucle");
                }
            }
            StmtKind::Defer(inner) => self.stmt(inner),
            StmtKind::Guard { cond, else_b } => {
                self.check_bool_cond(cond, "guard");
                self.stmt(else_b);
                if !self.block_always_exits(else_b) {
                    self.error(line, "le bloc `else` de guard doit sortir (return, break, continue ou throw)");
                }
            }
            StmtKind::Switch { subject, cases, default } => {
                self.expr(subject);
                for (values, body) in cases {
                    for v in values {
                        self.expr(v);
                    }
                    self.symbols.enter_scope();
                    for s in body {
                        self.stmt(s);
                    }
                    self.leave_scope_with_warnings();
                }
                if let Some(body) = default {
                    self.symbols.enter_scope();
                    for s in body {
                        self.stmt(s);
                    }
                    self.leave_scope_with_warnings();
                }
            }
            StmtKind::Throw(e) => {
                self.expr(e);
            }
            StmtKind::DoCatch { body, catch_name, catch_body } => {
                self.stmt(body);
                self.symbols.enter_scope();
                if let Some(name) = catch_name {
                    let mut sym = Symbol::new(
                        &name,
                        SymbolKind::Variable,
                        self.types.t_any,
                        Span::new(line, 1, name.len() as u32),
                    );
                    sym.initialized = true;
                    sym.used = true; // lier l'exception n'oblige pas à la lire
                    let _ = self.symbols.declare(sym);
                }
                self.stmt(catch_body);
                self.leave_scope_with_warnings();
            }
            StmtKind::Func(f) => {
                // au niveau global, l'en-tête est déjà déclaré (passe 1)
                if self.symbols.resolve_current(&f.name).is_none() {
                    self.declare_function_symbol(&f, line);
                }
                self.function_body(&f, None);
            }
            StmtKind::Class { name, superclass, protocols, fields, methods } => {
                self.class_decl(line, &name, superclass, protocols, fields, methods);
            }
            StmtKind::Struct { name, fields, methods } => {
                self.struct_decl(line, &name, fields, methods);
            }
            StmtKind::Enum { name, cases } => {
                let ty = match self.types.lookup(&name) {
                    Some(t) if matches!(self.types.get(t).kind, TypeKind::Enum) => t,
                    _ => {
                        let t = self.types.register(&name, Type::named(TypeKind::Enum, &name));
                        self.declare_type_symbol(&name, SymbolKind::Enum, t, line);
                        t
                    }
                };
                let int_t = self.types.t_int;
                let members: Vec<(String, TypeId)> =
                    cases.iter().map(|(case_name, _)| (case_name.clone(), int_t)).collect();
                self.types.get_mut(ty).members = members;
            }
            StmtKind::Protocol { name, requirements } => {
                let ty = match self.types.lookup(&name) {
                    Some(t) if matches!(self.types.get(t).kind, TypeKind::Protocol) => t,
                    _ => {
                        let t = self.types.register(&name, Type::named(TypeKind::Protocol, &name));
                        self.declare_type_symbol(&name, SymbolKind::Protocol, t, line);
                        t
                    }
                };
                let methods: Vec<(String, TypeId)> = requirements
                    .iter()
                    .map(|(req_name, arity)| {
                        let params = vec![self.types.t_any; *arity];
                        let f = self.types.function_of(params, self.types.t_any, false, false);
                        (req_name.clone(), f)
                    })
                    .collect();
                self.types.get_mut(ty).methods = methods;
            }
            StmtKind::Extension { target, methods } => {
                let Some(target_ty) = self.types.lookup(&target) else {
                    self.error(line, format!("extension d'un type inconnu: `{target}`"));
                    return;
                };
                for m in &methods {
                    let params: Vec<TypeId> = m
                        .params
                        .iter()
                        .map(|p| p.ty.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any))
                        .collect();
                    let ret = m.ret.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any);
                    let fty = self.types.function_of(params, ret, m.is_async, m.throws);
                    self.types.get_mut(target_ty).methods.push((m.name.clone(), fty));
                }
                for m in &methods {
                    self.function_body(m, Some(target_ty));
                }
            }
            StmtKind::TypeAlias { name, ty } => {
                let target = self.resolve_type_expr(ty);
                let alias = Type::named(TypeKind::Alias(target), &name);
                self.types.register(&name, alias);
            }
            StmtKind::Import(decl) => self.import_decl(line, decl),
            StmtKind::Export(decl) => self.export_decl(line, decl),
            StmtKind::Module { .. } => {}
        }
    }

    fn check_bool_cond(&mut self, cond: ExprId, ctx: &str) {
        let t = self.expr(cond);
        if !matches!(self.types.get(self.types.resolve_alias(t)).kind, TypeKind::Bool)
            && !self.types.is_any_or_unresolved(t)
            && !self.types.get(t).is_optional
        {
            let shown = self.types.display(t);
            self.error(
                self.ast.expr(cond).line,
                format!("la condition de `{ctx}` doit être Bool, trouvé `{shown}`"),
            );
        }
    }

    /// Vrai si le statement (bloc compris) termine toujours par une sortie.
    fn block_always_exits(&self, id: StmtId) -> bool {
        match &self.ast.stmt(id).kind {
            StmtKind::Return(_) | StmtKind::Break | StmtKind::Continue | StmtKind::Throw(_) => true,
            StmtKind::Block(stmts) => {
                stmts.last().is_some_and(|last| self.block_always_exits(*last))
            }
            _ => false,
        }
    }

    fn leave_scope_with_warnings(&mut self) {
        let dropped = self.symbols.exit_scope();
        for id in dropped {
            let sym = self.symbols.get(id);
            if sym.kind == SymbolKind::Variable && !sym.used {
                let (name, line) = (sym.name.clone(), sym.decl_span.line);
                self.warn(line, format!("variable `{name}` jamais utilisée"));
            }
        }
    }

    /* ────── fonctions & types composites ────── */

    fn function_body(&mut self, f: &FuncDecl, self_ty: Option<TypeId>) {
        let ret = f.ret.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any);
        self.fn_depth += 1;
        self.fn_ret.push(ret);
        if let Some(t) = self_ty {
            self.self_type.push(t);
        }
        self.symbols.enter_scope();
        for p in &f.params {
            let pt = p.ty.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any);
            let mut sym =
                Symbol::new(&p.name, SymbolKind::Parameter, pt, Span::new(p.line, 1, p.name.len() as u32));
            sym.initialized = true;
            sym.mutable = true;
            if self.symbols.declare(sym).is_err() {
                self.error(p.line, format!("paramètre `{}` dupliqué", p.name));
            }
        }
        for &s in &f.body {
            self.stmt(s);
        }
        self.leave_scope_with_warnings();
        if self_ty.is_some() {
            self.self_type.pop();
        }
        self.fn_ret.pop();
        self.fn_depth -= 1;
    }

    fn class_decl(
        &mut self,
        line: u32,
        name: &str,
        superclass: Option<String>,
        protocols: Vec<String>,
        fields: Vec<FieldDecl>,
        methods: Vec<FuncDecl>,
    ) {
        let ty = match self.types.lookup(name) {
            Some(t) if matches!(self.types.get(t).kind, TypeKind::Class) => t,
            _ => {
                let t = self.types.register(name, Type::named(TypeKind::Class, name));
                self.declare_type_symbol(name, SymbolKind::Class, t, line);
                t
            }
        };
        if let Some(sup) = &superclass {
            match self.types.lookup(sup) {
                Some(s) if matches!(self.types.get(s).kind, TypeKind::Class) => {
                    self.types.get_mut(ty).supertype = Some(s);
                }
                Some(_) => self.error(line, format!("`{sup}` n'est pas une classe")),
                None => self.error(line, format!("supertype inconnu: `{sup}`")),
            }
        }
        for p in &protocols {
            match self.types.lookup(p) {
                Some(pt) if matches!(self.types.get(pt).kind, TypeKind::Protocol) => {
                    self.types.get_mut(ty).protocols.push(pt);
                }
                Some(_) => self.error(line, format!("`{p}` n'est pas un protocole")),
                None => self.error(line, format!("protocole inconnu: `{p}`")),
            }
        }
        // champs
        let mut members = Vec::new();
        for field in &fields {
            let ft = match (field.ty, field.init) {
                (Some(t), _) => self.resolve_type_expr(t),
                (None, Some(init)) => self.expr(init),
                (None, None) => self.types.t_any,
            };
            if let (Some(t), Some(init)) = (field.ty, field.init) {
                let declared = self.resolve_type_expr(t);
                let got = self.expr(init);
                if !self.types.assignable(got, declared) {
                    self.error(
                        field.line,
                        format!(
                            "initialiseur `{}` incompatible avec `{}`",
                            self.types.display(got),
                            self.types.display(declared)
                        ),
                    );
                }
            }
            members.push((field.name.clone(), ft));
        }
        self.types.get_mut(ty).members = members;
        // méthodes
        let mut method_types = Vec::new();
        for m in &methods {
            let params: Vec<TypeId> = m
                .params
                .iter()
                .map(|p| p.ty.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any))
                .collect();
            let ret = m.ret.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any);
            let fty = self.types.function_of(params, ret, m.is_async, m.throws);
            method_types.push((m.name.clone(), fty));
        }
        self.types.get_mut(ty).methods = method_types;
        for m in &methods {
            self.function_body(m, Some(ty));
        }
        // conformance : chaque exigence doit avoir une méthode homonyme de même arité
        let proto_ids = self.types.get(ty).protocols.clone();
        for pid in proto_ids {
            let reqs = self.types.get(pid).methods.clone();
            for (req_name, req_ty) in reqs {
                let present = methods.iter().any(|m| {
                    m.name == req_name
                        && match &self.types.get(req_ty).kind {
                            TypeKind::Function { params, .. } => m.params.len() == params.len(),
                            _ => true,
                        }
                });
                if !present {
                    let proto_name = self.types.display(pid);
                    self.error(
                        line,
                        format!("`{name}` ne conforme pas à `{proto_name}`: méthode `{req_name}` manquante"),
                    );
                }
            }
        }
    }

    fn struct_decl(&mut self, line: u32, name: &str, fields: Vec<FieldDecl>, methods: Vec<FuncDecl>) {
        let ty = match self.types.lookup(name) {
            Some(t) if matches!(self.types.get(t).kind, TypeKind::Struct) => t,
            _ => {
                let t = self.types.register(name, Type::named(TypeKind::Struct, name));
                self.declare_type_symbol(name, SymbolKind::Struct, t, line);
                t
            }
        };
        let mut members = Vec::new();
        for field in &fields {
            let ft = match field.ty {
                Some(t) => self.resolve_type_expr(t),
                None => self.types.t_any,
            };
            if let Some(init) = field.init {
                self.expr(init);
            }
            members.push((field.name.clone(), ft));
        }
        self.types.get_mut(ty).members = members;
        let mut method_types = Vec::new();
        for m in &methods {
            let params: Vec<TypeId> = m
                .params
                .iter()
                .map(|p| p.ty.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any))
                .collect();
            let ret = m.ret.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any);
            let fty = self.types.function_of(params, ret, m.is_async, m.throws);
            method_types.push((m.name.clone(), fty));
        }
        self.types.get_mut(ty).methods = method_types;
        for m in &methods {
            self.function_body(m, Some(ty));
        }
    }

    /* ────── imports / exports ────── */

    fn import_decl(&mut self, line: u32, decl: ImportDecl) {
        match decl {
            ImportDecl::Whole { path, alias } => {
                let name = alias.unwrap_or_else(|| module_basename(&path));
                self.declare_import_symbol(&name, line);
            }
            ImportDecl::Specific { items, .. } => {
                for (name, alias) in items {
                    let bound = alias.unwrap_or(name);
                    self.declare_import_symbol(&bound, line);
                }
            }
            ImportDecl::Default { name, .. } => self.declare_import_symbol(&name, line),
            ImportDecl::Namespace { alias, .. } => self.declare_import_symbol(&alias, line),
            ImportDecl::Wildcard { .. } => {
                self.lenient_names = true;
            }
        }
    }

    fn declare_import_symbol(&mut self, name: &str, line: u32) {
        let mut sym =
            Symbol::new(name, SymbolKind::Variable, self.types.t_any, Span::new(line, 1, name.len() as u32));
        sym.initialized = true;
        sym.used = true; // un import sert l'espace de noms, pas de warning
        if self.symbols.declare(sym).is_err() {
            self.error(line, format!("`{name}` est déjà déclaré dans cette portée"));
        }
    }

    fn export_decl(&mut self, line: u32, decl: ExportDecl) {
        match decl {
            ExportDecl::Named(items) => {
                for (name, _) in items {
                    match self.symbols.resolve(&name) {
                        Some(id) => self.symbols.get_mut(id).used = true,
                        None => self.error(line, format!("export d'un nom non déclaré: `{name}`")),
                    }
                }
            }
            ExportDecl::Default(e) => {
                self.expr(e);
            }
            ExportDecl::AllFrom(_) => {}
            ExportDecl::Decl(inner) => {
                self.stmt(inner);
                // la déclaration exportée compte comme utilisée
                if let StmtKind::Var { name, .. } | StmtKind::Func(FuncDecl { name, .. }) =
                    &self.ast.stmt(inner).kind
                {
                    let name = name.clone();
                    if let Some(id) = self.symbols.resolve(&name) {
                        self.symbols.get_mut(id).used = true;
                    }
                }
            }
        }
    }

    /* ────── expressions ────── */

    fn expr(&mut self, id: ExprId) -> TypeId {
        let line = self.ast.expr(id).line;
        let kind = self.ast.expr(id).kind.clone();
        let ty = match kind {
            ExprKind::Nil => self.types.t_nil,
            ExprKind::Bool(_) => self.types.t_bool,
            ExprKind::Int(_) => self.types.t_int,
            ExprKind::Float(_) => self.types.t_double,
            ExprKind::Str(_) | ExprKind::Char(_) => self.types.t_string,
            ExprKind::Interp { exprs, .. } => {
                for e in exprs {
                    self.expr(e);
                }
                self.types.t_string
            }
            ExprKind::Ident(name) => self.ident(line, &name),
            ExprKind::SelfRef => match self.self_type.last() {
                Some(&t) => t,
                None => {
                    self.error(line, "`self` hors d'une méthode");
                    self.types.t_unresolved
                }
            },
            ExprKind::Unary { op, operand } => self.unary(line, op, operand),
            ExprKind::Binary { op, lhs, rhs } => self.binary(line, op, lhs, rhs),
            ExprKind::Logical { lhs, rhs, .. } => {
                for e in [lhs, rhs] {
                    let t = self.expr(e);
                    if !matches!(self.types.get(self.types.resolve_alias(t)).kind, TypeKind::Bool)
                        && !self.types.is_any_or_unresolved(t)
                    {
                        let shown = self.types.display(t);
                        self.error(line, format!("opérande logique doit être Bool, trouvé `{shown}`"));
                    }
                }
                self.types.t_bool
            }
            ExprKind::Assign { target, op, value } => self.assign(line, target, op, value),
            ExprKind::Ternary { cond, then_e, else_e } => {
                self.check_bool_cond(cond, "?:");
                let t = self.expr(then_e);
                let e = self.expr(else_e);
                if self.types.equals(t, e) {
                    t
                } else {
                    self.types.t_any
                }
            }
            ExprKind::NilCoalesce { lhs, rhs } => {
                let lt = self.expr(lhs);
                let rt = self.expr(rhs);
                let unwrapped = match self.types.get(self.types.resolve_alias(lt)).kind {
                    TypeKind::Optional(w) => w,
                    _ => lt,
                };
                if self.types.equals(unwrapped, rt) {
                    rt
                } else {
                    self.types.t_any
                }
            }
            ExprKind::Call { callee, args } => self.call(line, callee, args),
            ExprKind::Member { object, name } => self.member(line, object, &name, false),
            ExprKind::OptionalChain { object, name } => self.member(line, object, &name, true),
            ExprKind::Subscript { object, index } => {
                let ot = self.expr(object);
                let it = self.expr(index);
                match self.types.get(self.types.resolve_alias(ot)).kind.clone() {
                    TypeKind::Array(e) => {
                        if !self.types.is_numeric(it) && !self.types.is_any_or_unresolved(it) {
                            self.error(line, "l'indice de tableau doit être numérique");
                        }
                        e
                    }
                    TypeKind::Dictionary(_, v) => v,
                    TypeKind::String => self.types.t_string,
                    TypeKind::Any | TypeKind::Unresolved => self.types.t_any,
                    _ => {
                        let shown = self.types.display(ot);
                        self.error(line, format!("`{shown}` ne supporte pas l'indexation"));
                        self.types.t_any
                    }
                }
            }
            ExprKind::ForceUnwrap { operand } => {
                let t = self.expr(operand);
                match self.types.get(self.types.resolve_alias(t)).kind {
                    TypeKind::Optional(w) => w,
                    TypeKind::Any | TypeKind::Unresolved | TypeKind::Nil => self.types.t_any,
                    _ => t, // déballer un non-optionnel est inoffensif
                }
            }
            ExprKind::Cast { operand, ty } => {
                self.expr(operand);
                self.resolve_type_expr(ty)
            }
            ExprKind::ArrayLit(elems) => {
                let mut elem_ty: Option<TypeId> = None;
                for e in elems {
                    let t = self.expr(e);
                    elem_ty = Some(match elem_ty {
                        None => t,
                        Some(prev) if self.types.equals(prev, t) => prev,
                        Some(_) => self.types.t_any,
                    });
                }
                let elem = elem_ty.unwrap_or(self.types.t_any);
                self.types.array_of(elem)
            }
            ExprKind::ObjectLit(entries) => {
                for (_, e) in entries {
                    self.expr(e);
                }
                self.types.t_any
            }
            ExprKind::Closure { params, body } => {
                let decl = FuncDecl {
                    name: String::new(),
                    params: params.clone(),
                    ret: None,
                    body: body.clone(),
                    is_async: false,
                    throws: false,
                    line,
                };
                self.function_body(&decl, None);
                let ps: Vec<TypeId> = params
                    .iter()
                    .map(|p| p.ty.map(|t| self.resolve_type_expr(t)).unwrap_or(self.types.t_any))
                    .collect();
                self.types.function_of(ps, self.types.t_any, false, false)
            }
            ExprKind::Await { operand } => self.expr(operand),
        };
        self.ast.exprs.get_mut(id).ty = Some(ty);
        ty
    }

    fn ident(&mut self, line: u32, name: &str) -> TypeId {
        match self.symbols.resolve(name) {
            Some(id) => {
                self.symbols.get_mut(id).used = true;
                self.symbols.get(id).ty
            }
            None if self.lenient_names => {
                // `import * from …` : le nom vient probablement du module
                let mut sym =
                    Symbol::new(name, SymbolKind::Variable, self.types.t_any, Span::new(line, 1, 1));
                sym.initialized = true;
                sym.used = true;
                let _ = self.symbols.declare(sym);
                self.types.t_any
            }
            None => {
                self.error(line, format!("nom non déclaré: `{name}`"));
                self.types.t_unresolved
            }
        }
    }

    fn unary(&mut self, line: u32, op: UnaryOp, operand: ExprId) -> TypeId {
        let t = self.expr(operand);
        match op {
            UnaryOp::Not => {
                if !matches!(self.types.get(self.types.resolve_alias(t)).kind, TypeKind::Bool)
                    && !self.types.is_any_or_unresolved(t)
                {
                    self.error(line, "`!` s'applique à Bool");
                }
                self.types.t_bool
            }
            UnaryOp::Neg | UnaryOp::Plus => {
                if self.types.is_any_or_unresolved(t) {
                    return self.types.t_any;
                }
                if !self.types.is_numeric(t) {
                    let shown = self.types.display(t);
                    self.error(line, format!("opérande numérique attendu, trouvé `{shown}`"));
                    return self.types.t_any;
                }
                t
            }
            UnaryOp::BitNot => {
                if !self.types.is_numeric(t) && !self.types.is_any_or_unresolved(t) {
                    self.error(line, "`~` s'applique à un entier");
                }
                self.types.t_int
            }
            UnaryOp::PreInc | UnaryOp::PreDec => {
                if !self.types.is_numeric(t) && !self.types.is_any_or_unresolved(t) {
                    self.error(line, "`++`/`--` s'appliquent à un nombre");
                }
                if let ExprKind::Ident(name) = &self.ast.expr(operand).kind {
                    let name = name.clone();
                    if let Some(sid) = self.symbols.resolve(&name) {
                        if !self.symbols.get(sid).mutable {
                            self.error(line, format!("`{name}` est immuable"));
                        }
                    }
                }
                t
            }
        }
    }

    fn binary(&mut self, line: u32, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> TypeId {
        let lt = self.expr(lhs);
        let rt = self.expr(rhs);
        let l = self.types.resolve_alias(lt);
        let r = self.types.resolve_alias(rt);
        let any = self.types.is_any_or_unresolved(l) || self.types.is_any_or_unresolved(r);
        match op {
            BinaryOp::Add => {
                let both_str = matches!(self.types.get(l).kind, TypeKind::String)
                    && matches!(self.types.get(r).kind, TypeKind::String);
                if both_str {
                    return self.types.t_string;
                }
                if any {
                    return self.types.t_any;
                }
                if self.types.is_numeric(l) && self.types.is_numeric(r) {
                    return self.types.common_numeric(l, r);
                }
                self.operand_error(line, "+", l, r);
                self.types.t_any
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                if any {
                    return self.types.t_any;
                }
                if self.types.is_numeric(l) && self.types.is_numeric(r) {
                    return self.types.common_numeric(l, r);
                }
                self.operand_error(line, op_symbol(op), l, r);
                self.types.t_any
            }
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr => {
                if !any && (!self.types.is_numeric(l) || !self.types.is_numeric(r)) {
                    self.operand_error(line, op_symbol(op), l, r);
                }
                self.types.t_int
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let both_str = matches!(self.types.get(l).kind, TypeKind::String)
                    && matches!(self.types.get(r).kind, TypeKind::String);
                if !any && !both_str && (!self.types.is_numeric(l) || !self.types.is_numeric(r)) {
                    self.operand_error(line, op_symbol(op), l, r);
                }
                self.types.t_bool
            }
            BinaryOp::Eq | BinaryOp::Ne => self.types.t_bool,
        }
    }

    fn operand_error(&mut self, line: u32, op: &str, l: TypeId, r: TypeId) {
        let (ls, rs) = (self.types.display(l), self.types.display(r));
        self.error(line, format!("opérandes invalides pour `{op}`: `{ls}` et `{rs}`"));
    }

    fn assign(&mut self, line: u32, target: ExprId, op: Option<BinaryOp>, value: ExprId) -> TypeId {
        let tt = self.expr(target);
        let vt = match op {
            // composé : typé comme l'opération binaire sous-jacente
            Some(bin) => self.binary(line, bin, target, value),
            None => self.expr(value),
        };
        // mutabilité
        if let ExprKind::Ident(name) = &self.ast.expr(target).kind {
            let name = name.clone();
            if let Some(sid) = self.symbols.resolve(&name) {
                let sym = self.symbols.get(sid);
                if !sym.mutable && sym.initialized && sym.kind == SymbolKind::Variable {
                    self.error(line, format!("affectation à l'immuable `{name}`"));
                }
                self.symbols.get_mut(sid).initialized = true;
            }
        }
        if !self.types.is_any_or_unresolved(tt) && !self.types.assignable(vt, tt) {
            self.error(
                line,
                format!(
                    "`{}` n'est pas assignable à `{}`",
                    self.types.display(vt),
                    self.types.display(tt)
                ),
            );
        }
        vt
    }

    fn call(&mut self, line: u32, callee: ExprId, args: Vec<ExprId>) -> TypeId {
        let ct = self.expr(callee);
        let arg_types: Vec<TypeId> = args.iter().map(|a| self.expr(*a)).collect();
        match self.types.get(self.types.resolve_alias(ct)).kind.clone() {
            TypeKind::Function { params, ret, .. } => {
                if params.len() != arg_types.len() {
                    self.error(
                        line,
                        format!("arité incorrecte: {} attendu(s), {} fourni(s)", params.len(), arg_types.len()),
                    );
                } else {
                    for (p, a) in params.iter().zip(&arg_types) {
                        if !self.types.assignable(*a, *p) {
                            self.error(
                                line,
                                format!(
                                    "argument `{}` incompatible avec `{}`",
                                    self.types.display(*a),
                                    self.types.display(*p)
                                ),
                            );
                        }
                    }
                }
                ret
            }
            // constructeur de struct : un argument par champ
            TypeKind::Struct => {
                let fields = self.types.get(ct).members.len();
                if fields != arg_types.len() {
                    self.error(
                        line,
                        format!("constructeur de struct: {fields} champ(s) attendu(s), {} fourni(s)", arg_types.len()),
                    );
                }
                ct
            }
            // constructeur de classe : champs initialisés dans la déclaration
            TypeKind::Class => {
                if !arg_types.is_empty() {
                    self.error(line, "le constructeur de classe ne prend pas d'argument");
                }
                ct
            }
            TypeKind::Any | TypeKind::Unresolved => self.types.t_any,
            _ => {
                let shown = self.types.display(ct);
                self.error(line, format!("`{shown}` n'est pas appelable"));
                self.types.t_any
            }
        }
    }

    fn member(&mut self, line: u32, object: ExprId, name: &str, optional: bool) -> TypeId {
        let ot = self.expr(object);
        let o = self.types.resolve_alias(ot);
        let t = match self.types.get(o).kind.clone() {
            TypeKind::Struct | TypeKind::Class | TypeKind::Enum => {
                let found = self
                    .types
                    .get(o)
                    .members
                    .iter()
                    .chain(self.types.get(o).methods.iter())
                    .find(|(n, _)| n == name)
                    .map(|(_, t)| *t);
                match found {
                    Some(t) => t,
                    None => {
                        // remonter la chaîne de supertypes
                        let mut cur = self.types.get(o).supertype;
                        let mut via_super = None;
                        while let Some(sup) = cur {
                            let hit = self
                                .types
                                .get(sup)
                                .members
                                .iter()
                                .chain(self.types.get(sup).methods.iter())
                                .find(|(n, _)| n == name)
                                .map(|(_, t)| *t);
                            if hit.is_some() {
                                via_super = hit;
                                break;
                            }
                            cur = self.types.get(sup).supertype;
                        }
                        match via_super {
                            Some(t) => t,
                            None => {
                                let shown = self.types.display(o);
                                self.error(line, format!("`{shown}` n'a pas de membre `{name}`"));
                                self.types.t_any
                            }
                        }
                    }
                }
            }
            TypeKind::Optional(w) if optional => {
                // a?.b : chaîne sur l'enveloppe
                let _ = w;
                self.types.t_any
            }
            // types natifs : méthodes de prototype résolues à l'exécution
            TypeKind::Array(_) | TypeKind::String | TypeKind::Dictionary(..) => self.types.t_any,
            TypeKind::Any | TypeKind::Unresolved | TypeKind::Nil => self.types.t_any,
            _ => {
                let shown = self.types.display(o);
                self.error(line, format!("`{shown}` n'a pas de membre `{name}`"));
                self.types.t_any
            }
        };
        if optional {
            self.types.optional_of(t)
        } else {
            t
        }
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
        BinaryOp::Shl => "<<",
        BinaryOp::Shr => ">>",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
    }
}

fn module_basename(path: &str) -> String {
    let trimmed = path.trim_start_matches("@/").trim_start_matches('$');
    let last = trimmed.rsplit(['/', '.']).next().unwrap_or(trimmed);
    last.to_string()
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn analyze(src: &str) -> (bool, Diagnostics) {
        let mut ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let (program, parse_err) = parse_source(src, &mut ast, &mut diags);
        assert!(!parse_err, "erreur de parse inattendue:\n{}", diags.rendered());
        let mut analyzer = Analyzer::new(&mut ast, &mut diags);
        let ok = analyzer.analyze(&program);
        (ok, diags)
    }

    #[test]
    fn simple_program_is_clean() {
        let (ok, d) = analyze("let x = 10\nvar y = x + 5\ny = y * 2\nprint(y)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn undeclared_name() {
        let (ok, d) = analyze("let x = oops");
        assert!(!ok);
        assert!(d.rendered().contains("nom non déclaré"));
    }

    #[test]
    fn duplicate_in_same_scope() {
        let (ok, d) = analyze("let x = 1\nlet x = 2");
        assert!(!ok);
        assert!(d.rendered().contains("déjà déclaré"));
    }

    #[test]
    fn shadowing_across_scopes_allowed() {
        let (ok, d) = analyze("let x = 1\n{ let x = 2\nprint(x) }\nprint(x)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn assignment_to_immutable() {
        let (ok, d) = analyze("let x = 1\nx = 2");
        assert!(!ok);
        assert!(d.rendered().contains("immuable"));
    }

    #[test]
    fn mutable_assignment_ok() {
        let (ok, d) = analyze("var x = 1\nx = 2\nprint(x)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn string_plus_string() {
        let (ok, d) = analyze("let a = \"x\"\nlet b = a + \"y\"\nprint(b)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn string_plus_number_rejected() {
        let (ok, d) = analyze("let a = \"x\" + 1");
        assert!(!ok);
        assert!(d.rendered().contains("opérandes invalides"));
    }

    #[test]
    fn numeric_common_type() {
        let (ok, _) = analyze("let a = 1 + 2.5\nprint(a)");
        assert!(ok);
    }

    #[test]
    fn logical_requires_bool() {
        let (ok, d) = analyze("let a = 1 && true");
        assert!(!ok);
        assert!(d.rendered().contains("Bool"));
    }

    #[test]
    fn return_outside_function() {
        let (ok, d) = analyze("return 1");
        assert!(!ok);
        assert!(d.rendered().contains("hors d'une fonction"));
    }

    #[test]
    fn break_outside_loop() {
        let (ok, d) = analyze("break");
        assert!(!ok);
        assert!(d.rendered().contains("hors d'une boucle"));
    }

    #[test]
    fn break_inside_loop_ok() {
        let (ok, d) = analyze("while true { break }");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn unused_variable_warns() {
        let (ok, d) = analyze("func f() { let unused = 1 }\nf()");
        assert!(ok, "{}", d.rendered());
        assert!(d.warning_count() >= 1);
        assert!(d.rendered().contains("jamais utilisée"));
    }

    #[test]
    fn uninitialized_mutable_warns() {
        let (ok, d) = analyze("var x: Int\nx = 1\nprint(x)");
        assert!(ok, "{}", d.rendered());
        assert!(d.rendered().contains("non initialisée"));
    }

    #[test]
    fn arity_mismatch() {
        let (ok, d) = analyze("func f(a: Int) { print(a) }\nf(1, 2)");
        assert!(!ok);
        assert!(d.rendered().contains("arité"));
    }

    #[test]
    fn forward_reference_between_functions() {
        let (ok, d) = analyze("func a() { b() }\nfunc b() { }\na()");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn struct_constructor_arity() {
        let (ok, d) = analyze("struct Pair { let a: Int\n let b: Int }\nlet p = Pair(1, 2)\nprint(p.a)");
        assert!(ok, "{}", d.rendered());
        let (ok2, d2) = analyze("struct Pair { let a: Int\n let b: Int }\nlet p = Pair(1)");
        assert!(!ok2);
        assert!(d2.rendered().contains("champ"));
    }

    #[test]
    fn member_on_unknown_composite_field() {
        let (ok, d) = analyze("struct P { let a: Int }\nlet p = P(1)\nprint(p.zzz)");
        assert!(!ok);
        assert!(d.rendered().contains("membre"));
    }

    #[test]
    fn class_conformance_checked() {
        let (ok, d) = analyze(
            "protocol Printable { func describe() }\nclass P: Printable { }\nlet p = P()",
        );
        assert!(!ok);
        assert!(d.rendered().contains("conforme"));
    }

    #[test]
    fn class_conformance_satisfied() {
        let (ok, d) = analyze(
            "protocol Printable { func describe() }\nclass P: Printable { func describe() { } }\nlet p = P()\nprint(p)",
        );
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn guard_else_must_exit() {
        let (ok, d) = analyze("func f(x: Int) { guard x > 0 else { print(x) } }\nf(1)");
        assert!(!ok);
        assert!(d.rendered().contains("guard"));
        let (ok2, d2) = analyze("func f(x: Int) { guard x > 0 else { return } print(x) }\nf(1)");
        assert!(ok2, "{}", d2.rendered());
    }

    #[test]
    fn imports_register_symbols() {
        let (ok, d) = analyze(
            "import \"math\"\nimport { sin, cos as c } from \"math\"\nprint(math)\nprint(sin)\nprint(c)",
        );
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn wildcard_import_permits_unknowns() {
        let (ok, d) = analyze("import * from \"string\"\nprint(uppercase)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn typealias_resolves() {
        let (ok, d) = analyze("typealias Meters = Double\nlet d: Meters = 3.5\nprint(d)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn for_in_element_type() {
        let (ok, d) = analyze("var sum = 0\nfor i in [1, 2, 3] { sum = sum + i }\nprint(sum)");
        assert!(ok, "{}", d.rendered());
    }

    #[test]
    fn non_iterable_rejected() {
        let (ok, d) = analyze("for i in 42 { print(i) }");
        assert!(!ok);
        assert!(d.rendered().contains("itérable"));
    }

    #[test]
    fn any_is_permissive() {
        let (ok, d) = analyze("import \"io\"\nlet x = io.whatever\nlet y = x + 1\nlet z = x(1, 2, 3)\nprint(y)\nprint(z)");
        assert!(ok, "{}", d.rendered());
    }
}
