//! swiftlang-compiler — AST annoté → bytecode (Chunk).
//!
//! Compilateur single-pass : un visiteur sur le Programme qui émet dans
//! le chunk de la fonction en construction. Une pile de `CompilerState`
//! suit la fonction courante : locales (nom + profondeur + drapeau
//! non-initialisé), upvalues (is_local + index), profondeur lexicale,
//! et le descripteur de la boucle englobante (offset de départ,
//! profondeur d'entrée, fixups de break/continue).
//!
//! Le compilateur ne re-vérifie pas la sémantique : il suppose les
//! annotations de l'analyseur. Les échecs restants (saut trop long,
//! plus de 255 locales) passent par Diagnostics et laissent un code
//! structurellement bien formé.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

use std::collections::HashSet;
use std::rc::Rc;

use swiftlang_core::ast::*;
use swiftlang_core::bytecode::chunk::{Chunk, Const, Function, MAX_CONST_INDEX};
use swiftlang_core::bytecode::op::{proto_id, Op};
use swiftlang_core::diagnostics::{Diagnostics, Level, Phase, Span};

/* ───────────────────────── États ───────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Module,
    Function,
    Method,
}

struct Local {
    name: String,
    /// -1 tant que l'initialiseur n'est pas terminé (interdit `let x = x`).
    depth: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalDesc {
    is_local: bool,
    index: u8,
}

struct LoopCtx {
    start: usize,
    /// Profondeur de portée à l'entrée : break/continue dépilent au-delà.
    scope_depth: u32,
    breaks: Vec<usize>,
    /// Fixups de continue (boucle C : la cible est l'incrément).
    continues: Vec<usize>,
    /// Continue saute en avant (boucle C) plutôt qu'en arrière.
    forward_continue: bool,
}

struct CompilerState {
    func: Function,
    locals: Vec<Local>,
    upvalues: Vec<UpvalDesc>,
    scope_depth: u32,
    loops: Vec<LoopCtx>,
    defers: Vec<(u32, StmtId)>,
}

impl CompilerState {
    fn new(name: &str, kind: FnKind) -> Self {
        // slot 0 réservé : le callee, ou `self` dans une méthode
        let slot0 = Local {
            name: if kind == FnKind::Method { "self".into() } else { String::new() },
            depth: 0,
        };
        Self {
            func: Function::new(name),
            locals: vec![slot0],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            defers: Vec::new(),
        }
    }
}

enum LocalLookup {
    Found(u8),
    Uninitialized,
    NotFound,
}

/* ───────────────────────── Compilateur ───────────────────────── */

struct Compiler<'a> {
    ast: &'a Ast,
    diags: &'a mut Diagnostics,
    states: Vec<CompilerState>,
    is_module: bool,
    module_path: Option<String>,
    struct_names: HashSet<String>,
}

/// Compile un programme en mode script. Le dernier statement-expression
/// du niveau global devient la valeur terminale (retournée par la VM).
pub fn compile(ast: &Ast, program: &Program, diags: &mut Diagnostics) -> Option<Rc<Function>> {
    Compiler::new(ast, diags, false, None).run(program)
}

/// Compile un programme en mode module : les définitions globales passent
/// par SET_GLOBAL (interceptées vers la portée du module) et `export`
/// publie via MODULE_EXPORT.
pub fn compile_module(
    ast: &Ast,
    program: &Program,
    diags: &mut Diagnostics,
    module_path: &str,
) -> Option<Rc<Function>> {
    Compiler::new(ast, diags, true, Some(module_path.to_string())).run(program)
}

impl<'a> Compiler<'a> {
    fn new(
        ast: &'a Ast,
        diags: &'a mut Diagnostics,
        is_module: bool,
        module_path: Option<String>,
    ) -> Self {
        let kind = if is_module { FnKind::Module } else { FnKind::Script };
        let name = module_path.clone().unwrap_or_else(|| "<script>".into());
        let mut state = CompilerState::new(&name, kind);
        state.func.module = module_path.clone();
        Self { ast, diags, states: vec![state], is_module, module_path, struct_names: HashSet::new() }
    }

    fn run(mut self, program: &Program) -> Option<Rc<Function>> {
        let errors_before = self.diags.count();
        let last_expr = if self.is_module {
            None
        } else {
            // dernier statement-expression : valeur terminale du script
            program.stmts.last().copied().filter(|s| {
                matches!(self.ast.stmt(*s).kind, StmtKind::Expr(_))
            })
        };
        for &stmt in &program.stmts {
            if Some(stmt) == last_expr {
                let StmtKind::Expr(e) = &self.ast.stmt(stmt).kind else { unreachable!() };
                let (e, line) = (*e, self.ast.stmt(stmt).line);
                self.expr(e);
                self.emit_op(Op::Return, line);
            } else {
                self.stmt(stmt);
            }
        }
        if self.chunk().code.last() != Some(&(Op::Return as u8)) {
            self.run_all_defers();
            let line = self.cur_line();
            self.emit_op(Op::Nil, line);
            self.emit_op(Op::Return, line);
        }
        let state = self.states.pop().expect("état script");
        if self.diags.count() > errors_before || self.diags.has_fatal() {
            return None;
        }
        Some(Rc::new(state.func))
    }

    /* ────── accès ────── */

    fn state(&mut self) -> &mut CompilerState {
        self.states.last_mut().expect("au moins un état")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state().func.chunk
    }

    fn cur_line(&mut self) -> u32 {
        let c = self.chunk();
        let off = c.code.len().saturating_sub(1);
        c.line_for(off).max(1)
    }

    fn error(&mut self, line: u32, msg: impl Into<String>) {
        self.diags.report(Level::Error, Phase::Compile, Some(Span::new(line, 1, 1)), msg, None);
    }

    /* ────── primitives d'émission ────── */

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.chunk().push_byte(byte, line);
    }

    fn emit_op(&mut self, op: Op, line: u32) {
        self.chunk().push_op(op, line);
    }

    fn emit_short(&mut self, v: u16, line: u32) {
        self.chunk().push_short(v, line);
    }

    /// Émet un saut avec opérande provisoire ; renvoie l'offset à patcher.
    fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit_op(op, line);
        let at = self.chunk().len();
        self.emit_short(0xFFFF, line);
        at
    }

    /// Patche la distance `offset+2 → position courante` (16 bits max).
    fn patch_jump(&mut self, offset: usize) {
        let dist = self.chunk().len() - (offset + 2);
        if dist > u16::MAX as usize {
            let line = self.cur_line();
            self.error(line, format!("saut trop long ({dist} octets, max {})", u16::MAX));
            return;
        }
        self.chunk().write_short_at(offset, dist as u16);
    }

    /// Saut arrière vers `start` (distance 16 bits non signée).
    fn emit_loop(&mut self, start: usize, line: u32) {
        self.emit_op(Op::Loop, line);
        let dist = self.chunk().len() + 2 - start;
        if dist > u16::MAX as usize {
            self.error(line, format!("boucle trop longue ({dist} octets, max {})", u16::MAX));
            self.emit_short(0, line);
            return;
        }
        self.emit_short(dist as u16, line);
    }

    /// CONSTANT si l'index tient sur un octet, CONSTANT_LONG sinon.
    fn emit_constant(&mut self, v: Const, line: u32) {
        let idx = self.chunk().add_const(v);
        if idx < 256 {
            self.emit_op(Op::Constant, line);
            self.emit_byte(idx as u8, line);
        } else if idx <= MAX_CONST_INDEX {
            self.emit_op(Op::ConstantLong, line);
            let [a, b, c, _] = idx.to_le_bytes();
            self.emit_byte(a, line);
            self.emit_byte(b, line);
            self.emit_byte(c, line);
        } else {
            self.error(line, "pool de constantes plein (2^24)");
        }
    }

    /// Index 1 octet d'une constante chaîne (noms de globaux, propriétés…).
    fn name_const(&mut self, name: &str, line: u32) -> u8 {
        let idx = self.chunk().add_const(Const::Str(name.to_string()));
        if idx > 255 {
            self.error(line, format!("trop de constantes nommées pour `{name}` (max 256)"));
            return 0;
        }
        idx as u8
    }

    /* ────── portées & locales ────── */

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let depth = self.state().scope_depth;
        self.run_defers_at(depth);
        self.state().scope_depth -= 1;
        let target = self.state().scope_depth as i32;
        while self
            .state()
            .locals
            .last()
            .is_some_and(|l| l.depth > target)
        {
            self.emit_op(Op::Pop, line);
            self.state().locals.pop();
        }
    }

    fn add_local(&mut self, name: &str, line: u32) -> Option<u8> {
        if self.state().locals.len() >= 256 {
            self.error(line, format!("trop de locales dans la fonction (max 255), `{name}` ignorée"));
            return None;
        }
        let slot = self.state().locals.len() as u8;
        self.state().locals.push(Local { name: name.to_string(), depth: -1 });
        Some(slot)
    }

    fn mark_initialized(&mut self) {
        let depth = self.state().scope_depth as i32;
        if let Some(l) = self.state().locals.last_mut() {
            l.depth = depth;
        }
    }

    fn resolve_local_in(&self, state: usize, name: &str) -> LocalLookup {
        let locals = &self.states[state].locals;
        for (i, l) in locals.iter().enumerate().rev() {
            if l.name == name {
                if l.depth == -1 {
                    return LocalLookup::Uninitialized;
                }
                return LocalLookup::Found(i as u8);
            }
        }
        LocalLookup::NotFound
    }

    fn add_upvalue(&mut self, state: usize, is_local: bool, index: u8, line: u32) -> u8 {
        let desc = UpvalDesc { is_local, index };
        if let Some(i) = self.states[state].upvalues.iter().position(|u| *u == desc) {
            return i as u8;
        }
        if self.states[state].upvalues.len() >= 256 {
            self.error(line, "trop d'upvalues capturées (max 255)");
            return 0;
        }
        self.states[state].upvalues.push(desc);
        (self.states[state].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, state: usize, name: &str, line: u32) -> Option<u8> {
        if state == 0 {
            return None;
        }
        let parent = state - 1;
        match self.resolve_local_in(parent, name) {
            LocalLookup::Found(slot) => Some(self.add_upvalue(state, true, slot, line)),
            LocalLookup::Uninitialized => None,
            LocalLookup::NotFound => self
                .resolve_upvalue(parent, name, line)
                .map(|idx| self.add_upvalue(state, false, idx, line)),
        }
    }

    fn emit_get_var(&mut self, name: &str, line: u32) {
        let cur = self.states.len() - 1;
        match self.resolve_local_in(cur, name) {
            LocalLookup::Found(slot) => {
                self.emit_op(Op::GetLocal, line);
                self.emit_byte(slot, line);
            }
            LocalLookup::Uninitialized => {
                self.error(line, format!("lecture de `{name}` dans son propre initialiseur"));
                self.emit_op(Op::Nil, line); // garde la pile équilibrée
            }
            LocalLookup::NotFound => match self.resolve_upvalue(cur, name, line) {
                Some(idx) => {
                    self.emit_op(Op::GetUpvalue, line);
                    self.emit_byte(idx, line);
                }
                None => {
                    let c = self.name_const(name, line);
                    self.emit_op(Op::GetGlobal, line);
                    self.emit_byte(c, line);
                }
            },
        }
    }

    fn emit_set_var(&mut self, name: &str, line: u32) {
        let cur = self.states.len() - 1;
        match self.resolve_local_in(cur, name) {
            LocalLookup::Found(slot) => {
                self.emit_op(Op::SetLocal, line);
                self.emit_byte(slot, line);
            }
            LocalLookup::Uninitialized | LocalLookup::NotFound => {
                match self.resolve_upvalue(cur, name, line) {
                    Some(idx) => {
                        self.emit_op(Op::SetUpvalue, line);
                        self.emit_byte(idx, line);
                    }
                    None => {
                        let c = self.name_const(name, line);
                        self.emit_op(Op::SetGlobal, line);
                        self.emit_byte(c, line);
                    }
                }
            }
        }
    }

    /// Définition d'un nom global : DEFINE_GLOBAL en script, SET_GLOBAL en
    /// module (le hook d'exécution de module intercepte et range dans la
    /// portée du module).
    fn emit_define_global(&mut self, name: &str, line: u32) {
        let c = self.name_const(name, line);
        let op = if self.is_module { Op::SetGlobal } else { Op::DefineGlobal };
        self.emit_op(op, line);
        self.emit_byte(c, line);
        if self.is_module {
            // SET_GLOBAL laisse la valeur sur la pile
            self.emit_op(Op::Pop, line);
        }
    }

    /* ────── defers ────── */

    fn run_defers_at(&mut self, depth: u32) {
        let to_run: Vec<StmtId> = {
            let state = self.state();
            let keep: Vec<(u32, StmtId)> =
                state.defers.iter().copied().filter(|(d, _)| *d < depth).collect();
            let run: Vec<StmtId> = state
                .defers
                .iter()
                .rev()
                .filter(|(d, _)| *d >= depth)
                .map(|(_, s)| *s)
                .collect();
            state.defers = keep;
            run
        };
        for s in to_run {
            self.stmt(s);
        }
    }

    fn run_all_defers(&mut self) {
        let to_run: Vec<StmtId> = self.state().defers.iter().rev().map(|(_, s)| *s).collect();
        for s in to_run {
            self.stmt(s);
        }
    }

    /* ────── statements ────── */

    fn stmt(&mut self, id: StmtId) {
        let line = self.ast.stmt(id).line;
        let kind = self.ast.stmt(id).kind.clone();
        match kind {
            StmtKind::Var { name, init, .. } => self.var_stmt(&name, init, line),
            StmtKind::Expr(e) => {
                self.expr(e);
                self.emit_op(Op::Pop, line);
            }
            StmtKind::Block(stmts) => {
                self.begin_scope();
                for s in stmts {
                    self.stmt(s);
                }
                self.end_scope(line);
            }
            StmtKind::If { cond, then_b, else_b } => {
                self.expr(cond);
                let else_jump = self.emit_jump(Op::JumpIfFalse, line);
                self.emit_op(Op::Pop, line);
                self.stmt(then_b);
                let end_jump = self.emit_jump(Op::Jump, line);
                self.patch_jump(else_jump);
                self.emit_op(Op::Pop, line);
                if let Some(e) = else_b {
                    self.stmt(e);
                }
                self.patch_jump(end_jump);
            }
            StmtKind::While { cond, body } => {
                let start = self.chunk().len();
                self.expr(cond);
                let exit = self.emit_jump(Op::JumpIfFalse, line);
                self.emit_op(Op::Pop, line);
                let depth = self.state().scope_depth;
                self.state().loops.push(LoopCtx {
                    start,
                    scope_depth: depth,
                    breaks: Vec::new(),
                    continues: Vec::new(),
                    forward_continue: false,
                });
                self.stmt(body);
                self.emit_loop(start, line);
                self.patch_jump(exit);
                self.emit_op(Op::Pop, line);
                let ctx = self.state().loops.pop().expect("boucle ouverte");
                for b in ctx.breaks {
                    self.patch_jump(b);
                }
            }
            StmtKind::For { init, cond, incr, body } => {
                self.begin_scope();
                if let Some(i) = init {
                    self.stmt(i);
                }
                let start = self.chunk().len();
                let exit = cond.map(|c| {
                    self.expr(c);
                    let j = self.emit_jump(Op::JumpIfFalse, line);
                    self.emit_op(Op::Pop, line);
                    j
                });
                let depth = self.state().scope_depth;
                self.state().loops.push(LoopCtx {
                    start,
                    scope_depth: depth,
                    breaks: Vec::new(),
                    continues: Vec::new(),
                    forward_continue: incr.is_some(),
                });
                self.stmt(body);
                // cible des continue : l'incrément
                let continues = std::mem::take(&mut self.state().loops.last_mut().expect("boucle").continues);
                for c in continues {
                    self.patch_jump(c);
                }
                if let Some(i) = incr {
                    self.expr(i);
                    self.emit_op(Op::Pop, line);
                }
                self.emit_loop(start, line);
                if let Some(exit) = exit {
                    self.patch_jump(exit);
                    self.emit_op(Op::Pop, line);
                }
                let ctx = self.state().loops.pop().expect("boucle ouverte");
                for b in ctx.breaks {
                    self.patch_jump(b);
                }
                self.end_scope(line);
            }
            StmtKind::ForIn { var, iterable, body } => self.for_in(&var, iterable, body, line),
            StmtKind::Return(value) => {
                self.run_all_defers();
                match value {
                    Some(e) => self.expr(e),
                    None => self.emit_op(Op::Nil, line),
                }
                self.emit_op(Op::Return, line);
            }
            StmtKind::Break => {
                let Some(scope_depth) = self.state().loops.last().map(|l| l.scope_depth) else {
                    return; // hors boucle : déjà signalé par la sema
                };
                self.pop_locals_to_depth(scope_depth, line);
                let j = self.emit_jump(Op::Jump, line);
                self.state().loops.last_mut().expect("boucle").breaks.push(j);
            }
            StmtKind::Continue => {
                let Some((scope_depth, start, forward)) = self
                    .state()
                    .loops
                    .last()
                    .map(|l| (l.scope_depth, l.start, l.forward_continue))
                else {
                    return;
                };
                self.pop_locals_to_depth(scope_depth, line);
                if forward {
                    let j = self.emit_jump(Op::Jump, line);
                    self.state().loops.last_mut().expect("boucle").continues.push(j);
                } else {
                    self.emit_loop(start, line);
                }
            }
            StmtKind::Defer(inner) => {
                let depth = self.state().scope_depth;
                self.state().defers.push((depth, inner));
            }
            StmtKind::Guard { cond, else_b } => {
                self.expr(cond);
                let else_jump = self.emit_jump(Op::JumpIfFalse, line);
                self.emit_op(Op::Pop, line);
                let end_jump = self.emit_jump(Op::Jump, line);
                self.patch_jump(else_jump);
                self.emit_op(Op::Pop, line);
                self.stmt(else_b);
                self.patch_jump(end_jump);
            }
            StmtKind::Switch { subject, cases, default } => {
                self.switch_stmt(subject, cases, default, line)
            }
            StmtKind::Throw(e) => {
                self.expr(e);
                self.emit_op(Op::Throw, line);
            }
            StmtKind::DoCatch { body, catch_name, catch_body } => {
                let handler = self.emit_jump(Op::PushHandler, line);
                self.stmt(body);
                self.emit_op(Op::PopHandler, line);
                let over = self.emit_jump(Op::Jump, line);
                self.patch_jump(handler);
                // la VM a poussé la valeur d'exception
                self.begin_scope();
                let name = catch_name.unwrap_or_default();
                let _ = self.add_local(if name.is_empty() { "(exception)" } else { &name }, line);
                self.mark_initialized();
                self.stmt(catch_body);
                self.end_scope(line);
                self.patch_jump(over);
            }
            StmtKind::Func(f) => self.func_stmt(&f, line),
            StmtKind::Class { name, fields, methods, .. } => {
                self.class_stmt(&name, &fields, &methods, line)
            }
            StmtKind::Struct { name, fields, methods } => {
                self.struct_stmt(&name, &fields, &methods, line)
            }
            StmtKind::Enum { name, cases } => {
                self.emit_op(Op::CreateObject, line);
                for (i, (case, raw)) in cases.iter().enumerate() {
                    self.emit_op(Op::Dup, line);
                    self.emit_constant(Const::Str(case.clone()), line);
                    let value = raw.map(|v| v as f64).unwrap_or(i as f64);
                    self.emit_constant(Const::Num(value), line);
                    self.emit_op(Op::SetProperty, line);
                    self.emit_op(Op::Pop, line);
                }
                self.define_named(&name, line);
            }
            StmtKind::Protocol { .. } | StmtKind::TypeAlias { .. } | StmtKind::Module { .. } => {}
            StmtKind::Extension { target, methods } => self.extension_stmt(&target, &methods, line),
            StmtKind::Import(decl) => self.import_stmt(&decl, line),
            StmtKind::Export(decl) => self.export_stmt(&decl, line),
        }
    }

    fn var_stmt(&mut self, name: &str, init: Option<ExprId>, line: u32) {
        if self.state().scope_depth > 0 {
            let _ = self.add_local(name, line);
            match init {
                Some(e) => self.expr(e),
                None => self.emit_op(Op::Nil, line),
            }
            self.mark_initialized();
        } else {
            match init {
                Some(e) => self.expr(e),
                None => self.emit_op(Op::Nil, line),
            }
            self.emit_define_global(name, line);
        }
    }

    /// Définit un nom : local si une portée est ouverte, global sinon.
    fn define_named(&mut self, name: &str, line: u32) {
        if self.state().scope_depth > 0 {
            let _ = self.add_local(name, line);
            self.mark_initialized();
        } else {
            self.emit_define_global(name, line);
        }
    }

    fn pop_locals_to_depth(&mut self, depth: u32, line: u32) {
        // émet les POP sans retirer les locales : le reste du corps de la
        // boucle compile toujours dans la même portée
        let count = self
            .state()
            .locals
            .iter()
            .filter(|l| l.depth > depth as i32)
            .count();
        for _ in 0..count {
            self.emit_op(Op::Pop, line);
        }
    }

    fn for_in(&mut self, var: &str, iterable: ExprId, body: StmtId, line: u32) {
        self.begin_scope();
        self.expr(iterable);
        self.emit_op(Op::GetIter, line);
        // deux locales fantômes réservent [tableau, index] sur la pile
        let _ = self.add_local("(iter array)", line);
        self.mark_initialized();
        let _ = self.add_local("(iter index)", line);
        self.mark_initialized();

        let start = self.chunk().len();
        self.emit_op(Op::ForIter, line);
        let exit = self.emit_jump(Op::JumpIfFalse, line);
        self.emit_op(Op::Pop, line); // le booléen

        let depth = self.state().scope_depth;
        self.state().loops.push(LoopCtx {
            start,
            scope_depth: depth,
            breaks: Vec::new(),
            continues: Vec::new(),
            forward_continue: false,
        });

        self.begin_scope();
        let _ = self.add_local(var, line); // liée à l'élément au sommet
        self.mark_initialized();
        self.stmt(body);
        self.end_scope(line);

        self.emit_loop(start, line);
        self.patch_jump(exit);
        self.emit_op(Op::Pop, line); // le booléen du chemin épuisé
        let ctx = self.state().loops.pop().expect("boucle ouverte");
        for b in ctx.breaks {
            self.patch_jump(b);
        }
        // dépile l'état d'itération et retire les deux fantômes
        self.emit_op(Op::Pop, line); // index
        self.emit_op(Op::Pop, line); // tableau
        let n = self.state().locals.len() - 2;
        self.state().locals.truncate(n);
        self.state().scope_depth -= 1;
    }

    fn switch_stmt(
        &mut self,
        subject: ExprId,
        cases: Vec<(Vec<ExprId>, Vec<StmtId>)>,
        default: Option<Vec<StmtId>>,
        line: u32,
    ) {
        self.begin_scope();
        self.expr(subject);
        let Some(slot) = self.add_local("(switch)", line) else {
            self.end_scope(line);
            return;
        };
        self.mark_initialized();

        let mut end_jumps = Vec::new();
        for (values, body) in cases {
            let mut hits = Vec::new();
            for v in values {
                self.emit_op(Op::GetLocal, line);
                self.emit_byte(slot, line);
                self.expr(v);
                self.emit_op(Op::Equal, line);
                let miss = self.emit_jump(Op::JumpIfFalse, line);
                self.emit_op(Op::Pop, line);
                hits.push(self.emit_jump(Op::Jump, line));
                self.patch_jump(miss);
                self.emit_op(Op::Pop, line);
            }
            let next_case = self.emit_jump(Op::Jump, line);
            for h in hits {
                self.patch_jump(h);
            }
            self.begin_scope();
            for s in body {
                self.stmt(s);
            }
            self.end_scope(line);
            end_jumps.push(self.emit_jump(Op::Jump, line));
            self.patch_jump(next_case);
        }
        if let Some(body) = default {
            self.begin_scope();
            for s in body {
                self.stmt(s);
            }
            self.end_scope(line);
        }
        for j in end_jumps {
            self.patch_jump(j);
        }
        self.end_scope(line);
    }

    /* ────── fonctions, classes, structs ────── */

    fn func_stmt(&mut self, f: &FuncDecl, line: u32) {
        if self.state().scope_depth > 0 {
            // locale déclarée avant le corps : la fonction peut se
            // référencer (récursion) ; la closure émise occupe son slot
            let _ = self.add_local(&f.name, line);
            self.mark_initialized();
            self.compile_function(&f.name, &f.params, &f.body, FnKind::Function, line);
        } else {
            self.compile_function(&f.name, &f.params, &f.body, FnKind::Function, line);
            self.emit_define_global(&f.name, line);
        }
    }

    /// Compile un corps de fonction dans un nouvel état, puis émet
    /// CLOSURE avec les descripteurs d'upvalues.
    fn compile_function(
        &mut self,
        name: &str,
        params: &[Param],
        body: &[StmtId],
        kind: FnKind,
        line: u32,
    ) {
        let mut state = CompilerState::new(name, kind);
        state.func.arity = params.len().min(255) as u8;
        state.func.module = self.module_path.clone();
        // profondeur 1 : les déclarations du corps sont des locales, jamais
        // dépilées explicitement (RETURN démonte la frame)
        state.scope_depth = 1;
        self.states.push(state);

        for p in params {
            let _ = self.add_local(&p.name, p.line);
            self.mark_initialized();
        }

        // corps à expression unique : retour implicite de sa valeur
        let implicit_ret = body.len() == 1
            && matches!(self.ast.stmt(body[0]).kind, StmtKind::Expr(_))
            && kind == FnKind::Function
            && name.is_empty();
        if implicit_ret {
            let StmtKind::Expr(e) = &self.ast.stmt(body[0]).kind else { unreachable!() };
            let e = *e;
            self.expr(e);
            self.emit_op(Op::Return, line);
        } else {
            for &s in body {
                self.stmt(s);
            }
        }
        // chemin de sortie implicite (chaque `return` explicite a déjà
        // compilé ses defers)
        if self.chunk().code.last() != Some(&(Op::Return as u8)) {
            self.run_all_defers();
            let last_line = self.cur_line();
            self.emit_op(Op::Nil, last_line);
            self.emit_op(Op::Return, last_line);
        }

        let mut done = self.states.pop().expect("état fonction");
        done.func.upvalue_count = done.upvalues.len().min(255) as u8;
        let upvalues = done.upvalues.clone();
        let idx = self.chunk().add_const(Const::Func(Rc::new(done.func)));
        if idx < 256 {
            self.emit_op(Op::Closure, line);
            self.emit_byte(idx as u8, line);
        } else if idx <= MAX_CONST_INDEX {
            self.emit_op(Op::ClosureLong, line);
            let [a, b, c, _] = idx.to_le_bytes();
            self.emit_byte(a, line);
            self.emit_byte(b, line);
            self.emit_byte(c, line);
        } else {
            self.error(line, "pool de constantes plein (2^24)");
        }
        for u in upvalues {
            self.emit_byte(u8::from(u.is_local), line);
            self.emit_byte(u.index, line);
        }
    }

    /// Une classe devient une fonction constructeur : objet vide, champs
    /// initialisés, méthodes accrochées en propriétés (le `self` est lié
    /// par la VM à l'appel de méthode).
    fn class_stmt(&mut self, name: &str, fields: &[FieldDecl], methods: &[FuncDecl], line: u32) {
        let mut state = CompilerState::new(name, FnKind::Function);
        state.func.module = self.module_path.clone();
        state.scope_depth = 1;
        self.states.push(state);

        self.emit_op(Op::CreateObject, line);
        for field in fields {
            self.emit_op(Op::Dup, line);
            self.emit_constant(Const::Str(field.name.clone()), field.line);
            match field.init {
                Some(e) => self.expr(e),
                None => self.emit_op(Op::Nil, field.line),
            }
            self.emit_op(Op::SetProperty, field.line);
            self.emit_op(Op::Pop, field.line);
        }
        for m in methods {
            self.emit_op(Op::Dup, m.line);
            self.emit_constant(Const::Str(m.name.clone()), m.line);
            self.compile_function(&m.name, &m.params, &m.body, FnKind::Method, m.line);
            self.emit_op(Op::SetProperty, m.line);
            self.emit_op(Op::Pop, m.line);
        }
        self.emit_op(Op::Return, line);

        let mut done = self.states.pop().expect("état constructeur");
        done.func.upvalue_count = done.upvalues.len().min(255) as u8;
        let upvalues = done.upvalues.clone();
        let idx = self.chunk().add_const(Const::Func(Rc::new(done.func)));
        if idx < 256 {
            self.emit_op(Op::Closure, line);
            self.emit_byte(idx as u8, line);
        } else {
            self.emit_op(Op::ClosureLong, line);
            let [a, b, c, _] = idx.to_le_bytes();
            self.emit_byte(a, line);
            self.emit_byte(b, line);
            self.emit_byte(c, line);
        }
        for u in upvalues {
            self.emit_byte(u8::from(u.is_local), line);
            self.emit_byte(u.index, line);
        }
        self.define_named(name, line);
    }

    /// Un struct : DEFINE_STRUCT (forme), puis une fonction constructeur
    /// homonyme qui pousse ses arguments et CREATE_STRUCT, et enfin les
    /// méthodes installées sur le prototype du struct.
    fn struct_stmt(&mut self, name: &str, fields: &[FieldDecl], methods: &[FuncDecl], line: u32) {
        self.struct_names.insert(name.to_string());

        if fields.len() > 255 {
            self.error(line, format!("struct `{name}`: trop de champs (max 255)"));
        }
        let name_c = self.name_const(name, line);
        self.emit_op(Op::DefineStruct, line);
        self.emit_byte(name_c, line);
        self.emit_byte(fields.len().min(255) as u8, line);
        for field in fields.iter().take(255) {
            let fc = self.name_const(&field.name, field.line);
            self.emit_byte(fc, field.line);
        }

        // constructeur : fn name(champ…) { CREATE_STRUCT(champ…) }
        let mut state = CompilerState::new(name, FnKind::Function);
        state.func.arity = fields.len().min(255) as u8;
        state.func.module = self.module_path.clone();
        state.scope_depth = 1;
        self.states.push(state);
        for field in fields {
            let _ = self.add_local(&field.name, field.line);
            self.mark_initialized();
        }
        for i in 0..fields.len() {
            self.emit_op(Op::GetLocal, line);
            self.emit_byte((i + 1) as u8, line);
        }
        let ctor_name_c = self.name_const(name, line);
        self.emit_op(Op::CreateStruct, line);
        self.emit_byte(ctor_name_c, line);
        self.emit_op(Op::Return, line);
        let done = self.states.pop().expect("état constructeur");
        let idx = self.chunk().add_const(Const::Func(Rc::new(done.func)));
        if idx < 256 {
            self.emit_op(Op::Closure, line);
            self.emit_byte(idx as u8, line);
        } else {
            self.emit_op(Op::ClosureLong, line);
            let [a, b, c, _] = idx.to_le_bytes();
            self.emit_byte(a, line);
            self.emit_byte(b, line);
            self.emit_byte(c, line);
        }
        self.define_named(name, line);

        // méthodes inline : installées sur le prototype du struct
        for m in methods {
            let proto_c = self.name_const(name, m.line);
            self.emit_op(Op::GetStructProto, m.line);
            self.emit_byte(proto_c, m.line);
            self.emit_constant(Const::Str(m.name.clone()), m.line);
            self.compile_function(&m.name, &m.params, &m.body, FnKind::Method, m.line);
            self.emit_op(Op::SetProperty, m.line);
            self.emit_op(Op::Pop, m.line);
        }
    }

    /// Méthodes d'extension : nom compilé `<Cible>_ext_<méthode>` (la
    /// sentinelle `_ext_`), installées sur le prototype du type visé.
    fn extension_stmt(&mut self, target: &str, methods: &[FuncDecl], line: u32) {
        enum ProtoTarget {
            Builtin(u8),
            Struct,
        }
        let proto = match target {
            "String" => ProtoTarget::Builtin(proto_id::STRING),
            "Array" => ProtoTarget::Builtin(proto_id::ARRAY),
            "Object" | "Any" => ProtoTarget::Builtin(proto_id::OBJECT),
            _ if self.struct_names.contains(target) => ProtoTarget::Struct,
            _ => {
                self.error(line, format!("extension non supportée pour `{target}`"));
                return;
            }
        };
        for m in methods {
            match proto {
                ProtoTarget::Builtin(id) => {
                    self.emit_op(Op::GetObjectProto, m.line);
                    self.emit_byte(id, m.line);
                }
                ProtoTarget::Struct => {
                    let c = self.name_const(target, m.line);
                    self.emit_op(Op::GetStructProto, m.line);
                    self.emit_byte(c, m.line);
                }
            }
            self.emit_constant(Const::Str(m.name.clone()), m.line);
            let mangled = format!("{target}_ext_{}", m.name);
            self.compile_function(&mangled, &m.params, &m.body, FnKind::Method, m.line);
            self.emit_op(Op::SetProperty, m.line);
            self.emit_op(Op::Pop, m.line);
        }
    }

    /* ────── imports / exports ────── */

    fn import_stmt(&mut self, decl: &ImportDecl, line: u32) {
        match decl {
            ImportDecl::Whole { path, alias } => {
                let c = self.name_const(path, line);
                self.emit_op(Op::LoadModule, line);
                self.emit_byte(c, line);
                let bound = alias.clone().unwrap_or_else(|| basename(path));
                self.emit_define_global(&bound, line);
            }
            ImportDecl::Specific { items, path } => {
                if is_builtin_path(path) {
                    // chemin rapide : LOAD_BUILTIN (module, nom) depuis la pile
                    for (name, alias) in items {
                        self.emit_constant(Const::Str(path.clone()), line);
                        self.emit_constant(Const::Str(name.clone()), line);
                        self.emit_op(Op::LoadBuiltin, line);
                        let bound = alias.clone().unwrap_or_else(|| name.clone());
                        self.emit_define_global(&bound, line);
                    }
                } else {
                    let c = self.name_const(path, line);
                    self.emit_op(Op::LoadModule, line);
                    self.emit_byte(c, line);
                    for (name, alias) in items {
                        self.emit_op(Op::Dup, line);
                        let n = self.name_const(name, line);
                        self.emit_op(Op::ImportFrom, line);
                        self.emit_byte(n, line);
                        let bound = alias.clone().unwrap_or_else(|| name.clone());
                        self.emit_define_global(&bound, line);
                    }
                    self.emit_op(Op::Pop, line);
                }
            }
            ImportDecl::Default { name, path } => {
                let c = self.name_const(path, line);
                self.emit_op(Op::LoadModule, line);
                self.emit_byte(c, line);
                let n = self.name_const("default", line);
                self.emit_op(Op::ImportFrom, line);
                self.emit_byte(n, line);
                self.emit_define_global(name, line);
            }
            ImportDecl::Namespace { alias, path } => {
                let c = self.name_const(path, line);
                self.emit_op(Op::LoadModule, line);
                self.emit_byte(c, line);
                self.emit_define_global(alias, line);
            }
            ImportDecl::Wildcard { path } => {
                let c = self.name_const(path, line);
                self.emit_op(Op::LoadModule, line);
                self.emit_byte(c, line);
                self.emit_op(Op::ImportAllFrom, line);
            }
        }
    }

    fn export_stmt(&mut self, decl: &ExportDecl, line: u32) {
        match decl {
            ExportDecl::Named(items) => {
                for (name, alias) in items {
                    self.emit_get_var(name, line);
                    let published = alias.as_deref().unwrap_or(name);
                    let c = self.name_const(published, line);
                    self.emit_op(Op::ModuleExport, line);
                    self.emit_byte(c, line);
                }
            }
            ExportDecl::Default(e) => {
                self.expr(*e);
                let c = self.name_const("default", line);
                self.emit_op(Op::ModuleExport, line);
                self.emit_byte(c, line);
            }
            ExportDecl::AllFrom(path) => {
                // ré-export : la VM splatte les exports du module chargé
                let c = self.name_const(path, line);
                self.emit_op(Op::LoadModule, line);
                self.emit_byte(c, line);
                let star = self.name_const("*", line);
                self.emit_op(Op::ModuleExport, line);
                self.emit_byte(star, line);
            }
            ExportDecl::Decl(inner) => {
                self.stmt(*inner);
                if let Some(name) = declared_name(&self.ast.stmt(*inner).kind) {
                    self.emit_get_var(&name, line);
                    let c = self.name_const(&name, line);
                    self.emit_op(Op::ModuleExport, line);
                    self.emit_byte(c, line);
                }
            }
        }
    }

    /* ────── expressions ────── */

    fn expr(&mut self, id: ExprId) {
        let line = self.ast.expr(id).line;
        let kind = self.ast.expr(id).kind.clone();
        match kind {
            ExprKind::Nil => self.emit_op(Op::Nil, line),
            ExprKind::Bool(true) => self.emit_op(Op::True, line),
            ExprKind::Bool(false) => self.emit_op(Op::False, line),
            ExprKind::Int(v) => self.emit_constant(Const::Num(v as f64), line),
            ExprKind::Float(v) => self.emit_constant(Const::Num(v), line),
            ExprKind::Str(s) => self.emit_constant(Const::Str(s), line),
            ExprKind::Char(c) => self.emit_constant(Const::Str(c.to_string()), line),
            ExprKind::Interp { parts, exprs } => {
                self.emit_constant(Const::Str(parts[0].clone()), line);
                for (i, e) in exprs.iter().enumerate() {
                    self.expr(*e);
                    self.emit_op(Op::ToString, line);
                    self.emit_op(Op::Add, line);
                    let tail = &parts[i + 1];
                    if !tail.is_empty() {
                        self.emit_constant(Const::Str(tail.clone()), line);
                        self.emit_op(Op::Add, line);
                    }
                }
            }
            ExprKind::Ident(name) => self.emit_get_var(&name, line),
            ExprKind::SelfRef => {
                self.emit_op(Op::GetLocal, line);
                self.emit_byte(0, line);
            }
            ExprKind::Unary { op, operand } => self.unary(op, operand, line),
            ExprKind::Binary { op, lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
                self.emit_binop(op, line);
            }
            ExprKind::Logical { op, lhs, rhs } => match op {
                LogicalOp::And => {
                    self.expr(lhs);
                    let end = self.emit_jump(Op::JumpIfFalse, line);
                    self.emit_op(Op::Pop, line);
                    self.expr(rhs);
                    self.patch_jump(end);
                }
                LogicalOp::Or => {
                    self.expr(lhs);
                    let els = self.emit_jump(Op::JumpIfFalse, line);
                    let end = self.emit_jump(Op::Jump, line);
                    self.patch_jump(els);
                    self.emit_op(Op::Pop, line);
                    self.expr(rhs);
                    self.patch_jump(end);
                }
            },
            ExprKind::Assign { target, op, value } => self.assign(target, op, value, line),
            ExprKind::Ternary { cond, then_e, else_e } => {
                self.expr(cond);
                let els = self.emit_jump(Op::JumpIfFalse, line);
                self.emit_op(Op::Pop, line);
                self.expr(then_e);
                let end = self.emit_jump(Op::Jump, line);
                self.patch_jump(els);
                self.emit_op(Op::Pop, line);
                self.expr(else_e);
                self.patch_jump(end);
            }
            ExprKind::NilCoalesce { lhs, rhs } => {
                self.expr(lhs);
                self.emit_op(Op::Dup, line);
                self.emit_op(Op::Nil, line);
                self.emit_op(Op::Equal, line);
                let keep = self.emit_jump(Op::JumpIfFalse, line);
                self.emit_op(Op::Pop, line); // bool
                self.emit_op(Op::Pop, line); // lhs nil
                self.expr(rhs);
                let end = self.emit_jump(Op::Jump, line);
                self.patch_jump(keep);
                self.emit_op(Op::Pop, line); // bool
                self.patch_jump(end);
            }
            ExprKind::Call { callee, args } => self.call(callee, &args, line),
            ExprKind::Member { object, name } => {
                self.expr(object);
                self.emit_constant(Const::Str(name), line);
                self.emit_op(Op::GetProperty, line);
            }
            ExprKind::OptionalChain { object, name } => {
                self.expr(object);
                let skip = self.emit_jump(Op::OptionalChain, line);
                self.emit_constant(Const::Str(name), line);
                self.emit_op(Op::GetProperty, line);
                self.patch_jump(skip);
            }
            ExprKind::Subscript { object, index } => {
                self.expr(object);
                self.expr(index);
                self.emit_op(Op::GetSubscript, line);
            }
            ExprKind::ForceUnwrap { operand } => {
                self.expr(operand);
                self.emit_op(Op::ForceUnwrap, line);
            }
            ExprKind::Cast { operand, .. } => {
                // le transtypage est purement statique
                self.expr(operand);
            }
            ExprKind::ArrayLit(elems) => {
                if elems.len() > 255 {
                    self.error(line, "littéral de tableau trop long (max 255 éléments)");
                }
                let count = elems.len().min(255);
                for e in elems.iter().take(count) {
                    self.expr(*e);
                }
                self.emit_op(Op::Array, line);
                self.emit_byte(count as u8, line);
            }
            ExprKind::ObjectLit(entries) => {
                self.emit_op(Op::CreateObject, line);
                for (key, value) in entries {
                    self.emit_op(Op::Dup, line);
                    self.emit_constant(Const::Str(key), line);
                    self.expr(value);
                    self.emit_op(Op::SetProperty, line);
                    self.emit_op(Op::Pop, line);
                }
            }
            ExprKind::Closure { params, body } => {
                self.compile_function("", &params, &body, FnKind::Function, line);
            }
            ExprKind::Await { operand } => {
                self.expr(operand);
                self.emit_op(Op::Await, line);
            }
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: ExprId, line: u32) {
        match op {
            UnaryOp::Neg => {
                self.expr(operand);
                self.emit_op(Op::Neg, line);
            }
            UnaryOp::Not => {
                self.expr(operand);
                self.emit_op(Op::Not, line);
            }
            UnaryOp::BitNot => {
                self.expr(operand);
                self.emit_op(Op::BitNot, line);
            }
            UnaryOp::Plus => self.expr(operand),
            UnaryOp::PreInc | UnaryOp::PreDec => {
                let ExprKind::Ident(name) = self.ast.expr(operand).kind.clone() else {
                    self.error(line, "`++`/`--` exigent une variable");
                    self.emit_op(Op::Nil, line);
                    return;
                };
                self.emit_get_var(&name, line);
                self.emit_constant(Const::Num(1.0), line);
                self.emit_op(if op == UnaryOp::PreInc { Op::Add } else { Op::Sub }, line);
                self.emit_set_var(&name, line);
            }
        }
    }

    fn emit_binop(&mut self, op: BinaryOp, line: u32) {
        let o = match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::Mod => Op::Mod,
            BinaryOp::BitAnd => Op::BitAnd,
            BinaryOp::BitOr => Op::BitOr,
            BinaryOp::BitXor => Op::BitXor,
            BinaryOp::Shl => Op::Shl,
            BinaryOp::Shr => Op::Shr,
            BinaryOp::Eq => Op::Equal,
            BinaryOp::Ne => Op::NotEqual,
            BinaryOp::Lt => Op::Less,
            BinaryOp::Le => Op::LessEqual,
            BinaryOp::Gt => Op::Greater,
            BinaryOp::Ge => Op::GreaterEqual,
        };
        self.emit_op(o, line);
    }

    fn assign(&mut self, target: ExprId, op: Option<BinaryOp>, value: ExprId, line: u32) {
        let target_kind = self.ast.expr(target).kind.clone();
        match target_kind {
            ExprKind::Ident(name) => {
                match op {
                    Some(bin) => {
                        self.emit_get_var(&name, line);
                        self.expr(value);
                        self.emit_binop(bin, line);
                    }
                    None => self.expr(value),
                }
                self.emit_set_var(&name, line);
            }
            ExprKind::Member { object, name } | ExprKind::OptionalChain { object, name } => {
                match op {
                    Some(bin) => {
                        // [obj] dup → lecture de l'ancien, calcul, puis écriture
                        self.expr(object);
                        self.emit_op(Op::Dup, line);
                        self.emit_constant(Const::Str(name.clone()), line);
                        self.emit_op(Op::GetProperty, line);
                        self.expr(value);
                        self.emit_binop(bin, line);
                        self.emit_constant(Const::Str(name), line);
                        self.emit_op(Op::Swap, line);
                        self.emit_op(Op::SetProperty, line);
                    }
                    None => {
                        self.expr(object);
                        self.emit_constant(Const::Str(name), line);
                        self.expr(value);
                        self.emit_op(Op::SetProperty, line);
                    }
                }
            }
            ExprKind::Subscript { object, index } => {
                match op {
                    Some(bin) => {
                        // objet et indice ré-évalués pour la lecture : la
                        // pile n'offre pas de copie en profondeur
                        self.expr(object);
                        self.expr(index);
                        self.expr(object);
                        self.expr(index);
                        self.emit_op(Op::GetSubscript, line);
                        self.expr(value);
                        self.emit_binop(bin, line);
                        self.emit_op(Op::SetSubscript, line);
                    }
                    None => {
                        self.expr(object);
                        self.expr(index);
                        self.expr(value);
                        self.emit_op(Op::SetSubscript, line);
                    }
                }
            }
            _ => {
                self.error(line, "cible d'affectation non compilable");
                self.emit_op(Op::Nil, line);
            }
        }
    }

    fn call(&mut self, callee: ExprId, args: &[ExprId], line: u32) {
        if args.len() > 255 {
            self.error(line, "trop d'arguments (max 255)");
        }
        let argc = args.len().min(255) as u8;
        // appel de méthode : le receveur devient le slot 0 du callee
        if let ExprKind::Member { object, name } = self.ast.expr(callee).kind.clone() {
            self.expr(object);
            self.emit_op(Op::Dup, line);
            self.emit_constant(Const::Str(name), line);
            self.emit_op(Op::GetProperty, line);
            self.emit_op(Op::Swap, line);
            for a in args {
                self.expr(*a);
            }
            self.emit_op(Op::MethodCall, line);
            self.emit_byte(argc, line);
            return;
        }
        self.expr(callee);
        for a in args {
            self.expr(*a);
        }
        self.emit_op(Op::Call, line);
        self.emit_byte(argc, line);
    }
}

/* ───────────────────────── Aides ───────────────────────── */

fn basename(path: &str) -> String {
    let trimmed = path.trim_start_matches("@/").trim_start_matches('$');
    trimmed.rsplit(['/', '.']).next().unwrap_or(trimmed).to_string()
}

/// Un chemin builtin : nom nu, sans préfixe ni séparateur.
fn is_builtin_path(path: &str) -> bool {
    !path.starts_with("@/")
        && !path.starts_with('$')
        && !path.contains('/')
        && !path.contains('.')
}

fn declared_name(kind: &StmtKind) -> Option<String> {
    match kind {
        StmtKind::Var { name, .. }
        | StmtKind::Func(FuncDecl { name, .. })
        | StmtKind::Class { name, .. }
        | StmtKind::Struct { name, .. }
        | StmtKind::Enum { name, .. } => Some(name.clone()),
        _ => None,
    }
}

/* ───────────────────────── Pipeline frontal ───────────────────────── */

/// Lexe, parse, analyse et compile une source en mode script.
pub fn compile_source(src: &str, file: &str, diags: &mut Diagnostics) -> Option<Rc<Function>> {
    let mut ast = Ast::new();
    diags.set_source(file, src);
    let (program, parse_err) = swiftlang_core::parser::parse_source(src, &mut ast, diags);
    let mut analyzer = swiftlang_core::sema::Analyzer::new(&mut ast, diags);
    let sema_ok = analyzer.analyze(&program);
    if parse_err || !sema_ok {
        return None;
    }
    let func = compile(&ast, &program, diags);
    if let Some(f) = &func {
        log::debug!("{file}: {} octets de bytecode, {} constantes", f.chunk.len(), f.chunk.consts.len());
    }
    ast.reset();
    func
}

/// Variante REPL : les noms inconnus sont tolérés (les lignes
/// précédentes ont défini des globaux que cette analyse ne voit pas).
pub fn compile_repl_source(src: &str, diags: &mut Diagnostics) -> Option<Rc<Function>> {
    let mut ast = Ast::new();
    diags.set_source("<repl>", src);
    let (program, parse_err) = swiftlang_core::parser::parse_source(src, &mut ast, diags);
    let mut analyzer = swiftlang_core::sema::Analyzer::new(&mut ast, diags);
    analyzer.set_lenient(true);
    let sema_ok = analyzer.analyze(&program);
    if parse_err || !sema_ok {
        return None;
    }
    let func = compile(&ast, &program, diags);
    ast.reset();
    func
}

/// Idem, en mode module (`compile_module`).
pub fn compile_module_source(
    src: &str,
    module_path: &str,
    diags: &mut Diagnostics,
) -> Option<Rc<Function>> {
    let mut ast = Ast::new();
    diags.set_source(module_path, src);
    let (program, parse_err) = swiftlang_core::parser::parse_source(src, &mut ast, diags);
    let mut analyzer = swiftlang_core::sema::Analyzer::new(&mut ast, diags);
    let sema_ok = analyzer.analyze(&program);
    if parse_err || !sema_ok {
        return None;
    }
    let func = compile_module(&ast, &program, diags, module_path);
    ast.reset();
    func
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use swiftlang_core::bytecode::disasm::disassemble;

    fn compile_ok(src: &str) -> Rc<Function> {
        let mut diags = Diagnostics::silent();
        match compile_source(src, "test.swift", &mut diags) {
            Some(f) => f,
            None => panic!("échec de compilation:\n{}", diags.rendered()),
        }
    }

    fn ops_of(chunk: &Chunk) -> Vec<Op> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off < chunk.code.len() {
            let op = Op::from_byte(chunk.code[off]).expect("opcode valide");
            out.push(op);
            off += 1 + operand_len(chunk, op, off);
        }
        out
    }

    fn operand_len(chunk: &Chunk, op: Op, operand_at: usize) -> usize {
        use swiftlang_core::bytecode::op::OperandKind::*;
        match op.operand_kind() {
            None => 0,
            Byte | ConstByte => 1,
            Short => 2,
            ConstLong => 3,
            ClosureSpecial => {
                let (idx, head) = if op == Op::Closure {
                    (chunk.code[operand_at] as u32, 1usize)
                } else {
                    let b = &chunk.code[operand_at..operand_at + 3];
                    (u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16, 3usize)
                };
                let n = match chunk.const_at(idx) {
                    Some(Const::Func(f)) => f.upvalue_count as usize,
                    _ => 0,
                };
                head + n * 2
            }
            StructDef => {
                let fc = chunk.code[operand_at + 1] as usize;
                2 + fc
            }
        }
    }

    #[test]
    fn script_returns_last_expression() {
        let f = compile_ok("let x = 21\nx + x");
        let ops = ops_of(&f.chunk);
        assert_eq!(ops.last(), Some(&Op::Return));
        // pas de POP après la dernière expression
        assert_eq!(&ops[ops.len() - 2..], &[Op::Add, Op::Return]);
    }

    #[test]
    fn locals_are_slot_addressed() {
        let f = compile_ok("func f() { let a = 1\nlet b = 2\nreturn b }\nf()");
        let inner = f
            .chunk
            .consts
            .iter()
            .find_map(|(_, c)| match c {
                Const::Func(f) => Some(f.clone()),
                _ => None,
            })
            .expect("fonction interne");
        let ops = ops_of(&inner.chunk);
        assert!(ops.contains(&Op::GetLocal));
        assert!(!ops.contains(&Op::GetGlobal));
    }

    #[test]
    fn globals_resolved_by_name() {
        let f = compile_ok("let a = 1\nprint(a)");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::DefineGlobal));
        assert!(ops.contains(&Op::GetGlobal));
    }

    #[test]
    fn if_emits_matched_jumps() {
        let f = compile_ok("var x = 0\nif true { x = 1 } else { x = 2 }");
        let chunk = &f.chunk;
        // chaque jz/jmp atterrit sur une frontière d'opcode dans le chunk
        let mut off = 0usize;
        let mut boundaries = std::collections::HashSet::new();
        while off < chunk.code.len() {
            boundaries.insert(off);
            let op = Op::from_byte(chunk.code[off]).unwrap();
            off += 1 + operand_len(chunk, op, off);
        }
        boundaries.insert(chunk.code.len());
        let mut off = 0usize;
        while off < chunk.code.len() {
            let op = Op::from_byte(chunk.code[off]).unwrap();
            if matches!(op, Op::Jump | Op::JumpIfFalse | Op::OptionalChain | Op::PushHandler) {
                let dist = chunk.read_short(off + 1) as usize;
                assert!(boundaries.contains(&(off + 3 + dist)), "saut hors frontière");
            }
            if op == Op::Loop {
                let dist = chunk.read_short(off + 1) as usize;
                assert!(boundaries.contains(&(off + 3 - dist)), "loop hors frontière");
            }
            off += 1 + operand_len(chunk, op, off);
        }
    }

    #[test]
    fn while_loop_shape() {
        let f = compile_ok("var i = 0\nwhile i < 3 { i = i + 1 }");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::Loop));
        assert!(ops.contains(&Op::JumpIfFalse));
    }

    #[test]
    fn for_in_uses_iterator_protocol() {
        let f = compile_ok("var s = 0\nfor i in [1, 2, 3] { s = s + i }");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::GetIter));
        assert!(ops.contains(&Op::ForIter));
    }

    #[test]
    fn closure_emits_upvalue_descriptors() {
        let f = compile_ok(
            "func make() { var c = 0\nfunc inc() { c = c + 1\nreturn c }\nreturn inc }\nmake()",
        );
        let make = f
            .chunk
            .consts
            .iter()
            .find_map(|(_, c)| match c {
                Const::Func(f) if f.name == "make" => Some(f.clone()),
                _ => None,
            })
            .expect("make");
        let inc = make
            .chunk
            .consts
            .iter()
            .find_map(|(_, c)| match c {
                Const::Func(f) if f.name == "inc" => Some(f.clone()),
                _ => None,
            })
            .expect("inc");
        assert_eq!(inc.upvalue_count, 1, "inc capture c");
        let ops = ops_of(&inc.chunk);
        assert!(ops.contains(&Op::GetUpvalue));
        assert!(ops.contains(&Op::SetUpvalue));
    }

    #[test]
    fn method_call_lowering() {
        let f = compile_ok("let xs = []\nxs.push(1)");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::MethodCall));
        assert!(ops.contains(&Op::Swap));
    }

    #[test]
    fn interpolation_lowering() {
        let f = compile_ok("let n = 2\nlet s = \"v=${n}!\"\nprint(s)");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::ToString));
        assert!(ops.iter().filter(|o| **o == Op::Add).count() >= 2);
    }

    #[test]
    fn struct_lowering() {
        let f = compile_ok("struct Pair { let a: Int\nlet b: Int }\nlet p = Pair(1, 2)\nprint(p.a)");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::DefineStruct));
        let ctor = f
            .chunk
            .consts
            .iter()
            .find_map(|(_, c)| match c {
                Const::Func(f) if f.name == "Pair" => Some(f.clone()),
                _ => None,
            })
            .expect("constructeur");
        assert_eq!(ctor.arity, 2);
        assert!(ops_of(&ctor.chunk).contains(&Op::CreateStruct));
    }

    #[test]
    fn extension_mangles_with_sentinel() {
        let f = compile_ok("extension String { func shout() { return self } }");
        let found = f.chunk.consts.iter().any(|(_, c)| match c {
            Const::Func(f) => f.name == "String_ext_shout",
            _ => false,
        });
        assert!(found, "nom de méthode d'extension avec sentinelle _ext_");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::GetObjectProto));
    }

    #[test]
    fn module_mode_uses_set_global_and_exports() {
        let mut diags = Diagnostics::silent();
        let f = compile_module_source(
            "func helper() { return 1 }\nexport { helper }",
            "utils",
            &mut diags,
        )
        .unwrap_or_else(|| panic!("échec:\n{}", diags.rendered()));
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::SetGlobal), "définition de module via SET_GLOBAL");
        assert!(!ops.contains(&Op::DefineGlobal));
        assert!(ops.contains(&Op::ModuleExport));
    }

    #[test]
    fn import_lowerings() {
        let f = compile_ok(
            "import \"@/utils\" as u\nimport { length } from \"string\"\nimport * from \"math\"\nprint(u)",
        );
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::LoadModule));
        assert!(ops.contains(&Op::LoadBuiltin));
        assert!(ops.contains(&Op::ImportAllFrom));
    }

    #[test]
    fn do_catch_throw_surface() {
        let f = compile_ok("do { throw \"boom\" } catch e { print(e) }");
        let ops = ops_of(&f.chunk);
        assert!(ops.contains(&Op::PushHandler));
        assert!(ops.contains(&Op::PopHandler));
        assert!(ops.contains(&Op::Throw));
    }

    #[test]
    fn locals_vanish_after_end_scope() {
        // après end_scope, resolve_local ne trouve plus les noms du bloc
        let ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let mut c = Compiler::new(&ast, &mut diags, false, None);
        c.begin_scope();
        let _ = c.add_local("x", 1);
        c.mark_initialized();
        let _ = c.add_local("y", 1);
        c.mark_initialized();
        assert!(matches!(c.resolve_local_in(0, "x"), LocalLookup::Found(_)));
        assert!(matches!(c.resolve_local_in(0, "y"), LocalLookup::Found(_)));
        c.end_scope(1);
        assert!(matches!(c.resolve_local_in(0, "x"), LocalLookup::NotFound));
        assert!(matches!(c.resolve_local_in(0, "y"), LocalLookup::NotFound));
    }

    #[test]
    fn jump_distance_boundary() {
        // 2^16−1 passe ; 2^16 échoue avec diagnostic, sans corruption
        let ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let mut c = Compiler::new(&ast, &mut diags, false, None);
        let j = c.emit_jump(Op::Jump, 1);
        for _ in 0..u16::MAX as usize {
            c.emit_op(Op::Nil, 1);
        }
        c.patch_jump(j);
        assert_eq!(c.diags.count(), 0);
        assert_eq!(c.chunk().read_short(j), u16::MAX);

        let mut diags2 = Diagnostics::silent();
        let ast2 = Ast::new();
        let mut c2 = Compiler::new(&ast2, &mut diags2, false, None);
        let j2 = c2.emit_jump(Op::Jump, 1);
        for _ in 0..(u16::MAX as usize + 1) {
            c2.emit_op(Op::Nil, 1);
        }
        c2.patch_jump(j2);
        assert_eq!(c2.diags.count(), 1);
        // l'opérande provisoire reste un u16 valide : pas de corruption
        assert_eq!(c2.chunk().read_short(j2), 0xFFFF);
    }

    #[test]
    fn constant_long_boundary() {
        let ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let mut c = Compiler::new(&ast, &mut diags, false, None);
        for i in 0..300 {
            c.emit_constant(Const::Num(i as f64), 1);
        }
        let ops = ops_of(&c.states[0].func.chunk);
        let shorts = ops.iter().filter(|o| **o == Op::Constant).count();
        let longs = ops.iter().filter(|o| **o == Op::ConstantLong).count();
        assert_eq!(shorts, 256);
        assert_eq!(longs, 44);
    }

    #[test]
    fn break_in_every_branch_still_patches() {
        let f = compile_ok(
            "var i = 0\nfor ; i < 10; i = i + 1 { if i > 1 { break } else { break } }\nprint(i)",
        );
        // le chunk se termine proprement
        assert_eq!(*f.chunk.code.last().unwrap(), Op::Return as u8);
        let text = disassemble(&f.chunk, "break-partout");
        assert!(!text.contains("octet inconnu"));
    }

    #[test]
    fn defer_runs_before_return() {
        let f = compile_ok("func f() { defer { print(1) } return 2 }\nf()");
        let inner = f
            .chunk
            .consts
            .iter()
            .find_map(|(_, c)| match c {
                Const::Func(f) if f.name == "f" => Some(f.clone()),
                _ => None,
            })
            .expect("f");
        let ops = ops_of(&inner.chunk);
        // l'appel différé (print) précède le Return
        let call_pos = ops.iter().position(|o| *o == Op::Call).expect("call");
        let ret_pos = ops.iter().position(|o| *o == Op::Return).expect("ret");
        assert!(call_pos < ret_pos);
    }
}
