//! parser.rs — Descente récursive + précédences Pratt.
//!
//! Échelle (du plus faible au plus fort) : affectation (assoc. droite,
//! `=` et composés), ternaire, `??`, `||`, `&&`, `|`, `^`, `&`, égalité,
//! relationnels, décalages, additif, multiplicatif, unaire préfixe,
//! postfixe (appel, indexation, membre, `?.`, `!`, `as T`), primaire.
//!
//! Récupération d'erreur : diagnostic puis resynchronisation sur un
//! mot-clé ouvreur de statement, un `;`, ou le début de la ligne
//! suivante ; le parsing continue pour remonter plusieurs erreurs par
//! fichier, dans la limite du cap de diagnostics.

use crate::ast::*;
use crate::diagnostics::{Diagnostics, Level, Phase};
use crate::token::{Token, TokenKind};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ast: &'a mut Ast,
    diags: &'a mut Diagnostics,
    had_error: bool,
    panic_mode: bool,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, ast: &'a mut Ast, diags: &'a mut Diagnostics) -> Self {
        Self { tokens, pos: 0, ast, diags, had_error: false, panic_mode: false }
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Parse le programme entier (statements ordonnés).
    pub fn parse_program(&mut self) -> Program {
        let mut program = Program::default();
        while !self.at_eof() {
            if let TokenKind::Error(msg) = self.peek_kind().clone() {
                let span = self.peek().span();
                self.diags.report(Level::Error, Phase::Lex, Some(span), msg, None);
                self.had_error = true;
                self.advance();
                continue;
            }
            if matches!(self.peek_kind(), TokenKind::KwModule) {
                let line = self.peek().line;
                self.advance();
                if let Some(name) = self.expect_ident("nom de module attendu") {
                    program.module_name = Some(name.clone());
                    let id = self.ast.add_stmt(StmtKind::Module { name }, line);
                    program.stmts.push(id);
                }
                self.eat(&TokenKind::Semicolon);
                continue;
            }
            if let Some(stmt) = self.statement() {
                program.stmts.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        program
    }

    /* ────── curseur ────── */

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or_else(|| self.tokens.last().expect("EOF présent"))
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn same(a: &TokenKind, b: &TokenKind) -> bool {
        std::mem::discriminant(a) == std::mem::discriminant(b)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        Self::same(self.peek_kind(), kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, msg: &str) -> bool {
        if self.eat(kind) {
            true
        } else {
            self.error_here(msg);
            false
        }
    }

    fn expect_ident(&mut self, msg: &str) -> Option<String> {
        if let TokenKind::Ident(name) = self.peek_kind() {
            let name = name.clone();
            self.advance();
            Some(name)
        } else {
            self.error_here(msg);
            None
        }
    }

    fn expect_string(&mut self, msg: &str) -> Option<String> {
        if let TokenKind::Str(s) = self.peek_kind() {
            let s = s.clone();
            self.advance();
            Some(s)
        } else {
            self.error_here(msg);
            None
        }
    }

    fn error_here(&mut self, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let span = self.peek().span();
        let full = format!("{msg}, trouvé `{}`", self.peek_kind());
        self.diags.report(Level::Error, Phase::Parse, Some(span), full, None);
    }

    /// Resynchronise sur une frontière de statement.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        let start_line = self.peek().line;
        while !self.at_eof() {
            if self.eat(&TokenKind::Semicolon) {
                return;
            }
            if self.peek().line > start_line || is_stmt_start(self.peek_kind()) {
                return;
            }
            self.advance();
        }
    }

    /* ────── statements ────── */

    fn statement(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        let kind = match self.peek_kind().clone() {
            // statement vide : toléré, rien à produire
            TokenKind::Semicolon => {
                self.advance();
                return None;
            }
            TokenKind::KwLet => return self.var_decl(false),
            TokenKind::KwVar => return self.var_decl(true),
            TokenKind::KwFunc => return self.func_stmt(false),
            TokenKind::KwAsync if matches!(self.peek_at(1), TokenKind::KwFunc) => {
                self.advance();
                return self.func_stmt(true);
            }
            TokenKind::KwClass => return self.class_decl(),
            TokenKind::KwStruct => return self.struct_decl(),
            TokenKind::KwEnum => return self.enum_decl(),
            TokenKind::KwProtocol => return self.protocol_decl(),
            TokenKind::KwExtension => return self.extension_decl(),
            TokenKind::KwTypealias => return self.typealias_decl(),
            TokenKind::KwImport => return self.import_decl(),
            TokenKind::KwExport => return self.export_decl(),
            TokenKind::KwIf => return self.if_stmt(),
            TokenKind::KwWhile => return self.while_stmt(),
            TokenKind::KwFor => return self.for_stmt(),
            TokenKind::KwSwitch => return self.switch_stmt(),
            TokenKind::KwGuard => return self.guard_stmt(),
            TokenKind::KwDo => return self.do_catch_stmt(),
            TokenKind::KwDefer => {
                self.advance();
                let inner = self.block()?;
                StmtKind::Defer(inner)
            }
            TokenKind::KwReturn => {
                self.advance();
                let value = if self.check(&TokenKind::Semicolon)
                    || self.check(&TokenKind::RBrace)
                    || self.at_eof()
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.eat(&TokenKind::Semicolon);
                StmtKind::Return(value)
            }
            TokenKind::KwBreak => {
                self.advance();
                self.eat(&TokenKind::Semicolon);
                StmtKind::Break
            }
            TokenKind::KwContinue => {
                self.advance();
                self.eat(&TokenKind::Semicolon);
                StmtKind::Continue
            }
            TokenKind::KwThrow => {
                self.advance();
                let value = self.expression()?;
                self.eat(&TokenKind::Semicolon);
                StmtKind::Throw(value)
            }
            TokenKind::KwModule => {
                self.advance();
                let name = self.expect_ident("nom de module attendu")?;
                self.eat(&TokenKind::Semicolon);
                StmtKind::Module { name }
            }
            TokenKind::LBrace => return self.block(),
            _ => {
                let expr = self.expression()?;
                self.eat(&TokenKind::Semicolon);
                StmtKind::Expr(expr)
            }
        };
        Some(self.ast.add_stmt(kind, line))
    }

    fn var_decl(&mut self, mutable: bool) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // let / var
        let name = self.expect_ident("nom de variable attendu")?;
        let ty = if self.eat(&TokenKind::Colon) { Some(self.type_expr()?) } else { None };
        let init = if self.eat(&TokenKind::Assign) { Some(self.expression()?) } else { None };
        self.eat(&TokenKind::Semicolon);
        Some(self.ast.add_stmt(StmtKind::Var { name, ty, init, mutable }, line))
    }

    fn func_stmt(&mut self, is_async: bool) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // func
        let decl = self.func_decl_tail(is_async, line)?;
        Some(self.ast.add_stmt(StmtKind::Func(decl), line))
    }

    /// Après le mot-clé `func` : nom, params, signature, corps.
    fn func_decl_tail(&mut self, is_async: bool, line: u32) -> Option<FuncDecl> {
        let name = self.expect_ident("nom de fonction attendu")?;
        self.expect(&TokenKind::LParen, "`(` attendu après le nom de fonction");
        let params = self.param_list()?;
        let throws = self.eat(&TokenKind::KwThrows);
        let ret = if self.eat(&TokenKind::Arrow) { Some(self.type_expr()?) } else { None };
        self.expect(&TokenKind::LBrace, "corps de fonction attendu");
        let body = self.stmt_list_until_rbrace();
        Some(FuncDecl { name, params, ret, body, is_async, throws, line })
    }

    fn param_list(&mut self) -> Option<Vec<Param>> {
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let line = self.peek().line;
                let name = self.expect_ident("nom de paramètre attendu")?;
                let ty = if self.eat(&TokenKind::Colon) { Some(self.type_expr()?) } else { None };
                params.push(Param { name, ty, line });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)` attendu après les paramètres");
        Some(params)
    }

    fn stmt_list_until_rbrace(&mut self) -> Vec<StmtId> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            if let Some(s) = self.statement() {
                stmts.push(s);
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RBrace, "`}` attendu");
        stmts
    }

    fn block(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.expect(&TokenKind::LBrace, "`{` attendu");
        let stmts = self.stmt_list_until_rbrace();
        Some(self.ast.add_stmt(StmtKind::Block(stmts), line))
    }

    fn if_stmt(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // if
        let cond = self.expression()?;
        let then_b = self.block()?;
        let else_b = if self.eat(&TokenKind::KwElse) {
            if self.check(&TokenKind::KwIf) {
                Some(self.if_stmt()?)
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Some(self.ast.add_stmt(StmtKind::If { cond, then_b, else_b }, line))
    }

    fn while_stmt(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // while
        let cond = self.expression()?;
        let body = self.block()?;
        Some(self.ast.add_stmt(StmtKind::While { cond, body }, line))
    }

    /// `for x in iterable { … }` ou `for init; cond; incr { … }`.
    fn for_stmt(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // for
        let parens = self.eat(&TokenKind::LParen);

        if let TokenKind::Ident(name) = self.peek_kind().clone() {
            if matches!(self.peek_at(1), TokenKind::KwIn) {
                self.advance(); // ident
                self.advance(); // in
                let iterable = self.expression()?;
                if parens {
                    self.expect(&TokenKind::RParen, "`)` attendu");
                }
                let body = self.block()?;
                return Some(self.ast.add_stmt(StmtKind::ForIn { var: name, iterable, body }, line));
            }
        }

        // forme C : init; cond; incr
        let init = if self.eat(&TokenKind::Semicolon) {
            None
        } else if matches!(self.peek_kind(), TokenKind::KwLet) {
            self.var_decl(false)
        } else if matches!(self.peek_kind(), TokenKind::KwVar) {
            self.var_decl(true)
        } else {
            let e = self.expression()?;
            self.expect(&TokenKind::Semicolon, "`;` attendu après l'initialisation");
            let l = self.ast.expr(e).line;
            Some(self.ast.add_stmt(StmtKind::Expr(e), l))
        };
        let cond = if self.check(&TokenKind::Semicolon) { None } else { Some(self.expression()?) };
        self.expect(&TokenKind::Semicolon, "`;` attendu après la condition");
        let incr = if self.check(&TokenKind::RParen) || self.check(&TokenKind::LBrace) {
            None
        } else {
            Some(self.expression()?)
        };
        if parens {
            self.expect(&TokenKind::RParen, "`)` attendu");
        }
        let body = self.block()?;
        Some(self.ast.add_stmt(StmtKind::For { init, cond, incr, body }, line))
    }

    fn guard_stmt(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // guard
        let cond = self.expression()?;
        self.expect(&TokenKind::KwElse, "`else` attendu après la condition de guard");
        let else_b = self.block()?;
        Some(self.ast.add_stmt(StmtKind::Guard { cond, else_b }, line))
    }

    fn switch_stmt(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // switch
        let subject = self.expression()?;
        self.expect(&TokenKind::LBrace, "`{` attendu après le sujet de switch");
        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            if self.eat(&TokenKind::KwCase) {
                let mut values = vec![self.expression()?];
                while self.eat(&TokenKind::Comma) {
                    values.push(self.expression()?);
                }
                self.expect(&TokenKind::Colon, "`:` attendu après les valeurs de case");
                let body = self.case_body();
                cases.push((values, body));
            } else if self.eat(&TokenKind::KwDefault) {
                self.expect(&TokenKind::Colon, "`:` attendu après default");
                default = Some(self.case_body());
            } else {
                self.error_here("`case` ou `default` attendu");
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "`}` attendu en fin de switch");
        Some(self.ast.add_stmt(StmtKind::Switch { subject, cases, default }, line))
    }

    fn case_body(&mut self) -> Vec<StmtId> {
        let mut body = Vec::new();
        while !self.check(&TokenKind::KwCase)
            && !self.check(&TokenKind::KwDefault)
            && !self.check(&TokenKind::RBrace)
            && !self.at_eof()
        {
            if let Some(s) = self.statement() {
                body.push(s);
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        body
    }

    fn do_catch_stmt(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // do
        let body = self.block()?;
        self.expect(&TokenKind::KwCatch, "`catch` attendu après le bloc do");
        let catch_name = if let TokenKind::Ident(n) = self.peek_kind().clone() {
            self.advance();
            Some(n)
        } else {
            None
        };
        let catch_body = self.block()?;
        Some(self.ast.add_stmt(StmtKind::DoCatch { body, catch_name, catch_body }, line))
    }

    /* ────── déclarations de types ────── */

    fn class_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // class
        let name = self.expect_ident("nom de classe attendu")?;
        let mut superclass = None;
        let mut protocols = Vec::new();
        if self.eat(&TokenKind::Colon) {
            superclass = self.expect_ident("nom de supertype attendu");
            while self.eat(&TokenKind::Comma) {
                if let Some(p) = self.expect_ident("nom de protocole attendu") {
                    protocols.push(p);
                }
            }
        }
        self.expect(&TokenKind::LBrace, "`{` attendu après l'en-tête de classe");
        let (fields, methods) = self.type_body();
        Some(self.ast.add_stmt(StmtKind::Class { name, superclass, protocols, fields, methods }, line))
    }

    fn struct_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // struct
        let name = self.expect_ident("nom de struct attendu")?;
        self.expect(&TokenKind::LBrace, "`{` attendu après le nom de struct");
        let (fields, methods) = self.type_body();
        Some(self.ast.add_stmt(StmtKind::Struct { name, fields, methods }, line))
    }

    /// Corps partagé class/struct : champs `let`/`var` et méthodes `func`.
    fn type_body(&mut self) -> (Vec<FieldDecl>, Vec<FuncDecl>) {
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let line = self.peek().line;
            match self.peek_kind().clone() {
                TokenKind::KwLet | TokenKind::KwVar => {
                    self.advance();
                    if let Some(name) = self.expect_ident("nom de champ attendu") {
                        let ty = if self.eat(&TokenKind::Colon) { self.type_expr() } else { None };
                        let init =
                            if self.eat(&TokenKind::Assign) { self.expression() } else { None };
                        self.eat(&TokenKind::Semicolon);
                        fields.push(FieldDecl { name, ty, init, line });
                    }
                }
                TokenKind::KwFunc => {
                    self.advance();
                    if let Some(m) = self.func_decl_tail(false, line) {
                        methods.push(m);
                    }
                }
                _ => {
                    self.error_here("champ ou méthode attendu");
                }
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RBrace, "`}` attendu en fin de corps de type");
        (fields, methods)
    }

    fn enum_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // enum
        let name = self.expect_ident("nom d'enum attendu")?;
        self.expect(&TokenKind::LBrace, "`{` attendu après le nom d'enum");
        let mut cases = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            if self.eat(&TokenKind::KwCase) {
                loop {
                    let Some(case_name) = self.expect_ident("nom de cas attendu") else { break };
                    let raw = if self.eat(&TokenKind::Assign) {
                        if let TokenKind::Int(v) = self.peek_kind().clone() {
                            self.advance();
                            Some(v)
                        } else {
                            self.error_here("valeur entière attendue pour le cas d'enum");
                            None
                        }
                    } else {
                        None
                    };
                    cases.push((case_name, raw));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.eat(&TokenKind::Semicolon);
            } else {
                self.error_here("`case` attendu dans un corps d'enum");
                break;
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RBrace, "`}` attendu en fin d'enum");
        Some(self.ast.add_stmt(StmtKind::Enum { name, cases }, line))
    }

    fn protocol_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // protocol
        let name = self.expect_ident("nom de protocole attendu")?;
        self.expect(&TokenKind::LBrace, "`{` attendu après le nom de protocole");
        let mut requirements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            if self.eat(&TokenKind::KwFunc) {
                if let Some(fn_name) = self.expect_ident("nom de méthode attendu") {
                    self.expect(&TokenKind::LParen, "`(` attendu");
                    let params = self.param_list().unwrap_or_default();
                    if self.eat(&TokenKind::Arrow) {
                        let _ = self.type_expr();
                    }
                    self.eat(&TokenKind::Semicolon);
                    requirements.push((fn_name, params.len()));
                }
            } else {
                self.error_here("exigence `func` attendue dans un protocole");
                break;
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RBrace, "`}` attendu en fin de protocole");
        Some(self.ast.add_stmt(StmtKind::Protocol { name, requirements }, line))
    }

    fn extension_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // extension
        let target = self.expect_ident("nom de type étendu attendu")?;
        self.expect(&TokenKind::LBrace, "`{` attendu après le nom d'extension");
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.at_eof() {
            let m_line = self.peek().line;
            if self.eat(&TokenKind::KwFunc) {
                if let Some(m) = self.func_decl_tail(false, m_line) {
                    methods.push(m);
                }
            } else {
                self.error_here("méthode `func` attendue dans une extension");
                break;
            }
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.expect(&TokenKind::RBrace, "`}` attendu en fin d'extension");
        Some(self.ast.add_stmt(StmtKind::Extension { target, methods }, line))
    }

    fn typealias_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // typealias
        let name = self.expect_ident("nom d'alias attendu")?;
        self.expect(&TokenKind::Assign, "`=` attendu après le nom d'alias");
        let ty = self.type_expr()?;
        self.eat(&TokenKind::Semicolon);
        Some(self.ast.add_stmt(StmtKind::TypeAlias { name, ty }, line))
    }

    /* ────── import / export ────── */

    fn import_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // import
        let decl = match self.peek_kind().clone() {
            // import "chemin" [as alias]
            TokenKind::Str(path) => {
                self.advance();
                let alias = if self.eat(&TokenKind::KwAs) {
                    self.expect_ident("alias attendu après `as`")
                } else {
                    None
                };
                ImportDecl::Whole { path, alias }
            }
            // import { a, b as c } from "chemin"
            TokenKind::LBrace => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    let Some(name) = self.expect_ident("nom importé attendu") else { break };
                    let alias = if self.eat(&TokenKind::KwAs) {
                        self.expect_ident("alias attendu après `as`")
                    } else {
                        None
                    };
                    items.push((name, alias));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "`}` attendu après la liste d'imports");
                self.expect(&TokenKind::KwFrom, "`from` attendu");
                let path = self.expect_string("chemin de module attendu")?;
                ImportDecl::Specific { items, path }
            }
            // import * as ns from "chemin" | import * from "chemin"
            TokenKind::Star => {
                self.advance();
                if self.eat(&TokenKind::KwAs) {
                    let alias = self.expect_ident("alias d'espace de noms attendu")?;
                    self.expect(&TokenKind::KwFrom, "`from` attendu");
                    let path = self.expect_string("chemin de module attendu")?;
                    ImportDecl::Namespace { alias, path }
                } else {
                    self.expect(&TokenKind::KwFrom, "`from` attendu");
                    let path = self.expect_string("chemin de module attendu")?;
                    ImportDecl::Wildcard { path }
                }
            }
            // import nom from "chemin"
            TokenKind::Ident(name) => {
                self.advance();
                self.expect(&TokenKind::KwFrom, "`from` attendu");
                let path = self.expect_string("chemin de module attendu")?;
                ImportDecl::Default { name, path }
            }
            _ => {
                self.error_here("forme d'import invalide");
                return None;
            }
        };
        self.eat(&TokenKind::Semicolon);
        Some(self.ast.add_stmt(StmtKind::Import(decl), line))
    }

    fn export_decl(&mut self) -> Option<StmtId> {
        let line = self.peek().line;
        self.advance(); // export
        let decl = match self.peek_kind().clone() {
            // export { a, b as c }
            TokenKind::LBrace => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    let Some(name) = self.expect_ident("nom exporté attendu") else { break };
                    let alias = if self.eat(&TokenKind::KwAs) {
                        self.expect_ident("alias attendu après `as`")
                    } else {
                        None
                    };
                    items.push((name, alias));
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace, "`}` attendu après la liste d'exports");
                self.eat(&TokenKind::Semicolon);
                ExportDecl::Named(items)
            }
            // export * from "chemin"
            TokenKind::Star => {
                self.advance();
                self.expect(&TokenKind::KwFrom, "`from` attendu");
                let path = self.expect_string("chemin de module attendu")?;
                self.eat(&TokenKind::Semicolon);
                ExportDecl::AllFrom(path)
            }
            // export default expr
            TokenKind::KwDefault => {
                self.advance();
                let value = self.expression()?;
                self.eat(&TokenKind::Semicolon);
                ExportDecl::Default(value)
            }
            // export <déclaration>
            _ => {
                let inner = self.statement()?;
                ExportDecl::Decl(inner)
            }
        };
        Some(self.ast.add_stmt(StmtKind::Export(decl), line))
    }

    /* ────── expressions ────── */

    pub fn expression(&mut self) -> Option<ExprId> {
        self.assignment()
    }

    fn assignment(&mut self) -> Option<ExprId> {
        let lhs = self.ternary()?;
        let op = match self.peek_kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Sub),
            TokenKind::StarAssign => Some(BinaryOp::Mul),
            TokenKind::SlashAssign => Some(BinaryOp::Div),
            _ => return Some(lhs),
        };
        let tok = self.advance();
        if !is_assign_target(&self.ast.expr(lhs).kind) {
            self.had_error = true;
            self.diags.report(
                Level::Error,
                Phase::Parse,
                Some(tok.span()),
                "cible d'affectation invalide",
                None,
            );
        }
        // assoc. droite
        let value = self.assignment()?;
        Some(self.ast.add_expr(ExprKind::Assign { target: lhs, op, value }, tok.line, tok.col))
    }

    fn ternary(&mut self) -> Option<ExprId> {
        let cond = self.coalesce()?;
        if self.check(&TokenKind::Question) {
            let tok = self.advance();
            let then_e = self.expression()?;
            self.expect(&TokenKind::Colon, "`:` attendu dans le ternaire");
            let else_e = self.expression()?;
            return Some(self.ast.add_expr(
                ExprKind::Ternary { cond, then_e, else_e },
                tok.line,
                tok.col,
            ));
        }
        Some(cond)
    }

    fn coalesce(&mut self) -> Option<ExprId> {
        let lhs = self.logic_or()?;
        if self.check(&TokenKind::QuestionQuestion) {
            let tok = self.advance();
            // assoc. droite : a ?? b ?? c == a ?? (b ?? c)
            let rhs = self.coalesce()?;
            return Some(self.ast.add_expr(ExprKind::NilCoalesce { lhs, rhs }, tok.line, tok.col));
        }
        Some(lhs)
    }

    fn logic_or(&mut self) -> Option<ExprId> {
        let mut lhs = self.logic_and()?;
        while self.check(&TokenKind::OrOr) {
            let tok = self.advance();
            let rhs = self.logic_and()?;
            lhs = self.ast.add_expr(
                ExprKind::Logical { op: LogicalOp::Or, lhs, rhs },
                tok.line,
                tok.col,
            );
        }
        Some(lhs)
    }

    fn logic_and(&mut self) -> Option<ExprId> {
        let mut lhs = self.bit_or()?;
        while self.check(&TokenKind::AndAnd) {
            let tok = self.advance();
            let rhs = self.bit_or()?;
            lhs = self.ast.add_expr(
                ExprKind::Logical { op: LogicalOp::And, lhs, rhs },
                tok.line,
                tok.col,
            );
        }
        Some(lhs)
    }

    fn bit_or(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[(TokenKind::Pipe, BinaryOp::BitOr)],
            Self::bit_xor,
        )
    }

    fn bit_xor(&mut self) -> Option<ExprId> {
        self.binary_level(&[(TokenKind::Caret, BinaryOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> Option<ExprId> {
        self.binary_level(&[(TokenKind::Amp, BinaryOp::BitAnd)], Self::equality)
    }

    fn equality(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::BangEq, BinaryOp::Ne)],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Ge, BinaryOp::Ge),
            ],
            Self::shift,
        )
    }

    fn shift(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[(TokenKind::Shl, BinaryOp::Shl), (TokenKind::Shr, BinaryOp::Shr)],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Option<ExprId> {
        self.binary_level(
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
            Self::unary,
        )
    }

    fn binary_level(
        &mut self,
        table: &[(TokenKind, BinaryOp)],
        next: fn(&mut Self) -> Option<ExprId>,
    ) -> Option<ExprId> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in table {
                if self.check(kind) {
                    let tok = self.advance();
                    let rhs = next(self)?;
                    lhs = self.ast.add_expr(
                        ExprKind::Binary { op: *op, lhs, rhs },
                        tok.line,
                        tok.col,
                    );
                    continue 'outer;
                }
            }
            break;
        }
        Some(lhs)
    }

    fn unary(&mut self) -> Option<ExprId> {
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::PlusPlus => Some(UnaryOp::PreInc),
            TokenKind::MinusMinus => Some(UnaryOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            let tok = self.advance();
            let operand = self.unary()?;
            return Some(self.ast.add_expr(ExprKind::Unary { op, operand }, tok.line, tok.col));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Option<ExprId> {
        let mut expr = self.primary()?;
        loop {
            match self.peek_kind().clone() {
                TokenKind::LParen => {
                    let tok = self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&TokenKind::RParen, "`)` attendu après les arguments");
                    expr = self.ast.add_expr(ExprKind::Call { callee: expr, args }, tok.line, tok.col);
                }
                TokenKind::LBracket => {
                    let tok = self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "`]` attendu après l'indice");
                    expr = self.ast.add_expr(
                        ExprKind::Subscript { object: expr, index },
                        tok.line,
                        tok.col,
                    );
                }
                TokenKind::Dot => {
                    let tok = self.advance();
                    let name = self.expect_ident("nom de membre attendu après `.`")?;
                    expr = self.ast.add_expr(
                        ExprKind::Member { object: expr, name },
                        tok.line,
                        tok.col,
                    );
                }
                TokenKind::QuestionDot => {
                    let tok = self.advance();
                    let name = self.expect_ident("nom de membre attendu après `?.`")?;
                    expr = self.ast.add_expr(
                        ExprKind::OptionalChain { object: expr, name },
                        tok.line,
                        tok.col,
                    );
                }
                TokenKind::Bang => {
                    let tok = self.advance();
                    expr = self.ast.add_expr(ExprKind::ForceUnwrap { operand: expr }, tok.line, tok.col);
                }
                TokenKind::KwAs => {
                    let tok = self.advance();
                    let ty = self.type_expr()?;
                    expr = self.ast.add_expr(ExprKind::Cast { operand: expr, ty }, tok.line, tok.col);
                }
                _ => break,
            }
        }
        Some(expr)
    }

    fn primary(&mut self) -> Option<ExprId> {
        let tok = self.peek().clone();
        match tok.kind.clone() {
            TokenKind::KwNil => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Nil, tok.line, tok.col))
            }
            TokenKind::KwTrue => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Bool(true), tok.line, tok.col))
            }
            TokenKind::KwFalse => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Bool(false), tok.line, tok.col))
            }
            TokenKind::Int(v) => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Int(v), tok.line, tok.col))
            }
            TokenKind::Float(v) => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Float(v), tok.line, tok.col))
            }
            TokenKind::Str(s) => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Str(s), tok.line, tok.col))
            }
            TokenKind::Char(c) => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Char(c), tok.line, tok.col))
            }
            TokenKind::InterpStart(first) => {
                self.advance();
                self.interpolation(first, tok.line, tok.col)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::Ident(name), tok.line, tok.col))
            }
            TokenKind::KwSelf => {
                self.advance();
                Some(self.ast.add_expr(ExprKind::SelfRef, tok.line, tok.col))
            }
            TokenKind::KwAwait => {
                self.advance();
                let operand = self.unary()?;
                Some(self.ast.add_expr(ExprKind::Await { operand }, tok.line, tok.col))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "`)` attendu");
                Some(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elems = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        elems.push(self.expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBracket, "`]` attendu en fin de tableau");
                Some(self.ast.add_expr(ExprKind::ArrayLit(elems), tok.line, tok.col))
            }
            TokenKind::LBrace => self.object_or_closure(tok.line, tok.col),
            TokenKind::Error(msg) => {
                let span = tok.span();
                self.diags.report(Level::Error, Phase::Lex, Some(span), msg, None);
                self.had_error = true;
                self.panic_mode = true;
                self.advance();
                None
            }
            _ => {
                self.error_here("expression attendue");
                None
            }
        }
    }

    fn interpolation(&mut self, first: String, line: u32, col: u32) -> Option<ExprId> {
        let mut parts = vec![first];
        let mut exprs = Vec::new();
        loop {
            exprs.push(self.expression()?);
            match self.peek_kind().clone() {
                TokenKind::InterpMid(s) => {
                    self.advance();
                    parts.push(s);
                }
                TokenKind::InterpEnd(s) => {
                    self.advance();
                    parts.push(s);
                    break;
                }
                _ => {
                    self.error_here("segment d'interpolation attendu");
                    return None;
                }
            }
        }
        Some(self.ast.add_expr(ExprKind::Interp { parts, exprs }, line, col))
    }

    /// `{` en position d'expression : littéral objet ou closure.
    fn object_or_closure(&mut self, line: u32, col: u32) -> Option<ExprId> {
        self.advance(); // '{'

        // `{}` : objet vide
        if self.eat(&TokenKind::RBrace) {
            return Some(self.ast.add_expr(ExprKind::ObjectLit(Vec::new()), line, col));
        }

        // `clé:` (ident ou chaîne) : littéral objet
        let object_like = matches!(
            (self.peek_kind(), self.peek_at(1)),
            (TokenKind::Ident(_) | TokenKind::Str(_), TokenKind::Colon)
        );
        if object_like {
            let mut entries = Vec::new();
            loop {
                let key = match self.peek_kind().clone() {
                    TokenKind::Ident(k) | TokenKind::Str(k) => {
                        self.advance();
                        k
                    }
                    _ => {
                        self.error_here("clé d'objet attendue");
                        return None;
                    }
                };
                self.expect(&TokenKind::Colon, "`:` attendu après la clé");
                let value = self.expression()?;
                entries.push((key, value));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::RBrace, "`}` attendu en fin d'objet");
            return Some(self.ast.add_expr(ExprKind::ObjectLit(entries), line, col));
        }

        // `params in` : closure paramétrée (lookahead borné puis rewind)
        let save = self.pos;
        let mut params = Vec::new();
        let mut is_closure = false;
        loop {
            if let TokenKind::Ident(name) = self.peek_kind().clone() {
                let p_line = self.peek().line;
                self.advance();
                params.push(Param { name, ty: None, line: p_line });
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                if self.eat(&TokenKind::KwIn) {
                    is_closure = true;
                }
            }
            break;
        }
        if !is_closure {
            self.pos = save;
            params.clear();
        }

        let body = self.stmt_list_until_rbrace();
        Some(self.ast.add_expr(ExprKind::Closure { params, body }, line, col))
    }

    /* ────── types ────── */

    fn type_expr(&mut self) -> Option<TypeExprId> {
        let line = self.peek().line;
        let mut base = match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                self.ast.add_type_expr(TypeExprKind::Named(name), line)
            }
            TokenKind::LBracket => {
                self.advance();
                let first = self.type_expr()?;
                let node = if self.eat(&TokenKind::Colon) {
                    let value = self.type_expr()?;
                    TypeExprKind::Dictionary(first, value)
                } else {
                    TypeExprKind::Array(first)
                };
                self.expect(&TokenKind::RBracket, "`]` attendu en fin de type");
                self.ast.add_type_expr(node, line)
            }
            TokenKind::LParen => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        items.push(self.type_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RParen, "`)` attendu");
                if self.eat(&TokenKind::Arrow) {
                    let ret = self.type_expr()?;
                    self.ast.add_type_expr(TypeExprKind::Function { params: items, ret }, line)
                } else {
                    self.ast.add_type_expr(TypeExprKind::Tuple(items), line)
                }
            }
            _ => {
                self.error_here("type attendu");
                return None;
            }
        };
        while self.eat(&TokenKind::Question) {
            base = self.ast.add_type_expr(TypeExprKind::Optional(base), line);
        }
        Some(base)
    }
}

fn is_assign_target(kind: &ExprKind) -> bool {
    matches!(
        kind,
        ExprKind::Ident(_)
            | ExprKind::Member { .. }
            | ExprKind::OptionalChain { .. }
            | ExprKind::Subscript { .. }
            | ExprKind::SelfRef
    )
}

fn is_stmt_start(kind: &TokenKind) -> bool {
    use TokenKind::*;
    matches!(
        kind,
        KwLet | KwVar
            | KwFunc
            | KwClass
            | KwStruct
            | KwEnum
            | KwProtocol
            | KwExtension
            | KwTypealias
            | KwImport
            | KwExport
            | KwModule
            | KwIf
            | KwWhile
            | KwFor
            | KwReturn
            | KwBreak
            | KwContinue
            | KwDefer
            | KwGuard
            | KwSwitch
            | KwThrow
            | KwDo
    )
}

/* ───────────────────────── API top-level ───────────────────────── */

/// Lexe + parse une source, renvoie `(programme, had_error)`.
pub fn parse_source(src: &str, ast: &mut Ast, diags: &mut Diagnostics) -> (Program, bool) {
    let tokens = crate::lexer::tokenize(src);
    let mut parser = Parser::new(tokens, ast, diags);
    let program = parser.parse_program();
    let had_error = parser.had_error();
    (program, had_error)
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;

    fn parse_ok(src: &str) -> (Ast, Program) {
        let mut ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let (program, had_error) = parse_source(src, &mut ast, &mut diags);
        assert!(!had_error, "erreurs inattendues:\n{}", diags.rendered());
        (ast, program)
    }

    fn parse_err(src: &str) -> Diagnostics {
        let mut ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let (_, had_error) = parse_source(src, &mut ast, &mut diags);
        assert!(had_error, "erreur attendue pour: {src}");
        diags
    }

    #[test]
    fn var_decls() {
        let (ast, p) = parse_ok("let x = 10; var y: Int = 2\nlet z: [String]");
        assert_eq!(p.stmts.len(), 3);
        match &ast.stmt(p.stmts[0]).kind {
            StmtKind::Var { name, mutable, init, .. } => {
                assert_eq!(name, "x");
                assert!(!mutable);
                assert!(init.is_some());
            }
            other => panic!("attendu Var, trouvé {other:?}"),
        }
        match &ast.stmt(p.stmts[1]).kind {
            StmtKind::Var { mutable, ty, .. } => {
                assert!(mutable);
                assert!(ty.is_some());
            }
            other => panic!("attendu Var, trouvé {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let (ast, p) = parse_ok("1 + 2 * 3");
        let StmtKind::Expr(e) = &ast.stmt(p.stmts[0]).kind else { panic!() };
        let ExprKind::Binary { op: BinaryOp::Add, rhs, .. } = &ast.expr(*e).kind else {
            panic!("addition attendue en racine")
        };
        assert!(matches!(ast.expr(*rhs).kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn assignment_is_right_assoc() {
        let (ast, p) = parse_ok("a = b = 1");
        let StmtKind::Expr(e) = &ast.stmt(p.stmts[0]).kind else { panic!() };
        let ExprKind::Assign { value, .. } = &ast.expr(*e).kind else { panic!() };
        assert!(matches!(ast.expr(*value).kind, ExprKind::Assign { .. }));
    }

    #[test]
    fn compound_assignment() {
        let (ast, p) = parse_ok("x += 2");
        let StmtKind::Expr(e) = &ast.stmt(p.stmts[0]).kind else { panic!() };
        assert!(matches!(
            ast.expr(*e).kind,
            ExprKind::Assign { op: Some(BinaryOp::Add), .. }
        ));
    }

    #[test]
    fn postfix_chain() {
        let (ast, p) = parse_ok("a.b[0](1, 2)!.c");
        let StmtKind::Expr(e) = &ast.stmt(p.stmts[0]).kind else { panic!() };
        // racine : membre `.c` sur un force-unwrap d'appel
        let ExprKind::Member { object, name } = &ast.expr(*e).kind else { panic!() };
        assert_eq!(name, "c");
        assert!(matches!(ast.expr(*object).kind, ExprKind::ForceUnwrap { .. }));
    }

    #[test]
    fn ternary_and_coalesce() {
        let (ast, p) = parse_ok("a ?? b ? 1 : 2");
        let StmtKind::Expr(e) = &ast.stmt(p.stmts[0]).kind else { panic!() };
        let ExprKind::Ternary { cond, .. } = &ast.expr(*e).kind else {
            panic!("ternaire attendu en racine")
        };
        assert!(matches!(ast.expr(*cond).kind, ExprKind::NilCoalesce { .. }));
    }

    #[test]
    fn interpolation_expr() {
        let (ast, p) = parse_ok(r#"let s = "a${1 + 2}b""#);
        let StmtKind::Var { init: Some(e), .. } = &ast.stmt(p.stmts[0]).kind else { panic!() };
        let ExprKind::Interp { parts, exprs } = &ast.expr(*e).kind else { panic!() };
        assert_eq!(parts, &vec!["a".to_string(), "b".to_string()]);
        assert_eq!(exprs.len(), 1);
    }

    #[test]
    fn closures_and_object_literals() {
        let (ast, p) = parse_ok("let f = { x, y in return x }\nlet o = { a: 1, \"b c\": 2 }\nlet v = {}");
        let StmtKind::Var { init: Some(f), .. } = &ast.stmt(p.stmts[0]).kind else { panic!() };
        let ExprKind::Closure { params, body } = &ast.expr(*f).kind else { panic!("closure attendue") };
        assert_eq!(params.len(), 2);
        assert_eq!(body.len(), 1);
        let StmtKind::Var { init: Some(o), .. } = &ast.stmt(p.stmts[1]).kind else { panic!() };
        let ExprKind::ObjectLit(entries) = &ast.expr(*o).kind else { panic!("objet attendu") };
        assert_eq!(entries.len(), 2);
        let StmtKind::Var { init: Some(v), .. } = &ast.stmt(p.stmts[2]).kind else { panic!() };
        assert!(matches!(&ast.expr(*v).kind, ExprKind::ObjectLit(e) if e.is_empty()));
    }

    #[test]
    fn zero_param_closure() {
        let (ast, p) = parse_ok("let f = { return 1 }");
        let StmtKind::Var { init: Some(f), .. } = &ast.stmt(p.stmts[0]).kind else { panic!() };
        let ExprKind::Closure { params, body } = &ast.expr(*f).kind else { panic!("closure attendue") };
        assert!(params.is_empty());
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn control_flow_statements() {
        let (_, p) = parse_ok(
            "if a { } else if b { } else { }\nwhile x < 10 { x = x + 1 }\nfor i = 0; i < 3; i = i + 1 { }\nfor x in xs { }",
        );
        assert_eq!(p.stmts.len(), 4);
    }

    #[test]
    fn func_class_struct() {
        let (ast, p) = parse_ok(
            "func add(a: Int, b: Int) -> Int { return a + b }\n\
             class Point: Shape, Printable { var x = 0\n func norm() { } }\n\
             struct Pair { let a: Int\n let b: Int }",
        );
        let StmtKind::Func(f) = &ast.stmt(p.stmts[0]).kind else { panic!() };
        assert_eq!(f.name, "add");
        assert_eq!(f.params.len(), 2);
        let StmtKind::Class { superclass, protocols, fields, methods, .. } = &ast.stmt(p.stmts[1]).kind
        else {
            panic!()
        };
        assert_eq!(superclass.as_deref(), Some("Shape"));
        assert_eq!(protocols.len(), 1);
        assert_eq!(fields.len(), 1);
        assert_eq!(methods.len(), 1);
        let StmtKind::Struct { fields, .. } = &ast.stmt(p.stmts[2]).kind else { panic!() };
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn import_forms() {
        let (ast, p) = parse_ok(
            "import \"math\"\n\
             import \"@/utils\" as u\n\
             import { sin, cos as c } from \"math\"\n\
             import defaults from \"config\"\n\
             import * as ns from \"$env\"\n\
             import * from \"string\"",
        );
        let forms: Vec<_> = p
            .stmts
            .iter()
            .map(|s| match &ast.stmt(*s).kind {
                StmtKind::Import(d) => d,
                other => panic!("import attendu, trouvé {other:?}"),
            })
            .collect();
        assert!(matches!(forms[0], ImportDecl::Whole { alias: None, .. }));
        assert!(matches!(forms[1], ImportDecl::Whole { alias: Some(_), .. }));
        assert!(matches!(forms[2], ImportDecl::Specific { items, .. } if items.len() == 2));
        assert!(matches!(forms[3], ImportDecl::Default { .. }));
        assert!(matches!(forms[4], ImportDecl::Namespace { .. }));
        assert!(matches!(forms[5], ImportDecl::Wildcard { .. }));
    }

    #[test]
    fn export_forms() {
        let (ast, p) = parse_ok(
            "export { a, b as c }\nexport default 42\nexport * from \"shared\"\nexport func f() { }",
        );
        assert!(matches!(
            &ast.stmt(p.stmts[0]).kind,
            StmtKind::Export(ExportDecl::Named(items)) if items.len() == 2
        ));
        assert!(matches!(&ast.stmt(p.stmts[1]).kind, StmtKind::Export(ExportDecl::Default(_))));
        assert!(matches!(&ast.stmt(p.stmts[2]).kind, StmtKind::Export(ExportDecl::AllFrom(_))));
        assert!(matches!(&ast.stmt(p.stmts[3]).kind, StmtKind::Export(ExportDecl::Decl(_))));
    }

    #[test]
    fn switch_guard_throw_docatch() {
        let (ast, p) = parse_ok(
            "switch x { case 1, 2: f()\n case 3: g()\n default: h() }\n\
             guard x > 0 else { return }\n\
             throw \"boom\"\n\
             do { f() } catch e { g() }",
        );
        let StmtKind::Switch { cases, default, .. } = &ast.stmt(p.stmts[0]).kind else { panic!() };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].0.len(), 2);
        assert!(default.is_some());
        assert!(matches!(&ast.stmt(p.stmts[1]).kind, StmtKind::Guard { .. }));
        assert!(matches!(&ast.stmt(p.stmts[2]).kind, StmtKind::Throw(_)));
        let StmtKind::DoCatch { catch_name, .. } = &ast.stmt(p.stmts[3]).kind else { panic!() };
        assert_eq!(catch_name.as_deref(), Some("e"));
    }

    #[test]
    fn module_declaration() {
        let (_, p) = parse_ok("module utils\nlet x = 1");
        assert_eq!(p.module_name.as_deref(), Some("utils"));
    }

    #[test]
    fn type_expressions() {
        let (ast, p) = parse_ok("let a: [Int]\nlet b: [String: Int]\nlet c: Int?\nlet d: (Int, Int) -> Bool");
        let tys: Vec<_> = p
            .stmts
            .iter()
            .map(|s| match &ast.stmt(*s).kind {
                StmtKind::Var { ty: Some(t), .. } => t,
                other => panic!("var typée attendue, trouvé {other:?}"),
            })
            .collect();
        assert!(matches!(ast.type_expr(*tys[0]).kind, TypeExprKind::Array(_)));
        assert!(matches!(ast.type_expr(*tys[1]).kind, TypeExprKind::Dictionary(..)));
        assert!(matches!(ast.type_expr(*tys[2]).kind, TypeExprKind::Optional(_)));
        assert!(matches!(ast.type_expr(*tys[3]).kind, TypeExprKind::Function { .. }));
    }

    #[test]
    fn recovery_surfaces_multiple_errors() {
        let mut ast = Ast::new();
        let mut diags = Diagnostics::silent();
        let (_, had_error) =
            parse_source("let = 1\nlet y = 2\nlet = 3\nlet z = 4", &mut ast, &mut diags);
        assert!(had_error);
        assert_eq!(diags.count(), 2, "les deux erreurs doivent être remontées");
    }

    #[test]
    fn stray_semicolons_tolerated() {
        let (_, p) = parse_ok("let x = 1;;\nwhile x < 2 { x = x + 1 };\n;");
        assert_eq!(p.stmts.len(), 2);
    }

    #[test]
    fn invalid_assign_target() {
        let d = parse_err("1 = 2");
        assert!(d.rendered().contains("cible d'affectation invalide"));
    }

    #[test]
    fn await_and_cast() {
        let (ast, p) = parse_ok("let x = await f() as Int");
        let StmtKind::Var { init: Some(e), .. } = &ast.stmt(p.stmts[0]).kind else { panic!() };
        assert!(matches!(ast.expr(*e).kind, ExprKind::Cast { .. }));
    }
}
