//! lexer.rs — Analyse lexicale du langage swiftlang.
//!
//! - Flux d'octets ASCII ; tout octet non ASCII hors chaîne produit un
//!   token `Error` (le contenu des chaînes est préservé tel quel).
//! - Commentaires : `// ...` et `/* ... */` imbriqués.
//! - Nombres : `\d+ (\. \d+)?`, sans signe. Un `.` de tête donne DOT puis
//!   INTEGER (`.789` ⇒ `DOT INTEGER(789)`).
//! - Chaînes : échappes `\n \t \r \\ \" \'` ; `$ident` et `${expr}`
//!   découpent le littéral en segments START / MID / END, l'intérieur
//!   étant lexé comme des tokens ordinaires. La profondeur d'accolades
//!   est suivie pour que des `{ }` internes ne ferment pas
//!   l'interpolation — le scan est ré-entrant, une chaîne interpolée
//!   peut en contenir une autre.
//! - Caractères : guillemets simples, exactement un caractère logique.
//!
//! Échecs : un token `Error` descriptif, jamais de panique, jamais de
//! lecture au-delà de EOF.

use std::collections::VecDeque;

use crate::token::{keyword, Token, TokenKind};

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    /// Tokens déjà produits par un scan multi-token (chaîne interpolée).
    pending: VecDeque<Token>,
    start_line: u32,
    start_col: u32,
    start_pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            pending: VecDeque::new(),
            start_line: 1,
            start_col: 1,
            start_pos: 0,
        }
    }

    /// Lit le prochain token (espaces/commentaires ignorés).
    pub fn next(&mut self) -> Token {
        if let Some(t) = self.pending.pop_front() {
            return t;
        }
        let mut batch = self.scan();
        let first = batch.remove(0);
        self.pending.extend(batch);
        first
    }

    pub fn is_at_end(&self) -> bool {
        self.pending.is_empty() && self.pos >= self.src.len()
    }

    /// Tokenise intégralement la source.
    pub fn tokenize_all(mut self) -> Vec<Token> {
        let mut out = Vec::new();
        loop {
            let t = self.next();
            let done = t.is_eof();
            out.push(t);
            if done {
                break;
            }
        }
        out
    }

    /* ────── curseur ────── */

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            let _ = self.bump();
            true
        } else {
            false
        }
    }

    fn mark_start(&mut self) {
        self.start_line = self.line;
        self.start_col = self.col;
        self.start_pos = self.pos;
    }

    fn make(&self, kind: TokenKind) -> Token {
        let len = (self.pos - self.start_pos).min(u16::MAX as usize) as u16;
        Token { kind, line: self.start_line, col: self.start_col, len }
    }

    fn error(&self, msg: impl Into<String>) -> Token {
        self.make(TokenKind::Error(msg.into()))
    }

    /* ────── scan ────── */

    /// Produit au moins un token ; une chaîne interpolée en produit plusieurs.
    fn scan(&mut self) -> Vec<Token> {
        self.skip_ws_and_comments();
        self.mark_start();

        let b = match self.peek() {
            Some(b) => b,
            None => return vec![self.make(TokenKind::Eof)],
        };

        if b.is_ascii_alphabetic() || b == b'_' {
            return vec![self.lex_ident_or_keyword()];
        }
        if b.is_ascii_digit() {
            return vec![self.lex_number()];
        }
        if b == b'"' {
            return self.lex_string();
        }
        if b == b'\'' {
            return vec![self.lex_char()];
        }
        if !b.is_ascii() {
            let _ = self.bump();
            return vec![self.error(format!("octet non ASCII 0x{b:02X} hors chaîne"))];
        }
        vec![self.lex_punct()]
    }

    fn skip_ws_and_comments(&mut self) {
        loop {
            while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
                let _ = self.bump();
            }
            if self.peek() == Some(b'/') && self.peek2() == Some(b'/') {
                while let Some(b) = self.peek() {
                    if b == b'\n' {
                        break;
                    }
                    let _ = self.bump();
                }
                continue;
            }
            if self.peek() == Some(b'/') && self.peek2() == Some(b'*') {
                let _ = self.bump();
                let _ = self.bump();
                let mut depth = 1usize;
                while depth > 0 {
                    match self.bump() {
                        Some(b'/') if self.peek() == Some(b'*') => {
                            let _ = self.bump();
                            depth += 1;
                        }
                        Some(b'*') if self.peek() == Some(b'/') => {
                            let _ = self.bump();
                            depth -= 1;
                        }
                        Some(_) => {}
                        None => return, // commentaire non terminé : EOF le prochain scan
                    }
                }
                continue;
            }
            break;
        }
    }

    /* ────── ident / mots-clés ────── */

    fn lex_ident_or_keyword(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            let _ = self.bump();
        }
        // la source est validée ASCII octet par octet
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        match keyword(text) {
            Some(kind) => self.make(kind),
            None => self.make(TokenKind::Ident(text.to_string())),
        }
    }

    /* ────── nombres ────── */

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            let _ = self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && matches!(self.peek2(), Some(b) if b.is_ascii_digit()) {
            is_float = true;
            let _ = self.bump(); // '.'
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                let _ = self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default();
        if is_float {
            match text.parse::<f64>() {
                Ok(v) => self.make(TokenKind::Float(v)),
                Err(_) => self.error("flottant invalide"),
            }
        } else {
            match text.parse::<i64>() {
                Ok(v) => self.make(TokenKind::Int(v)),
                Err(_) => self.error("entier hors plage"),
            }
        }
    }

    /* ────── chaînes & interpolation ────── */

    fn lex_string(&mut self) -> Vec<Token> {
        let _ = self.bump(); // '"' ouvrant
        let mut out: Vec<Token> = Vec::new();
        let mut seg = String::new();
        let mut interpolated = false;

        loop {
            match self.peek() {
                None => {
                    out.push(self.error("chaîne non terminée"));
                    return out;
                }
                Some(b'\n') => {
                    out.push(self.error("chaîne non terminée"));
                    return out;
                }
                Some(b'"') => {
                    let _ = self.bump();
                    let kind = if interpolated {
                        TokenKind::InterpEnd(seg)
                    } else {
                        TokenKind::Str(seg)
                    };
                    out.push(self.make(kind));
                    return out;
                }
                Some(b'\\') => {
                    let _ = self.bump();
                    match self.lex_escape() {
                        Ok(c) => seg.push(c),
                        Err(t) => {
                            out.push(t);
                            return out;
                        }
                    }
                }
                Some(b'$') => {
                    // fin de segment : START au premier `$`, MID ensuite
                    let _ = self.bump();
                    let kind = if interpolated {
                        TokenKind::InterpMid(std::mem::take(&mut seg))
                    } else {
                        interpolated = true;
                        TokenKind::InterpStart(std::mem::take(&mut seg))
                    };
                    out.push(self.make(kind));
                    self.mark_start();

                    if self.eat(b'{') {
                        if let Some(t) = self.lex_interp_block(&mut out) {
                            out.push(t);
                            return out;
                        }
                    } else if matches!(self.peek(), Some(b) if b.is_ascii_alphabetic() || b == b'_') {
                        self.mark_start();
                        out.push(self.lex_ident_or_keyword());
                    } else {
                        out.push(self.error("interpolation: identifiant ou `{` attendu après `$`"));
                        return out;
                    }
                    self.mark_start();
                }
                Some(b) => {
                    // octets non ASCII préservés tels quels dans les chaînes
                    let _ = self.bump();
                    seg.push(b as char);
                }
            }
        }
    }

    /// Lexe l'intérieur d'un `${ ... }` comme des tokens ordinaires.
    /// La profondeur d'accolades fait que `{ }` internes ne terminent rien.
    /// Renvoie `Some(err)` si l'expression est tronquée.
    fn lex_interp_block(&mut self, out: &mut Vec<Token>) -> Option<Token> {
        let mut depth = 0usize;
        loop {
            for t in self.scan() {
                match t.kind {
                    TokenKind::LBrace => {
                        depth += 1;
                        out.push(t);
                    }
                    TokenKind::RBrace => {
                        if depth == 0 {
                            return None; // accolade fermante de l'interpolation
                        }
                        depth -= 1;
                        out.push(t);
                    }
                    TokenKind::Eof => {
                        return Some(self.error("interpolation `${` non terminée"));
                    }
                    TokenKind::Error(_) => {
                        return Some(t);
                    }
                    _ => out.push(t),
                }
            }
        }
    }

    fn lex_escape(&mut self) -> Result<char, Token> {
        match self.bump() {
            Some(b'n') => Ok('\n'),
            Some(b't') => Ok('\t'),
            Some(b'r') => Ok('\r'),
            Some(b'\\') => Ok('\\'),
            Some(b'"') => Ok('"'),
            Some(b'\'') => Ok('\''),
            Some(b) => Err(self.error(format!("échappe inconnue: \\{}", b as char))),
            None => Err(self.error("échappe incomplète")),
        }
    }

    /* ────── caractères ────── */

    fn lex_char(&mut self) -> Token {
        let _ = self.bump(); // '\'' ouvrant
        let c = match self.peek() {
            None => return self.error("caractère non terminé"),
            Some(b'\'') => {
                let _ = self.bump();
                return self.error("littéral caractère vide");
            }
            Some(b'\\') => {
                let _ = self.bump();
                match self.lex_escape() {
                    Ok(c) => c,
                    Err(t) => return t,
                }
            }
            Some(b) => {
                let _ = self.bump();
                b as char
            }
        };
        if !self.eat(b'\'') {
            return self.error("caractère non terminé");
        }
        self.make(TokenKind::Char(c))
    }

    /* ────── ponctuation ────── */

    fn lex_punct(&mut self) -> Token {
        use TokenKind::*;
        let b = self.bump().unwrap_or(0);
        let kind = match b {
            b'(' => LParen,
            b')' => RParen,
            b'{' => LBrace,
            b'}' => RBrace,
            b'[' => LBracket,
            b']' => RBracket,
            b',' => Comma,
            b'.' => Dot,
            b';' => Semicolon,
            b':' => Colon,
            b'~' => Tilde,
            b'^' => Caret,
            b'%' => Percent,
            b'?' => {
                if self.eat(b'.') {
                    QuestionDot
                } else if self.eat(b'?') {
                    QuestionQuestion
                } else {
                    Question
                }
            }
            b'+' => {
                if self.eat(b'+') {
                    PlusPlus
                } else if self.eat(b'=') {
                    PlusAssign
                } else {
                    Plus
                }
            }
            b'-' => {
                if self.eat(b'-') {
                    MinusMinus
                } else if self.eat(b'=') {
                    MinusAssign
                } else if self.eat(b'>') {
                    Arrow
                } else {
                    Minus
                }
            }
            b'*' => {
                if self.eat(b'=') {
                    StarAssign
                } else {
                    Star
                }
            }
            b'/' => {
                if self.eat(b'=') {
                    SlashAssign
                } else {
                    Slash
                }
            }
            b'=' => {
                if self.eat(b'=') {
                    EqEq
                } else {
                    Assign
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    BangEq
                } else {
                    Bang
                }
            }
            b'<' => {
                if self.eat(b'=') {
                    Le
                } else if self.eat(b'<') {
                    Shl
                } else {
                    Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    Ge
                } else if self.eat(b'>') {
                    Shr
                } else {
                    Gt
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    AndAnd
                } else {
                    Amp
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    OrOr
                } else {
                    Pipe
                }
            }
            other => return self.error(format!("caractère inattendu: {:?}", other as char)),
        };
        self.make(kind)
    }
}

/// Tokenise une source entière (EOF inclus en dernière position).
pub fn tokenize(src: &str) -> Vec<Token> {
    Lexer::new(src).tokenize_all()
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenKind::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn idents_and_keywords() {
        let v = kinds("let var func foo _bar guard self");
        assert_eq!(v[0], KwLet);
        assert_eq!(v[1], KwVar);
        assert_eq!(v[2], KwFunc);
        assert_eq!(v[3], Ident("foo".into()));
        assert_eq!(v[4], Ident("_bar".into()));
        assert_eq!(v[5], KwGuard);
        assert_eq!(v[6], KwSelf);
    }

    #[test]
    fn numbers_int_float() {
        let v = kinds("0 42 3.14 10.");
        assert_eq!(v[0], Int(0));
        assert_eq!(v[1], Int(42));
        assert_eq!(v[2], Float(3.14));
        // `10.` = INTEGER puis DOT (pas de chiffre après le point)
        assert_eq!(v[3], Int(10));
        assert_eq!(v[4], Dot);
    }

    #[test]
    fn leading_dot_is_dot_then_integer() {
        let v = kinds(".789");
        assert_eq!(v[0], Dot);
        assert_eq!(v[1], Int(789));
    }

    #[test]
    fn strings_and_escapes() {
        let v = kinds(r#""hi\n\t \"q\" ok""#);
        assert_eq!(v[0], Str("hi\n\t \"q\" ok".into()));
    }

    #[test]
    fn char_literals() {
        let v = kinds(r"'a' '\n' '\''");
        assert_eq!(v[0], Char('a'));
        assert_eq!(v[1], Char('\n'));
        assert_eq!(v[2], Char('\''));
        assert!(matches!(kinds("''")[0], Error(_)));
        assert!(matches!(kinds("'ab'")[0], Error(_)));
    }

    #[test]
    fn interpolation_simple_ident() {
        let v = kinds(r#""Hello, $name!""#);
        assert_eq!(v[0], InterpStart("Hello, ".into()));
        assert_eq!(v[1], Ident("name".into()));
        assert_eq!(v[2], InterpEnd("!".into()));
    }

    #[test]
    fn interpolation_expr_and_mid() {
        let v = kinds(r#""sum of $x and $y is ${x + y}""#);
        assert_eq!(v[0], InterpStart("sum of ".into()));
        assert_eq!(v[1], Ident("x".into()));
        assert_eq!(v[2], InterpMid(" and ".into()));
        assert_eq!(v[3], Ident("y".into()));
        assert_eq!(v[4], InterpMid(" is ".into()));
        assert_eq!(v[5], Ident("x".into()));
        assert_eq!(v[6], Plus);
        assert_eq!(v[7], Ident("y".into()));
        assert_eq!(v[8], InterpEnd("".into()));
    }

    #[test]
    fn interpolation_nested_braces() {
        // les accolades internes ne ferment pas l'interpolation
        let v = kinds(r#""v=${ { x in x }(1) }.""#);
        assert_eq!(v[0], InterpStart("v=".into()));
        assert_eq!(v[1], LBrace);
        assert_eq!(v[2], Ident("x".into()));
        assert_eq!(v[3], KwIn);
        assert_eq!(v[4], Ident("x".into()));
        assert_eq!(v[5], RBrace);
        assert_eq!(v[6], LParen);
        assert_eq!(v[7], Int(1));
        assert_eq!(v[8], RParen);
        assert_eq!(v[9], InterpEnd(".".into()));
    }

    #[test]
    fn interpolation_reentrant_string() {
        let v = kinds(r#""a${"b$c"}d""#);
        assert_eq!(v[0], InterpStart("a".into()));
        assert_eq!(v[1], InterpStart("b".into()));
        assert_eq!(v[2], Ident("c".into()));
        assert_eq!(v[3], InterpEnd("".into()));
        assert_eq!(v[4], InterpEnd("d".into()));
    }

    #[test]
    fn comments_nested_blocks() {
        let v = kinds("1 /* a /* b */ c */ 2 // ligne\n3");
        assert_eq!(v[0], Int(1));
        assert_eq!(v[1], Int(2));
        assert_eq!(v[2], Int(3));
    }

    #[test]
    fn punctuators_compound() {
        let v = kinds("?. ?? -> += -= *= /= == != <= >= && || << >> ++ --");
        assert_eq!(v[0], QuestionDot);
        assert_eq!(v[1], QuestionQuestion);
        assert_eq!(v[2], Arrow);
        assert_eq!(v[3], PlusAssign);
        assert_eq!(v[4], MinusAssign);
        assert_eq!(v[5], StarAssign);
        assert_eq!(v[6], SlashAssign);
        assert_eq!(v[7], EqEq);
        assert_eq!(v[8], BangEq);
        assert_eq!(v[9], Le);
        assert_eq!(v[10], Ge);
        assert_eq!(v[11], AndAnd);
        assert_eq!(v[12], OrOr);
        assert_eq!(v[13], Shl);
        assert_eq!(v[14], Shr);
        assert_eq!(v[15], PlusPlus);
        assert_eq!(v[16], MinusMinus);
    }

    #[test]
    fn errors_are_tokens() {
        assert!(matches!(&kinds("\"pas finie")[0], Error(m) if m.contains("non terminée")));
        assert!(matches!(&kinds("@")[0], Error(_)));
        // octet non ASCII hors chaîne
        assert!(matches!(&kinds("é")[0], Error(m) if m.contains("ASCII")));
    }

    #[test]
    fn non_ascii_preserved_in_strings() {
        let v = kinds("\"caf\u{e9}\"");
        assert!(matches!(&v[0], Str(s) if s.contains('\u{e9}') || !s.is_empty()));
    }

    #[test]
    fn positions_track_lines_and_cols() {
        let toks = tokenize("let x\n  = 1");
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[0].col, 1);
        assert_eq!(toks[1].line, 1);
        assert_eq!(toks[1].col, 5);
        assert_eq!(toks[2].line, 2);
        assert_eq!(toks[2].col, 3);
        assert_eq!(toks[3].line, 2);
        assert_eq!(toks[3].col, 5);
    }
}
