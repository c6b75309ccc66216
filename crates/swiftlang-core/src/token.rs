//! token.rs — Jeu de tokens du langage swiftlang.
//!
//! Trois tags portent l'interpolation de chaînes : `InterpStart` (segment
//! avant le premier `$`), `InterpMid` (segment entre deux expressions),
//! `InterpEnd` (queue finale). L'intérieur des expressions est lexé comme
//! des tokens ordinaires.

use std::fmt;

/// Un token : tag + position 1-based + longueur du lexème (pour le caret).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
    pub len: u16,
}

impl Token {
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    pub fn span(&self) -> crate::diagnostics::Span {
        crate::diagnostics::Span::new(self.line, self.col, self.len as u32)
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Fin & erreur
    Eof,
    Error(String),

    // Littéraux
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    InterpStart(String),
    InterpMid(String),
    InterpEnd(String),

    // Identifiants
    Ident(String),

    // Mots-clés
    KwLet, KwVar, KwFunc, KwClass, KwStruct, KwEnum, KwProtocol, KwExtension,
    KwTypealias, KwImport, KwExport, KwModule, KwFrom, KwAs,
    KwIf, KwElse, KwWhile, KwFor, KwIn, KwReturn, KwBreak, KwContinue,
    KwDefer, KwGuard, KwSwitch, KwCase, KwDefault,
    KwThrow, KwThrows, KwDo, KwCatch,
    KwTrue, KwFalse, KwNil,
    KwAwait, KwAsync, KwSelf,

    // Ponctuation
    LParen, RParen, LBrace, RBrace, LBracket, RBracket,
    Comma, Dot, Semicolon, Colon,
    Question, QuestionDot, QuestionQuestion, Arrow,

    // Affectation & combinaisons
    Assign, PlusAssign, MinusAssign, StarAssign, SlashAssign,

    // Binaires
    Plus, Minus, Star, Slash, Percent,
    Amp, Pipe, Caret, Tilde, Shl, Shr,

    // Comparaisons
    EqEq, BangEq, Lt, Le, Gt, Ge,

    // Logiques
    AndAnd, OrOr, Bang,

    // Préfixes
    PlusPlus, MinusMinus,
}

/// Table des mots-clés (identifiant → tag dédié).
pub fn keyword(ident: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match ident {
        "let" => KwLet,
        "var" => KwVar,
        "func" => KwFunc,
        "class" => KwClass,
        "struct" => KwStruct,
        "enum" => KwEnum,
        "protocol" => KwProtocol,
        "extension" => KwExtension,
        "typealias" => KwTypealias,
        "import" => KwImport,
        "export" => KwExport,
        "module" => KwModule,
        "from" => KwFrom,
        "as" => KwAs,
        "if" => KwIf,
        "else" => KwElse,
        "while" => KwWhile,
        "for" => KwFor,
        "in" => KwIn,
        "return" => KwReturn,
        "break" => KwBreak,
        "continue" => KwContinue,
        "defer" => KwDefer,
        "guard" => KwGuard,
        "switch" => KwSwitch,
        "case" => KwCase,
        "default" => KwDefault,
        "throw" => KwThrow,
        "throws" => KwThrows,
        "do" => KwDo,
        "catch" => KwCatch,
        "true" => KwTrue,
        "false" => KwFalse,
        "nil" => KwNil,
        "await" => KwAwait,
        "async" => KwAsync,
        "self" => KwSelf,
        _ => return None,
    })
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TokenKind::*;
        match self {
            Eof => write!(f, "fin de fichier"),
            Error(msg) => write!(f, "erreur: {msg}"),
            Int(v) => write!(f, "{v}"),
            Float(v) => write!(f, "{v}"),
            Str(s) => write!(f, "\"{s}\""),
            Char(c) => write!(f, "'{c}'"),
            InterpStart(_) | InterpMid(_) | InterpEnd(_) => write!(f, "segment interpolé"),
            Ident(s) => write!(f, "{s}"),
            KwLet => write!(f, "let"),
            KwVar => write!(f, "var"),
            KwFunc => write!(f, "func"),
            KwClass => write!(f, "class"),
            KwStruct => write!(f, "struct"),
            KwEnum => write!(f, "enum"),
            KwProtocol => write!(f, "protocol"),
            KwExtension => write!(f, "extension"),
            KwTypealias => write!(f, "typealias"),
            KwImport => write!(f, "import"),
            KwExport => write!(f, "export"),
            KwModule => write!(f, "module"),
            KwFrom => write!(f, "from"),
            KwAs => write!(f, "as"),
            KwIf => write!(f, "if"),
            KwElse => write!(f, "else"),
            KwWhile => write!(f, "while"),
            KwFor => write!(f, "for"),
            KwIn => write!(f, "in"),
            KwReturn => write!(f, "return"),
            KwBreak => write!(f, "break"),
            KwContinue => write!(f, "continue"),
            KwDefer => write!(f, "defer"),
            KwGuard => write!(f, "guard"),
            KwSwitch => write!(f, "switch"),
            KwCase => write!(f, "case"),
            KwDefault => write!(f, "default"),
            KwThrow => write!(f, "throw"),
            KwThrows => write!(f, "throws"),
            KwDo => write!(f, "do"),
            KwCatch => write!(f, "catch"),
            KwTrue => write!(f, "true"),
            KwFalse => write!(f, "false"),
            KwNil => write!(f, "nil"),
            KwAwait => write!(f, "await"),
            KwAsync => write!(f, "async"),
            KwSelf => write!(f, "self"),
            LParen => write!(f, "("),
            RParen => write!(f, ")"),
            LBrace => write!(f, "{{"),
            RBrace => write!(f, "}}"),
            LBracket => write!(f, "["),
            RBracket => write!(f, "]"),
            Comma => write!(f, ","),
            Dot => write!(f, "."),
            Semicolon => write!(f, ";"),
            Colon => write!(f, ":"),
            Question => write!(f, "?"),
            QuestionDot => write!(f, "?."),
            QuestionQuestion => write!(f, "??"),
            Arrow => write!(f, "->"),
            Assign => write!(f, "="),
            PlusAssign => write!(f, "+="),
            MinusAssign => write!(f, "-="),
            StarAssign => write!(f, "*="),
            SlashAssign => write!(f, "/="),
            Plus => write!(f, "+"),
            Minus => write!(f, "-"),
            Star => write!(f, "*"),
            Slash => write!(f, "/"),
            Percent => write!(f, "%"),
            Amp => write!(f, "&"),
            Pipe => write!(f, "|"),
            Caret => write!(f, "^"),
            Tilde => write!(f, "~"),
            Shl => write!(f, "<<"),
            Shr => write!(f, ">>"),
            EqEq => write!(f, "=="),
            BangEq => write!(f, "!="),
            Lt => write!(f, "<"),
            Le => write!(f, "<="),
            Gt => write!(f, ">"),
            Ge => write!(f, ">="),
            AndAnd => write!(f, "&&"),
            OrOr => write!(f, "||"),
            Bang => write!(f, "!"),
            PlusPlus => write!(f, "++"),
            MinusMinus => write!(f, "--"),
        }
    }
}
