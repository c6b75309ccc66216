//! swiftlang-core — Cœur du langage swiftlang
//!
//! Contient toute la chaîne avant du langage, sans dépendre du
//! compilateur ni de la VM :
//!
//! ## Modules
//! - `diagnostics` : collecte d'erreurs/avertissements avec spans, caret, cap.
//! - `arena`       : pools typés par sous-système (AST, symboles), reset O(1).
//! - `token`       : jeu de tokens (littéraux, mots-clés, interpolation).
//! - `lexer`       : lexer ASCII écrit main, interpolation ré-entrante.
//! - `ast`         : nœuds Expr/Stmt/TypeExpr en arène indexée.
//! - `parser`      : descente récursive + précédences Pratt, resynchronisation.
//! - `types`       : modèle de types nominal + contexte de types.
//! - `symbols`     : table des symboles, chaîne de portées.
//! - `sema`        : analyse sémantique (résolution, typage, règles de contexte).
//! - `bytecode`    : opcodes, Chunk, (dé)sérialisation binaire, désassembleur.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod arena;
pub mod ast;
pub mod bytecode;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod sema;
pub mod symbols;
pub mod token;
pub mod types;

// ---------- Reexports de confort ----------
pub use bytecode::{
    chunk::{Chunk, Const, ConstPool, Function},
    op::Op,
};
pub use diagnostics::{Diagnostics, Level, Phase, Span};

// ---------- Version ----------
/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renvoie une bannière de version (utile pour logs/outils).
pub fn version() -> String {
    format!("swiftlang-core {VERSION}")
}
