//! swiftlang-vm — Machine virtuelle du langage swiftlang.
//!
//! ## Modules
//! - `value`   : valeurs taguées (`Value`), ids de tas stables.
//! - `heap`    : tas GC mark-sweep + pool d'internement des chaînes.
//! - `vm`      : boucle d'interprétation, frames, closures, upvalues.
//! - `natives` : prototypes des types de base, globaux, modules builtin.
//! - `modules` : chargeur de modules (builtin, natif `$`, fichiers).
//!
//! Le point d'entrée confortable est [`run_source`] : il enchaîne tout le
//! pipeline (lexer → parseur → analyse → compilation) puis exécute, et
//! rapporte l'issue sous forme de [`InterpretOutcome`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod heap;
pub mod modules;
mod natives;
pub mod value;
pub mod vm;

pub use heap::GcStats;
pub use modules::{Manifest, ManifestError, ModuleKind, ModuleState};
pub use value::{RuntimeErr, Value};
pub use vm::{NativeFn, Vm, VmOptions};

use swiftlang_core::diagnostics::Diagnostics;

/// Issue d'une interprétation complète.
#[derive(Debug)]
pub enum InterpretOutcome {
    /// Valeur terminale au sommet de la pile.
    Ok(Value),
    /// Erreurs de compilation (détails dans le collecteur de diagnostics).
    CompileError,
    /// Erreur d'exécution non rattrapée.
    RuntimeError(RuntimeErr),
}

/// Pipeline complet sur une source script : compile puis exécute.
pub fn run_source(
    vm: &mut Vm,
    src: &str,
    file: &str,
    diags: &mut Diagnostics,
) -> InterpretOutcome {
    let Some(func) = swiftlang_compiler::compile_source(src, file, diags) else {
        return InterpretOutcome::CompileError;
    };
    log::debug!("exécution de {file} ({} octets de bytecode)", func.chunk.len());
    match vm.interpret(func) {
        Ok(v) => InterpretOutcome::Ok(v),
        Err(e) => InterpretOutcome::RuntimeError(e),
    }
}

/* ───────────────────────── Tests ───────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Value {
        let mut vm = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
        let mut diags = Diagnostics::silent();
        match run_source(&mut vm, src, "test.swift", &mut diags) {
            InterpretOutcome::Ok(v) => v,
            InterpretOutcome::CompileError => panic!("compilation:\n{}", diags.rendered()),
            InterpretOutcome::RuntimeError(e) => panic!("exécution: {e}"),
        }
    }

    #[test]
    fn arithmetic_terminal_value() {
        assert!(matches!(eval("1 + 2 * 3"), Value::Num(x) if x == 7.0));
    }

    #[test]
    fn compile_error_reported() {
        let mut vm = Vm::new();
        let mut diags = Diagnostics::silent();
        let out = run_source(&mut vm, "let = 2", "bad.swift", &mut diags);
        assert!(matches!(out, InterpretOutcome::CompileError));
        assert!(diags.has_errors());
    }

    #[test]
    fn runtime_error_reported_with_line() {
        let mut vm = Vm::new();
        let mut diags = Diagnostics::silent();
        let out = run_source(&mut vm, "let x = 1\nlet y = 0\nx / y", "dz.swift", &mut diags);
        match out {
            InterpretOutcome::RuntimeError(e) => {
                assert!(e.msg.contains("division par zéro"));
                assert_eq!(e.line, 3);
            }
            other => panic!("erreur d'exécution attendue, trouvé {other:?}"),
        }
    }
}
