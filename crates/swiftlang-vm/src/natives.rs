//! natives.rs — Fonctions natives : prototypes des types de base,
//! globaux (`print`, `clock`) et modules builtin (`string`, `array`,
//! `io`, `math`).
//!
//! Contrat natif : `(vm, arguments) → valeur`. Pour un appel de méthode,
//! le receveur est le premier argument ; les mêmes natifs servent donc
//! de méthodes de prototype et de fonctions de module.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::heap::{Obj, Table};
use crate::modules::{ModuleKind, ModuleState};
use crate::value::{RuntimeErr, Value};
use crate::vm::{NativeDef, NativeFn, Vm};

/// Installe protos, globaux et modules builtin sur une VM fraîche.
pub(crate) fn install(vm: &mut Vm) {
    // prototypes des types natifs
    vm.string_proto = vm.heap.alloc(Obj::Table(Table::new()));
    vm.array_proto = vm.heap.alloc(Obj::Table(Table::new()));
    vm.object_proto = vm.heap.alloc(Obj::Table(Table::new()));

    let string_methods: &[(&str, NativeFn)] = &[
        ("length", n_length),
        ("uppercase", n_uppercase),
        ("lowercase", n_lowercase),
        ("contains", n_contains),
        ("substring", n_substring),
    ];
    let array_methods: &[(&str, NativeFn)] = &[
        ("push", n_push),
        ("pop", n_pop),
        ("length", n_length),
        ("contains", n_contains),
    ];
    let object_methods: &[(&str, NativeFn)] = &[("keys", n_keys), ("has", n_has)];

    for (proto, methods) in [
        (vm.string_proto, string_methods),
        (vm.array_proto, array_methods),
        (vm.object_proto, object_methods),
    ] {
        for (name, f) in methods {
            let value = vm.create_native_function(name, *f);
            let key = vm.intern(name);
            if let Obj::Table(t) = vm.heap.get_mut(proto) {
                t.set(key, value);
            }
        }
    }

    // globaux
    let print = vm.create_native_function("print", n_print);
    vm.globals.insert("print".into(), print);
    let clock = vm.create_native_function("clock", n_clock);
    vm.globals.insert("clock".into(), clock);

    // modules builtin, pré-peuplés et en cache dès le départ
    install_builtin_module(vm, "string", string_methods);
    install_builtin_module(
        vm,
        "array",
        &[("push", n_push), ("pop", n_pop), ("length", n_length), ("contains", n_contains)],
    );
    install_builtin_module(
        vm,
        "io",
        &[("print", n_io_print), ("println", n_print), ("eprint", n_eprint)],
    );
    let math = install_builtin_module(
        vm,
        "math",
        &[
            ("abs", n_abs),
            ("floor", n_floor),
            ("ceil", n_ceil),
            ("sqrt", n_sqrt),
            ("pow", n_pow),
            ("min", n_min),
            ("max", n_max),
        ],
    );
    let pi = Value::Num(std::f64::consts::PI);
    vm.module_export(math, "pi", pi);
}

fn install_builtin_module(vm: &mut Vm, name: &str, entries: &[(&str, NativeFn)]) -> u32 {
    let id = vm.modules.create(vm.heap.alloc(Obj::Table(Table::new())), name, ModuleKind::Builtin);
    for (export, f) in entries {
        let value = vm.create_native_function(export, *f);
        vm.module_export(id, export, value);
    }
    vm.modules.list[id as usize].state = ModuleState::Loaded;
    id
}

impl Vm {
    /// Constructeurs du contrat natif (§ interface externe).
    pub fn create_native_function(&mut self, name: &str, f: NativeFn) -> Value {
        let idx = self.natives.len() as u32;
        self.natives.push(NativeDef { name: name.to_string(), func: f });
        Value::Native(idx)
    }

    pub fn create_number_value(&mut self, x: f64) -> Value {
        Value::Num(x)
    }

    pub fn create_string_value(&mut self, s: &str) -> Value {
        self.str_value(s)
    }
}

fn arg_err(msg: &str) -> RuntimeErr {
    RuntimeErr { msg: msg.into(), line: 0 }
}

fn num_arg(args: &[Value], i: usize, who: &str) -> Result<f64, RuntimeErr> {
    match args.get(i) {
        Some(Value::Num(x)) => Ok(*x),
        _ => Err(arg_err(&format!("{who}: argument {i} doit être un nombre"))),
    }
}

/* ────── globaux ────── */

/// `print(...)` : affiche les arguments séparés par une espace, puis \n.
fn n_print(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let parts: Vec<String> = args.iter().map(|v| vm.display(v)).collect();
    let text = format!("{}\n", parts.join(" "));
    vm.write_out(&text);
    Ok(Value::Nil)
}

/// `io.print(...)` : sans retour à la ligne.
fn n_io_print(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let parts: Vec<String> = args.iter().map(|v| vm.display(v)).collect();
    vm.write_out(&parts.join(" "));
    Ok(Value::Nil)
}

fn n_eprint(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let parts: Vec<String> = args.iter().map(|v| vm.display(v)).collect();
    eprintln!("{}", parts.join(" "));
    Ok(Value::Nil)
}

/// Secondes écoulées depuis l'époque Unix (double).
fn n_clock(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Num(secs))
}

/* ────── tableaux ────── */

fn n_push(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let Some(Value::Array(r)) = args.first() else {
        return Err(arg_err("push: receveur tableau attendu"));
    };
    let value = args.get(1).cloned().unwrap_or(Value::Nil);
    match vm.heap.get_mut(*r) {
        Obj::Array(items) => items.push(value),
        _ => return Err(arg_err("push: tableau corrompu")),
    }
    Ok(Value::Nil)
}

fn n_pop(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let Some(Value::Array(r)) = args.first() else {
        return Err(arg_err("pop: receveur tableau attendu"));
    };
    match vm.heap.get_mut(*r) {
        Obj::Array(items) => Ok(items.pop().unwrap_or(Value::Nil)),
        _ => Err(arg_err("pop: tableau corrompu")),
    }
}

/// `length` : tableaux et chaînes.
fn n_length(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    match args.first() {
        Some(Value::Array(r)) => match vm.heap.get(*r) {
            Obj::Array(items) => Ok(Value::Num(items.len() as f64)),
            _ => Err(arg_err("length: tableau corrompu")),
        },
        Some(Value::Str(s)) => Ok(Value::Num(vm.heap.strings.get(*s).len() as f64)),
        _ => Err(arg_err("length: tableau ou chaîne attendu")),
    }
}

/// `contains` : élément d'un tableau, ou sous-chaîne d'une chaîne.
fn n_contains(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    match (args.first(), args.get(1)) {
        (Some(Value::Array(r)), Some(needle)) => match vm.heap.get(*r) {
            Obj::Array(items) => Ok(Value::Bool(items.iter().any(|e| e.equals(needle)))),
            _ => Err(arg_err("contains: tableau corrompu")),
        },
        (Some(Value::Str(s)), Some(Value::Str(needle))) => {
            let hay = vm.heap.strings.get(*s);
            let needle = vm.heap.strings.get(*needle);
            Ok(Value::Bool(hay.contains(needle)))
        }
        _ => Err(arg_err("contains: (tableau, valeur) ou (chaîne, chaîne) attendu")),
    }
}

/* ────── chaînes ────── */

fn n_uppercase(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let Some(Value::Str(s)) = args.first() else {
        return Err(arg_err("uppercase: chaîne attendue"));
    };
    let up = vm.heap.strings.get(*s).to_uppercase();
    Ok(vm.create_string_value(&up))
}

fn n_lowercase(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let Some(Value::Str(s)) = args.first() else {
        return Err(arg_err("lowercase: chaîne attendue"));
    };
    let low = vm.heap.strings.get(*s).to_lowercase();
    Ok(vm.create_string_value(&low))
}

/// `substring(chaîne, début, fin)` — fin exclusive, bornes vérifiées.
fn n_substring(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let Some(Value::Str(s)) = args.first() else {
        return Err(arg_err("substring: chaîne attendue"));
    };
    let start = num_arg(&args, 1, "substring")? as usize;
    let end = num_arg(&args, 2, "substring")? as usize;
    let text = vm.heap.strings.get(*s);
    if start > end || end > text.len() {
        return Err(arg_err(&format!(
            "substring: bornes invalides {start}..{end} (longueur {})",
            text.len()
        )));
    }
    let piece = text[start..end].to_string();
    Ok(vm.create_string_value(&piece))
}

/* ────── objets ────── */

fn n_keys(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let Some(Value::Object(r)) = args.first() else {
        return Err(arg_err("keys: receveur objet attendu"));
    };
    let names: Vec<String> = match vm.heap.get(*r) {
        Obj::Table(t) => t.iter().map(|(k, _)| vm.heap.strings.get(k).to_string()).collect(),
        _ => return Err(arg_err("keys: objet corrompu")),
    };
    let values: Vec<Value> = names.iter().map(|n| vm.create_string_value(n)).collect();
    let arr = vm.heap.alloc(Obj::Array(values));
    Ok(Value::Array(arr))
}

fn n_has(vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    let (Some(Value::Object(r)), Some(Value::Str(k))) = (args.first(), args.get(1)) else {
        return Err(arg_err("has: (objet, chaîne) attendu"));
    };
    let found = match vm.heap.get(*r) {
        Obj::Table(t) => t.get(*k).is_some(),
        _ => false,
    };
    Ok(Value::Bool(found))
}

/* ────── math ────── */

fn n_abs(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "abs")?.abs()))
}

fn n_floor(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "floor")?.floor()))
}

fn n_ceil(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "ceil")?.ceil()))
}

fn n_sqrt(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "sqrt")?.sqrt()))
}

fn n_pow(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "pow")?.powf(num_arg(&args, 1, "pow")?)))
}

fn n_min(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "min")?.min(num_arg(&args, 1, "min")?)))
}

fn n_max(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, RuntimeErr> {
    Ok(Value::Num(num_arg(&args, 0, "max")?.max(num_arg(&args, 1, "max")?)))
}
