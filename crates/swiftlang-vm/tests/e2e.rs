//! e2e.rs — Scénarios bout-en-bout : source → valeur terminale de pile.
//!
//! Couvre aussi les propriétés transverses : round-trip du format
//! binaire, sûreté du GC sous collectes forcées, partage d'upvalues,
//! internement, et les comportements aux bornes du compilateur.

use swiftlang_core::bytecode::format::{deserialize_chunk, serialize_chunk};
use swiftlang_core::diagnostics::Diagnostics;
use swiftlang_vm::{InterpretOutcome, RuntimeErr, Value, Vm, VmOptions};

fn run(src: &str) -> (Value, Vm) {
    run_with(src, VmOptions { capture_output: true, ..Default::default() })
}

fn run_with(src: &str, opts: VmOptions) -> (Value, Vm) {
    let mut vm = Vm::with_options(opts);
    let mut diags = Diagnostics::silent();
    match swiftlang_vm::run_source(&mut vm, src, "test.swift", &mut diags) {
        InterpretOutcome::Ok(v) => (v, vm),
        InterpretOutcome::CompileError => panic!("compilation:\n{}", diags.rendered()),
        InterpretOutcome::RuntimeError(e) => panic!("exécution: {e}"),
    }
}

fn run_err(src: &str) -> RuntimeErr {
    let mut vm = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
    let mut diags = Diagnostics::silent();
    match swiftlang_vm::run_source(&mut vm, src, "test.swift", &mut diags) {
        InterpretOutcome::RuntimeError(e) => e,
        other => panic!("erreur d'exécution attendue, trouvé {other:?}"),
    }
}

fn as_num(v: &Value) -> f64 {
    match v {
        Value::Num(x) => *x,
        other => panic!("nombre attendu, trouvé {other:?}"),
    }
}

fn as_str(vm: &Vm, v: &Value) -> String {
    match v {
        Value::Str(_) => vm.display(v),
        other => panic!("chaîne attendue, trouvé {other:?}"),
    }
}

/* ───────────────────── Scénarios du langage ───────────────────── */

#[test]
fn scenario_1_interpolation_simple() {
    let (v, vm) = run(r#"let name = "World"; let greeting = "Hello, $name!"; greeting"#);
    assert_eq!(as_str(&vm, &v), "Hello, World!");
}

#[test]
fn scenario_2_interpolation_expression() {
    let (v, vm) =
        run(r#"let x=10; let y=20; let s = "The sum of $x and $y is ${x + y}"; s"#);
    assert_eq!(as_str(&vm, &v), "The sum of 10 and 20 is 30");
}

#[test]
fn scenario_3_for_in_sum() {
    let (v, _) = run("var sum = 0; for i in [1,2,3,4,5] { sum = sum + i; } sum");
    assert_eq!(as_num(&v), 15.0);
}

#[test]
fn scenario_4_array_push_and_subscript() {
    let (v, _) = run("let arr = []; arr.push(10); arr.push(20); arr[0] + arr[1]");
    assert_eq!(as_num(&v), 30.0);
}

#[test]
fn scenario_5_independent_closure_counters() {
    let (v, _) = run(
        "func make() { let s = {}; s.c = 0; func inc() { s.c = s.c + 1; return s.c; } return inc; }\n\
         let a = make(); let b = make(); a(); a(); b();",
    );
    // les compteurs sont indépendants : b() rend 1
    assert_eq!(as_num(&v), 1.0);
}

#[test]
fn scenario_6_modulo_table() {
    assert_eq!(as_num(&run("5 % 2").0), 1.0);
    assert_eq!(as_num(&run("10 % 5").0), 0.0);
    assert_eq!(as_num(&run("-7 % 3").0), -1.0);
    assert_eq!(as_num(&run("(10+5) % (2+2)").0), 3.0);
}

/* ───────────────────── Sémantique générale ───────────────────── */

#[test]
fn control_flow_and_comparisons() {
    let (v, _) = run("var n = 0\nvar i = 0\nwhile i < 10 { if i % 2 == 0 { n = n + i }\ni = i + 1 }\nn");
    assert_eq!(as_num(&v), 20.0);
}

#[test]
fn c_style_for_with_break_continue() {
    let (v, _) = run(
        "var total = 0\nfor var i = 0; i < 100; i = i + 1 {\n  if i == 7 { break }\n  if i % 2 == 1 { continue }\n  total = total + i\n}\ntotal",
    );
    // 0 + 2 + 4 + 6
    assert_eq!(as_num(&v), 12.0);
}

#[test]
fn string_concat_and_comparison() {
    let (v, vm) = run(r#"let a = "foo" + "bar"; a"#);
    assert_eq!(as_str(&vm, &v), "foobar");
    let (v, _) = run(r#""abc" < "abd""#);
    assert!(matches!(v, Value::Bool(true)));
}

#[test]
fn ternary_and_nil_coalescing() {
    assert_eq!(as_num(&run("true ? 1 : 2").0), 1.0);
    assert_eq!(as_num(&run("false ? 1 : 2").0), 2.0);
    assert_eq!(as_num(&run("nil ?? 5").0), 5.0);
    assert_eq!(as_num(&run("3 ?? 5").0), 3.0);
}

#[test]
fn logical_short_circuit() {
    let (v, vm) = run(
        "var log = \"\"\nfunc t() { log = log + \"t\"\nreturn true }\nfunc f() { log = log + \"f\"\nreturn false }\nlet r = f() && t()\nlog",
    );
    // t() ne doit pas s'exécuter
    assert_eq!(as_str(&vm, &v), "f");
}

#[test]
fn functions_and_recursion() {
    let (v, _) = run("func fib(n: Int) -> Int { if n < 2 { return n } return fib(n - 1) + fib(n - 2) }\nfib(10)");
    assert_eq!(as_num(&v), 55.0);
}

#[test]
fn closures_share_one_upvalue_cell() {
    // P4 : deux closures capturant le même slot voient les écritures
    // l'une de l'autre
    let (v, _) = run(
        "func pair() {\n  var n = 0\n  func bump() { n = n + 1\nreturn n }\n  func read() { return n }\n  let r = [bump, read]\n  return r\n}\nlet fns = pair()\nfns[0]()\nfns[0]()\nfns[1]()",
    );
    assert_eq!(as_num(&v), 2.0);
}

#[test]
fn upvalues_survive_frame_return() {
    let (v, _) = run(
        "func counter() { var n = 0\nfunc inc() { n = n + 1\nreturn n }\nreturn inc }\nlet c = counter()\nc()\nc()\nc()",
    );
    assert_eq!(as_num(&v), 3.0);
}

#[test]
fn structs_create_and_access() {
    let (v, _) = run("struct Pair { let a: Int\nlet b: Int }\nlet p = Pair(3, 4)\np.a * p.b");
    assert_eq!(as_num(&v), 12.0);
}

#[test]
fn struct_methods_via_proto() {
    let (v, _) = run(
        "struct Point { let x: Int\nlet y: Int\nfunc sum() { return self.x + self.y } }\nlet p = Point(3, 4)\np.sum()",
    );
    assert_eq!(as_num(&v), 7.0);
}

#[test]
fn extension_installs_method() {
    let (v, _) = run(
        "struct Box { let v: Int }\nextension Box { func double() { return self.v * 2 } }\nlet b = Box(21)\nb.double()",
    );
    assert_eq!(as_num(&v), 42.0);
}

#[test]
fn class_constructor_fields_and_methods() {
    let (v, _) = run(
        "class Counter { var count = 0\n func bump() { self.count = self.count + 1\nreturn self.count } }\nlet c = Counter()\nc.bump()\nc.bump()",
    );
    assert_eq!(as_num(&v), 2.0);
}

#[test]
fn enum_cases_are_numbered() {
    let (v, _) = run("enum Color { case red, green, blue }\nColor.green");
    assert_eq!(as_num(&v), 1.0);
    let (v, _) = run("enum Http { case ok = 200, notFound = 404 }\nHttp.notFound");
    assert_eq!(as_num(&v), 404.0);
}

#[test]
fn switch_and_guard() {
    let (v, vm) = run(
        "func label(n: Int) -> String {\n  guard n >= 0 else { return \"négatif\" }\n  switch n { case 0: return \"zéro\"\n case 1, 2: return \"petit\"\n default: return \"grand\" }\n}\nlabel(0) + \",\" + label(2) + \",\" + label(9) + \",\" + label(0 - 1)",
    );
    assert_eq!(as_str(&vm, &v), "zéro,petit,grand,négatif");
}

#[test]
fn throw_and_catch() {
    let (v, vm) = run(
        "var seen = \"\"\ndo { throw \"boom\" } catch e { seen = e }\nseen",
    );
    assert_eq!(as_str(&vm, &v), "boom");
}

#[test]
fn runtime_error_unwinds_to_catch() {
    let (v, vm) = run(
        "var msg = \"\"\ndo { let arr = [1]\narr[5] } catch e { msg = e }\nmsg",
    );
    assert!(as_str(&vm, &v).contains("indice hors limites"));
}

#[test]
fn uncaught_throw_aborts() {
    let e = run_err("throw \"libre\"");
    assert!(e.msg.contains("libre"));
}

#[test]
fn throw_crosses_call_frames() {
    let (v, vm) = run(
        "func deep() { throw \"profond\" }\nfunc mid() { deep() }\nvar got = \"\"\ndo { mid() } catch e { got = e }\ngot",
    );
    assert_eq!(as_str(&vm, &v), "profond");
}

#[test]
fn defer_runs_at_scope_exit() {
    let (v, vm) = run(
        "var log = \"\"\nfunc f() { defer { log = log + \"d\" }\nlog = log + \"a\"\nreturn nil }\nf()\nlog",
    );
    assert_eq!(as_str(&vm, &v), "ad");
}

#[test]
fn optional_chain_and_force_unwrap() {
    let (v, _) = run("let o = { a: 1 }\no?.a");
    assert_eq!(as_num(&v), 1.0);
    let (v, _) = run("let o = nil\no?.a");
    assert!(v.is_nil());
    let e = run_err("let o = nil\no!");
    assert!(e.msg.contains("nil"));
}

#[test]
fn await_is_synchronous_passthrough() {
    let (v, _) = run("func f() { return 9 }\nawait f()");
    assert_eq!(as_num(&v), 9.0);
}

#[test]
fn division_by_zero_is_an_error() {
    let e = run_err("1 / 0");
    assert!(e.msg.contains("division par zéro"));
    // double : sémantique IEEE 754
    let (v, _) = run("1.5 / 0.5");
    assert_eq!(as_num(&v), 3.0);
}

#[test]
fn builtin_prototype_methods() {
    let (v, _) = run(r#""hello".length()"#);
    assert_eq!(as_num(&v), 5.0);
    let (v, vm) = run(r#""hello".uppercase()"#);
    assert_eq!(as_str(&vm, &v), "HELLO");
    let (v, _) = run("[1, 2, 3].contains(2)");
    assert!(matches!(v, Value::Bool(true)));
}

#[test]
fn builtin_module_imports() {
    let (v, _) = run("import \"math\"\nmath.abs(0 - 7)");
    assert_eq!(as_num(&v), 7.0);
    let (v, vm) = run("import { uppercase } from \"string\"\nuppercase(\"ok\")");
    assert_eq!(as_str(&vm, &v), "OK");
    let (v, _) = run("import * from \"math\"\nfloor(3.9)");
    assert_eq!(as_num(&v), 3.0);
}

#[test]
fn print_goes_to_captured_output() {
    let (_, mut vm) = run("print(\"a\", 1 + 1)\nprint(nil)");
    assert_eq!(vm.take_output(), "a 2\nnil\n");
}

#[test]
fn native_module_contract() {
    fn init_env(vm: &mut Vm, id: u32) {
        let version = vm.create_number_value(3.0);
        vm.module_export(id, "version", version);
        let name = vm.create_string_value("hôte");
        vm.module_export(id, "name", name);
    }
    let mut vm = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
    vm.register_native_module("env", init_env);
    let mut diags = Diagnostics::silent();
    let out = swiftlang_vm::run_source(
        &mut vm,
        "import \"$env\" as env\nenv.version",
        "native.swift",
        &mut diags,
    );
    match out {
        InterpretOutcome::Ok(v) => assert_eq!(as_num(&v), 3.0),
        other => panic!("issue inattendue: {other:?}"),
    }
}

#[test]
fn file_modules_load_and_export() {
    let dir = std::env::temp_dir().join(format!("swiftlang-mods-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(
        dir.join("util.swift"),
        "func twice(x: Int) -> Int { return x * 2 }\nexport { twice }\nexport default 99",
    )
    .expect("write");

    let mut vm = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
    vm.add_search_root(&dir);
    let mut diags = Diagnostics::silent();
    let out = swiftlang_vm::run_source(
        &mut vm,
        "import { twice } from \"util\"\nimport d from \"util\"\ntwice(4) + d",
        "main.swift",
        &mut diags,
    );
    match out {
        InterpretOutcome::Ok(v) => assert_eq!(as_num(&v), 107.0),
        InterpretOutcome::CompileError => panic!("compilation:\n{}", diags.rendered()),
        InterpretOutcome::RuntimeError(e) => panic!("exécution: {e}"),
    }
    // le cache ne recharge pas : un seul enregistrement pour `util`
    let count = vm.module_registry().iter().filter(|m| m.path == "util").count();
    assert_eq!(count, 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn module_cycles_are_tolerated() {
    // a importe b, b importe a : le module `loading` redemandé rend sa
    // table d'exports partielle, aucun des deux n'utilise l'autre au
    // top-level
    let dir = std::env::temp_dir().join(format!("swiftlang-cycle-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    std::fs::write(dir.join("alpha.swift"), "import \"beta\"\nfunc fa() { return 1 }\nexport { fa }")
        .expect("write");
    std::fs::write(dir.join("beta.swift"), "import \"alpha\"\nfunc fb() { return 2 }\nexport { fb }")
        .expect("write");

    let mut vm = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
    vm.add_search_root(&dir);
    let mut diags = Diagnostics::silent();
    let out = swiftlang_vm::run_source(
        &mut vm,
        "import { fa } from \"alpha\"\nimport { fb } from \"beta\"\nfa() + fb()",
        "main.swift",
        &mut diags,
    );
    match out {
        InterpretOutcome::Ok(v) => assert_eq!(as_num(&v), 3.0),
        InterpretOutcome::CompileError => panic!("compilation:\n{}", diags.rendered()),
        InterpretOutcome::RuntimeError(e) => panic!("exécution: {e}"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

/* ───────────────────── P1 : round-trip binaire ───────────────────── */

#[test]
fn p1_serialized_chunk_executes_identically() {
    let sources = [
        "1 + 2 * 3",
        r#"let s = "a" + "b"; s + "c""#,
        "var t = 0; for i in [1,2,3] { t = t + i }; t",
        "func sq(x: Int) -> Int { return x * x }\nsq(7)",
    ];
    for src in sources {
        let mut diags = Diagnostics::silent();
        let func = swiftlang_compiler::compile_source(src, "p1.swift", &mut diags)
            .unwrap_or_else(|| panic!("compilation: {src}"));
        let mut vm_a = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
        let original = vm_a.interpret(func.clone()).expect("exécution originale");
        let bytes = serialize_chunk(&func.chunk);
        let chunk = deserialize_chunk(&bytes).expect("désérialisation");
        let mut reloaded = swiftlang_core::bytecode::chunk::Function::new("<script>");
        reloaded.chunk = chunk;
        let mut vm_b = Vm::with_options(VmOptions { capture_output: true, ..Default::default() });
        let replayed = vm_b.interpret(std::rc::Rc::new(reloaded)).expect("exécution rechargée");
        // comparer le rendu via la VM propriétaire de chaque valeur
        assert_eq!(vm_a.display(&original), vm_b.display(&replayed), "résultats divergents pour: {src}");
    }
}

/* ───────────────────── P2 : sûreté du GC ───────────────────── */

#[test]
fn p2_forced_collections_do_not_change_output() {
    let src = "var acc = \"\"\nfor i in [1,2,3,4,5,6,7,8] {\n  let piece = \"x$i\"\n  acc = acc + piece\n}\nlet arr = [acc, acc + \"!\", \"fin\"]\nprint(arr[0])\nprint(arr[1])\nprint(arr[2])\nacc";
    let (v1, mut vm1) = run(src);
    let (v2, mut vm2) = run_with(
        src,
        VmOptions { capture_output: true, gc_stress: true, ..Default::default() },
    );
    assert_eq!(vm1.display(&v1), vm2.display(&v2));
    assert_eq!(vm1.take_output(), vm2.take_output());
    // le mode stress a réellement collecté
    assert!(vm2.heap.stats().collections > 0);
}

#[test]
fn gc_reclaims_unreachable_objects() {
    let (_, mut vm) = run(
        "var i = 0\nwhile i < 50 {\n  let tmp = [i, i + 1, \"temp$i\"]\n  i = i + 1\n}\ni",
    );
    let before = vm.heap.live_objects();
    vm.collect_garbage();
    let after = vm.heap.live_objects();
    assert!(after <= before);
    let stats = vm.heap.stats();
    assert!(stats.total_allocated > 0);
    assert!(stats.peak_allocated >= stats.current_allocated);
}

/* ───────────────────── P5 : internement ───────────────────── */

#[test]
fn p5_equal_strings_are_reference_equal() {
    let (v, vm) = run(r#"let a = "wor" + "ld"; let b = "world"; a == b"#);
    assert!(matches!(v, Value::Bool(true)));
    drop(vm);
    // même contenu ⇒ même id
    let mut vm = Vm::new();
    let a = vm.heap.strings.intern("chaîne partagée");
    let b = vm.heap.strings.intern("chaîne partagée");
    assert_eq!(a, b);
}

/* ───────────────────── Bornes ───────────────────── */

#[test]
fn constant_255_and_256_execute_identically() {
    // plus de 256 constantes numériques : les indices hauts passent par
    // CONSTANT_LONG et s'exécutent comme les bas
    let mut src = String::from("0");
    let mut expected = 0.0;
    for i in 0..300 {
        src.push_str(&format!(" + {i}"));
        expected += f64::from(i);
    }
    let (v, _) = run(&src);
    assert_eq!(as_num(&v), expected);
}

#[test]
fn deep_recursion_overflows_cleanly() {
    let e = run_err("func f(n: Int) { return f(n + 1) }\nf(0)");
    assert!(e.msg.contains("débordement"));
}

#[test]
fn global_define_then_set() {
    let mut vm = Vm::new();
    let mut diags = Diagnostics::silent();
    let out = swiftlang_vm::run_source(&mut vm, "var x = 1\nx = 2\nx", "ok.swift", &mut diags);
    match out {
        InterpretOutcome::Ok(v) => assert_eq!(as_num(&v), 2.0),
        other => panic!("issue inattendue: {other:?}"),
    }
}

#[test]
fn iterating_a_string_yields_characters() {
    let (v, vm) = run("var out = \"\"\nfor c in \"abc\" { out = out + c + \".\" }\nout");
    assert_eq!(as_str(&vm, &v), "a.b.c.");
}
