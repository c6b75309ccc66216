//! main.rs — CLI swiftlang : run, build, bundle, new, cache, repl.
//!
//! Codes de sortie : 0 succès, 1 erreur d'exécution, 2 erreur de
//! compilation. `SWIFTLANG_MODULE_PATH` ajoute des racines de recherche
//! (séparées par `:`), `SWIFTLANG_DEBUG` non vide active les traces
//! internes (filtre de logs + GC verbeux).

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use swiftlang_core::bytecode::disasm::disassemble;
use swiftlang_core::bytecode::format::{deserialize_chunk, serialize_chunk};
use swiftlang_core::diagnostics::Diagnostics;
use swiftlang_vm::{InterpretOutcome, Manifest, Vm, VmOptions};

const EXIT_OK: u8 = 0;
const EXIT_RUNTIME: u8 = 1;
const EXIT_COMPILE: u8 = 2;

#[derive(Parser)]
#[command(name = "swiftlang", version, about = "Langage swiftlang : exécution et outillage")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Exécute un fichier source ou un module compilé (sinon le main du manifeste)
    Run {
        file: Option<PathBuf>,
        /// Affiche le désassemblage avant l'exécution
        #[arg(long)]
        disasm: bool,
    },
    /// Compile un fichier vers un module binaire `.swiftmodule`
    Build {
        file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compile les sources du manifeste, dans l'ordre, en un seul module
    Bundle {
        #[arg(default_value = "manifest.json")]
        manifest: PathBuf,
    },
    /// Échafaude un nouveau projet
    New { name: String },
    /// Cache de modules
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
    /// Boucle interactive
    Repl,
}

#[derive(Subcommand)]
enum CacheCmd {
    /// Liste les modules connus (chemin, genre, état)
    List,
}

/* ───────────────────────── Entrée ───────────────────────── */

fn main() -> ExitCode {
    let debug = std::env::var("SWIFTLANG_DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    let mut builder = env_logger::Builder::from_default_env();
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    let _ = builder.try_init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("swiftlang: {e:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn dispatch(cli: Cli) -> Result<u8> {
    match cli.cmd {
        Cmd::Run { file, disasm } => cmd_run(file, disasm),
        Cmd::Build { file, output } => cmd_build(&file, output),
        Cmd::Bundle { manifest } => cmd_bundle(&manifest),
        Cmd::New { name } => cmd_new(&name),
        Cmd::Cache { cmd: CacheCmd::List } => cmd_cache_list(),
        Cmd::Repl => cmd_repl(),
    }
}

fn new_diags() -> Diagnostics {
    let mut d = Diagnostics::new();
    d.enable_color(std::io::stderr().is_terminal());
    d
}

fn make_vm() -> Vm {
    let debug = std::env::var("SWIFTLANG_DEBUG").map(|v| !v.is_empty()).unwrap_or(false);
    Vm::with_options(VmOptions { gc_verbose: debug, trace: debug, ..Default::default() })
}

/* ───────────────────────── run ───────────────────────── */

fn cmd_run(file: Option<PathBuf>, show_disasm: bool) -> Result<u8> {
    let file = match file {
        Some(f) => f,
        None => {
            let m = Manifest::load(Path::new("manifest.json"))
                .context("aucun fichier donné et pas de manifest.json")?;
            PathBuf::from(m.main)
        }
    };
    let mut vm = make_vm();
    if let Some(parent) = file.parent() {
        if parent.as_os_str().is_empty() {
            vm.add_search_root(".");
        } else {
            vm.add_search_root(parent);
        }
    }

    // module binaire : chargé tel quel, sans repasser par le frontal
    if file.extension().is_some_and(|e| e == "swiftmodule") {
        let bytes = std::fs::read(&file).with_context(|| format!("lecture de {}", file.display()))?;
        let chunk = match deserialize_chunk(&bytes) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("swiftlang: {e}");
                return Ok(EXIT_COMPILE);
            }
        };
        if show_disasm {
            print!("{}", disassemble(&chunk, &file.display().to_string()));
        }
        let mut func = swiftlang_core::bytecode::chunk::Function::new(file.display().to_string());
        func.chunk = chunk;
        return Ok(match vm.interpret(Rc::new(func)) {
            Ok(_) => EXIT_OK,
            Err(e) => {
                eprintln!("swiftlang: {e}");
                EXIT_RUNTIME
            }
        });
    }

    let src = std::fs::read_to_string(&file).with_context(|| format!("lecture de {}", file.display()))?;
    let mut diags = new_diags();
    if show_disasm {
        if let Some(func) = swiftlang_compiler::compile_source(&src, &file.display().to_string(), &mut diags)
        {
            print!("{}", disassemble(&func.chunk, &file.display().to_string()));
        }
        diags.clear();
    }
    match swiftlang_vm::run_source(&mut vm, &src, &file.display().to_string(), &mut diags) {
        InterpretOutcome::Ok(_) => Ok(EXIT_OK),
        InterpretOutcome::CompileError => Ok(EXIT_COMPILE),
        InterpretOutcome::RuntimeError(e) => {
            eprintln!("swiftlang: {e}");
            Ok(EXIT_RUNTIME)
        }
    }
}

/* ───────────────────────── build / bundle ───────────────────────── */

fn cmd_build(file: &Path, output: Option<PathBuf>) -> Result<u8> {
    let src = std::fs::read_to_string(file).with_context(|| format!("lecture de {}", file.display()))?;
    let mut diags = new_diags();
    let Some(func) = swiftlang_compiler::compile_source(&src, &file.display().to_string(), &mut diags)
    else {
        return Ok(EXIT_COMPILE);
    };
    let out = output.unwrap_or_else(|| file.with_extension("swiftmodule"));
    std::fs::write(&out, serialize_chunk(&func.chunk))
        .with_context(|| format!("écriture de {}", out.display()))?;
    println!("écrit: {}", out.display());
    Ok(EXIT_OK)
}

fn cmd_bundle(manifest_path: &Path) -> Result<u8> {
    let manifest = Manifest::load(manifest_path)
        .with_context(|| format!("manifeste {}", manifest_path.display()))?;
    let root = manifest_path.parent().unwrap_or(Path::new("."));
    if manifest.sources.is_empty() {
        bail!("le manifeste ne liste aucune source");
    }
    let mut joined = String::new();
    for rel in &manifest.sources {
        let p = root.join(rel);
        let src = std::fs::read_to_string(&p).with_context(|| format!("lecture de {}", p.display()))?;
        joined.push_str(&src);
        joined.push('\n');
    }
    let mut diags = new_diags();
    let Some(func) = swiftlang_compiler::compile_module_source(&joined, &manifest.name, &mut diags)
    else {
        return Ok(EXIT_COMPILE);
    };
    let out = root.join(format!("{}.swiftmodule", manifest.name));
    std::fs::write(&out, serialize_chunk(&func.chunk))
        .with_context(|| format!("écriture de {}", out.display()))?;
    let kind = manifest.kind.as_deref().unwrap_or("application");
    let version = manifest.version.as_deref().unwrap_or("0.0.0");
    println!(
        "bundle: {} v{version} ({kind}, {} source(s)) -> {}",
        manifest.name,
        manifest.sources.len(),
        out.display()
    );
    if let Some(desc) = &manifest.description {
        log::debug!("description: {desc}");
    }
    Ok(EXIT_OK)
}

/* ───────────────────────── new / cache ───────────────────────── */

fn cmd_new(name: &str) -> Result<u8> {
    let root = PathBuf::from(name);
    if root.exists() {
        bail!("`{name}` existe déjà");
    }
    std::fs::create_dir_all(root.join("src"))?;
    let manifest = format!(
        "{{\n  \"name\": \"{name}\",\n  \"version\": \"0.1.0\",\n  \"description\": \"\",\n  \"main\": \"src/main.swift\",\n  \"type\": \"application\",\n  \"sources\": [\"src/main.swift\"]\n}}\n"
    );
    std::fs::write(root.join("manifest.json"), manifest)?;
    std::fs::write(
        root.join("src/main.swift"),
        "let name = \"World\"\nprint(\"Hello, $name!\")\n",
    )?;
    println!("projet créé: {name}/");
    Ok(EXIT_OK)
}

fn cmd_cache_list() -> Result<u8> {
    let vm = make_vm();
    let mut rows: Vec<(String, &'static str, &'static str)> = vm
        .module_registry()
        .iter()
        .map(|m| {
            let kind = match m.kind {
                swiftlang_vm::ModuleKind::Script => "script",
                swiftlang_vm::ModuleKind::SourceFile => "source",
                swiftlang_vm::ModuleKind::Builtin => "builtin",
                swiftlang_vm::ModuleKind::Native => "natif",
            };
            let state = match m.state {
                swiftlang_vm::ModuleState::Unloaded => "non chargé",
                swiftlang_vm::ModuleState::Loading => "en chargement",
                swiftlang_vm::ModuleState::Loaded => "chargé",
                swiftlang_vm::ModuleState::Failed => "échec",
            };
            (m.path.clone(), kind, state)
        })
        .collect();
    rows.sort();
    for (path, kind, state) in rows {
        println!("{path:<16} {kind:<8} {state}");
    }
    Ok(EXIT_OK)
}

/* ───────────────────────── repl ───────────────────────── */

fn cmd_repl() -> Result<u8> {
    println!("swiftlang {} — REPL (ctrl-d pour quitter)", env!("CARGO_PKG_VERSION"));
    let mut vm = make_vm();
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(EXIT_OK);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" {
            return Ok(EXIT_OK);
        }
        let mut diags = new_diags();
        let Some(func) = swiftlang_compiler::compile_repl_source(trimmed, &mut diags) else {
            continue; // diagnostics déjà affichés
        };
        match vm.interpret(func) {
            Ok(v) if !v.is_nil() => println!("{}", vm.display(&v)),
            Ok(_) => {}
            Err(e) => eprintln!("swiftlang: {e}"),
        }
    }
}
