//! modules.rs — Chargeur de modules : builtin, natifs (`$`), fichiers.
//!
//! Ordre de résolution de LOAD_MODULE :
//! 1. registre builtin (`string`, `array`, `io`, `math`) — table d'exports
//!    pré-peuplée ;
//! 2. `$nom` : module natif enregistré, son hook d'init publie via
//!    `module_export` ;
//! 3. fichier : racines de recherche (projet pour `@/…`, chemin pointé,
//!    `SWIFTLANG_MODULE_PATH`), `.swiftmodule` préféré quand présent,
//!    sinon compilation complète de la source en mode module, puis
//!    exécution du top-level dans une frame dédiée.
//!
//! Cycles : un module `loading` redemandé rend sa table d'exports
//! partielle. Un module en échec passe `failed` et n'est pas retenté
//! dans le même processus. Au plus un chargement par chemin canonique.

use std::path::PathBuf;
use std::rc::Rc;

use ahash::AHashMap;

use swiftlang_core::bytecode::chunk::Function;
use swiftlang_core::bytecode::format::deserialize_chunk;
use swiftlang_core::diagnostics::Diagnostics;

use crate::heap::{Obj, Table};
use crate::value::{ObjRef, RuntimeErr, Value};
use crate::vm::Vm;

/// Hook d'initialisation d'un module natif : publie ses exports.
pub type NativeModuleInit = fn(&mut Vm, u32);

/* ───────────────────────── Manifeste ───────────────────────── */

/// Manifeste de paquet (`manifest.json`). Le chargeur n'exige que
/// `name`, `main` et `sources` ; le reste est optionnel.
#[derive(Debug, serde::Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub main: String,
    /// `application` ou `library`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub sources: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("lecture du manifeste: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifeste invalide: {0}")]
    Json(#[from] serde_json::Error),
}

impl Manifest {
    pub fn load(path: &std::path::Path) -> Result<Manifest, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Script,
    SourceFile,
    Builtin,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

pub struct Module {
    pub path: String,
    pub kind: ModuleKind,
    pub state: ModuleState,
    /// Table d'exports (objet GC).
    pub exports: ObjRef,
    /// Portée du module : les SET_GLOBAL interceptés atterrissent ici.
    pub scope: AHashMap<String, Value>,
}

pub struct ModuleRegistry {
    pub(crate) by_path: AHashMap<String, u32>,
    pub(crate) list: Vec<Module>,
    pub(crate) roots: Vec<PathBuf>,
    pub(crate) native_inits: AHashMap<String, NativeModuleInit>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        let mut roots = vec![PathBuf::from(".")];
        if let Ok(extra) = std::env::var("SWIFTLANG_MODULE_PATH") {
            roots.extend(extra.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
        }
        Self { by_path: AHashMap::new(), list: Vec::new(), roots, native_inits: AHashMap::new() }
    }

    /// Crée et met en cache un enregistrement de module.
    pub(crate) fn create(&mut self, exports: ObjRef, path: &str, kind: ModuleKind) -> u32 {
        let id = self.list.len() as u32;
        self.list.push(Module {
            path: path.to_string(),
            kind,
            state: ModuleState::Loading,
            exports,
            scope: AHashMap::new(),
        });
        self.by_path.insert(path.to_string(), id);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &Module> {
        self.list.iter()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Enregistre un module natif (`import "$nom"`).
    pub fn register_native_module(&mut self, name: &str, init: NativeModuleInit) {
        self.modules.native_inits.insert(name.to_string(), init);
    }

    /// Publie `nom → valeur` dans la table d'exports d'un module.
    /// C'est l'unique porte d'export du contrat natif.
    pub fn module_export(&mut self, module_id: u32, name: &str, value: Value) {
        let exports = self.modules.list[module_id as usize].exports;
        let key = self.intern(name);
        if let Obj::Table(t) = self.heap.get_mut(exports) {
            t.set(key, value);
        }
    }

    /// Ajoute une racine de recherche de modules.
    pub fn add_search_root(&mut self, root: impl Into<PathBuf>) {
        self.modules.roots.push(root.into());
    }

    /// Registre de modules (lecture seule : cache, états, chemins).
    pub fn module_registry(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// Cœur de LOAD_MODULE : renvoie l'objet d'exports du module.
    pub(crate) fn load_module(&mut self, path: &str, line: u32) -> Result<Value, RuntimeErr> {
        // cache : un module en cours de chargement rend ses exports partiels
        if let Some(&id) = self.modules.by_path.get(path) {
            let m = &self.modules.list[id as usize];
            return match m.state {
                ModuleState::Loaded | ModuleState::Loading => Ok(Value::Object(m.exports)),
                ModuleState::Failed => Err(RuntimeErr {
                    msg: format!("module en échec, non retenté: `{path}`"),
                    line,
                }),
                ModuleState::Unloaded => Ok(Value::Object(m.exports)),
            };
        }

        // module natif enregistré
        if let Some(name) = path.strip_prefix('$') {
            let Some(&init) = self.modules.native_inits.get(name) else {
                return Err(RuntimeErr { msg: format!("module natif inconnu: `${name}`"), line });
            };
            let exports = self.heap.alloc(Obj::Table(Table::new()));
            let id = self.modules.create(exports, path, ModuleKind::Native);
            init(self, id);
            self.modules.list[id as usize].state = ModuleState::Loaded;
            return Ok(Value::Object(exports));
        }

        // fichier source ou bytecode
        let Some(resolved) = self.resolve_module_path(path) else {
            return Err(RuntimeErr { msg: format!("module introuvable: `{path}`"), line });
        };
        log::debug!("chargement du module {path} depuis {}", resolved.display());

        let func = self.compile_module_file(&resolved, path, line)?;
        let exports = self.heap.alloc(Obj::Table(Table::new()));
        let id = self.modules.create(exports, path, ModuleKind::SourceFile);
        match self.run_module_function(func, id) {
            Ok(_) => {
                self.modules.list[id as usize].state = ModuleState::Loaded;
                Ok(Value::Object(exports))
            }
            Err(e) => {
                self.modules.list[id as usize].state = ModuleState::Failed;
                Err(RuntimeErr {
                    msg: format!("échec du chargement de `{path}`: {}", e.msg),
                    line,
                })
            }
        }
    }

    fn compile_module_file(
        &mut self,
        resolved: &PathBuf,
        path: &str,
        line: u32,
    ) -> Result<Rc<Function>, RuntimeErr> {
        let is_binary = resolved.extension().is_some_and(|e| e == "swiftmodule");
        if is_binary {
            let bytes = std::fs::read(resolved).map_err(|e| RuntimeErr {
                msg: format!("lecture de `{}`: {e}", resolved.display()),
                line,
            })?;
            let chunk = deserialize_chunk(&bytes).map_err(|e| RuntimeErr {
                msg: format!("module binaire invalide `{path}`: {e}"),
                line,
            })?;
            let mut func = Function::new(path);
            func.chunk = chunk;
            func.module = Some(path.to_string());
            return Ok(Rc::new(func));
        }
        let src = std::fs::read_to_string(resolved).map_err(|e| RuntimeErr {
            msg: format!("lecture de `{}`: {e}", resolved.display()),
            line,
        })?;
        let mut diags = Diagnostics::new();
        match swiftlang_compiler::compile_module_source(&src, path, &mut diags) {
            Some(f) => Ok(f),
            None => Err(RuntimeErr {
                msg: format!("échec de compilation du module `{path}`"),
                line,
            }),
        }
    }

    /// Résolution de chemin : `@/x` relatif au projet (le répertoire
    /// porteur d'un `manifest.json`), `a.b` pointé vers `a/b`,
    /// `.swiftmodule` préféré quand présent.
    fn resolve_module_path(&self, path: &str) -> Option<PathBuf> {
        let (rel, project_relative): (String, bool) = if let Some(p) = path.strip_prefix("@/") {
            (p.to_string(), true)
        } else if path.contains('/') || path.ends_with(".swift") || path.ends_with(".swiftmodule") {
            (path.to_string(), false)
        } else {
            // chemin pointé : a.b.c → a/b/c
            (path.replace('.', "/"), false)
        };
        let project = project_relative.then(|| self.project_root()).flatten();
        let roots = project.iter().chain(self.modules.roots.iter());
        for root in roots {
            for candidate in [
                root.join(format!("{rel}.swiftmodule")),
                root.join(format!("{rel}.swift")),
                root.join(&rel),
            ] {
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Racine du projet : le plus proche ancêtre portant `manifest.json`.
    fn project_root(&self) -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let manifest = dir.join("manifest.json");
            if manifest.is_file() && Manifest::load(&manifest).is_ok() {
                return Some(dir);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Membre d'un module builtin (chemin rapide de LOAD_BUILTIN). Un nom
    /// nu qui n'est pas builtin retombe sur le chargement complet.
    pub(crate) fn load_builtin_member(
        &mut self,
        module: &str,
        name: &str,
        line: u32,
    ) -> Result<Value, RuntimeErr> {
        let exports = match self.modules.by_path.get(module) {
            Some(&id) => self.modules.list[id as usize].exports,
            None => match self.load_module(module, line)? {
                Value::Object(r) => r,
                _ => {
                    return Err(RuntimeErr {
                        msg: format!("module invalide: `{module}`"),
                        line,
                    })
                }
            },
        };
        let key = self.intern(name);
        let found = match self.heap.get(exports) {
            Obj::Table(t) => t.get(key).cloned(),
            _ => None,
        };
        found.ok_or_else(|| RuntimeErr {
            msg: format!("export introuvable: `{name}` dans `{module}`"),
            line,
        })
    }
}
