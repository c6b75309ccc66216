//! vm.rs — Machine à pile exécutant le bytecode.
//!
//! Boucle de dispatch sur l'octet d'opcode ; chaque cas manipule la pile
//! et le pointeur d'instruction. Les frames d'appel ont une capacité
//! fixe (le débordement est une erreur d'exécution). Le point sûr du GC
//! est le haut de la boucle. Les erreurs d'exécution déroulent la pile
//! vers le handler `catch` le plus proche, sinon l'interprétation
//! s'arrête ; le déroulement est exprimé en résultat somme, pas en
//! parcours manuel d'une pile de handlers globale.

use std::rc::Rc;
use std::time::Instant;

use ahash::AHashMap;

use swiftlang_core::bytecode::chunk::{Const, Function};
use swiftlang_core::bytecode::op::{proto_id, Op};

use crate::heap::{ClosureObj, Heap, Obj, StructInst, Table, Upvalue};
use crate::modules::ModuleRegistry;
use crate::value::{ObjRef, RuntimeErr, StrRef, Value};

pub(crate) const FRAMES_MAX: usize = 256;

/// Fonction native : `(vm, arguments) → valeur`.
pub type NativeFn = fn(&mut Vm, Vec<Value>) -> Result<Value, RuntimeErr>;

pub(crate) struct NativeDef {
    pub name: String,
    pub func: NativeFn,
}

/// Forme d'un struct enregistrée par DEFINE_STRUCT.
pub(crate) struct StructDef {
    pub name: String,
    pub fields: Vec<String>,
    pub proto: Option<ObjRef>,
}

pub(crate) struct Handler {
    pub catch_ip: usize,
    pub stack_len: usize,
}

pub(crate) struct Frame {
    pub closure: Option<ObjRef>,
    pub func: Rc<Function>,
    pub ip: usize,
    pub base: usize,
    pub is_method: bool,
    pub module: Option<u32>,
    pub handlers: Vec<Handler>,
}

/// Options d'exécution.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Trace chaque opcode (via `log::trace!`).
    pub trace: bool,
    /// Force une collecte à chaque point sûr (tests de sûreté GC).
    pub gc_stress: bool,
    /// Logge chaque collecte.
    pub gc_verbose: bool,
    /// Capture la sortie de `print` dans un tampon interne.
    pub capture_output: bool,
}

pub struct Vm {
    pub heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) globals: AHashMap<String, Value>,
    pub(crate) natives: Vec<NativeDef>,
    pub(crate) struct_defs: Vec<StructDef>,
    pub(crate) struct_by_name: AHashMap<String, u32>,
    pub(crate) string_proto: ObjRef,
    pub(crate) array_proto: ObjRef,
    pub(crate) object_proto: ObjRef,
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) modules: ModuleRegistry,
    pub(crate) captured: Option<String>,
    pub(crate) trace: bool,
    /// Plancher de frames de l'exécution en cours (ré-entrance module).
    floor: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(opts: VmOptions) -> Self {
        let mut heap = Heap::new();
        heap.stress = opts.gc_stress;
        heap.verbose = opts.gc_verbose;
        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: AHashMap::new(),
            natives: Vec::new(),
            struct_defs: Vec::new(),
            struct_by_name: AHashMap::new(),
            string_proto: ObjRef(0),
            array_proto: ObjRef(0),
            object_proto: ObjRef(0),
            open_upvalues: Vec::new(),
            modules: ModuleRegistry::new(),
            captured: opts.capture_output.then(String::new),
            trace: opts.trace,
            floor: 0,
        };
        crate::natives::install(&mut vm);
        vm
    }

    /// Sortie capturée (vidée), si `capture_output` est actif.
    pub fn take_output(&mut self) -> String {
        self.captured.as_mut().map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn write_out(&mut self, text: &str) {
        match &mut self.captured {
            Some(buf) => buf.push_str(text),
            None => print!("{text}"),
        }
    }

    /// Exécute une fonction script ; renvoie la valeur terminale.
    pub fn interpret(&mut self, func: Rc<Function>) -> Result<Value, RuntimeErr> {
        self.push(Value::Func(func.clone()));
        self.push_call(Value::Func(func), 0, false, None)?;
        let result = self.run_until(0);
        if result.is_err() {
            // la VM reste utilisable (REPL) après une erreur d'exécution
            self.frames.clear();
            self.open_upvalues.clear();
            self.stack.clear();
        }
        result
    }

    /// Exécute la fonction top-level d'un module dans sa propre frame.
    pub(crate) fn run_module_function(
        &mut self,
        func: Rc<Function>,
        module_id: u32,
    ) -> Result<Value, RuntimeErr> {
        let depth = self.frames.len();
        let stack_before = self.stack.len();
        self.push(Value::Func(func.clone()));
        self.push_call(Value::Func(func), 0, false, Some(module_id))?;
        let result = self.run_until(depth);
        if result.is_err() {
            self.frames.truncate(depth);
            self.close_upvalues(stack_before);
            self.stack.truncate(stack_before);
        }
        result
    }

    /* ────── helpers de frame ────── */

    fn line_here(&self) -> u32 {
        self.frames
            .last()
            .map(|f| f.func.chunk.line_for(f.ip.saturating_sub(1)))
            .unwrap_or(0)
    }

    fn err(&self, msg: impl Into<String>) -> RuntimeErr {
        RuntimeErr { msg: msg.into(), line: self.line_here() }
    }

    fn fetch_byte(&mut self) -> u8 {
        let f = self.frames.last_mut().expect("frame active");
        let b = f.func.chunk.code[f.ip];
        f.ip += 1;
        b
    }

    fn fetch_short(&mut self) -> u16 {
        let f = self.frames.last_mut().expect("frame active");
        let v = f.func.chunk.read_short(f.ip);
        f.ip += 2;
        v
    }

    fn fetch_const(&mut self, long: bool) -> Const {
        let idx = if long {
            let a = u32::from(self.fetch_byte());
            let b = u32::from(self.fetch_byte());
            let c = u32::from(self.fetch_byte());
            a | (b << 8) | (c << 16)
        } else {
            u32::from(self.fetch_byte())
        };
        let f = self.frames.last().expect("frame active");
        f.func.chunk.const_at(idx).cloned().unwrap_or(Const::Nil)
    }

    /// Constante chaîne adressée par un opérande 1 octet (noms).
    fn fetch_name(&mut self) -> String {
        match self.fetch_const(false) {
            Const::Str(s) => s,
            other => {
                log::warn!("constante de nom invalide: {other}");
                String::new()
            }
        }
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self, depth: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - depth]
    }

    /* ────── valeurs ────── */

    pub(crate) fn intern(&mut self, s: &str) -> StrRef {
        self.heap.strings.intern(s)
    }

    pub(crate) fn str_value(&mut self, s: &str) -> Value {
        let r = self.intern(s);
        Value::Str(r)
    }

    /// Rendu texte d'une valeur (print, TO_STRING, REPL).
    pub fn display(&self, v: &Value) -> String {
        match v {
            Value::Nil => "nil".into(),
            Value::Bool(b) => b.to_string(),
            Value::Num(x) => format_num(*x),
            Value::Str(s) => self.heap.strings.get(*s).to_string(),
            Value::Func(f) => format!("<fn {}>", f.name),
            Value::Native(i) => {
                format!("<natif {}>", self.natives.get(*i as usize).map(|n| n.name.as_str()).unwrap_or("?"))
            }
            Value::Closure(r) => match self.heap.get(*r) {
                Obj::Closure(c) => format!("<fn {}>", c.func.name),
                _ => "<fn>".into(),
            },
            Value::Array(r) => match self.heap.get(*r) {
                Obj::Array(items) => {
                    let parts: Vec<String> = items.iter().map(|e| self.display(e)).collect();
                    format!("[{}]", parts.join(", "))
                }
                _ => "[]".into(),
            },
            Value::Object(r) => match self.heap.get(*r) {
                Obj::Table(t) => {
                    let parts: Vec<String> = t
                        .iter()
                        .map(|(k, val)| format!("{}: {}", self.heap.strings.get(k), self.display(val)))
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                _ => "{}".into(),
            },
            Value::Struct(r) => match self.heap.get(*r) {
                Obj::Struct(s) => {
                    let def = &self.struct_defs[s.def as usize];
                    let parts: Vec<String> = s.fields.iter().map(|f| self.display(f)).collect();
                    format!("{}({})", def.name, parts.join(", "))
                }
                _ => "<struct>".into(),
            },
        }
    }

    /* ────── upvalues ────── */

    /// La liste des upvalues ouvertes est triée par slot décroissant :
    /// deux closures capturant le même slot partagent la même cellule.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &r) in self.open_upvalues.iter().enumerate() {
            if let Obj::Upvalue(Upvalue::Open(s)) = self.heap.get(r) {
                if *s == slot {
                    return r;
                }
                if *s < slot {
                    insert_at = i;
                    break;
                }
            }
        }
        let r = self.heap.alloc(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, r);
        r
    }

    /// Ferme toutes les upvalues ouvertes dont le slot ≥ `from`.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            let slot = match self.heap.get(r) {
                Obj::Upvalue(Upvalue::Open(s)) => *s,
                _ => break,
            };
            if slot < from {
                break;
            }
            let v = self.stack.get(slot).cloned().unwrap_or(Value::Nil);
            *self.heap.get_mut(r) = Obj::Upvalue(Upvalue::Closed(v));
            self.open_upvalues.remove(0);
        }
    }

    /* ────── appels ────── */

    fn push_call(
        &mut self,
        callee: Value,
        argc: usize,
        is_method: bool,
        module: Option<u32>,
    ) -> Result<(), RuntimeErr> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.err("débordement de la pile d'appels"));
        }
        let (func, closure) = match &callee {
            Value::Func(f) => (f.clone(), None),
            Value::Closure(r) => match self.heap.get(*r) {
                Obj::Closure(c) => (c.func.clone(), Some(*r)),
                _ => return Err(self.err("appel d'une valeur non appelable")),
            },
            other => {
                return Err(self.err(format!("appel d'une valeur non appelable ({})", other.type_name())))
            }
        };
        if usize::from(func.arity) != argc {
            return Err(self.err(format!(
                "arité incorrecte pour `{}`: {} attendu(s), {argc} fourni(s)",
                func.name, func.arity
            )));
        }
        // slot 0 = callee pour un appel simple, receveur pour une méthode
        let base = self.stack.len() - argc - 1;
        // une fonction compilée dans un module s'exécute dans la portée de
        // son module ; sinon héritage de la frame englobante
        let module = module
            .or_else(|| {
                func.module
                    .as_ref()
                    .and_then(|p| self.modules.by_path.get(p).copied())
            })
            .or_else(|| self.frames.last().and_then(|f| f.module));
        self.frames.push(Frame {
            closure,
            func,
            ip: 0,
            base,
            is_method,
            module,
            handlers: Vec::new(),
        });
        Ok(())
    }

    fn call_native(&mut self, idx: u32, argc: usize, with_receiver: bool) -> Result<(), RuntimeErr> {
        let take = argc + usize::from(with_receiver);
        let args = self.stack.split_off(self.stack.len() - take);
        // retire le callee (et la valeur de méthode pré-échangée)
        let _ = self.stack.pop();
        let f = self.natives[idx as usize].func;
        let result = f(self, args)?;
        self.push(result);
        Ok(())
    }

    /* ────── globals (conscients du module) ────── */

    fn get_scoped(&self, name: &str) -> Option<Value> {
        if let Some(mid) = self.frames.last().and_then(|f| f.module) {
            if let Some(v) = self.modules.list[mid as usize].scope.get(name) {
                return Some(v.clone());
            }
        }
        self.globals.get(name).cloned()
    }

    fn define_scoped(&mut self, name: &str, v: Value) {
        if let Some(mid) = self.frames.last().and_then(|f| f.module) {
            self.modules.list[mid as usize].scope.insert(name.to_string(), v);
        } else {
            self.globals.insert(name.to_string(), v);
        }
    }

    /* ────── déroulement ────── */

    /// Lève une exception : déroule jusqu'au handler installé le plus
    /// proche (sans franchir le plancher de ré-entrance), sinon erreur.
    fn unwind(&mut self, exc: Value) -> Result<(), RuntimeErr> {
        loop {
            if self.frames.is_empty() {
                let msg = self.display(&exc);
                return Err(RuntimeErr { msg: format!("exception non rattrapée: {msg}"), line: 0 });
            }
            let handler = self.frames.last_mut().expect("frame active").handlers.pop();
            if let Some(h) = handler {
                self.close_upvalues(h.stack_len);
                self.stack.truncate(h.stack_len);
                self.push(exc);
                self.frames.last_mut().expect("frame active").ip = h.catch_ip;
                return Ok(());
            }
            if self.frames.len() <= self.floor + 1 {
                let line = self.line_here();
                let msg = self.display(&exc);
                return Err(RuntimeErr { msg: format!("exception non rattrapée: {msg}"), line });
            }
            // dépile la frame sans handler
            let f = self.frames.pop().expect("frame active");
            self.close_upvalues(f.base);
            self.stack.truncate(f.base - usize::from(f.is_method));
        }
    }

    fn raise(&mut self, msg: String) -> Result<(), RuntimeErr> {
        let has_handler = self.frames.iter().skip(self.floor).any(|f| !f.handlers.is_empty());
        if has_handler {
            let v = self.str_value(&msg);
            self.unwind(v)
        } else {
            Err(self.err(msg))
        }
    }

    /* ────── boucle principale ────── */

    /// Exécute jusqu'à ce que la pile de frames redescende à `min_frames`.
    fn run_until(&mut self, min_frames: usize) -> Result<Value, RuntimeErr> {
        let saved_floor = self.floor;
        self.floor = min_frames;
        let result = self.dispatch_loop(min_frames);
        self.floor = saved_floor;
        result
    }

    fn dispatch_loop(&mut self, min_frames: usize) -> Result<Value, RuntimeErr> {
        loop {
            if self.frames.len() == min_frames {
                return Ok(self.pop());
            }
            // point sûr : aucune référence brute hors du graphe suivi
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            let byte = self.fetch_byte();
            let Some(op) = Op::from_byte(byte) else {
                return Err(self.err(format!("opcode inconnu: 0x{byte:02X}")));
            };
            if self.trace {
                log::trace!("pile[{}] {}", self.stack.len(), op.mnemonic());
            }
            match op {
                Op::Constant | Op::ConstantLong => {
                    let c = self.fetch_const(op == Op::ConstantLong);
                    let v = match c {
                        Const::Nil => Value::Nil,
                        Const::Bool(b) => Value::Bool(b),
                        Const::Num(x) => Value::Num(x),
                        Const::Str(s) => self.str_value(&s),
                        Const::Func(f) => Value::Func(f),
                    };
                    self.push(v);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    // un slot capturé qui meurt doit d'abord être fermé
                    if !self.stack.is_empty() {
                        self.close_upvalues(self.stack.len() - 1);
                    }
                    self.pop();
                }
                Op::Dup => {
                    let v = self.peek(0).clone();
                    self.push(v);
                }
                Op::Swap => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                Op::GetLocal => {
                    let slot = usize::from(self.fetch_byte());
                    let base = self.frames.last().expect("frame").base;
                    let v = self.stack[base + slot].clone();
                    self.push(v);
                }
                Op::SetLocal => {
                    let slot = usize::from(self.fetch_byte());
                    let base = self.frames.last().expect("frame").base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                Op::GetUpvalue => {
                    let idx = usize::from(self.fetch_byte());
                    let v = self.read_upvalue(idx)?;
                    self.push(v);
                }
                Op::SetUpvalue => {
                    let idx = usize::from(self.fetch_byte());
                    let v = self.peek(0).clone();
                    self.write_upvalue(idx, v)?;
                }
                Op::GetGlobal => {
                    let name = self.fetch_name();
                    match self.get_scoped(&name) {
                        Some(v) => self.push(v),
                        None => {
                            self.raise(format!("variable globale non définie: `{name}`"))?;
                            continue;
                        }
                    }
                }
                Op::SetGlobal => {
                    let name = self.fetch_name();
                    let v = self.peek(0).clone();
                    let in_module = self.frames.last().and_then(|f| f.module).is_some();
                    if in_module {
                        // hook module : SET_GLOBAL définit dans la portée du module
                        self.define_scoped(&name, v);
                    } else if self.globals.contains_key(&name) {
                        self.globals.insert(name, v);
                    } else {
                        self.raise(format!("variable globale non définie: `{name}`"))?;
                        continue;
                    }
                }
                Op::DefineGlobal => {
                    let name = self.fetch_name();
                    let v = self.pop();
                    self.define_scoped(&name, v);
                }
                Op::GetProperty => {
                    if let Err(msg) = self.op_get_property() {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::SetProperty => {
                    if let Err(msg) = self.op_set_property() {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::GetSubscript => {
                    if let Err(msg) = self.op_get_subscript() {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::SetSubscript => {
                    if let Err(msg) = self.op_set_subscript() {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::BitAnd
                | Op::BitOr
                | Op::BitXor
                | Op::Shl
                | Op::Shr
                | Op::Less
                | Op::Greater
                | Op::LessEqual
                | Op::GreaterEqual => {
                    if let Err(msg) = self.op_binary(op) {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(&b)));
                }
                Op::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(!a.equals(&b)));
                }
                Op::Neg => {
                    let v = self.pop();
                    match as_num(&v) {
                        Some(x) => self.push(Value::Num(-x)),
                        None => {
                            self.raise(format!("opérande de `-` non numérique ({})", v.type_name()))?;
                            continue;
                        }
                    }
                }
                Op::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                Op::BitNot => {
                    let v = self.pop();
                    match as_num(&v) {
                        Some(x) => self.push(Value::Num(!(x as i64) as f64)),
                        None => {
                            self.raise("opérande de `~` non numérique".into())?;
                            continue;
                        }
                    }
                }
                Op::Jump => {
                    let dist = usize::from(self.fetch_short());
                    self.frames.last_mut().expect("frame").ip += dist;
                }
                Op::JumpIfFalse => {
                    let dist = usize::from(self.fetch_short());
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().expect("frame").ip += dist;
                    }
                }
                Op::Loop => {
                    let dist = usize::from(self.fetch_short());
                    self.frames.last_mut().expect("frame").ip -= dist;
                }
                Op::Call => {
                    let argc = usize::from(self.fetch_byte());
                    let callee = self.peek(argc).clone();
                    match callee {
                        Value::Native(i) => {
                            if let Err(e) = self.call_native(i, argc, false) {
                                self.raise(e.msg)?;
                            }
                        }
                        other => {
                            if let Err(e) = self.push_call(other, argc, false, None) {
                                self.raise(e.msg)?;
                            }
                        }
                    }
                }
                Op::MethodCall => {
                    let argc = usize::from(self.fetch_byte());
                    // pile : [méthode, receveur, args…]
                    let callee = self.peek(argc + 1).clone();
                    match callee {
                        Value::Native(i) => {
                            // une fonction rangée DANS l'objet (export de
                            // module) s'appelle sans receveur ; une méthode
                            // héritée du prototype lie le receveur
                            let receiver = self.peek(argc).clone();
                            let standalone = match &receiver {
                                Value::Object(r) => match self.heap.get(*r) {
                                    Obj::Table(t) => {
                                        t.iter().any(|(_, v)| matches!(v, Value::Native(j) if *j == i))
                                    }
                                    _ => false,
                                },
                                _ => false,
                            };
                            if standalone {
                                // retire le receveur de la fenêtre d'appel
                                let args_at = self.stack.len() - argc;
                                self.stack.remove(args_at - 1);
                            }
                            if let Err(e) = self.call_native(i, argc, !standalone) {
                                self.raise(e.msg)?;
                            }
                        }
                        other => {
                            if let Err(e) = self.push_call(other, argc, true, None) {
                                self.raise(e.msg)?;
                            }
                        }
                    }
                }
                Op::Closure | Op::ClosureLong => {
                    let c = self.fetch_const(op == Op::ClosureLong);
                    let Const::Func(func) = c else {
                        return Err(self.err("constante de closure invalide"));
                    };
                    let mut upvalues = Vec::with_capacity(usize::from(func.upvalue_count));
                    for _ in 0..func.upvalue_count {
                        let is_local = self.fetch_byte() != 0;
                        let index = usize::from(self.fetch_byte());
                        if is_local {
                            let base = self.frames.last().expect("frame").base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.frames.last().expect("frame").closure;
                            let r = enclosing
                                .and_then(|c| match self.heap.get(c) {
                                    Obj::Closure(cl) => cl.upvalues.get(index).copied(),
                                    _ => None,
                                })
                                .ok_or_else(|| self.err("upvalue englobante introuvable"))?;
                            upvalues.push(r);
                        }
                    }
                    let r = self.heap.alloc(Obj::Closure(ClosureObj { func, upvalues }));
                    self.push(Value::Closure(r));
                }
                Op::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("frame active");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base - usize::from(frame.is_method));
                    self.push(result);
                }
                Op::Array => {
                    let count = usize::from(self.fetch_byte());
                    let items = self.stack.split_off(self.stack.len() - count);
                    let r = self.heap.alloc(Obj::Array(items));
                    self.push(Value::Array(r));
                }
                Op::CreateObject => {
                    let mut t = Table::new();
                    t.proto = Some(self.object_proto);
                    let r = self.heap.alloc(Obj::Table(t));
                    self.push(Value::Object(r));
                }
                Op::DefineStruct => {
                    let name = self.fetch_name();
                    let fc = usize::from(self.fetch_byte());
                    let mut fields = Vec::with_capacity(fc);
                    for _ in 0..fc {
                        fields.push(self.fetch_name());
                    }
                    self.define_struct(&name, fields);
                }
                Op::CreateStruct => {
                    let name = self.fetch_name();
                    let Some(&def) = self.struct_by_name.get(&name) else {
                        self.raise(format!("struct inconnu: `{name}`"))?;
                        continue;
                    };
                    let fc = self.struct_defs[def as usize].fields.len();
                    let fields = self.stack.split_off(self.stack.len() - fc);
                    let r = self.heap.alloc(Obj::Struct(StructInst { def, fields }));
                    self.push(Value::Struct(r));
                }
                Op::GetIter => {
                    if let Err(msg) = self.op_get_iter() {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::ForIter => {
                    let idx_pos = self.stack.len() - 1;
                    let Value::Num(i) = self.stack[idx_pos].clone() else {
                        return Err(self.err("état d'itérateur corrompu"));
                    };
                    let Value::Array(arr) = self.stack[idx_pos - 1].clone() else {
                        return Err(self.err("état d'itérateur corrompu"));
                    };
                    let (elem, more) = match self.heap.get(arr) {
                        Obj::Array(items) => {
                            let i = i as usize;
                            if i < items.len() {
                                (Some(items[i].clone()), true)
                            } else {
                                (None, false)
                            }
                        }
                        _ => (None, false),
                    };
                    if more {
                        self.stack[idx_pos] = Value::Num(i + 1.0);
                        self.push(elem.expect("élément présent"));
                        self.push(Value::Bool(true));
                    } else {
                        self.push(Value::Bool(false));
                    }
                }
                Op::LoadModule => {
                    let path = self.fetch_name();
                    let line = self.line_here();
                    match self.load_module(&path, line) {
                        Ok(v) => self.push(v),
                        Err(e) => {
                            self.raise(e.msg)?;
                            continue;
                        }
                    }
                }
                Op::ImportFrom => {
                    let name = self.fetch_name();
                    let module = self.pop();
                    let Value::Object(r) = module else {
                        self.raise("import depuis une valeur qui n'est pas un module".into())?;
                        continue;
                    };
                    let key = self.intern(&name);
                    let found = match self.heap.get(r) {
                        Obj::Table(t) => t.get(key).cloned(),
                        _ => None,
                    };
                    match found {
                        Some(v) => self.push(v),
                        None => {
                            self.raise(format!("export introuvable: `{name}`"))?;
                            continue;
                        }
                    }
                }
                Op::ImportAllFrom => {
                    let module = self.pop();
                    let Value::Object(r) = module else {
                        self.raise("import depuis une valeur qui n'est pas un module".into())?;
                        continue;
                    };
                    let entries: Vec<(String, Value)> = match self.heap.get(r) {
                        Obj::Table(t) => t
                            .iter()
                            .map(|(k, v)| (self.heap.strings.get(k).to_string(), v.clone()))
                            .collect(),
                        _ => Vec::new(),
                    };
                    for (name, v) in entries {
                        self.define_scoped(&name, v);
                    }
                }
                Op::LoadBuiltin => {
                    let name_v = self.pop();
                    let module_v = self.pop();
                    let (Value::Str(n), Value::Str(m)) = (&name_v, &module_v) else {
                        self.raise("LOAD_BUILTIN attend deux chaînes".into())?;
                        continue;
                    };
                    let name = self.heap.strings.get(*n).to_string();
                    let module = self.heap.strings.get(*m).to_string();
                    let line = self.line_here();
                    match self.load_builtin_member(&module, &name, line) {
                        Ok(v) => self.push(v),
                        Err(e) => {
                            self.raise(e.msg)?;
                            continue;
                        }
                    }
                }
                Op::ModuleExport => {
                    let name = self.fetch_name();
                    let value = self.pop();
                    if let Err(msg) = self.op_module_export(&name, value) {
                        self.raise(msg)?;
                        continue;
                    }
                }
                Op::ToString => {
                    let v = self.pop();
                    let text = self.display(&v);
                    let sv = self.str_value(&text);
                    self.push(sv);
                }
                Op::OptionalChain => {
                    let dist = usize::from(self.fetch_short());
                    if self.peek(0).is_nil() {
                        self.frames.last_mut().expect("frame").ip += dist;
                    }
                }
                Op::ForceUnwrap => {
                    if self.peek(0).is_nil() {
                        self.raise("déballage forcé d'une valeur nil".into())?;
                        continue;
                    }
                }
                Op::Await => {
                    // passage synchrone : la valeur attendue est déjà là
                }
                Op::GetObjectProto => {
                    let id = self.fetch_byte();
                    let r = match id {
                        proto_id::STRING => self.string_proto,
                        proto_id::ARRAY => self.array_proto,
                        _ => self.object_proto,
                    };
                    self.push(Value::Object(r));
                }
                Op::GetStructProto => {
                    let name = self.fetch_name();
                    let r = self.struct_proto(&name);
                    self.push(Value::Object(r));
                }
                Op::Throw => {
                    let exc = self.pop();
                    self.unwind(exc)?;
                }
                Op::PushHandler => {
                    let dist = usize::from(self.fetch_short());
                    let f = self.frames.last_mut().expect("frame active");
                    let catch_ip = f.ip + dist;
                    let stack_len = self.stack.len();
                    f.handlers.push(Handler { catch_ip, stack_len });
                }
                Op::PopHandler => {
                    let _ = self.frames.last_mut().expect("frame active").handlers.pop();
                }
            }
        }
    }

    /* ────── opérations détaillées ────── */

    fn read_upvalue(&mut self, idx: usize) -> Result<Value, RuntimeErr> {
        let closure = self
            .frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| self.err("upvalue hors closure"))?;
        let cell = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[idx],
            _ => return Err(self.err("closure corrompue")),
        };
        Ok(match self.heap.get(cell) {
            Obj::Upvalue(Upvalue::Open(slot)) => self.stack[*slot].clone(),
            Obj::Upvalue(Upvalue::Closed(v)) => v.clone(),
            _ => Value::Nil,
        })
    }

    fn write_upvalue(&mut self, idx: usize, v: Value) -> Result<(), RuntimeErr> {
        let closure = self
            .frames
            .last()
            .and_then(|f| f.closure)
            .ok_or_else(|| self.err("upvalue hors closure"))?;
        let cell = match self.heap.get(closure) {
            Obj::Closure(c) => c.upvalues[idx],
            _ => return Err(self.err("closure corrompue")),
        };
        match self.heap.get_mut(cell) {
            Obj::Upvalue(u) => match u {
                Upvalue::Open(slot) => {
                    let slot = *slot;
                    self.stack[slot] = v;
                }
                Upvalue::Closed(c) => *c = v,
            },
            _ => {}
        }
        Ok(())
    }

    fn op_binary(&mut self, op: Op) -> Result<(), String> {
        let b = self.pop();
        let a = self.pop();
        // `+` sur deux chaînes : concaténation (chaîne internée neuve)
        if op == Op::Add {
            if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
                let joined = format!("{}{}", self.heap.strings.get(*x), self.heap.strings.get(*y));
                let v = self.str_value(&joined);
                self.push(v);
                return Ok(());
            }
        }
        // comparaisons de chaînes : ordre lexicographique
        if matches!(op, Op::Less | Op::Greater | Op::LessEqual | Op::GreaterEqual) {
            if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
                let xs = self.heap.strings.get(*x);
                let ys = self.heap.strings.get(*y);
                let r = match op {
                    Op::Less => xs < ys,
                    Op::Greater => xs > ys,
                    Op::LessEqual => xs <= ys,
                    _ => xs >= ys,
                };
                self.push(Value::Bool(r));
                return Ok(());
            }
        }
        let (Some(x), Some(y)) = (as_num(&a), as_num(&b)) else {
            return Err(format!(
                "opérandes invalides pour `{}`: {} et {}",
                op.mnemonic(),
                a.type_name(),
                b.type_name()
            ));
        };
        let v = match op {
            Op::Add => Value::Num(x + y),
            Op::Sub => Value::Num(x - y),
            Op::Mul => Value::Num(x * y),
            Op::Div => {
                if y == 0.0 && x.fract() == 0.0 && y.fract() == 0.0 {
                    return Err("division par zéro".into());
                }
                Value::Num(x / y)
            }
            Op::Mod => {
                if y == 0.0 && x.fract() == 0.0 {
                    return Err("division par zéro (modulo)".into());
                }
                Value::Num(x % y)
            }
            Op::BitAnd => Value::Num(((x as i64) & (y as i64)) as f64),
            Op::BitOr => Value::Num(((x as i64) | (y as i64)) as f64),
            Op::BitXor => Value::Num(((x as i64) ^ (y as i64)) as f64),
            Op::Shl => Value::Num(((x as i64) << (y as i64 & 63)) as f64),
            Op::Shr => Value::Num(((x as i64) >> (y as i64 & 63)) as f64),
            Op::Less => Value::Bool(x < y),
            Op::Greater => Value::Bool(x > y),
            Op::LessEqual => Value::Bool(x <= y),
            Op::GreaterEqual => Value::Bool(x >= y),
            _ => unreachable!("opcode binaire"),
        };
        self.push(v);
        Ok(())
    }

    /// Recherche une propriété dans une table puis sa chaîne de prototypes.
    fn table_lookup(&self, mut table: ObjRef, key: StrRef) -> Option<Value> {
        loop {
            match self.heap.get(table) {
                Obj::Table(t) => {
                    if let Some(v) = t.get(key) {
                        return Some(v.clone());
                    }
                    match t.proto {
                        Some(p) => table = p,
                        None => return None,
                    }
                }
                _ => return None,
            }
        }
    }

    fn op_get_property(&mut self) -> Result<(), String> {
        let name_v = self.pop();
        let obj_v = self.pop();
        let Value::Str(key) = name_v else {
            return Err("nom de propriété invalide".into());
        };
        let v = match &obj_v {
            Value::Object(r) => self.table_lookup(*r, key).unwrap_or(Value::Nil),
            Value::Array(_) => self.table_lookup(self.array_proto, key).unwrap_or(Value::Nil),
            Value::Str(_) => self.table_lookup(self.string_proto, key).unwrap_or(Value::Nil),
            Value::Struct(r) => {
                let (def, field) = match self.heap.get(*r) {
                    Obj::Struct(s) => {
                        let def = &self.struct_defs[s.def as usize];
                        let name = self.heap.strings.get(key);
                        let idx = def.fields.iter().position(|f| f == name);
                        (s.def, idx.map(|i| s.fields[i].clone()))
                    }
                    _ => return Err("struct corrompu".into()),
                };
                match field {
                    Some(v) => v,
                    None => {
                        let proto = self.struct_defs[def as usize].proto;
                        proto.and_then(|p| self.table_lookup(p, key)).unwrap_or(Value::Nil)
                    }
                }
            }
            Value::Nil => return Err("propriété lue sur nil".into()),
            other => return Err(format!("propriété lue sur un non-objet ({})", other.type_name())),
        };
        self.push(v);
        Ok(())
    }

    fn op_set_property(&mut self) -> Result<(), String> {
        let value = self.pop();
        let name_v = self.pop();
        let obj_v = self.pop();
        let Value::Str(key) = name_v else {
            return Err("nom de propriété invalide".into());
        };
        match &obj_v {
            Value::Object(r) => match self.heap.get_mut(*r) {
                Obj::Table(t) => {
                    t.set(key, value.clone());
                }
                _ => return Err("objet corrompu".into()),
            },
            Value::Struct(r) => {
                let name = self.heap.strings.get(key).to_string();
                let def = match self.heap.get(*r) {
                    Obj::Struct(s) => s.def,
                    _ => return Err("struct corrompu".into()),
                };
                let idx = self.struct_defs[def as usize]
                    .fields
                    .iter()
                    .position(|f| *f == name)
                    .ok_or_else(|| format!("champ inconnu: `{name}`"))?;
                match self.heap.get_mut(*r) {
                    Obj::Struct(s) => s.fields[idx] = value.clone(),
                    _ => {}
                }
            }
            other => {
                return Err(format!("propriété écrite sur un non-objet ({})", other.type_name()))
            }
        }
        self.push(value);
        Ok(())
    }

    fn op_get_subscript(&mut self) -> Result<(), String> {
        let idx_v = self.pop();
        let obj_v = self.pop();
        let v = match (&obj_v, &idx_v) {
            (Value::Array(r), Value::Num(i)) => {
                let items = match self.heap.get(*r) {
                    Obj::Array(items) => items,
                    _ => return Err("tableau corrompu".into()),
                };
                let i = *i;
                if i < 0.0 || i >= items.len() as f64 {
                    return Err(format!("indice hors limites: {} (longueur {})", i, items.len()));
                }
                items[i as usize].clone()
            }
            (Value::Object(r), Value::Str(k)) => self.table_lookup(*r, *k).unwrap_or(Value::Nil),
            (Value::Str(s), Value::Num(i)) => {
                let text = self.heap.strings.get(*s);
                let i = *i;
                if i < 0.0 || i >= text.len() as f64 {
                    return Err(format!("indice hors limites: {} (longueur {})", i, text.len()));
                }
                let ch = text.as_bytes()[i as usize] as char;
                let owned = ch.to_string();
                self.str_value(&owned)
            }
            (o, i) => {
                return Err(format!(
                    "indexation invalide: {}[{}]",
                    o.type_name(),
                    i.type_name()
                ))
            }
        };
        self.push(v);
        Ok(())
    }

    fn op_set_subscript(&mut self) -> Result<(), String> {
        let value = self.pop();
        let idx_v = self.pop();
        let obj_v = self.pop();
        match (&obj_v, &idx_v) {
            (Value::Array(r), Value::Num(i)) => {
                let i = *i;
                match self.heap.get_mut(*r) {
                    Obj::Array(items) => {
                        if i < 0.0 || i >= items.len() as f64 {
                            return Err(format!(
                                "indice hors limites: {} (longueur {})",
                                i,
                                items.len()
                            ));
                        }
                        items[i as usize] = value.clone();
                    }
                    _ => return Err("tableau corrompu".into()),
                }
            }
            (Value::Object(r), Value::Str(k)) => match self.heap.get_mut(*r) {
                Obj::Table(t) => {
                    t.set(*k, value.clone());
                }
                _ => return Err("objet corrompu".into()),
            },
            (o, i) => {
                return Err(format!(
                    "écriture indexée invalide: {}[{}]",
                    o.type_name(),
                    i.type_name()
                ))
            }
        }
        self.push(value);
        Ok(())
    }

    fn op_get_iter(&mut self) -> Result<(), String> {
        let v = self.pop();
        match v {
            Value::Array(r) => {
                self.push(Value::Array(r));
                self.push(Value::Num(0.0));
                Ok(())
            }
            Value::Str(s) => {
                // une chaîne s'itère caractère par caractère
                let text = self.heap.strings.get(s).to_string();
                let chars: Vec<Value> = text
                    .chars()
                    .map(|c| {
                        let owned = c.to_string();
                        self.str_value(&owned)
                    })
                    .collect();
                let r = self.heap.alloc(Obj::Array(chars));
                self.push(Value::Array(r));
                self.push(Value::Num(0.0));
                Ok(())
            }
            other => Err(format!("`{}` n'est pas itérable", other.type_name())),
        }
    }

    fn op_module_export(&mut self, name: &str, value: Value) -> Result<(), String> {
        let Some(mid) = self.frames.last().and_then(|f| f.module) else {
            return Err("`export` hors d'un module".into());
        };
        let exports = self.modules.list[mid as usize].exports;
        if name == "*" {
            // ré-export : splat des exports d'un autre module
            let Value::Object(src) = value else {
                return Err("ré-export d'une valeur qui n'est pas un module".into());
            };
            let entries: Vec<(StrRef, Value)> = match self.heap.get(src) {
                Obj::Table(t) => t.iter().map(|(k, v)| (k, v.clone())).collect(),
                _ => Vec::new(),
            };
            match self.heap.get_mut(exports) {
                Obj::Table(t) => {
                    for (k, v) in entries {
                        t.set(k, v);
                    }
                }
                _ => return Err("table d'exports corrompue".into()),
            }
            return Ok(());
        }
        let key = self.intern(name);
        match self.heap.get_mut(exports) {
            Obj::Table(t) => {
                t.set(key, value);
                Ok(())
            }
            _ => Err("table d'exports corrompue".into()),
        }
    }

    /* ────── structs ────── */

    pub(crate) fn define_struct(&mut self, name: &str, fields: Vec<String>) {
        match self.struct_by_name.get(name) {
            Some(&idx) => {
                self.struct_defs[idx as usize].fields = fields;
            }
            None => {
                let idx = self.struct_defs.len() as u32;
                self.struct_defs.push(StructDef { name: name.to_string(), fields, proto: None });
                self.struct_by_name.insert(name.to_string(), idx);
            }
        }
    }

    /// Prototype d'un struct, créé paresseusement.
    pub(crate) fn struct_proto(&mut self, name: &str) -> ObjRef {
        let idx = match self.struct_by_name.get(name) {
            Some(&i) => i,
            None => {
                // GET_STRUCT_PROTO avant DEFINE_STRUCT : forme vide
                self.define_struct(name, Vec::new());
                self.struct_by_name[name]
            }
        };
        if let Some(p) = self.struct_defs[idx as usize].proto {
            return p;
        }
        let p = self.heap.alloc(Obj::Table(Table::new()));
        self.struct_defs[idx as usize].proto = Some(p);
        p
    }

    /* ────── GC ────── */

    /// Collecte complète : marquage depuis les racines, balayage des
    /// objets puis des chaînes internées.
    pub fn collect_garbage(&mut self) {
        let started = Instant::now();
        let mut work: Vec<ObjRef> = Vec::new();

        for i in 0..self.stack.len() {
            let v = self.stack[i].clone();
            self.heap.mark_value(&v, &mut work);
        }
        let globals: Vec<Value> = self.globals.values().cloned().collect();
        for v in &globals {
            self.heap.mark_value(v, &mut work);
        }
        let frame_closures: Vec<ObjRef> = self.frames.iter().filter_map(|f| f.closure).collect();
        for r in frame_closures {
            self.heap.mark_object(r, &mut work);
        }
        for i in 0..self.open_upvalues.len() {
            let r = self.open_upvalues[i];
            self.heap.mark_object(r, &mut work);
        }
        let module_roots: Vec<Value> = self
            .modules
            .list
            .iter()
            .flat_map(|m| {
                std::iter::once(Value::Object(m.exports)).chain(m.scope.values().cloned())
            })
            .collect();
        for v in &module_roots {
            self.heap.mark_value(v, &mut work);
        }
        let protos: Vec<ObjRef> = [self.string_proto, self.array_proto, self.object_proto]
            .into_iter()
            .chain(self.struct_defs.iter().filter_map(|d| d.proto))
            .collect();
        for r in protos {
            self.heap.mark_object(r, &mut work);
        }

        self.heap.trace(&mut work);
        self.heap.sweep(started);
    }
}

/// Coercition numérique : les booléens valent 0/1 en arithmétique.
fn as_num(v: &Value) -> Option<f64> {
    match v {
        Value::Num(x) => Some(*x),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Les nombres entiers s'affichent sans partie décimale.
pub(crate) fn format_num(x: f64) -> String {
    if x.fract() == 0.0 && x.is_finite() && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}
