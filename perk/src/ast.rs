//! AST nodes and the packed-module reader.
//!
//! Nodes are immutable and leaked: a module's AST and its compiled code live
//! for the process lifetime, which is what lets emitted machine code embed
//! raw node pointers. Heap references inside literals are recorded on the
//! module and registered as GC roots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use object::Slot;

use crate::fiber::Fiber;
use crate::pack::{PackError, PackReader};
use crate::runtime::{Namespace, Runtime};

/// Runtime helper installed at call sites and published for compiled
/// functions. Return protocol: 0 continue, <0 mis-dispatch (retry through
/// the refreshed target), 1 return from the current function, >1 exit the
/// JIT with a status code (2 early exit, 3 exception, 4 blocked awaiting
/// resume).
pub type MethodImpl = extern "C" fn(*mut Fiber, *const Apply) -> i64;

pub fn leak(node: Node) -> &'static Node {
    Box::leak(Box::new(node))
}

pub enum Node {
    Literal(Literal),
    Symbol(SymbolNode),
    Builtin(BuiltinNode),
    Let(LetNode),
    Local(LocalNode),
    Global(GlobalNode),
    Do(DoNode),
    Branch(BranchNode),
    Apply(Apply),
    Return(ReturnNode),
    Recur(RecurNode),
    Function(FunctionNode),
    Define(DefineNode),
    Import(ImportNode),
    Struct(StructNode),
    Module(ModuleNode),
}

pub struct Literal {
    pub value: Slot,
}

pub struct SymbolNode {
    pub name: String,
    pub namei: usize,
}

/// A pre-resolved builtin value.
pub struct BuiltinNode {
    pub value: Slot,
}

pub struct LetNode {
    pub name: String,
    pub namei: usize,
    pub expr: &'static Node,
}

pub struct LocalNode {
    pub name: String,
    pub namei: usize,
    /// Stack offset from the frame base; resolved when the enclosing
    /// function finishes reading.
    pub index: AtomicUsize,
}

pub struct GlobalNode {
    pub name: String,
    pub namei: usize,
    pub module: &'static ModuleNode,
    cell: OnceLock<Slot>,
}

impl GlobalNode {
    /// Resolve the global against its module namespace on first use.
    pub fn value(&self) -> Result<Slot, String> {
        if let Some(v) = self.cell.get() {
            return Ok(*v);
        }
        let ns = self
            .module
            .ns
            .get()
            .ok_or_else(|| format!("module of global {} not linked", self.name))?;
        match ns.find(self.namei) {
            Some(v) => Ok(*self.cell.get_or_init(|| v)),
            None => Err(format!(
                "name not found while initializing global: {}",
                self.name
            )),
        }
    }
}

pub struct DoNode {
    pub statements: Vec<&'static Node>,
}

pub struct BranchNode {
    pub condition: &'static Node,
    pub on_true: &'static Node,
    pub on_false: &'static Node,
}

/// A call site. `target` caches the most recently resolved method; the
/// bootstrap value re-resolves and installs.
pub struct Apply {
    pub target: AtomicUsize,
    pub line: u32,
    /// When set (the default), an error result unwinds the caller's frame;
    /// a non-throwing call site receives the error as a normal value.
    pub throws: bool,
    pub callable: Option<&'static Node>,
    pub arguments: Vec<&'static Node>,
}

impl Apply {
    pub fn new(
        line: u32,
        throws: bool,
        callable: Option<&'static Node>,
        arguments: Vec<&'static Node>,
    ) -> Self {
        Self {
            target: AtomicUsize::new(crate::exec::exec_dispatch_target as usize),
            line,
            throws,
            callable,
            arguments,
        }
    }

    #[inline(always)]
    pub fn argument_count(&self) -> usize {
        self.arguments.len()
    }

    #[inline(always)]
    pub fn set_target(&self, target: MethodImpl) {
        self.target.store(target as usize, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn load_target(&self) -> usize {
        self.target.load(Ordering::Relaxed)
    }
}

pub struct ReturnNode {
    pub expr: &'static Node,
}

pub struct RecurNode {
    pub arguments: Vec<&'static Node>,
}

pub struct FunctionNode {
    pub line: u32,
    pub name: String,
    /// Published compiled entry (a `MethodImpl`), 0 while uncompiled.
    pub code: AtomicUsize,
    pub module: &'static ModuleNode,
    pub parameters: Vec<usize>,
    pub locals: Vec<usize>,
    pub freevars: Vec<usize>,
    local_map: HashMap<usize, usize>,
    freevar_map: HashMap<usize, usize>,
    pub body: &'static Node,
}

impl FunctionNode {
    pub fn new(
        line: u32,
        name: String,
        module: &'static ModuleNode,
        parameters: Vec<usize>,
        locals: Vec<usize>,
        freevars: Vec<usize>,
        body: &'static Node,
    ) -> Self {
        // the callable sits at the frame base; parameters follow it, then
        // the declared locals
        let mut local_map = HashMap::with_capacity(parameters.len() + locals.len());
        let mut i = 1;
        for namei in &parameters {
            local_map.insert(*namei, i);
            i += 1;
        }
        for namei in &locals {
            local_map.insert(*namei, i);
            i += 1;
        }
        let freevar_map = freevars
            .iter()
            .enumerate()
            .map(|(i, namei)| (*namei, i))
            .collect();
        Self {
            line,
            name,
            code: AtomicUsize::new(0),
            module,
            parameters,
            locals,
            freevars,
            local_map,
            freevar_map,
            body,
        }
    }

    #[inline(always)]
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    pub fn local_index(&self, namei: usize) -> Option<usize> {
        self.local_map.get(&namei).copied()
    }

    pub fn freevar_index(&self, namei: usize) -> Option<usize> {
        self.freevar_map.get(&namei).copied()
    }

    pub fn published_code(&self) -> Option<MethodImpl> {
        let raw = self.code.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            // SAFETY: only valid MethodImpl addresses are published.
            Some(unsafe { std::mem::transmute::<usize, MethodImpl>(raw) })
        }
    }

    pub fn publish_code(&self, code: MethodImpl) {
        self.code.store(code as usize, Ordering::Release);
    }
}

pub struct DefineNode {
    pub name: String,
    pub namei: usize,
    pub expr: Option<&'static Node>,
    pub data: Option<Slot>,
}

pub struct ImportNode {
    pub from: String,
    /// Interned names of the imported symbols.
    pub imports: Vec<(String, usize)>,
}

pub struct StructNode {
    pub name: String,
    pub namei: usize,
    /// The struct fields, read as define nodes carrying data.
    pub fields: Vec<&'static Node>,
}

pub struct ModuleNode {
    pub name: String,
    pub expressions: OnceLock<Vec<&'static Node>>,
    pub ns: OnceLock<std::sync::Arc<Namespace>>,
    /// Heap references owned by this module's literals; scanned as roots.
    pub roots: parking_lot::Mutex<Vec<Slot>>,
}

// ── packed-module reader ──────────────────────────────────────────────

#[derive(Debug)]
pub enum ReadError {
    Pack(PackError),
    Malformed(String),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pack(e) => write!(f, "pack error: {e}"),
            Self::Malformed(what) => write!(f, "malformed module: {what}"),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<PackError> for ReadError {
    fn from(e: PackError) -> Self {
        Self::Pack(e)
    }
}

#[derive(Default)]
struct NodeKeys {
    name: Option<String>,
    value: Option<String>,
    from: Option<String>,
    line: Option<i64>,
    expr: Option<&'static Node>,
    stmts: Option<Vec<&'static Node>>,
    if_stmts: Option<Vec<&'static Node>>,
    else_stmts: Option<Vec<&'static Node>>,
    args: Option<Vec<&'static Node>>,
    parms: Option<Vec<&'static Node>>,
    locals: Option<Vec<&'static Node>>,
    freevars: Option<Vec<&'static Node>>,
    imports: Option<Vec<&'static Node>>,
    data: Option<Slot>,
}

/// Streaming reader turning a `.pck` byte stream into a module AST.
pub struct AstReader<'rt, 'b> {
    runtime: &'rt Runtime,
    input: PackReader<'b>,
    module: Option<&'static ModuleNode>,
    module_name: String,
    /// Local nodes of each function under construction, for late index
    /// binding.
    current_locals: Vec<Vec<&'static LocalNode>>,
}

impl<'rt, 'b> AstReader<'rt, 'b> {
    pub fn new(runtime: &'rt Runtime, bytes: &'b [u8]) -> Self {
        Self {
            runtime,
            input: PackReader::new(bytes),
            module: None,
            module_name: String::new(),
            current_locals: Vec::new(),
        }
    }

    pub fn read_module(mut self, name: &str) -> Result<&'static ModuleNode, ReadError> {
        self.module_name = name.to_string();
        let node = self.read_node()?;
        match node {
            Node::Module(module) => Ok(module),
            _ => Err(ReadError::Malformed("top-level node is not a module".into())),
        }
    }

    fn module(&self) -> Result<&'static ModuleNode, ReadError> {
        self.module
            .ok_or_else(|| ReadError::Malformed("node outside module".into()))
    }

    fn read_nodes(&mut self) -> Result<Vec<&'static Node>, ReadError> {
        let n = self.input.read_array_header()?;
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(self.read_node()?);
        }
        Ok(nodes)
    }

    fn read_keys(&mut self, remaining: usize) -> Result<NodeKeys, ReadError> {
        let mut keys = NodeKeys::default();
        for _ in 0..remaining {
            let key = self.input.read_string()?;
            match key.as_str() {
                "name" => keys.name = Some(self.input.read_string()?),
                "value" => keys.value = Some(self.input.read_string()?),
                "from" => keys.from = Some(self.input.read_string()?),
                "line" => keys.line = Some(self.input.read_i64()?),
                "expr" => keys.expr = Some(self.read_node()?),
                "stmts" => keys.stmts = Some(self.read_nodes()?),
                "if_stmts" => keys.if_stmts = Some(self.read_nodes()?),
                "else_stmts" => keys.else_stmts = Some(self.read_nodes()?),
                "args" => keys.args = Some(self.read_nodes()?),
                "parms" => keys.parms = Some(self.read_nodes()?),
                "locals" => keys.locals = Some(self.read_nodes()?),
                "freevars" => keys.freevars = Some(self.read_nodes()?),
                "imports" => keys.imports = Some(self.read_nodes()?),
                "data" => {
                    let value = self.input.read_value()?;
                    let slot = self.runtime.pack_to_slot(&value).map_err(|e| {
                        ReadError::Malformed(format!("bad data value: {e}"))
                    })?;
                    if let Some(module) = self.module {
                        if slot.is_ref() {
                            module.roots.lock().push(slot);
                        }
                    }
                    keys.data = Some(slot);
                }
                other => {
                    return Err(ReadError::Malformed(format!("unknown node key: {other}")))
                }
            }
        }
        Ok(keys)
    }

    fn symbols_to_nameis(nodes: Option<Vec<&'static Node>>) -> Result<Vec<usize>, ReadError> {
        let mut out = Vec::new();
        for node in nodes.unwrap_or_default() {
            match node {
                Node::Symbol(s) => out.push(s.namei),
                Node::Local(l) => out.push(l.namei),
                _ => {
                    return Err(ReadError::Malformed(
                        "expected symbol in name list".into(),
                    ))
                }
            }
        }
        Ok(out)
    }

    fn stmts_as_expr(&self, stmts: Option<Vec<&'static Node>>) -> &'static Node {
        let mut stmts = stmts.unwrap_or_default();
        match stmts.len() {
            0 => leak(Node::Literal(Literal { value: Slot::Undef })),
            1 => stmts.pop().expect("one statement"),
            _ => leak(Node::Do(DoNode { statements: stmts })),
        }
    }

    fn read_node(&mut self) -> Result<&'static Node, ReadError> {
        let map_len = self.input.read_map_header()?;
        if map_len < 1 {
            return Err(ReadError::Malformed("empty node map".into()));
        }
        let type_key = self.input.read_string()?;
        if type_key != "type" {
            return Err(ReadError::Malformed("node map must lead with type".into()));
        }
        let kind = self.input.read_string()?;
        let remaining = map_len - 1;

        match kind.as_str() {
            "module" => {
                if self.module.is_some() {
                    return Err(ReadError::Malformed("nested module".into()));
                }
                let node = leak(Node::Module(ModuleNode {
                    name: self.module_name.clone(),
                    expressions: OnceLock::new(),
                    ns: OnceLock::new(),
                    roots: parking_lot::Mutex::new(Vec::new()),
                }));
                let Node::Module(module) = node else {
                    unreachable!()
                };
                self.module = Some(module);
                let keys = self.read_keys(remaining)?;
                module
                    .expressions
                    .set(keys.stmts.unwrap_or_default())
                    .ok();
                Ok(node)
            }
            "define" => {
                self.module()?;
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .name
                    .ok_or_else(|| ReadError::Malformed("define without name".into()))?;
                if keys.expr.is_none() && keys.data.is_none() {
                    return Err(ReadError::Malformed(
                        "define needs expr or data".into(),
                    ));
                }
                let namei = self.runtime.intern(&name);
                Ok(leak(Node::Define(DefineNode {
                    name,
                    namei,
                    expr: keys.expr,
                    data: keys.data,
                })))
            }
            "struct_field" => {
                self.module()?;
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .name
                    .ok_or_else(|| ReadError::Malformed("struct_field without name".into()))?;
                let namei = self.runtime.intern(&name);
                Ok(leak(Node::Define(DefineNode {
                    name,
                    namei,
                    expr: None,
                    data: Some(keys.data.unwrap_or(Slot::Undef)),
                })))
            }
            "struct" => {
                self.module()?;
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .name
                    .ok_or_else(|| ReadError::Malformed("struct without name".into()))?;
                let namei = self.runtime.intern(&name);
                Ok(leak(Node::Struct(StructNode {
                    name,
                    namei,
                    fields: keys.stmts.unwrap_or_default(),
                })))
            }
            "import" => {
                self.module()?;
                let keys = self.read_keys(remaining)?;
                let from = keys
                    .from
                    .ok_or_else(|| ReadError::Malformed("import without from".into()))?;
                let mut imports = Vec::new();
                for node in keys.imports.unwrap_or_default() {
                    match node {
                        Node::Symbol(s) => imports.push((s.name.clone(), s.namei)),
                        _ => {
                            return Err(ReadError::Malformed(
                                "import list must hold symbols".into(),
                            ))
                        }
                    }
                }
                Ok(leak(Node::Import(ImportNode { from, imports })))
            }
            "let" => {
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .name
                    .ok_or_else(|| ReadError::Malformed("let without name".into()))?;
                let expr = keys
                    .expr
                    .ok_or_else(|| ReadError::Malformed("let without expr".into()))?;
                let namei = self.runtime.intern(&name);
                Ok(leak(Node::Let(LetNode { name, namei, expr })))
            }
            "symbol" => {
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .value
                    .ok_or_else(|| ReadError::Malformed("symbol without value".into()))?;
                let namei = self.runtime.intern(&name);
                Ok(leak(Node::Symbol(SymbolNode { name, namei })))
            }
            "global" => {
                let module = self.module()?;
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .value
                    .ok_or_else(|| ReadError::Malformed("global without value".into()))?;
                let namei = self.runtime.intern(&name);
                Ok(leak(Node::Global(GlobalNode {
                    name,
                    namei,
                    module,
                    cell: OnceLock::new(),
                })))
            }
            "local" => {
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .value
                    .ok_or_else(|| ReadError::Malformed("local without value".into()))?;
                let namei = self.runtime.intern(&name);
                let node = leak(Node::Local(LocalNode {
                    name,
                    namei,
                    index: AtomicUsize::new(0),
                }));
                if let Node::Local(local) = node {
                    if let Some(scope) = self.current_locals.last_mut() {
                        scope.push(local);
                    }
                }
                Ok(node)
            }
            "if_else_statement" => {
                let keys = self.read_keys(remaining)?;
                let condition = keys
                    .expr
                    .ok_or_else(|| ReadError::Malformed("if without condition".into()))?;
                Ok(leak(Node::Branch(BranchNode {
                    condition,
                    on_true: self.stmts_as_expr(keys.if_stmts),
                    on_false: self.stmts_as_expr(keys.else_stmts),
                })))
            }
            "return" => {
                let keys = self.read_keys(remaining)?;
                let expr = keys
                    .expr
                    .ok_or_else(|| ReadError::Malformed("return without expr".into()))?;
                Ok(leak(Node::Return(ReturnNode { expr })))
            }
            "recur" => {
                let keys = self.read_keys(remaining)?;
                Ok(leak(Node::Recur(RecurNode {
                    arguments: keys.args.unwrap_or_default(),
                })))
            }
            "call" => {
                let keys = self.read_keys(remaining)?;
                let callable = keys
                    .expr
                    .ok_or_else(|| ReadError::Malformed("call without callable".into()))?;
                Ok(leak(Node::Apply(Apply::new(
                    keys.line.unwrap_or(0) as u32,
                    keys.data.is_none(),
                    Some(callable),
                    keys.args.unwrap_or_default(),
                ))))
            }
            "builtin" => {
                let keys = self.read_keys(remaining)?;
                let name = keys
                    .value
                    .ok_or_else(|| ReadError::Malformed("builtin without value".into()))?;
                match self.runtime.find_builtin(&name) {
                    Some(value) => Ok(leak(Node::Builtin(BuiltinNode { value }))),
                    None => Err(ReadError::Malformed(format!("builtin not found: {name}"))),
                }
            }
            "integer" => {
                let keys = self.read_keys(remaining)?;
                let text = keys
                    .value
                    .ok_or_else(|| ReadError::Malformed("integer without value".into()))?;
                let value: i64 = text
                    .parse()
                    .map_err(|_| ReadError::Malformed(format!("bad integer: {text}")))?;
                Ok(leak(Node::Literal(Literal {
                    value: Slot::Int(value),
                })))
            }
            "string" | "keyword" => {
                let keys = self.read_keys(remaining)?;
                let text = keys
                    .value
                    .ok_or_else(|| ReadError::Malformed("string without value".into()))?;
                let slot = self.runtime.shared_str(&text).map_err(|e| {
                    ReadError::Malformed(format!("string literal: {e}"))
                })?;
                if let Some(module) = self.module {
                    module.roots.lock().push(slot);
                }
                Ok(leak(Node::Literal(Literal { value: slot })))
            }
            "boolean" => {
                let keys = self.read_keys(remaining)?;
                match keys.value.as_deref() {
                    Some("true") => Ok(leak(Node::Literal(Literal {
                        value: Slot::Bool(true),
                    }))),
                    Some("false") => Ok(leak(Node::Literal(Literal {
                        value: Slot::Bool(false),
                    }))),
                    other => Err(ReadError::Malformed(format!(
                        "bad value for bool: {other:?}"
                    ))),
                }
            }
            "vector" => {
                let _ = self.read_keys(remaining)?;
                let slot = self.runtime.empty_vector().map_err(|e| {
                    ReadError::Malformed(format!("vector literal: {e}"))
                })?;
                if let Some(module) = self.module {
                    module.roots.lock().push(slot);
                }
                Ok(leak(Node::Literal(Literal { value: slot })))
            }
            "dict" => {
                let _ = self.read_keys(remaining)?;
                let slot = self.runtime.empty_map().map_err(|e| {
                    ReadError::Malformed(format!("dict literal: {e}"))
                })?;
                if let Some(module) = self.module {
                    module.roots.lock().push(slot);
                }
                Ok(leak(Node::Literal(Literal { value: slot })))
            }
            "function" => {
                let module = self.module()?;
                self.current_locals.push(Vec::new());
                let keys = self.read_keys(remaining)?;
                let name = keys.name.unwrap_or_else(|| "<unknown>".to_string());
                let line = keys.line.unwrap_or(0) as u32;
                let function = FunctionNode::new(
                    line,
                    name,
                    module,
                    Self::symbols_to_nameis(keys.parms)?,
                    Self::symbols_to_nameis(keys.locals)?,
                    Self::symbols_to_nameis(keys.freevars)?,
                    self.stmts_as_expr(keys.stmts),
                );
                // bind the locals read inside this function to their frame
                // offsets
                let scope = self.current_locals.pop().expect("function scope");
                for local in scope {
                    match function.local_index(local.namei) {
                        Some(index) => local.index.store(index, Ordering::Relaxed),
                        None => {
                            return Err(ReadError::Malformed(format!(
                                "could not resolve local index for: {}",
                                local.name
                            )))
                        }
                    }
                }
                Ok(leak(Node::Function(function)))
            }
            other => Err(ReadError::Malformed(format!("unknown node type: {other}"))),
        }
    }
}
