//! Runtime and compile-time context types: the error taxonomy, the variable
//! slot table, the function registry, and the rewrite-diagnostics listener.

use crate::collation::CollationRegistry;
use crate::expr::Flag;
use crate::var::{Var, VarId};
use crate::xdm::Sequence;
use compact_str::CompactString;
use core::fmt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Canonicalized set of error codes the pipeline currently emits, following
/// the W3C XQuery naming. Expanded alongside feature coverage; `Unknown`
/// stays as the forward-compatible fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FOAR0001, // divide by zero
    FOAR0002, // numeric overflow
    FOER0000, // generic error (fn:error default)
    FORG0001, // invalid lexical form for a coercion
    FORG0006, // invalid argument type / singleton violated
    FOCH0002, // collation does not exist
    XPTY0004, // type error
    XPST0008, // undeclared variable
    XPST0017, // unknown function / wrong arity
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FOAR0001 => "FOAR0001",
            ErrorCode::FOAR0002 => "FOAR0002",
            ErrorCode::FOER0000 => "FOER0000",
            ErrorCode::FORG0001 => "FORG0001",
            ErrorCode::FORG0006 => "FORG0006",
            ErrorCode::FOCH0002 => "FOCH0002",
            ErrorCode::XPTY0004 => "XPTY0004",
            ErrorCode::XPST0008 => "XPST0008",
            ErrorCode::XPST0017 => "XPST0017",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "err:{}", self.as_str())
    }
}

/// Evaluation error. The first error raised during an advance aborts the
/// whole run; the pipeline never catches or retries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("error: {message} ({code})")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn from_code(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), source: None }
    }

    /// Composes an error with a source cause.
    pub fn with_source(mut self, source: impl Into<Option<Arc<dyn std::error::Error + Send + Sync>>>) -> Self {
        self.source = source.into();
        self
    }
}

pub type Arity = usize;

pub struct CallCtx<'a> {
    pub qc: &'a QueryContext,
}

pub type FunctionImpl = Arc<dyn Fn(&CallCtx, &[Sequence]) -> Result<Sequence, Error> + Send + Sync>;

/// A resolved function: name, arity range, declared effect flags, body.
/// The pipeline treats invocations opaquely except for the flags and the
/// [`inlineable`](FunctionDef::inlineable) query.
pub struct FunctionDef {
    pub name: CompactString,
    pub min_arity: Arity,
    /// `None` marks a variadic function.
    pub max_arity: Option<Arity>,
    flags: u8,
    pub imp: FunctionImpl,
}

impl FunctionDef {
    pub fn uses(&self, flag: Flag) -> bool {
        self.flags & flag.bit() != 0
    }

    /// Whether splicing the body into another expression preserves every
    /// externally observable behavior.
    pub fn inlineable(&self) -> bool {
        !(self.uses(Flag::Ndt) || self.uses(Flag::Cns) || self.uses(Flag::Ctx) || self.uses(Flag::Upd))
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("min_arity", &self.min_arity)
            .field("max_arity", &self.max_arity)
            .finish_non_exhaustive()
    }
}

/// Function-resolution collaborator. Registrations are range-based: a call
/// matches when `min_arity <= argc` and `argc <= max_arity` (variadic
/// functions leave the maximum open).
#[derive(Default)]
pub struct FunctionRegistry {
    fns: HashMap<CompactString, Vec<Rc<FunctionDef>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, min_arity: Arity, max_arity: Option<Arity>, flags: &[Flag], f: F)
    where
        F: 'static + Send + Sync + Fn(&CallCtx, &[Sequence]) -> Result<Sequence, Error>,
    {
        let bits = flags.iter().fold(0u8, |acc, fl| acc | fl.bit());
        let def = Rc::new(FunctionDef {
            name: CompactString::from(name),
            min_arity,
            max_arity,
            flags: bits,
            imp: Arc::new(f),
        });
        self.fns.entry(def.name.clone()).or_default().push(def);
    }

    /// Convenience: exact-arity, effect-free function.
    pub fn register_pure<F>(&mut self, name: &str, arity: Arity, f: F)
    where
        F: 'static + Send + Sync + Fn(&CallCtx, &[Sequence]) -> Result<Sequence, Error>,
    {
        self.register(name, arity, Some(arity), &[], f);
    }

    pub fn resolve(&self, name: &str, argc: Arity) -> Result<Rc<FunctionDef>, Error> {
        let Some(cands) = self.fns.get(name) else {
            return Err(Error::from_code(ErrorCode::XPST0017, format!("unknown function: {name}()")));
        };
        cands
            .iter()
            .find(|d| argc >= d.min_arity && d.max_arity.is_none_or(|m| argc <= m))
            .cloned()
            .ok_or_else(|| {
                Error::from_code(ErrorCode::XPST0017, format!("{name}() is not defined for {argc} argument(s)"))
            })
    }
}

/// Dynamic evaluation context: the variable slot table plus the function and
/// collation collaborators. Cloning is cheap and shares the slots, which is
/// what the evaluator chain relies on — every clause state machine writes
/// into the same table.
#[derive(Clone)]
pub struct QueryContext {
    slots: Rc<RefCell<Vec<Option<Sequence>>>>,
    pub functions: Rc<FunctionRegistry>,
    pub collations: Rc<CollationRegistry>,
    pub default_collation: Option<String>,
}

impl QueryContext {
    pub fn new() -> Self {
        QueryContextBuilder::new().build()
    }

    /// Binds a variable's slot, enforcing the declared type when the
    /// variable asks for it.
    pub fn bind(&self, var: &Var, value: Sequence) -> Result<(), Error> {
        if var.check_type && !var.declared.matches(&value) {
            return Err(Error::from_code(
                ErrorCode::XPTY0004,
                format!("treat as {} failed for {}", var.declared, var),
            ));
        }
        self.bind_unchecked(var.id, value);
        Ok(())
    }

    pub(crate) fn bind_unchecked(&self, id: VarId, value: Sequence) {
        let mut slots = self.slots.borrow_mut();
        let idx = id.0 as usize;
        if idx >= slots.len() {
            slots.resize(idx + 1, None);
        }
        slots[idx] = Some(value);
    }

    pub fn get(&self, var: &Var) -> Result<Sequence, Error> {
        self.slots
            .borrow()
            .get(var.id.0 as usize)
            .and_then(Clone::clone)
            .ok_or_else(|| Error::from_code(ErrorCode::XPST0008, format!("unbound variable {}", var)))
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct QueryContextBuilder {
    ctx: QueryContext,
}

impl Default for QueryContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: QueryContext {
                slots: Rc::new(RefCell::new(Vec::new())),
                functions: Rc::new(crate::functions::default_function_registry()),
                collations: Rc::new(CollationRegistry::default()),
                default_collation: None,
            },
        }
    }

    /// Pre-binds an externally supplied variable.
    pub fn with_variable(self, var: &Var, value: Sequence) -> Self {
        self.ctx.bind_unchecked(var.id, value);
        self
    }

    pub fn with_functions(mut self, reg: Rc<FunctionRegistry>) -> Self {
        self.ctx.functions = reg;
        self
    }

    pub fn with_collations(mut self, reg: Rc<CollationRegistry>) -> Self {
        self.ctx.collations = reg;
        self
    }

    pub fn with_default_collation(mut self, uri: impl Into<String>) -> Self {
        self.ctx.default_collation = Some(uri.into());
        self
    }

    pub fn build(self) -> QueryContext {
        self.ctx
    }
}

/// Callback receiving (pass name, affected clause rendering) for every
/// applied rewrite. Absence is a no-op; `tracing` events fire regardless.
pub type RewriteListener = Rc<dyn Fn(&str, &str)>;

/// Compile-time context threaded through the optimizer.
#[derive(Default)]
pub struct CompileContext {
    listener: Option<RewriteListener>,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: RewriteListener) -> Self {
        Self { listener: Some(listener) }
    }

    /// Emits one rewrite-trace notification.
    pub(crate) fn note(&self, pass: &'static str, detail: &dyn fmt::Display) {
        let rendered = detail.to_string();
        tracing::debug!(pass, clause = %rendered, "rewrite");
        if let Some(listener) = &self.listener {
            listener(pass, &rendered);
        }
    }
}
