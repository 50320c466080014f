//! CEL probes over `self`.

use std::sync::{Arc, Mutex};

use cel_interpreter::{Context, Program, Value as CelValue};
use cel_parser::{Atom, Expression, UnaryOp};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

use crate::{Outcome, ProbeError, Prober};

static PROGRAMS: Lazy<Mutex<FxHashMap<String, Arc<Program>>>> = Lazy::new(|| Mutex::new(FxHashMap::default()));

fn evaluate(program: &Program, obj: &Value) -> Result<CelValue, String> {
    let mut ctx = Context::default();
    ctx.add_variable("self", obj.clone()).map_err(|e| e.to_string())?;
    program.execute(&ctx).map_err(|e| e.to_string())
}

/// Boolean-valued functions and macros.
const BOOL_FUNCTIONS: &[&str] = &["has", "contains", "startsWith", "endsWith", "matches", "exists", "all", "exists_one"];

/// True when `expr` yields a bool whatever `self` holds. Field access on
/// `self` is untyped, so a bare `self.spec.ready` has to be compared.
fn yields_bool(expr: &Expression) -> bool {
    match expr {
        Expression::Relation(..) | Expression::And(..) | Expression::Or(..) => true,
        Expression::Unary(op, _) => matches!(op, UnaryOp::Not | UnaryOp::DoubleNot),
        Expression::Ternary(_, then, otherwise) => yields_bool(then) && yields_bool(otherwise),
        Expression::Atom(atom) => matches!(atom, Atom::Bool(_)),
        Expression::FunctionCall(name, _, _) => {
            matches!(name.as_ref(), Expression::Ident(name) if BOOL_FUNCTIONS.contains(&name.as_str()))
        }
        _ => false,
    }
}

/// Compiles once per distinct rule. Rules whose result is not a bool are
/// rejected here instead of failing on every probe.
fn compile(rule: &str) -> Result<Arc<Program>, ProbeError> {
    let mut cache = PROGRAMS.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(p) = cache.get(rule) {
        return Ok(Arc::clone(p));
    }
    let invalid = |reason: String| ProbeError::Cel { rule: rule.to_string(), reason };
    let expr = cel_parser::parse(rule).map_err(|e| invalid(e.to_string()))?;
    if !yields_bool(&expr) {
        return Err(invalid("rule must evaluate to a bool".into()));
    }
    let program = Program::compile(rule).map_err(|e| invalid(e.to_string()))?;
    debug!(rule, "cel program compiled");
    let program = Arc::new(program);
    cache.insert(rule.to_string(), Arc::clone(&program));
    Ok(program)
}

#[derive(Clone)]
pub struct CelProbe {
    pub rule: String,
    pub message: String,
    program: Arc<Program>,
}

impl std::fmt::Debug for CelProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelProbe").field("rule", &self.rule).field("message", &self.message).finish()
    }
}

impl CelProbe {
    pub fn new(rule: &str, message: &str) -> Result<Self, ProbeError> {
        Ok(Self { rule: rule.to_string(), message: message.to_string(), program: compile(rule)? })
    }
}

impl Prober for CelProbe {
    fn probe(&self, obj: &Value) -> Outcome {
        match evaluate(&self.program, obj) {
            Ok(CelValue::Bool(true)) => Outcome::ok(),
            Ok(CelValue::Bool(false)) => Outcome::fail(self.message.clone()),
            Ok(_) => Outcome::fail(format!("{}: rule did not evaluate to a bool", self.message)),
            Err(e) => Outcome::fail(format!("{}: {}", self.message, e)),
        }
    }
}
