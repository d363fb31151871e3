// Expression evaluator.
// A total function from (Expression, Context) to Val: failures surface as
// Val::Error or Val::Null plus a warning record, never as Err or a panic.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};

use crate::ast::{Expression, FunctionParameters};
use crate::datetime::{shift_months_local, shift_months_zoned, YearMonthDuration};
use crate::host::{HostBridge, JsonValueMapper, StaticHostBridge, ValueMapper};
use crate::value::{Function, FunctionBody, Val};

/// Context entry that overrides the implicit-input variable name.
pub const INPUT_VARIABLE_NAME: &str = "inputVariableName";

/// Default name of the implicit input consumed by unary tests.
pub const DEFAULT_INPUT_VARIABLE: &str = "cellInput";

// ── Warnings ─────────────────────────────────────────────────────────────────

/// A record describing a suppressed evaluation failure.
///
/// Warnings do not affect the returned value; they exist so decision-table
/// authors can diagnose cells that silently evaluated to null.
#[derive(Clone, Debug, PartialEq)]
pub struct Warning {
    pub kind: String,
    pub message: String,
}

impl Warning {
    pub const INVALID_TYPE: &'static str = "invalid type";
    pub const NON_BOOLEAN_CONDITION: &'static str = "non-boolean condition";
    pub const NON_BOOLEAN_OPERAND: &'static str = "non-boolean operand";

    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Warning {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Side channel receiving warning records during evaluation.
pub trait WarningSink {
    fn emit(&self, warning: Warning);
}

/// Default sink: forwards warnings to the `tracing` subscriber.
pub struct TracingSink;

impl WarningSink for TracingSink {
    fn emit(&self, warning: Warning) {
        tracing::warn!(kind = %warning.kind, "{}", warning.message);
    }
}

/// Sink that retains every record, for tests and for callers surfacing
/// warnings to expression authors.
#[derive(Clone, Default)]
pub struct CollectingSink {
    records: Rc<RefCell<Vec<Warning>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Warning> {
        self.records.borrow().clone()
    }
}

impl WarningSink for CollectingSink {
    fn emit(&self, warning: Warning) {
        self.records.borrow_mut().push(warning);
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// The lexical environment: variables and function overload sets.
///
/// A context is a frame over an optional parent; composition never copies
/// the parent chain. The evaluator derives short-lived child frames for
/// nested scopes (`for`, `some`, `every`, `filter`, `in`, context literals,
/// function bodies) and treats every frame as immutable once evaluation has
/// started. The builder-style `set_variable`/`add_function` mutations are
/// for assembling frames before they are shared.
#[derive(Clone, Debug, Default)]
pub struct Context {
    variables: IndexMap<String, Val>,
    functions: IndexMap<String, Vec<Rc<Function>>>,
    parent: Option<Rc<Context>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root context with the built-in function library installed.
    pub fn with_built_ins() -> Self {
        let mut ctx = Context::new();
        crate::functions::install(&mut ctx);
        ctx
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Val) {
        self.variables.insert(name.into(), value);
    }

    /// Append an overload for `name`, keeping registration order.
    pub fn add_function(&mut self, name: impl Into<String>, function: Rc<Function>) {
        self.functions.entry(name.into()).or_default().push(function);
    }

    /// Resolve a variable, innermost frame first.
    pub fn variable(&self, name: &str) -> Option<&Val> {
        self.variables
            .get(name)
            .or_else(|| self.parent.as_ref().and_then(|p| p.variable(name)))
    }

    /// Overloads for `name` from the innermost frame that defines it.
    pub fn function_overloads(&self, name: &str) -> Vec<Rc<Function>> {
        match self.functions.get(name) {
            Some(overloads) => overloads.clone(),
            None => self
                .parent
                .as_ref()
                .map(|p| p.function_overloads(name))
                .unwrap_or_default(),
        }
    }

    /// A new empty frame on top of this one.
    pub fn derive(&self) -> Context {
        Context {
            variables: IndexMap::new(),
            functions: IndexMap::new(),
            parent: Some(Rc::new(self.clone())),
        }
    }

    /// Right-biased overlay: names resolve in `other` first, then in `self`.
    pub fn overlay(&self, other: &Context) -> Context {
        let mut frame = self.derive();
        for (name, value) in other.flat_variables() {
            frame.set_variable(name, value);
        }
        for (name, overloads) in other.flat_functions() {
            for function in overloads {
                frame.add_function(name.clone(), function);
            }
        }
        frame
    }

    /// All visible variables, with inner frames shadowing outer ones.
    pub fn flat_variables(&self) -> IndexMap<String, Val> {
        let mut map = self
            .parent
            .as_ref()
            .map(|p| p.flat_variables())
            .unwrap_or_default();
        for (name, value) in &self.variables {
            map.insert(name.clone(), value.clone());
        }
        map
    }

    /// All visible overload sets; a frame defining a name shadows the whole
    /// set of any outer frame.
    pub fn flat_functions(&self) -> IndexMap<String, Vec<Rc<Function>>> {
        let mut map = self
            .parent
            .as_ref()
            .map(|p| p.flat_functions())
            .unwrap_or_default();
        for (name, overloads) in &self.functions {
            map.insert(name.clone(), overloads.clone());
        }
        map
    }

    /// Drop the parent chain, keeping only this frame's own entries.
    fn detach(mut self) -> Context {
        self.parent = None;
        self
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        if self.flat_variables() != other.flat_variables() {
            return false;
        }
        let (fa, fb) = (self.flat_functions(), other.flat_functions());
        fa.len() == fb.len()
            && fa.iter().all(|(name, overloads)| {
                fb.get(name).is_some_and(|others| {
                    overloads.len() == others.len()
                        && overloads.iter().zip(others).all(|(f, g)| Rc::ptr_eq(f, g))
                })
            })
    }
}

// ── Evaluator ────────────────────────────────────────────────────────────────

/// Recursive tree-walking evaluator for FEEL expressions.
///
/// Collaborators are injected: the warning sink for suppressed failures, the
/// value mapper and host bridge for host-function bodies. The defaults log
/// through `tracing` and reject every host class.
pub struct Evaluator {
    sink: Rc<dyn WarningSink>,
    mapper: Rc<dyn ValueMapper>,
    host: Rc<dyn HostBridge>,
    recursion_depth: usize,
    max_recursion_depth: usize,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator {
            sink: Rc::new(TracingSink),
            mapper: Rc::new(JsonValueMapper),
            host: Rc::new(StaticHostBridge::new()),
            recursion_depth: 0,
            // Deeply nested ASTs yield an error instead of a stack overflow
            max_recursion_depth: 512,
        }
    }

    pub fn with_warning_sink(mut self, sink: Rc<dyn WarningSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_value_mapper(mut self, mapper: Rc<dyn ValueMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_host_bridge(mut self, host: Rc<dyn HostBridge>) -> Self {
        self.host = host;
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Evaluate an expression in the given context.
    pub fn evaluate(&mut self, exp: &Expression, ctx: &Context) -> Val {
        self.eval(exp, ctx)
    }

    fn eval(&mut self, exp: &Expression, ctx: &Context) -> Val {
        self.recursion_depth += 1;
        if self.recursion_depth > self.max_recursion_depth {
            self.recursion_depth -= 1;
            return Val::Error(format!(
                "maximum recursion depth ({}) exceeded",
                self.max_recursion_depth
            ));
        }

        let result = self.eval_impl(exp, ctx);

        self.recursion_depth -= 1;
        result
    }

    fn eval_impl(&mut self, exp: &Expression, ctx: &Context) -> Val {
        match exp {
            // Literals
            Expression::ConstNull => Val::Null,
            Expression::ConstBool(b) => Val::Boolean(*b),
            Expression::ConstNumber(n) => Val::Number(*n),
            Expression::ConstString(s) => Val::String(s.clone()),
            Expression::ConstDate(d) => Val::Date(*d),
            Expression::ConstLocalTime(t) => Val::LocalTime(*t),
            Expression::ConstTime(t) => Val::Time(*t),
            Expression::ConstLocalDateTime(dt) => Val::LocalDateTime(*dt),
            Expression::ConstDateTime(dt) => Val::DateTime(*dt),
            Expression::ConstYearMonthDuration(d) => Val::YearMonthDuration(*d),
            Expression::ConstDayTimeDuration(d) => Val::DayTimeDuration(*d),

            // Element errors stay in place: some/every/filter inspect items
            // individually.
            Expression::ConstList(items) => {
                Val::List(items.iter().map(|item| self.eval(item, ctx)).collect())
            }

            // Entries fold left to right over a fresh frame composed with the
            // ambient context, so later entries see earlier ones.
            Expression::ConstContext(entries) => {
                let mut acc = ctx.derive();
                for (name, exp) in entries {
                    match self.eval(exp, &acc) {
                        Val::Function(f) => acc.add_function(name.clone(), f),
                        value => acc.set_variable(name.clone(), value),
                    }
                }
                Val::Context(acc.detach())
            }

            // Unary tests
            Expression::InputEqualTo(operand) => {
                let input = self.input_value(ctx);
                let operand = self.eval(operand, ctx);
                self.unary_equals(input, operand)
            }
            Expression::InputLessThan(operand) => {
                let input = self.input_value(ctx);
                let operand = self.eval(operand, ctx);
                Self::unary_compare(input, operand, Ordering::is_lt)
            }
            Expression::InputLessOrEqual(operand) => {
                let input = self.input_value(ctx);
                let operand = self.eval(operand, ctx);
                Self::unary_compare(input, operand, Ordering::is_le)
            }
            Expression::InputGreaterThan(operand) => {
                let input = self.input_value(ctx);
                let operand = self.eval(operand, ctx);
                Self::unary_compare(input, operand, Ordering::is_gt)
            }
            Expression::InputGreaterOrEqual(operand) => {
                let input = self.input_value(ctx);
                let operand = self.eval(operand, ctx);
                Self::unary_compare(input, operand, Ordering::is_ge)
            }
            Expression::Interval { start, end } => {
                let input = self.input_value(ctx);
                if input.is_error() {
                    return input;
                }
                let start_value = self.eval(start.expression(), ctx);
                let end_value = self.eval(end.expression(), ctx);
                let lower = if start.is_closed() {
                    Self::unary_compare(input.clone(), start_value, Ordering::is_ge)
                } else {
                    Self::unary_compare(input.clone(), start_value, Ordering::is_gt)
                };
                let upper = if end.is_closed() {
                    Self::unary_compare(input, end_value, Ordering::is_le)
                } else {
                    Self::unary_compare(input, end_value, Ordering::is_lt)
                };
                match (lower, upper) {
                    (Val::Boolean(a), Val::Boolean(b)) => Val::Boolean(a && b),
                    (e @ Val::Error(_), _) | (_, e @ Val::Error(_)) => e,
                    _ => Val::Null,
                }
            }

            // Arithmetic
            Expression::Addition(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                self.add(l, r)
            }
            Expression::Subtraction(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                self.sub(l, r)
            }
            Expression::Multiplication(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                self.mul(l, r)
            }
            Expression::Division(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                self.div(l, r)
            }
            Expression::Exponentiation(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                self.pow(l, r)
            }
            Expression::ArithmeticNegation(x) => match self.eval(x, ctx) {
                e @ Val::Error(_) => e,
                Val::Number(n) => Val::Number(-n),
                other => self.arithmetic_mismatch("-", &other, None),
            },

            // Comparison
            Expression::Equal(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                Self::equals(l, r)
            }
            Expression::LessThan(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                Self::compare(l, r, Ordering::is_lt)
            }
            Expression::LessOrEqual(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                Self::compare(l, r, Ordering::is_le)
            }
            Expression::GreaterThan(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                Self::compare(l, r, Ordering::is_gt)
            }
            Expression::GreaterOrEqual(a, b) => {
                let l = self.eval(a, ctx);
                let r = self.eval(b, ctx);
                Self::compare(l, r, Ordering::is_ge)
            }

            // Logic
            Expression::AtLeastOne(exps) => self.at_least_one(exps.iter(), ctx),
            Expression::Disjunction(a, b) => {
                self.at_least_one([a.as_ref(), b.as_ref()].into_iter(), ctx)
            }
            Expression::Conjunction(a, b) => self.all_of([a.as_ref(), b.as_ref()].into_iter(), ctx),
            Expression::Not(x) => match self.eval(x, ctx) {
                Val::Boolean(b) => Val::Boolean(!b),
                other => {
                    self.warn(
                        Warning::NON_BOOLEAN_OPERAND,
                        format!("expected boolean but found '{}'", other.type_name()),
                    );
                    Val::Null
                }
            },

            // Control
            Expression::If {
                condition,
                then,
                otherwise,
            } => match self.eval(condition, ctx) {
                Val::Boolean(true) => self.eval(then, ctx),
                Val::Boolean(false) => self.eval(otherwise, ctx),
                other => {
                    self.warn(
                        Warning::NON_BOOLEAN_CONDITION,
                        format!(
                            "expected boolean condition but found '{}'",
                            other.type_name()
                        ),
                    );
                    self.eval(otherwise, ctx)
                }
            },
            Expression::In(probe, test) => {
                let value = self.eval(probe, ctx);
                let key = Self::input_key(ctx);
                let mut frame = ctx.derive();
                frame.set_variable(key, value);
                self.eval(test, &frame)
            }
            Expression::InstanceOf(x, type_name) => match self.eval(x, ctx) {
                e @ Val::Error(_) => e,
                value => Val::Boolean(value.type_name() == type_name),
            },

            // Naming
            Expression::Ref(names) => {
                let Some(first) = names.first() else {
                    return Val::Error("empty reference".to_string());
                };
                let mut value = match ctx.variable(first) {
                    Some(v) => v.clone(),
                    None => return Val::Error(format!("no variable found for name '{first}'")),
                };
                for name in &names[1..] {
                    value = self.path_access(value, name);
                }
                value
            }
            Expression::Path(exp, key) => {
                let value = self.eval(exp, ctx);
                self.path_access(value, key)
            }

            // Iteration
            Expression::SomeItem {
                iterators,
                condition,
            } => self.eval_quantified(iterators, condition, ctx, false),
            Expression::EveryItem {
                iterators,
                condition,
            } => self.eval_quantified(iterators, condition, ctx, true),
            Expression::For { iterators, result } => {
                let lists = match self.eval_iterators(iterators, ctx) {
                    Ok(lists) => lists,
                    Err(e) => return e,
                };
                let total = Self::combination_count(&lists);
                let mut results = Vec::with_capacity(total);
                for index in 0..total {
                    let frame = Self::combination_frame(&lists, index, ctx);
                    results.push(self.eval(result, &frame));
                }
                Val::List(results)
            }
            Expression::Filter(list, predicate) => match self.eval(list, ctx) {
                e @ Val::Error(_) => e,
                Val::List(items) => {
                    let mut kept = Vec::new();
                    for item in items {
                        let mut frame = match &item {
                            Val::Context(entries) => ctx.overlay(entries),
                            _ => ctx.derive(),
                        };
                        frame.set_variable("item", item.clone());
                        if matches!(self.eval(predicate, &frame), Val::Boolean(true)) {
                            kept.push(item);
                        }
                    }
                    Val::List(kept)
                }
                other => Val::Error(format!("expected list but found '{}'", other.type_name())),
            },

            // Functions
            Expression::FunctionDefinition { params, body } => Val::Function(Rc::new(
                Function::expression(params.clone(), (**body).clone(), ctx.clone()),
            )),
            Expression::FunctionInvocation { name, params } => {
                let overloads = ctx.function_overloads(name);
                self.eval_invocation(&overloads, name, params, ctx)
            }
            Expression::QualifiedFunctionInvocation { path, name, params } => {
                match self.eval(path, ctx) {
                    e @ Val::Error(_) => e,
                    Val::Context(target) => {
                        let overloads = target.function_overloads(name);
                        self.eval_invocation(&overloads, name, params, ctx)
                    }
                    other => {
                        Val::Error(format!("expected context but found '{}'", other.type_name()))
                    }
                }
            }
            Expression::HostFunction { .. } => {
                Val::Error("host function can only be used as a function body".to_string())
            }
        }
    }

    // ── Implicit input ───────────────────────────────────────────────────────

    fn input_key(ctx: &Context) -> String {
        match ctx.variable(INPUT_VARIABLE_NAME) {
            Some(Val::String(name)) => name.clone(),
            _ => DEFAULT_INPUT_VARIABLE.to_string(),
        }
    }

    fn input_value(&self, ctx: &Context) -> Val {
        let key = Self::input_key(ctx);
        ctx.variable(&key)
            .cloned()
            .unwrap_or_else(|| Val::Error(format!("no variable found for name '{key}'")))
    }

    // ── Unary tests ──────────────────────────────────────────────────────────

    /// Input-equality of unary tests. A null input still compares against the
    /// operand (and vice versa); mismatches are described against the input.
    fn unary_equals(&self, input: Val, operand: Val) -> Val {
        if input.is_error() {
            return input;
        }
        if operand.is_error() {
            return operand;
        }
        if input.is_null() || operand.is_null() {
            return Val::Boolean(input.is_null() && operand.is_null());
        }
        if matches!(input, Val::List(_) | Val::Context(_) | Val::Function(_)) {
            return Val::Error(format!(
                "expected scalar input but found '{}'",
                input.type_name()
            ));
        }
        match input.feel_equal(&operand) {
            Some(b) => Val::Boolean(b),
            None => Val::Error(format!(
                "expected '{}' but found '{}'",
                input.type_name(),
                operand.type_name()
            )),
        }
    }

    /// Input-inequality of unary tests; only the ordered kinds participate.
    fn unary_compare(input: Val, operand: Val, test: fn(Ordering) -> bool) -> Val {
        if input.is_error() {
            return input;
        }
        if operand.is_error() {
            return operand;
        }
        match input.compare_ordered(&operand) {
            Some(ord) => Val::Boolean(test(ord)),
            None => Val::Error(format!(
                "expected '{}' but found '{}'",
                input.type_name(),
                operand.type_name()
            )),
        }
    }

    // ── Comparison ───────────────────────────────────────────────────────────

    fn equals(l: Val, r: Val) -> Val {
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match l.feel_equal(&r) {
            Some(b) => Val::Boolean(b),
            None => Val::Error(format!(
                "expected operands of the same type but found '{}' and '{}'",
                l.type_name(),
                r.type_name()
            )),
        }
    }

    fn compare(l: Val, r: Val, test: fn(Ordering) -> bool) -> Val {
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match l.compare_ordered(&r) {
            Some(ord) => Val::Boolean(test(ord)),
            None => Val::Error(format!(
                "expected operands of the same type but found '{}' and '{}'",
                l.type_name(),
                r.type_name()
            )),
        }
    }

    // ── Three-valued logic ───────────────────────────────────────────────────

    // A non-boolean operand does not short-circuit: a later `true` still
    // decides the disjunction, and only an undecided outcome degrades to null.
    fn at_least_one<'a>(
        &mut self,
        exps: impl Iterator<Item = &'a Expression>,
        ctx: &Context,
    ) -> Val {
        let mut contaminated = false;
        for exp in exps {
            match self.eval(exp, ctx) {
                Val::Boolean(true) => return Val::Boolean(true),
                Val::Boolean(false) => {}
                _ => contaminated = true,
            }
        }
        if contaminated {
            Val::Null
        } else {
            Val::Boolean(false)
        }
    }

    fn all_of<'a>(&mut self, exps: impl Iterator<Item = &'a Expression>, ctx: &Context) -> Val {
        let mut contaminated = false;
        for exp in exps {
            match self.eval(exp, ctx) {
                Val::Boolean(false) => return Val::Boolean(false),
                Val::Boolean(true) => {}
                _ => contaminated = true,
            }
        }
        if contaminated {
            Val::Null
        } else {
            Val::Boolean(true)
        }
    }

    // ── Arithmetic ───────────────────────────────────────────────────────────
    //
    // Dispatch is on the left operand's kind, then the right is validated.
    // Combinations outside the table degrade to null with a warning so a
    // single ill-typed cell does not take the whole table down; division by
    // zero is a hard error.

    fn add(&mut self, l: Val, r: Val) -> Val {
        use Val::*;
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match (l, r) {
            (Number(a), Number(b)) => match a.checked_add(b) {
                Some(n) => Number(n),
                None => Error("number overflow".to_string()),
            },
            (String(a), String(b)) => String(a + &b),
            (LocalTime(t), DayTimeDuration(d)) => LocalTime(t.overflowing_add_signed(d).0),
            (Time(t), DayTimeDuration(d)) => Time(t.wrapping_add(d)),
            (LocalDateTime(dt), YearMonthDuration(p)) => {
                LocalDateTime(shift_months_local(dt, p.total_months()))
            }
            (LocalDateTime(dt), DayTimeDuration(d)) => match dt.checked_add_signed(d) {
                Some(x) => LocalDateTime(x),
                None => Error("date-time overflow".to_string()),
            },
            (DateTime(dt), YearMonthDuration(p)) => {
                DateTime(shift_months_zoned(dt, p.total_months()))
            }
            (DateTime(dt), DayTimeDuration(d)) => match dt.checked_add_signed(d) {
                Some(x) => DateTime(x),
                None => Error("date-time overflow".to_string()),
            },
            (YearMonthDuration(a), YearMonthDuration(b)) => YearMonthDuration(a + b),
            (YearMonthDuration(p), LocalDateTime(dt)) => {
                LocalDateTime(shift_months_local(dt, p.total_months()))
            }
            (YearMonthDuration(p), DateTime(dt)) => {
                DateTime(shift_months_zoned(dt, p.total_months()))
            }
            (DayTimeDuration(a), DayTimeDuration(b)) => match a.checked_add(&b) {
                Some(d) => DayTimeDuration(d),
                None => Error("duration overflow".to_string()),
            },
            (DayTimeDuration(d), LocalTime(t)) => LocalTime(t.overflowing_add_signed(d).0),
            (DayTimeDuration(d), Time(t)) => Time(t.wrapping_add(d)),
            (DayTimeDuration(d), LocalDateTime(dt)) => match dt.checked_add_signed(d) {
                Some(x) => LocalDateTime(x),
                None => Error("date-time overflow".to_string()),
            },
            (DayTimeDuration(d), DateTime(dt)) => match dt.checked_add_signed(d) {
                Some(x) => DateTime(x),
                None => Error("date-time overflow".to_string()),
            },
            (l, r) => self.arithmetic_mismatch("+", &l, Some(&r)),
        }
    }

    fn sub(&mut self, l: Val, r: Val) -> Val {
        use Val::*;
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match (l, r) {
            (Number(a), Number(b)) => match a.checked_sub(b) {
                Some(n) => Number(n),
                None => Error("number overflow".to_string()),
            },
            (LocalTime(t), DayTimeDuration(d)) => LocalTime(t.overflowing_sub_signed(d).0),
            (LocalTime(a), LocalTime(b)) => DayTimeDuration(a.signed_duration_since(b)),
            (Time(t), DayTimeDuration(d)) => Time(t.wrapping_add(-d)),
            (Time(a), Time(b)) => DayTimeDuration(a.signed_duration_since(&b)),
            (LocalDateTime(dt), YearMonthDuration(p)) => {
                LocalDateTime(shift_months_local(dt, -p.total_months()))
            }
            (LocalDateTime(dt), DayTimeDuration(d)) => match dt.checked_sub_signed(d) {
                Some(x) => LocalDateTime(x),
                None => Error("date-time overflow".to_string()),
            },
            (LocalDateTime(a), LocalDateTime(b)) => DayTimeDuration(a.signed_duration_since(b)),
            (DateTime(dt), YearMonthDuration(p)) => {
                DateTime(shift_months_zoned(dt, -p.total_months()))
            }
            (DateTime(dt), DayTimeDuration(d)) => match dt.checked_sub_signed(d) {
                Some(x) => DateTime(x),
                None => Error("date-time overflow".to_string()),
            },
            (DateTime(a), DateTime(b)) => DayTimeDuration(a.signed_duration_since(b)),
            (YearMonthDuration(a), YearMonthDuration(b)) => YearMonthDuration(a - b),
            (DayTimeDuration(a), DayTimeDuration(b)) => match a.checked_sub(&b) {
                Some(d) => DayTimeDuration(d),
                None => Error("duration overflow".to_string()),
            },
            (l, r) => self.arithmetic_mismatch("-", &l, Some(&r)),
        }
    }

    fn mul(&mut self, l: Val, r: Val) -> Val {
        use Val::*;
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match (l, r) {
            (Number(a), Number(b)) => match a.checked_mul(b) {
                Some(n) => Number(n),
                None => Error("number overflow".to_string()),
            },
            (YearMonthDuration(p), Number(n)) => Self::scale_year_month(p, n),
            (Number(n), YearMonthDuration(p)) => Self::scale_year_month(p, n),
            (DayTimeDuration(d), Number(n)) => Self::scale_day_time(d, n),
            (Number(n), DayTimeDuration(d)) => Self::scale_day_time(d, n),
            (l, r) => self.arithmetic_mismatch("*", &l, Some(&r)),
        }
    }

    fn div(&mut self, l: Val, r: Val) -> Val {
        use Val::*;
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match (l, r) {
            (Number(_), Number(b)) if b.is_zero() => Error("division by zero".to_string()),
            (Number(a), Number(b)) => match a.checked_div(b) {
                Some(n) => Number(n),
                None => Error("number overflow".to_string()),
            },
            (YearMonthDuration(_), Number(n)) if n.is_zero() => {
                Error("division by zero".to_string())
            }
            // Months are integral: the quotient truncates to whole months
            (YearMonthDuration(p), Number(n)) => {
                match Decimal::from(p.total_months())
                    .checked_div(n)
                    .and_then(|m| m.trunc().to_i64())
                {
                    Some(months) => {
                        YearMonthDuration(crate::datetime::YearMonthDuration::from_months(months))
                    }
                    None => Error("number overflow".to_string()),
                }
            }
            (DayTimeDuration(_), Number(n)) if n.is_zero() => {
                Error("division by zero".to_string())
            }
            // Likewise, day-time quotients truncate to whole milliseconds
            (DayTimeDuration(d), Number(n)) => {
                match Decimal::from(d.num_milliseconds())
                    .checked_div(n)
                    .and_then(|m| m.trunc().to_i64())
                {
                    Some(millis) => DayTimeDuration(chrono::Duration::milliseconds(millis)),
                    None => Error("number overflow".to_string()),
                }
            }
            (l, r) => self.arithmetic_mismatch("/", &l, Some(&r)),
        }
    }

    fn pow(&mut self, l: Val, r: Val) -> Val {
        use Val::*;
        if l.is_error() {
            return l;
        }
        if r.is_error() {
            return r;
        }
        match (l, r) {
            // The exponent is coerced to an integer
            (Number(a), Number(b)) => match b.trunc().to_i64().and_then(|e| a.checked_powi(e)) {
                Some(n) => Number(n),
                None => Error("number overflow".to_string()),
            },
            (l, r) => self.arithmetic_mismatch("**", &l, Some(&r)),
        }
    }

    fn scale_year_month(p: YearMonthDuration, factor: Decimal) -> Val {
        match Decimal::from(p.total_months())
            .checked_mul(factor)
            .and_then(|m| m.trunc().to_i64())
        {
            Some(months) => Val::YearMonthDuration(YearMonthDuration::from_months(months)),
            None => Val::Error("number overflow".to_string()),
        }
    }

    fn scale_day_time(d: chrono::Duration, factor: Decimal) -> Val {
        match Decimal::from(d.num_milliseconds())
            .checked_mul(factor)
            .and_then(|m| m.trunc().to_i64())
        {
            Some(millis) => Val::DayTimeDuration(chrono::Duration::milliseconds(millis)),
            None => Val::Error("number overflow".to_string()),
        }
    }

    fn arithmetic_mismatch(&mut self, op: &str, l: &Val, r: Option<&Val>) -> Val {
        let message = match r {
            Some(r) => format!(
                "can not apply '{op}' to '{}' and '{}'",
                l.type_name(),
                r.type_name()
            ),
            None => format!("can not apply '{op}' to '{}'", l.type_name()),
        };
        self.warn(Warning::INVALID_TYPE, message);
        Val::Null
    }

    fn warn(&self, kind: &str, message: String) {
        self.sink.emit(Warning::new(kind, message));
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    /// Single-name access: context entry lookup, mapped across lists.
    fn path_access(&self, value: Val, key: &str) -> Val {
        match value {
            Val::Context(ctx) => ctx.variable(key).cloned().unwrap_or_else(|| {
                Val::Error(format!("context contains no entry with key '{key}'"))
            }),
            Val::List(items) => Val::List(
                items
                    .into_iter()
                    .map(|item| self.path_access(item, key))
                    .collect(),
            ),
            e @ Val::Error(_) => e,
            other => Val::Error(format!("expected context but found '{}'", other.type_name())),
        }
    }

    // ── Iteration ────────────────────────────────────────────────────────────

    fn eval_iterators(
        &mut self,
        iterators: &[(String, Expression)],
        ctx: &Context,
    ) -> Result<Vec<(String, Vec<Val>)>, Val> {
        let mut lists = Vec::with_capacity(iterators.len());
        for (name, exp) in iterators {
            match self.eval(exp, ctx) {
                Val::List(items) => lists.push((name.clone(), items)),
                e @ Val::Error(_) => return Err(e),
                other => {
                    return Err(Val::Error(format!(
                        "expected list but found '{}'",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(lists)
    }

    fn combination_count(lists: &[(String, Vec<Val>)]) -> usize {
        lists.iter().map(|(_, items)| items.len()).product()
    }

    /// Bindings for the `index`-th combination of the Cartesian product.
    /// The last iterator varies fastest, so `for i in [1,2], j in [3,4]`
    /// enumerates (1,3), (1,4), (2,3), (2,4).
    fn combination_frame(lists: &[(String, Vec<Val>)], index: usize, ctx: &Context) -> Context {
        let mut frame = ctx.derive();
        let mut bindings = vec![Val::Null; lists.len()];
        let mut remainder = index;
        for (slot, (_, items)) in lists.iter().enumerate().rev() {
            bindings[slot] = items[remainder % items.len()].clone();
            remainder /= items.len();
        }
        for ((name, _), value) in lists.iter().zip(bindings) {
            frame.set_variable(name.clone(), value);
        }
        frame
    }

    fn eval_quantified(
        &mut self,
        iterators: &[(String, Expression)],
        condition: &Expression,
        ctx: &Context,
        universal: bool,
    ) -> Val {
        let lists = match self.eval_iterators(iterators, ctx) {
            Ok(lists) => lists,
            Err(e) => return e,
        };
        let mut contaminated = false;
        for index in 0..Self::combination_count(&lists) {
            let frame = Self::combination_frame(&lists, index, ctx);
            match self.eval(condition, &frame) {
                Val::Boolean(b) if b != universal => return Val::Boolean(b),
                Val::Boolean(_) => {}
                _ => contaminated = true,
            }
        }
        if contaminated {
            Val::Null
        } else {
            Val::Boolean(universal)
        }
    }

    // ── Function invocation ──────────────────────────────────────────────────

    fn eval_invocation(
        &mut self,
        overloads: &[Rc<Function>],
        name: &str,
        params: &FunctionParameters,
        ctx: &Context,
    ) -> Val {
        match params {
            FunctionParameters::Positional(args) => {
                let Some(function) = overloads
                    .iter()
                    .find(|f| Self::matches_arity(f, args.len()))
                else {
                    return Val::Error(format!(
                        "no function found with name '{name}' and {} parameters",
                        args.len()
                    ));
                };
                let function = function.clone();

                let mut values = Vec::with_capacity(args.len() + 1);
                if function.requires_input {
                    let input = self.input_value(ctx);
                    if input.is_error() {
                        return input;
                    }
                    values.push(input);
                }
                for arg in args {
                    let value = self.eval(arg, ctx);
                    if value.is_error() {
                        return value;
                    }
                    values.push(value);
                }
                let values = if function.variadic {
                    Self::pack_variadic(&function, values)
                } else {
                    values
                };
                self.invoke(&function, values)
            }
            FunctionParameters::Named(pairs) => {
                // Every supplied name must be a declared parameter; declared
                // parameters that were not supplied bind to null.
                let Some(function) = overloads
                    .iter()
                    .find(|f| pairs.iter().all(|(n, _)| f.params.contains(n)))
                else {
                    let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
                    return Val::Error(format!(
                        "no function found with name '{name}' and parameters '{}'",
                        names.join(", ")
                    ));
                };
                let function = function.clone();

                // Declared parameters with no supplied expression bind to null
                let mut values = Vec::with_capacity(function.params.len());
                for param in &function.params {
                    match pairs.iter().find(|(n, _)| n == param) {
                        Some((_, exp)) => {
                            let value = self.eval(exp, ctx);
                            if value.is_error() {
                                return value;
                            }
                            values.push(value);
                        }
                        None => values.push(Val::Null),
                    }
                }
                self.invoke(&function, values)
            }
        }
    }

    /// Positional arity match. An input-requiring function receives the
    /// implicit input as an extra leading argument; a variadic function
    /// absorbs any surplus into its last parameter.
    fn matches_arity(function: &Function, argc: usize) -> bool {
        let argc = argc + usize::from(function.requires_input);
        if function.variadic {
            argc + 1 >= function.params.len()
        } else {
            argc == function.params.len()
        }
    }

    /// Collect surplus positional arguments into the last (variadic)
    /// parameter. A single list argument for a single-parameter function is
    /// passed through as-is rather than wrapped.
    fn pack_variadic(function: &Function, mut values: Vec<Val>) -> Vec<Val> {
        let fixed = function.params.len() - 1;
        let rest = values.split_off(fixed.min(values.len()));
        let packed = if function.params.len() == 1 && rest.len() == 1 && rest[0].is_list() {
            rest.into_iter().next().unwrap()
        } else {
            Val::List(rest)
        };
        values.push(packed);
        values
    }

    fn invoke(&mut self, function: &Function, values: Vec<Val>) -> Val {
        match &function.body {
            FunctionBody::Native(native) => native(&values),
            FunctionBody::Host {
                class,
                method,
                arg_types,
            } => self.invoke_host(class, method, arg_types, &values),
            FunctionBody::Expression { body, closure } => {
                if let Expression::HostFunction {
                    class,
                    method,
                    arg_types,
                } = body
                {
                    return self.invoke_host(class, method, arg_types, &values);
                }
                let mut frame = closure.derive();
                let mut values = values.into_iter();
                for param in &function.params {
                    frame.set_variable(param.clone(), values.next().unwrap_or(Val::Null));
                }
                self.eval(body, &frame)
            }
        }
    }

    fn invoke_host(&self, class: &str, method: &str, arg_types: &[String], args: &[Val]) -> Val {
        let unpacked: Vec<serde_json::Value> =
            args.iter().map(|v| self.mapper.unpack_val(v)).collect();
        match self.host.invoke(class, method, arg_types, &unpacked) {
            Ok(result) => self.mapper.to_val(&result),
            Err(e) => Val::Error(e.to_string()),
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expression as E, RangeBoundary};

    fn eval(exp: &Expression) -> Val {
        Evaluator::new().evaluate(exp, &Context::new())
    }

    fn eval_in(exp: &Expression, ctx: &Context) -> Val {
        Evaluator::new().evaluate(exp, ctx)
    }

    fn boxed(exp: Expression) -> Box<Expression> {
        Box::new(exp)
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval(&E::num(42)), Val::from(42));
        assert_eq!(eval(&E::string("a")), Val::from("a"));
        assert_eq!(eval(&E::boolean(true)), Val::Boolean(true));
        assert_eq!(eval(&E::null()), Val::Null);
    }

    #[test]
    fn test_list_literal_keeps_element_errors_in_place() {
        let exp = E::ConstList(vec![E::num(1), E::var("missing"), E::num(3)]);
        let Val::List(items) = eval(&exp) else {
            panic!("expected list");
        };
        assert_eq!(items[0], Val::from(1));
        assert!(items[1].is_error());
        assert_eq!(items[2], Val::from(3));
    }

    #[test]
    fn test_context_literal_later_entries_see_earlier_ones() {
        let exp = E::ConstContext(vec![
            ("a".to_string(), E::num(1)),
            (
                "b".to_string(),
                E::Addition(boxed(E::var("a")), boxed(E::num(2))),
            ),
        ]);
        let Val::Context(ctx) = eval(&exp) else {
            panic!("expected context");
        };
        assert_eq!(ctx.variable("a"), Some(&Val::from(1)));
        assert_eq!(ctx.variable("b"), Some(&Val::from(3)));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            eval(&E::Addition(boxed(E::num(1)), boxed(E::num(2)))),
            Val::from(3)
        );
        assert_eq!(
            eval(&E::Subtraction(boxed(E::num(5)), boxed(E::num(3)))),
            Val::from(2)
        );
        assert_eq!(
            eval(&E::Multiplication(boxed(E::num(4)), boxed(E::num(3)))),
            Val::from(12)
        );
        assert_eq!(
            eval(&E::Division(boxed(E::num(10)), boxed(E::num(4)))),
            Val::Number("2.5".parse().unwrap())
        );
        assert_eq!(
            eval(&E::Exponentiation(boxed(E::num(2)), boxed(E::num(10)))),
            Val::from(1024)
        );
        assert_eq!(eval(&E::ArithmeticNegation(boxed(E::num(2)))), Val::from(-2));
    }

    #[test]
    fn test_string_addition_concatenates() {
        assert_eq!(
            eval(&E::Addition(boxed(E::string("foo")), boxed(E::string("bar")))),
            Val::from("foobar")
        );
    }

    #[test]
    fn test_division_by_zero_is_error() {
        assert_eq!(
            eval(&E::Division(boxed(E::num(1)), boxed(E::num(0)))),
            Val::Error("division by zero".to_string())
        );
    }

    #[test]
    fn test_arithmetic_mismatch_yields_null_and_warning() {
        let sink = CollectingSink::new();
        let mut evaluator = Evaluator::new().with_warning_sink(Rc::new(sink.clone()));
        let exp = E::Addition(boxed(E::num(1)), boxed(E::boolean(true)));
        assert_eq!(evaluator.evaluate(&exp, &Context::new()), Val::Null);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, Warning::INVALID_TYPE);
    }

    #[test]
    fn test_exponent_is_coerced_to_integer() {
        let exp = E::Exponentiation(
            boxed(E::num(2)),
            boxed(E::ConstNumber("3.7".parse().unwrap())),
        );
        assert_eq!(eval(&exp), Val::from(8));
    }

    #[test]
    fn test_comparison_mismatch_is_error() {
        let exp = E::LessThan(boxed(E::string("abc")), boxed(E::num(10)));
        assert!(eval(&exp).is_error());

        // Strings are equality-comparable but not ordered
        let exp = E::LessThan(boxed(E::string("a")), boxed(E::string("b")));
        assert!(eval(&exp).is_error());
        let exp = E::Equal(boxed(E::string("a")), boxed(E::string("a")));
        assert_eq!(eval(&exp), Val::Boolean(true));
    }

    #[test]
    fn test_null_equality() {
        assert_eq!(
            eval(&E::Equal(boxed(E::null()), boxed(E::null()))),
            Val::Boolean(true)
        );
        assert_eq!(
            eval(&E::Equal(boxed(E::null()), boxed(E::num(1)))),
            Val::Boolean(false)
        );
    }

    #[test]
    fn test_three_valued_disjunction() {
        let t = E::boolean(true);
        let f = E::boolean(false);
        let n = E::num(7); // non-boolean operand

        let or = |a: &Expression, b: &Expression| {
            eval(&E::Disjunction(boxed(a.clone()), boxed(b.clone())))
        };
        assert_eq!(or(&t, &t), Val::Boolean(true));
        assert_eq!(or(&t, &f), Val::Boolean(true));
        assert_eq!(or(&f, &f), Val::Boolean(false));
        // a later true rescues the disjunction
        assert_eq!(or(&n, &t), Val::Boolean(true));
        assert_eq!(or(&n, &f), Val::Null);
        assert_eq!(or(&f, &n), Val::Null);
    }

    #[test]
    fn test_three_valued_conjunction() {
        let t = E::boolean(true);
        let f = E::boolean(false);
        let n = E::null();

        let and = |a: &Expression, b: &Expression| {
            eval(&E::Conjunction(boxed(a.clone()), boxed(b.clone())))
        };
        assert_eq!(and(&t, &t), Val::Boolean(true));
        assert_eq!(and(&t, &f), Val::Boolean(false));
        // a later false refutes the conjunction
        assert_eq!(and(&n, &f), Val::Boolean(false));
        assert_eq!(and(&n, &t), Val::Null);
        assert_eq!(and(&t, &n), Val::Null);
    }

    #[test]
    fn test_not_combinator() {
        assert_eq!(eval(&E::Not(boxed(E::boolean(true)))), Val::Boolean(false));
        assert_eq!(eval(&E::Not(boxed(E::boolean(false)))), Val::Boolean(true));

        let sink = CollectingSink::new();
        let mut evaluator = Evaluator::new().with_warning_sink(Rc::new(sink.clone()));
        assert_eq!(
            evaluator.evaluate(&E::Not(boxed(E::num(1))), &Context::new()),
            Val::Null
        );
        assert_eq!(sink.records()[0].kind, Warning::NON_BOOLEAN_OPERAND);
    }

    #[test]
    fn test_if_non_boolean_condition_takes_else_with_warning() {
        let sink = CollectingSink::new();
        let mut evaluator = Evaluator::new().with_warning_sink(Rc::new(sink.clone()));
        let exp = E::If {
            condition: boxed(E::num(1)),
            then: boxed(E::string("a")),
            otherwise: boxed(E::string("b")),
        };
        assert_eq!(evaluator.evaluate(&exp, &Context::new()), Val::from("b"));
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].kind, Warning::NON_BOOLEAN_CONDITION);
    }

    #[test]
    fn test_unary_tests_against_input() {
        let mut ctx = Context::new();
        ctx.set_variable(DEFAULT_INPUT_VARIABLE, Val::from(5));

        assert_eq!(
            eval_in(&E::InputLessThan(boxed(E::num(10))), &ctx),
            Val::Boolean(true)
        );
        assert_eq!(
            eval_in(&E::InputGreaterOrEqual(boxed(E::num(5))), &ctx),
            Val::Boolean(true)
        );
        assert_eq!(
            eval_in(&E::InputEqualTo(boxed(E::num(4))), &ctx),
            Val::Boolean(false)
        );
    }

    #[test]
    fn test_unary_test_type_mismatch_is_error() {
        let mut ctx = Context::new();
        ctx.set_variable(DEFAULT_INPUT_VARIABLE, Val::from("abc"));
        assert!(eval_in(&E::InputLessThan(boxed(E::num(10))), &ctx).is_error());
    }

    #[test]
    fn test_unary_equality_with_null_input() {
        let mut ctx = Context::new();
        ctx.set_variable(DEFAULT_INPUT_VARIABLE, Val::Null);
        assert_eq!(
            eval_in(&E::InputEqualTo(boxed(E::null())), &ctx),
            Val::Boolean(true)
        );
        assert_eq!(
            eval_in(&E::InputEqualTo(boxed(E::num(3))), &ctx),
            Val::Boolean(false)
        );
    }

    #[test]
    fn test_interval_boundaries() {
        let mut ctx = Context::new();
        ctx.set_variable(DEFAULT_INPUT_VARIABLE, Val::from(2));

        let closed = E::Interval {
            start: RangeBoundary::Closed(boxed(E::num(2))),
            end: RangeBoundary::Closed(boxed(E::num(4))),
        };
        assert_eq!(eval_in(&closed, &ctx), Val::Boolean(true));

        let open = E::Interval {
            start: RangeBoundary::Open(boxed(E::num(2))),
            end: RangeBoundary::Open(boxed(E::num(4))),
        };
        assert_eq!(eval_in(&open, &ctx), Val::Boolean(false));
    }

    #[test]
    fn test_in_rebinds_the_implicit_input() {
        let exp = E::In(boxed(E::num(5)), boxed(E::InputLessThan(boxed(E::num(10)))));
        assert_eq!(eval(&exp), Val::Boolean(true));
    }

    #[test]
    fn test_input_variable_name_override() {
        let mut ctx = Context::new();
        ctx.set_variable(INPUT_VARIABLE_NAME, Val::from("score"));
        ctx.set_variable("score", Val::from(7));
        assert_eq!(
            eval_in(&E::InputGreaterThan(boxed(E::num(3))), &ctx),
            Val::Boolean(true)
        );
    }

    #[test]
    fn test_instance_of() {
        let exp = E::InstanceOf(boxed(E::num(1)), "number".to_string());
        assert_eq!(eval(&exp), Val::Boolean(true));
        let exp = E::InstanceOf(boxed(E::num(1)), "string".to_string());
        assert_eq!(eval(&exp), Val::Boolean(false));
    }

    #[test]
    fn test_reference_and_path() {
        let mut inner = Context::new();
        inner.set_variable("b", Val::from(42));
        let mut ctx = Context::new();
        ctx.set_variable("a", Val::Context(inner));

        assert_eq!(
            eval_in(&E::Ref(vec!["a".to_string(), "b".to_string()]), &ctx),
            Val::from(42)
        );
        assert!(eval_in(&E::var("missing"), &ctx).is_error());
        assert!(
            eval_in(&E::Ref(vec!["a".to_string(), "missing".to_string()]), &ctx).is_error()
        );
    }

    #[test]
    fn test_path_maps_over_lists() {
        let mut ctx = Context::new();
        let item = |n: i64| {
            let mut c = Context::new();
            c.set_variable("x", Val::from(n));
            Val::Context(c)
        };
        ctx.set_variable("items", Val::List(vec![item(1), item(2)]));

        let exp = E::Path(boxed(E::var("items")), "x".to_string());
        assert_eq!(
            eval_in(&exp, &ctx),
            Val::List(vec![Val::from(1), Val::from(2)])
        );
    }

    #[test]
    fn test_for_cartesian_enumeration_order() {
        let exp = E::For {
            iterators: vec![
                (
                    "i".to_string(),
                    E::ConstList(vec![E::num(1), E::num(2)]),
                ),
                (
                    "j".to_string(),
                    E::ConstList(vec![E::num(3), E::num(4)]),
                ),
            ],
            result: boxed(E::ConstList(vec![E::var("i"), E::var("j")])),
        };
        let expected = Val::List(vec![
            Val::List(vec![Val::from(1), Val::from(3)]),
            Val::List(vec![Val::from(1), Val::from(4)]),
            Val::List(vec![Val::from(2), Val::from(3)]),
            Val::List(vec![Val::from(2), Val::from(4)]),
        ]);
        assert_eq!(eval(&exp), expected);
    }

    #[test]
    fn test_some_and_every() {
        let items = E::ConstList(vec![E::num(1), E::num(2), E::num(3)]);
        let some = E::SomeItem {
            iterators: vec![("x".to_string(), items.clone())],
            condition: boxed(E::GreaterThan(boxed(E::var("x")), boxed(E::num(2)))),
        };
        assert_eq!(eval(&some), Val::Boolean(true));

        let every = E::EveryItem {
            iterators: vec![("x".to_string(), items)],
            condition: boxed(E::GreaterThan(boxed(E::var("x")), boxed(E::num(2)))),
        };
        assert_eq!(eval(&every), Val::Boolean(false));
    }

    #[test]
    fn test_quantifier_over_non_list_is_error() {
        let some = E::SomeItem {
            iterators: vec![("x".to_string(), E::num(1))],
            condition: boxed(E::boolean(true)),
        };
        assert!(eval(&some).is_error());
    }

    #[test]
    fn test_filter_keeps_only_boolean_true() {
        let list = E::ConstList(vec![E::num(1), E::num(2), E::num(3), E::num(4)]);
        let exp = E::Filter(
            boxed(list),
            boxed(E::GreaterThan(boxed(E::var("item")), boxed(E::num(2)))),
        );
        assert_eq!(eval(&exp), Val::List(vec![Val::from(3), Val::from(4)]));
    }

    #[test]
    fn test_filter_overlays_context_items() {
        let item = |n: i64| {
            E::ConstContext(vec![("x".to_string(), E::num(n))])
        };
        let exp = E::Filter(
            boxed(E::ConstList(vec![item(1), item(5)])),
            boxed(E::GreaterThan(boxed(E::var("x")), boxed(E::num(2)))),
        );
        let Val::List(kept) = eval(&exp) else {
            panic!("expected list");
        };
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_function_definition_and_invocation() {
        let mut ctx = Context::new();
        let definition = E::FunctionDefinition {
            params: vec!["x".to_string()],
            body: boxed(E::Addition(boxed(E::var("x")), boxed(E::num(1)))),
        };
        let Val::Function(f) = eval_in(&definition, &ctx) else {
            panic!("expected function");
        };
        ctx.add_function("inc", f);

        let call = E::invoke("inc", vec![E::num(4)]);
        assert_eq!(eval_in(&call, &ctx), Val::from(5));
    }

    #[test]
    fn test_unknown_function_is_error() {
        let call = E::invoke("nope", vec![E::num(1)]);
        assert_eq!(
            eval(&call),
            Val::Error("no function found with name 'nope' and 1 parameters".to_string())
        );
    }

    #[test]
    fn test_named_invocation_defaults_missing_to_null() {
        let mut ctx = Context::new();
        ctx.add_function(
            "second",
            Rc::new(Function::native(&["a", "b"], false, false, |args| {
                args[1].clone()
            })),
        );

        let call = E::FunctionInvocation {
            name: "second".to_string(),
            params: FunctionParameters::Named(vec![
                ("a".to_string(), E::num(1)),
                ("b".to_string(), E::num(2)),
            ]),
        };
        assert_eq!(eval_in(&call, &ctx), Val::from(2));

        // the unsupplied parameter binds to null
        let partial = E::FunctionInvocation {
            name: "second".to_string(),
            params: FunctionParameters::Named(vec![("a".to_string(), E::num(1))]),
        };
        assert_eq!(eval_in(&partial, &ctx), Val::Null);

        // an undeclared name does not resolve
        let unknown = E::FunctionInvocation {
            name: "second".to_string(),
            params: FunctionParameters::Named(vec![("c".to_string(), E::num(1))]),
        };
        assert!(eval_in(&unknown, &ctx).is_error());
    }

    #[test]
    fn test_variadic_packing() {
        let mut ctx = Context::new();
        ctx.add_function(
            "collect",
            Rc::new(Function::native(&["items"], true, false, |args| {
                args[0].clone()
            })),
        );

        // several arguments are packed into a list
        let call = E::invoke("collect", vec![E::num(1), E::num(2)]);
        assert_eq!(
            eval_in(&call, &ctx),
            Val::List(vec![Val::from(1), Val::from(2)])
        );

        // a single list argument passes through as-is
        let call = E::invoke("collect", vec![E::ConstList(vec![E::num(7)])]);
        assert_eq!(eval_in(&call, &ctx), Val::List(vec![Val::from(7)]));

        // zero surplus arguments yield the empty list
        let call = E::invoke("collect", vec![]);
        assert_eq!(eval_in(&call, &ctx), Val::List(vec![]));
    }

    #[test]
    fn test_input_requiring_function_gets_input_prepended() {
        let mut ctx = Context::new();
        ctx.set_variable(DEFAULT_INPUT_VARIABLE, Val::from(10));
        ctx.add_function(
            "input plus",
            Rc::new(Function::native(&["input", "n"], false, true, |args| {
                match (args[0].as_number(), args[1].as_number()) {
                    (Some(a), Some(b)) => Val::Number(a + b),
                    _ => Val::Error("expected numbers".to_string()),
                }
            })),
        );

        let call = E::invoke("input plus", vec![E::num(5)]);
        assert_eq!(eval_in(&call, &ctx), Val::from(15));
    }

    #[test]
    fn test_qualified_invocation() {
        let exp = E::QualifiedFunctionInvocation {
            path: boxed(E::ConstContext(vec![(
                "f".to_string(),
                E::FunctionDefinition {
                    params: vec!["x".to_string()],
                    body: boxed(E::Addition(boxed(E::var("x")), boxed(E::num(1)))),
                },
            )])),
            name: "f".to_string(),
            params: FunctionParameters::Positional(vec![E::num(4)]),
        };
        assert_eq!(eval(&exp), Val::from(5));
    }

    #[test]
    fn test_closure_captures_defining_scope() {
        let mut ctx = Context::new();
        ctx.set_variable("base", Val::from(100));
        let definition = E::FunctionDefinition {
            params: vec!["x".to_string()],
            body: boxed(E::Addition(boxed(E::var("base")), boxed(E::var("x")))),
        };
        let Val::Function(f) = eval_in(&definition, &ctx) else {
            panic!("expected function");
        };

        // invoke from a context that does not know `base`
        let mut other = Context::new();
        other.add_function("f", f);
        let call = E::invoke("f", vec![E::num(1)]);
        assert_eq!(eval_in(&call, &other), Val::from(101));
    }

    #[test]
    fn test_recursion_depth_guard() {
        let mut exp = E::num(1);
        for _ in 0..600 {
            exp = E::ArithmeticNegation(boxed(exp));
        }
        assert!(eval(&exp).is_error());
    }

    #[test]
    fn test_overlay_is_right_biased() {
        let mut a = Context::new();
        a.set_variable("x", Val::from(1));
        a.set_variable("y", Val::from(2));
        let mut b = Context::new();
        b.set_variable("x", Val::from(10));

        let merged = a.overlay(&b);
        assert_eq!(merged.variable("x"), Some(&Val::from(10)));
        assert_eq!(merged.variable("y"), Some(&Val::from(2)));
    }
}
