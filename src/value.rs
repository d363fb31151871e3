// Val: the FEEL runtime value universe.
// Every evaluation produces exactly one of these variants; there is no
// "undefined". Errors are values too and flow through the evaluator.

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat};
use rust_decimal::Decimal;

use crate::ast::Expression;
use crate::datetime::{format_day_time, YearMonthDuration, ZonedTime};
use crate::evaluator::Context;

/// A FEEL runtime value.
///
/// The twelve data kinds of the language plus `Function` and `Error`.
/// Numbers are decimals, not binary floats; the two time-of-day kinds and
/// the two duration kinds are distinct and never compare to each other.
#[derive(Clone, Debug)]
pub enum Val {
    Number(Decimal),
    Boolean(bool),
    String(String),
    Date(NaiveDate),
    LocalTime(NaiveTime),
    Time(ZonedTime),
    LocalDateTime(NaiveDateTime),
    DateTime(DateTime<FixedOffset>),
    YearMonthDuration(YearMonthDuration),
    DayTimeDuration(Duration),
    Null,
    List(Vec<Val>),
    Context(Context),
    Function(Rc<Function>),
    Error(String),
}

/// An invocable FEEL function: parameter names, the variadic and
/// implicit-input flags, and a body.
pub struct Function {
    pub params: Vec<String>,
    pub variadic: bool,
    pub requires_input: bool,
    pub body: FunctionBody,
}

/// The three ways a function body can be realized.
pub enum FunctionBody {
    /// A user-defined expression, closed over its defining context.
    Expression { body: Expression, closure: Context },
    /// A built-in implemented natively.
    Native(NativeFn),
    /// A marker delegating to the host-function bridge.
    Host {
        class: String,
        method: String,
        arg_types: Vec<String>,
    },
}

pub type NativeFn = Rc<dyn Fn(&[Val]) -> Val>;

impl Function {
    /// A user-defined function closing over `closure`.
    pub fn expression(params: Vec<String>, body: Expression, closure: Context) -> Self {
        Function {
            params,
            variadic: false,
            requires_input: false,
            body: FunctionBody::Expression { body, closure },
        }
    }

    /// A native built-in.
    pub fn native(
        params: &[&str],
        variadic: bool,
        requires_input: bool,
        f: impl Fn(&[Val]) -> Val + 'static,
    ) -> Self {
        Function {
            params: params.iter().map(|p| p.to_string()).collect(),
            variadic,
            requires_input,
            body: FunctionBody::Native(Rc::new(f)),
        }
    }

    /// A host-bridged function.
    pub fn host(params: Vec<String>, class: String, method: String, arg_types: Vec<String>) -> Self {
        Function {
            params,
            variadic: false,
            requires_input: false,
            body: FunctionBody::Host {
                class,
                method,
                arg_types,
            },
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("params", &self.params)
            .field("variadic", &self.variadic)
            .field("requires_input", &self.requires_input)
            .field("body", &self.body)
            .finish()
    }
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Expression { body, .. } => {
                f.debug_struct("Expression").field("body", body).finish()
            }
            FunctionBody::Native(_) => write!(f, "Native"),
            FunctionBody::Host { class, method, .. } => f
                .debug_struct("Host")
                .field("class", class)
                .field("method", method)
                .finish(),
        }
    }
}

// ── Type checks ──────────────────────────────────────────────────────────────

impl Val {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Val::Null)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Val::Error(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Val::Number(_))
    }

    #[inline]
    pub fn is_boolean(&self) -> bool {
        matches!(self, Val::Boolean(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, Val::String(_))
    }

    #[inline]
    pub fn is_list(&self) -> bool {
        matches!(self, Val::List(_))
    }

    #[inline]
    pub fn is_context(&self) -> bool {
        matches!(self, Val::Context(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, Val::Function(_))
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

impl Val {
    #[inline]
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Val::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Val::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Val::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_list(&self) -> Option<&[Val]> {
        match self {
            Val::List(items) => Some(items),
            _ => None,
        }
    }

    #[inline]
    pub fn as_context(&self) -> Option<&Context> {
        match self {
            Val::Context(ctx) => Some(ctx),
            _ => None,
        }
    }

    #[inline]
    pub fn as_function(&self) -> Option<&Rc<Function>> {
        match self {
            Val::Function(f) => Some(f),
            _ => None,
        }
    }
}

// ── Type names & comparability ───────────────────────────────────────────────

impl Val {
    /// Canonical type name, as tested by `instance of`.
    ///
    /// Both time-of-day kinds answer `time` and both date-time kinds answer
    /// `date time` (with the space).
    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Number(_) => "number",
            Val::Boolean(_) => "boolean",
            Val::String(_) => "string",
            Val::Date(_) => "date",
            Val::LocalTime(_) | Val::Time(_) => "time",
            Val::LocalDateTime(_) | Val::DateTime(_) => "date time",
            Val::YearMonthDuration(_) => "year-month-duration",
            Val::DayTimeDuration(_) => "day-time-duration",
            Val::Null => "null",
            Val::List(_) => "list",
            Val::Context(_) => "context",
            Val::Function(_) => "function",
            Val::Error(_) => "error",
        }
    }

    /// Ordering between two values of the same ordered kind.
    ///
    /// `None` means the pair is not ordered: mismatched kinds, or kinds that
    /// only support equality (booleans, strings, lists, contexts).
    pub fn compare_ordered(&self, other: &Val) -> Option<Ordering> {
        match (self, other) {
            (Val::Number(a), Val::Number(b)) => Some(a.cmp(b)),
            (Val::Date(a), Val::Date(b)) => Some(a.cmp(b)),
            (Val::LocalTime(a), Val::LocalTime(b)) => Some(a.cmp(b)),
            (Val::Time(a), Val::Time(b)) => Some(a.cmp(b)),
            (Val::LocalDateTime(a), Val::LocalDateTime(b)) => Some(a.cmp(b)),
            (Val::DateTime(a), Val::DateTime(b)) => Some(a.cmp(b)),
            (Val::YearMonthDuration(a), Val::YearMonthDuration(b)) => Some(a.cmp(b)),
            (Val::DayTimeDuration(a), Val::DayTimeDuration(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// FEEL value equality across matching kinds.
    ///
    /// `None` means the pair is not comparable (mismatched kinds, or a
    /// function/error operand); the caller decides how to surface that.
    /// `null` equals only `null`.
    pub fn feel_equal(&self, other: &Val) -> Option<bool> {
        match (self, other) {
            (Val::Null, Val::Null) => Some(true),
            (Val::Null, _) | (_, Val::Null) => Some(false),
            (Val::Number(a), Val::Number(b)) => Some(a == b),
            (Val::Boolean(a), Val::Boolean(b)) => Some(a == b),
            (Val::String(a), Val::String(b)) => Some(a == b),
            (Val::Date(a), Val::Date(b)) => Some(a == b),
            (Val::LocalTime(a), Val::LocalTime(b)) => Some(a == b),
            (Val::Time(a), Val::Time(b)) => Some(a == b),
            (Val::LocalDateTime(a), Val::LocalDateTime(b)) => Some(a == b),
            (Val::DateTime(a), Val::DateTime(b)) => Some(a == b),
            (Val::YearMonthDuration(a), Val::YearMonthDuration(b)) => Some(a == b),
            (Val::DayTimeDuration(a), Val::DayTimeDuration(b)) => Some(a == b),
            (Val::List(a), Val::List(b)) => {
                if a.len() != b.len() {
                    return Some(false);
                }
                for (x, y) in a.iter().zip(b) {
                    match x.feel_equal(y)? {
                        true => {}
                        false => return Some(false),
                    }
                }
                Some(true)
            }
            (Val::Context(a), Val::Context(b)) => {
                let (va, vb) = (a.flat_variables(), b.flat_variables());
                if va.len() != vb.len() {
                    return Some(false);
                }
                for (key, x) in &va {
                    match vb.get(key) {
                        Some(y) => match x.feel_equal(y)? {
                            true => {}
                            false => return Some(false),
                        },
                        None => return Some(false),
                    }
                }
                Some(true)
            }
            _ => None,
        }
    }
}

// ── PartialEq ────────────────────────────────────────────────────────────────

/// Structural equality, used by tests and assertions. FEEL-level equality
/// (which surfaces errors instead of comparing them) is [`Val::feel_equal`].
impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Number(a), Val::Number(b)) => a == b,
            (Val::Boolean(a), Val::Boolean(b)) => a == b,
            (Val::String(a), Val::String(b)) => a == b,
            (Val::Date(a), Val::Date(b)) => a == b,
            (Val::LocalTime(a), Val::LocalTime(b)) => a == b,
            (Val::Time(a), Val::Time(b)) => a == b,
            (Val::LocalDateTime(a), Val::LocalDateTime(b)) => a == b,
            (Val::DateTime(a), Val::DateTime(b)) => a == b,
            (Val::YearMonthDuration(a), Val::YearMonthDuration(b)) => a == b,
            (Val::DayTimeDuration(a), Val::DayTimeDuration(b)) => a == b,
            (Val::Null, Val::Null) => true,
            (Val::List(a), Val::List(b)) => a == b,
            (Val::Context(a), Val::Context(b)) => a == b,
            (Val::Function(a), Val::Function(b)) => Rc::ptr_eq(a, b),
            (Val::Error(a), Val::Error(b)) => a == b,
            _ => false,
        }
    }
}

// ── From impls ───────────────────────────────────────────────────────────────

impl From<bool> for Val {
    #[inline]
    fn from(b: bool) -> Self {
        Val::Boolean(b)
    }
}

impl From<Decimal> for Val {
    #[inline]
    fn from(n: Decimal) -> Self {
        Val::Number(n)
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(n: i64) -> Self {
        Val::Number(Decimal::from(n))
    }
}

impl From<&str> for Val {
    #[inline]
    fn from(s: &str) -> Self {
        Val::String(s.to_string())
    }
}

impl From<String> for Val {
    #[inline]
    fn from(s: String) -> Self {
        Val::String(s)
    }
}

impl From<Vec<Val>> for Val {
    #[inline]
    fn from(items: Vec<Val>) -> Self {
        Val::List(items)
    }
}

// ── Display ──────────────────────────────────────────────────────────────────

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Number(n) => write!(f, "{}", n.normalize()),
            Val::Boolean(b) => write!(f, "{}", b),
            Val::String(s) => write!(f, "{}", s),
            Val::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Val::LocalTime(t) => write!(f, "{}", t),
            Val::Time(t) => write!(f, "{}", t),
            Val::LocalDateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Val::DateTime(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Val::YearMonthDuration(d) => write!(f, "{}", d),
            Val::DayTimeDuration(d) => write!(f, "{}", format_day_time(d)),
            Val::Null => write!(f, "null"),
            Val::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Val::Context(ctx) => {
                write!(f, "{{")?;
                for (i, (key, value)) in ctx.flat_variables().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}:{}", key, value)?;
                }
                write!(f, "}}")
            }
            Val::Function(fun) => write!(f, "function({})", fun.params.join(", ")),
            Val::Error(message) => write!(f, "error(\"{}\")", message),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: i64) -> Val {
        Val::from(n)
    }

    #[test]
    fn test_type_names() {
        assert_eq!(num(1).type_name(), "number");
        assert_eq!(Val::Boolean(true).type_name(), "boolean");
        assert_eq!(Val::from("x").type_name(), "string");
        assert_eq!(Val::Null.type_name(), "null");
        assert_eq!(Val::List(vec![]).type_name(), "list");
        assert_eq!(
            Val::LocalTime(crate::datetime::parse_local_time("10:00:00").unwrap()).type_name(),
            "time"
        );
        assert_eq!(
            Val::LocalDateTime(
                crate::datetime::parse_local_date_time("2020-01-01T10:00:00").unwrap()
            )
            .type_name(),
            "date time"
        );
        assert_eq!(
            Val::YearMonthDuration(YearMonthDuration::of(1, 0)).type_name(),
            "year-month-duration"
        );
        assert_eq!(
            Val::DayTimeDuration(Duration::hours(1)).type_name(),
            "day-time-duration"
        );
    }

    #[test]
    fn test_feel_equality() {
        assert_eq!(num(2).feel_equal(&num(2)), Some(true));
        assert_eq!(num(2).feel_equal(&num(3)), Some(false));
        assert_eq!(Val::Null.feel_equal(&Val::Null), Some(true));
        assert_eq!(Val::Null.feel_equal(&num(2)), Some(false));
        assert_eq!(num(2).feel_equal(&Val::from("2")), None);

        let a = Val::List(vec![num(1), num(2)]);
        let b = Val::List(vec![num(1), num(2)]);
        let c = Val::List(vec![num(1), num(3)]);
        assert_eq!(a.feel_equal(&b), Some(true));
        assert_eq!(a.feel_equal(&c), Some(false));
    }

    #[test]
    fn test_number_equality_ignores_scale() {
        let a = Val::Number("2.0".parse().unwrap());
        let b = Val::Number("2.00".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a.feel_equal(&b), Some(true));
    }

    #[test]
    fn test_ordered_comparability() {
        assert_eq!(
            num(1).compare_ordered(&num(2)),
            Some(std::cmp::Ordering::Less)
        );
        // Strings are equality-only
        assert_eq!(Val::from("a").compare_ordered(&Val::from("b")), None);
        // Mismatched kinds are not ordered
        assert_eq!(num(1).compare_ordered(&Val::from("a")), None);
        // The two duration kinds never compare to each other
        assert_eq!(
            Val::YearMonthDuration(YearMonthDuration::of(0, 1))
                .compare_ordered(&Val::DayTimeDuration(Duration::days(30))),
            None
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Val::Number("2.50".parse().unwrap()).to_string(), "2.5");
        assert_eq!(Val::Null.to_string(), "null");
        assert_eq!(Val::List(vec![num(1), num(2)]).to_string(), "[1, 2]");
        assert_eq!(
            Val::YearMonthDuration(YearMonthDuration::of(1, 2)).to_string(),
            "P1Y2M"
        );
        assert_eq!(
            Val::DayTimeDuration(Duration::hours(26)).to_string(),
            "P1DT2H"
        );
    }

    #[test]
    fn test_function_equality_is_identity() {
        let f = Rc::new(Function::native(&["x"], false, false, |_| Val::Null));
        let g = Rc::new(Function::native(&["x"], false, false, |_| Val::Null));
        assert_eq!(Val::Function(f.clone()), Val::Function(f.clone()));
        assert_ne!(Val::Function(f), Val::Function(g));
    }
}
