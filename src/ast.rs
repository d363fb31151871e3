// Expression tree definitions.
// The parser producing these trees is an external collaborator; the
// evaluator consumes them read-only. Trees also round-trip through serde so
// callers can ship them as JSON.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::datetime::{YearMonthDuration, ZonedTime};

/// A parsed FEEL expression.
///
/// One literal per value kind, the unary-test operators used in decision
/// table cells, the arithmetic/comparison/logic operators, iteration and
/// filtering, and the three invocation forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    // Literals
    ConstNull,
    ConstBool(bool),
    ConstNumber(Decimal),
    ConstString(String),
    ConstDate(NaiveDate),
    ConstLocalTime(NaiveTime),
    ConstTime(ZonedTime),
    ConstLocalDateTime(NaiveDateTime),
    ConstDateTime(DateTime<FixedOffset>),
    ConstYearMonthDuration(YearMonthDuration),
    ConstDayTimeDuration(#[serde(with = "crate::datetime::day_time_serde")] Duration),
    ConstList(Vec<Expression>),
    ConstContext(Vec<(String, Expression)>),

    // Unary tests against the implicit input
    InputEqualTo(Box<Expression>),
    InputLessThan(Box<Expression>),
    InputLessOrEqual(Box<Expression>),
    InputGreaterThan(Box<Expression>),
    InputGreaterOrEqual(Box<Expression>),
    Interval {
        start: RangeBoundary,
        end: RangeBoundary,
    },

    // Arithmetic
    Addition(Box<Expression>, Box<Expression>),
    Subtraction(Box<Expression>, Box<Expression>),
    Multiplication(Box<Expression>, Box<Expression>),
    Division(Box<Expression>, Box<Expression>),
    Exponentiation(Box<Expression>, Box<Expression>),
    ArithmeticNegation(Box<Expression>),

    // Comparison ('!=' is parsed as Not(Equal(..)) upstream)
    Equal(Box<Expression>, Box<Expression>),
    LessThan(Box<Expression>, Box<Expression>),
    LessOrEqual(Box<Expression>, Box<Expression>),
    GreaterThan(Box<Expression>, Box<Expression>),
    GreaterOrEqual(Box<Expression>, Box<Expression>),

    // Logic
    AtLeastOne(Vec<Expression>),
    Not(Box<Expression>),
    Disjunction(Box<Expression>, Box<Expression>),
    Conjunction(Box<Expression>, Box<Expression>),

    // Control
    If {
        condition: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    In(Box<Expression>, Box<Expression>),
    InstanceOf(Box<Expression>, String),

    // Naming
    Ref(Vec<String>),
    Path(Box<Expression>, String),

    // Iteration
    SomeItem {
        iterators: Vec<(String, Expression)>,
        condition: Box<Expression>,
    },
    EveryItem {
        iterators: Vec<(String, Expression)>,
        condition: Box<Expression>,
    },
    For {
        iterators: Vec<(String, Expression)>,
        result: Box<Expression>,
    },
    Filter(Box<Expression>, Box<Expression>),

    // Functions
    FunctionDefinition {
        params: Vec<String>,
        body: Box<Expression>,
    },
    FunctionInvocation {
        name: String,
        params: FunctionParameters,
    },
    QualifiedFunctionInvocation {
        path: Box<Expression>,
        name: String,
        params: FunctionParameters,
    },
    /// Marker used as a function body to delegate to the host bridge.
    HostFunction {
        class: String,
        method: String,
        arg_types: Vec<String>,
    },
}

/// One endpoint of an interval test, open (`(`/`)`) or closed (`[`/`]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RangeBoundary {
    Open(Box<Expression>),
    Closed(Box<Expression>),
}

impl RangeBoundary {
    pub fn expression(&self) -> &Expression {
        match self {
            RangeBoundary::Open(e) | RangeBoundary::Closed(e) => e,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RangeBoundary::Closed(_))
    }
}

/// Arguments of an invocation, positional or named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionParameters {
    Positional(Vec<Expression>),
    Named(Vec<(String, Expression)>),
}

impl Expression {
    /// Create a number literal from an integer
    pub fn num(n: i64) -> Self {
        Expression::ConstNumber(Decimal::from(n))
    }

    /// Create a string literal node
    pub fn string(s: impl Into<String>) -> Self {
        Expression::ConstString(s.into())
    }

    /// Create a boolean literal node
    pub fn boolean(b: bool) -> Self {
        Expression::ConstBool(b)
    }

    /// Create a null literal node
    pub fn null() -> Self {
        Expression::ConstNull
    }

    /// Create a single-name reference
    pub fn var(name: impl Into<String>) -> Self {
        Expression::Ref(vec![name.into()])
    }

    /// Create a positional invocation node
    pub fn invoke(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Expression::FunctionInvocation {
            name: name.into(),
            params: FunctionParameters::Positional(args),
        }
    }
}
