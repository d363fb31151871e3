// Built-in function library.
// Registered as regular function overloads in a root context via
// `Context::with_built_ins()`; resolution, variadic packing and null
// defaulting are the invoker's job, so these bodies only see their final
// argument vector.

use std::cmp::Ordering;
use std::rc::Rc;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use thiserror::Error;

use crate::datetime::{self, ParsedDuration, ZonedTime};
use crate::evaluator::Context;
use crate::value::{Function, Val};

/// Built-in function errors, surfaced to expressions as error values.
#[derive(Error, Debug)]
pub enum FunctionError {
    #[error("illegal argument: {0}")]
    ArgumentError(String),

    #[error("expected {expected} but found '{found}'")]
    TypeError {
        expected: &'static str,
        found: String,
    },

    #[error("division by zero")]
    DivisionByZero,
}

fn type_error(expected: &'static str, found: &Val) -> FunctionError {
    FunctionError::TypeError {
        expected,
        found: found.type_name().to_string(),
    }
}

fn overflow() -> FunctionError {
    FunctionError::ArgumentError("number overflow".to_string())
}

// ── Argument extraction ──────────────────────────────────────────────────────

fn number(args: &[Val], index: usize) -> Result<Decimal, FunctionError> {
    match &args[index] {
        Val::Number(n) => Ok(*n),
        other => Err(type_error("number", other)),
    }
}

fn integer(args: &[Val], index: usize) -> Result<i64, FunctionError> {
    let n = number(args, index)?;
    n.to_i64()
        .filter(|_| n.is_integer())
        .ok_or_else(|| FunctionError::ArgumentError(format!("expected integer but found '{n}'")))
}

fn text(args: &[Val], index: usize) -> Result<&str, FunctionError> {
    match &args[index] {
        Val::String(s) => Ok(s),
        other => Err(type_error("string", other)),
    }
}

fn items(args: &[Val], index: usize) -> Result<&[Val], FunctionError> {
    match &args[index] {
        Val::List(items) => Ok(items),
        other => Err(type_error("list", other)),
    }
}

// ── Registration ─────────────────────────────────────────────────────────────

fn add(
    ctx: &mut Context,
    name: &str,
    params: &[&str],
    f: impl Fn(&[Val]) -> Result<Val, FunctionError> + 'static,
) {
    ctx.add_function(
        name,
        Rc::new(Function::native(params, false, false, move |args| {
            f(args).unwrap_or_else(|e| Val::Error(e.to_string()))
        })),
    );
}

fn add_variadic(
    ctx: &mut Context,
    name: &str,
    params: &[&str],
    f: impl Fn(&[Val]) -> Result<Val, FunctionError> + 'static,
) {
    ctx.add_function(
        name,
        Rc::new(Function::native(params, true, false, move |args| {
            f(args).unwrap_or_else(|e| Val::Error(e.to_string()))
        })),
    );
}

/// Install the built-in library into a root context.
pub fn install(ctx: &mut Context) {
    conversion::install(ctx);
    boolean::install(ctx);
    numeric::install(ctx);
    string::install(ctx);
    list::install(ctx);
}

// ── Conversion functions ─────────────────────────────────────────────────────

pub mod conversion {
    use super::*;

    pub fn install(ctx: &mut Context) {
        add(ctx, "date", &["from"], |args| match &args[0] {
            Val::String(s) => Ok(datetime::parse_date(s)
                .map(Val::Date)
                .unwrap_or_else(|e| Val::Error(e.to_string()))),
            Val::Date(d) => Ok(Val::Date(*d)),
            Val::LocalDateTime(dt) => Ok(Val::Date(dt.date())),
            Val::DateTime(dt) => Ok(Val::Date(dt.date_naive())),
            other => Err(type_error("string", other)),
        });

        add(ctx, "date", &["year", "month", "day"], |args| {
            let year = integer(args, 0)?;
            let month = integer(args, 1)?;
            let day = integer(args, 2)?;
            i32::try_from(year)
                .ok()
                .zip(u32::try_from(month).ok())
                .zip(u32::try_from(day).ok())
                .and_then(|((y, m), d)| NaiveDate::from_ymd_opt(y, m, d))
                .map(Val::Date)
                .ok_or_else(|| {
                    FunctionError::ArgumentError(format!(
                        "invalid date ({year}, {month}, {day})"
                    ))
                })
        });

        add(ctx, "time", &["from"], |args| match &args[0] {
            Val::String(s) => Ok(parse_time(s)),
            Val::LocalTime(t) => Ok(Val::LocalTime(*t)),
            Val::Time(t) => Ok(Val::Time(*t)),
            Val::LocalDateTime(dt) => Ok(Val::LocalTime(dt.time())),
            Val::DateTime(dt) => Ok(Val::Time(ZonedTime::new(dt.time(), *dt.offset()))),
            other => Err(type_error("string", other)),
        });

        add(ctx, "date and time", &["from"], |args| match &args[0] {
            Val::String(s) => Ok(parse_date_time(s)),
            Val::LocalDateTime(dt) => Ok(Val::LocalDateTime(*dt)),
            Val::DateTime(dt) => Ok(Val::DateTime(*dt)),
            other => Err(type_error("string", other)),
        });

        add(ctx, "date and time", &["date", "time"], |args| {
            match (&args[0], &args[1]) {
                (Val::Date(d), Val::LocalTime(t)) => Ok(Val::LocalDateTime(d.and_time(*t))),
                (Val::Date(d), Val::Time(t)) => d
                    .and_time(t.time())
                    .and_local_timezone(t.offset())
                    .single()
                    .map(Val::DateTime)
                    .ok_or_else(|| {
                        FunctionError::ArgumentError("invalid date and time".to_string())
                    }),
                (other, Val::LocalTime(_) | Val::Time(_)) => Err(type_error("date", other)),
                (_, other) => Err(type_error("time", other)),
            }
        });

        add(ctx, "duration", &["from"], |args| match &args[0] {
            Val::String(s) => Ok(match datetime::parse_duration(s) {
                Ok(ParsedDuration::YearMonth(d)) => Val::YearMonthDuration(d),
                Ok(ParsedDuration::DayTime(d)) => Val::DayTimeDuration(d),
                Err(e) => Val::Error(e.to_string()),
            }),
            Val::YearMonthDuration(d) => Ok(Val::YearMonthDuration(*d)),
            Val::DayTimeDuration(d) => Ok(Val::DayTimeDuration(*d)),
            other => Err(type_error("string", other)),
        });

        add(ctx, "number", &["from"], |args| match &args[0] {
            Val::Number(n) => Ok(Val::Number(*n)),
            Val::String(s) => Ok(s
                .trim()
                .parse::<Decimal>()
                .map(Val::Number)
                .unwrap_or_else(|_| Val::Error(format!("can not parse '{s}' as a number")))),
            other => Err(type_error("string", other)),
        });

        add(ctx, "string", &["from"], |args| match &args[0] {
            Val::Null => Ok(Val::Null),
            value => Ok(Val::String(value.to_string())),
        });
    }

    fn parse_time(s: &str) -> Val {
        if let Ok(zoned) = s.parse::<ZonedTime>() {
            return Val::Time(zoned);
        }
        match datetime::parse_local_time(s) {
            Ok(t) => Val::LocalTime(t),
            Err(e) => Val::Error(e.to_string()),
        }
    }

    fn parse_date_time(s: &str) -> Val {
        match datetime::parse_date_time(s) {
            Ok(dt) => Val::DateTime(dt),
            Err(_) => match datetime::parse_local_date_time(s) {
                Ok(dt) => Val::LocalDateTime(dt),
                Err(e) => Val::Error(e.to_string()),
            },
        }
    }
}

// ── Boolean functions ────────────────────────────────────────────────────────

pub mod boolean {
    use super::*;

    pub fn install(ctx: &mut Context) {
        // three-valued: not(null) is null, as is not(anything non-boolean)
        add(ctx, "not", &["negand"], |args| {
            Ok(match &args[0] {
                Val::Boolean(b) => Val::Boolean(!b),
                _ => Val::Null,
            })
        });
    }
}

// ── Numeric functions ────────────────────────────────────────────────────────

pub mod numeric {
    use super::*;

    pub fn install(ctx: &mut Context) {
        add(ctx, "decimal", &["n", "scale"], |args| {
            round(args, RoundingStrategy::MidpointNearestEven)
        });

        // Away from zero at the given scale, per the DMN rounding modes
        add(ctx, "round up", &["n", "scale"], |args| {
            round(args, RoundingStrategy::AwayFromZero)
        });

        add(ctx, "round down", &["n", "scale"], |args| {
            round(args, RoundingStrategy::ToZero)
        });

        add(ctx, "floor", &["n"], |args| {
            Ok(Val::Number(number(args, 0)?.floor()))
        });

        add(ctx, "ceiling", &["n"], |args| {
            Ok(Val::Number(number(args, 0)?.ceil()))
        });

        add(ctx, "abs", &["n"], |args| {
            Ok(Val::Number(number(args, 0)?.abs()))
        });

        add(ctx, "modulo", &["dividend", "divisor"], |args| {
            let dividend = number(args, 0)?;
            let divisor = number(args, 1)?;
            if divisor.is_zero() {
                return Err(FunctionError::DivisionByZero);
            }
            // Result carries the sign of the divisor: modulo(-12, 5) = 3
            let quotient = dividend.checked_div(divisor).ok_or_else(overflow)?;
            let result = quotient
                .floor()
                .checked_mul(divisor)
                .and_then(|p| dividend.checked_sub(p))
                .ok_or_else(overflow)?;
            Ok(Val::Number(result))
        });

        add(ctx, "sqrt", &["number"], |args| {
            Ok(match number(args, 0)?.sqrt() {
                Some(root) => Val::Number(root),
                None => Val::Null,
            })
        });

        add(ctx, "odd", &["number"], |args| {
            let n = number(args, 0)?;
            Ok(Val::Boolean(n.is_integer() && !(n % Decimal::TWO).is_zero()))
        });

        add(ctx, "even", &["number"], |args| {
            let n = number(args, 0)?;
            Ok(Val::Boolean(n.is_integer() && (n % Decimal::TWO).is_zero()))
        });
    }

    fn round(args: &[Val], strategy: RoundingStrategy) -> Result<Val, FunctionError> {
        let n = number(args, 0)?;
        let scale = integer(args, 1)?;
        let scale = u32::try_from(scale).map_err(|_| {
            FunctionError::ArgumentError(format!("invalid scale '{scale}'"))
        })?;
        Ok(Val::Number(n.round_dp_with_strategy(scale, strategy)))
    }
}

// ── String functions ─────────────────────────────────────────────────────────

pub mod string {
    use super::*;

    pub fn install(ctx: &mut Context) {
        add(ctx, "substring", &["string", "start position"], |args| {
            Ok(substring(text(args, 0)?, integer(args, 1)?, None))
        });

        add(
            ctx,
            "substring",
            &["string", "start position", "length"],
            |args| {
                Ok(substring(
                    text(args, 0)?,
                    integer(args, 1)?,
                    Some(integer(args, 2)?),
                ))
            },
        );

        add(ctx, "string length", &["string"], |args| {
            Ok(Val::Number(Decimal::from(text(args, 0)?.chars().count())))
        });

        add(ctx, "upper case", &["string"], |args| {
            Ok(Val::String(text(args, 0)?.to_uppercase()))
        });

        add(ctx, "lower case", &["string"], |args| {
            Ok(Val::String(text(args, 0)?.to_lowercase()))
        });

        add(ctx, "starts with", &["string", "match"], |args| {
            Ok(Val::Boolean(text(args, 0)?.starts_with(text(args, 1)?)))
        });

        add(ctx, "ends with", &["string", "match"], |args| {
            Ok(Val::Boolean(text(args, 0)?.ends_with(text(args, 1)?)))
        });

        add(ctx, "contains", &["string", "match"], |args| {
            Ok(Val::Boolean(text(args, 0)?.contains(text(args, 1)?)))
        });
    }

    /// 1-based character extraction; a negative start counts from the end.
    fn substring(s: &str, start: i64, length: Option<i64>) -> Val {
        let chars: Vec<char> = s.chars().collect();
        let len = chars.len() as i64;
        let begin = if start > 0 {
            start - 1
        } else if start < 0 {
            (len + start).max(0)
        } else {
            0
        };
        let begin = begin.min(len) as usize;
        let count = length.map(|l| l.max(0) as usize).unwrap_or(chars.len());
        Val::String(chars[begin..].iter().take(count).collect())
    }
}

// ── List functions ───────────────────────────────────────────────────────────

pub mod list {
    use super::*;

    pub fn install(ctx: &mut Context) {
        // The aggregation built-ins accept either a single list or variadic
        // items: count([1,2]) and count(1,2) both work.
        add_variadic(ctx, "count", &["list"], |args| {
            Ok(Val::Number(Decimal::from(items(args, 0)?.len())))
        });

        add_variadic(ctx, "min", &["list"], |args| {
            extremum(items(args, 0)?, Ordering::Less)
        });

        add_variadic(ctx, "max", &["list"], |args| {
            extremum(items(args, 0)?, Ordering::Greater)
        });

        add_variadic(ctx, "sum", &["list"], |args| sum(items(args, 0)?));

        add_variadic(ctx, "mean", &["list"], |args| {
            let list = items(args, 0)?;
            match sum(list)? {
                Val::Number(total) => {
                    let count = Decimal::from(list.len());
                    Ok(Val::Number(total.checked_div(count).ok_or_else(overflow)?))
                }
                other => Ok(other),
            }
        });

        add_variadic(ctx, "append", &["list", "items"], |args| {
            let mut result = items(args, 0)?.to_vec();
            result.extend(items(args, 1)?.iter().cloned());
            Ok(Val::List(result))
        });

        add_variadic(ctx, "concatenate", &["lists"], |args| {
            let mut result = Vec::new();
            for value in items(args, 0)? {
                match value {
                    Val::List(inner) => result.extend(inner.iter().cloned()),
                    other => return Err(type_error("list", other)),
                }
            }
            Ok(Val::List(result))
        });

        add(ctx, "reverse", &["list"], |args| {
            let mut result = items(args, 0)?.to_vec();
            result.reverse();
            Ok(Val::List(result))
        });

        add(ctx, "index of", &["list", "match"], |args| {
            let list = items(args, 0)?;
            let needle = &args[1];
            let positions = list
                .iter()
                .enumerate()
                .filter(|(_, item)| item.feel_equal(needle) == Some(true))
                .map(|(i, _)| Val::Number(Decimal::from(i + 1)))
                .collect();
            Ok(Val::List(positions))
        });

        add(ctx, "sublist", &["list", "start position"], |args| {
            Ok(sublist(items(args, 0)?, integer(args, 1)?, None))
        });

        add(
            ctx,
            "sublist",
            &["list", "start position", "length"],
            |args| {
                Ok(sublist(
                    items(args, 0)?,
                    integer(args, 1)?,
                    Some(integer(args, 2)?),
                ))
            },
        );

        add(ctx, "flatten", &["list"], |args| {
            let mut result = Vec::new();
            flatten_into(items(args, 0)?, &mut result);
            Ok(Val::List(result))
        });

        add(ctx, "list contains", &["list", "element"], |args| {
            let needle = &args[1];
            Ok(Val::Boolean(
                items(args, 0)?
                    .iter()
                    .any(|item| item.feel_equal(needle) == Some(true)),
            ))
        });
    }

    /// The smallest/largest element under the ordered-kind comparison;
    /// an empty list has no extremum and yields null.
    fn extremum(list: &[Val], keep: Ordering) -> Result<Val, FunctionError> {
        let mut iter = list.iter();
        let Some(mut best) = iter.next() else {
            return Ok(Val::Null);
        };
        for item in iter {
            match item.compare_ordered(best) {
                Some(ord) if ord == keep => best = item,
                Some(_) => {}
                None => {
                    return Err(FunctionError::ArgumentError(format!(
                        "can not compare '{}' and '{}'",
                        item.type_name(),
                        best.type_name()
                    )))
                }
            }
        }
        Ok(best.clone())
    }

    fn sum(list: &[Val]) -> Result<Val, FunctionError> {
        if list.is_empty() {
            return Ok(Val::Null);
        }
        let mut total = Decimal::ZERO;
        for item in list {
            match item {
                Val::Number(n) => total = total.checked_add(*n).ok_or_else(overflow)?,
                other => return Err(type_error("number", other)),
            }
        }
        Ok(Val::Number(total))
    }

    /// 1-based element extraction; a negative start counts from the end.
    fn sublist(list: &[Val], start: i64, length: Option<i64>) -> Val {
        let len = list.len() as i64;
        let begin = if start > 0 {
            start - 1
        } else if start < 0 {
            (len + start).max(0)
        } else {
            0
        };
        let begin = begin.min(len) as usize;
        let count = length.map(|l| l.max(0) as usize).unwrap_or(list.len());
        Val::List(list[begin..].iter().take(count).cloned().collect())
    }

    fn flatten_into(list: &[Val], out: &mut Vec<Val>) {
        for item in list {
            match item {
                Val::List(inner) => flatten_into(inner, out),
                other => out.push(other.clone()),
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expression as E;
    use crate::evaluator::Evaluator;

    fn eval(exp: &E) -> Val {
        Evaluator::new().evaluate(exp, &Context::with_built_ins())
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_rounding_modes() {
        let call = |name: &str, n: &str, scale: i64| {
            eval(&E::invoke(
                name,
                vec![E::ConstNumber(dec(n)), E::num(scale)],
            ))
        };
        // round up moves away from zero, round down toward it
        assert_eq!(call("round up", "2.1", 0), Val::Number(dec("3")));
        assert_eq!(call("round up", "-2.1", 0), Val::Number(dec("-3")));
        assert_eq!(call("round down", "2.9", 0), Val::Number(dec("2")));
        assert_eq!(call("round down", "-2.9", 0), Val::Number(dec("-2")));
        // decimal rounds half to even
        assert_eq!(call("decimal", "2.5", 0), Val::Number(dec("2")));
        assert_eq!(call("decimal", "3.5", 0), Val::Number(dec("4")));
        assert_eq!(call("decimal", "1.015", 2), Val::Number(dec("1.02")));
    }

    #[test]
    fn test_floor_ceiling_abs() {
        assert_eq!(
            eval(&E::invoke("floor", vec![E::ConstNumber(dec("1.5"))])),
            Val::Number(dec("1"))
        );
        assert_eq!(
            eval(&E::invoke("ceiling", vec![E::ConstNumber(dec("1.5"))])),
            Val::Number(dec("2"))
        );
        assert_eq!(
            eval(&E::invoke("abs", vec![E::num(-3)])),
            Val::Number(dec("3"))
        );
    }

    #[test]
    fn test_modulo_follows_divisor_sign() {
        let call = |a: i64, b: i64| eval(&E::invoke("modulo", vec![E::num(a), E::num(b)]));
        assert_eq!(call(12, 5), Val::from(2));
        assert_eq!(call(-12, 5), Val::from(3));
        assert_eq!(call(12, -5), Val::from(-3));
        assert_eq!(
            call(1, 0),
            Val::Error("division by zero".to_string())
        );
    }

    #[test]
    fn test_sqrt_of_negative_is_null() {
        assert_eq!(eval(&E::invoke("sqrt", vec![E::num(4)])), Val::from(2));
        assert_eq!(eval(&E::invoke("sqrt", vec![E::num(-1)])), Val::Null);
    }

    #[test]
    fn test_substring_positions() {
        let call = |args: Vec<E>| eval(&E::invoke("substring", args));
        assert_eq!(
            call(vec![E::string("foobar"), E::num(3)]),
            Val::from("obar")
        );
        assert_eq!(
            call(vec![E::string("foobar"), E::num(3), E::num(3)]),
            Val::from("oba")
        );
        assert_eq!(
            call(vec![E::string("foobar"), E::num(-2)]),
            Val::from("ar")
        );
    }

    #[test]
    fn test_string_predicates() {
        assert_eq!(
            eval(&E::invoke(
                "starts with",
                vec![E::string("foobar"), E::string("foo")]
            )),
            Val::Boolean(true)
        );
        assert_eq!(
            eval(&E::invoke(
                "string length",
                vec![E::string("föö")]
            )),
            Val::from(3)
        );
    }

    #[test]
    fn test_aggregations_accept_list_or_items() {
        // single list argument passes through unwrapped
        let list = E::ConstList(vec![E::num(1), E::num(2), E::num(3)]);
        assert_eq!(eval(&E::invoke("sum", vec![list.clone()])), Val::from(6));
        assert_eq!(eval(&E::invoke("count", vec![list.clone()])), Val::from(3));
        assert_eq!(eval(&E::invoke("min", vec![list.clone()])), Val::from(1));
        assert_eq!(eval(&E::invoke("max", vec![list])), Val::from(3));

        // variadic items are packed
        assert_eq!(
            eval(&E::invoke("sum", vec![E::num(1), E::num(2), E::num(3)])),
            Val::from(6)
        );
        assert_eq!(
            eval(&E::invoke("mean", vec![E::num(1), E::num(2), E::num(3)])),
            Val::from(2)
        );
    }

    #[test]
    fn test_empty_aggregations_are_null() {
        let empty = E::ConstList(vec![]);
        assert_eq!(eval(&E::invoke("min", vec![empty.clone()])), Val::Null);
        assert_eq!(eval(&E::invoke("sum", vec![empty])), Val::Null);
    }

    #[test]
    fn test_append_and_concatenate() {
        let list = E::ConstList(vec![E::num(1)]);
        assert_eq!(
            eval(&E::invoke("append", vec![list, E::num(2), E::num(3)])),
            Val::List(vec![Val::from(1), Val::from(2), Val::from(3)])
        );

        let a = E::ConstList(vec![E::num(1), E::num(2)]);
        let b = E::ConstList(vec![E::num(3)]);
        assert_eq!(
            eval(&E::invoke("concatenate", vec![a, b])),
            Val::List(vec![Val::from(1), Val::from(2), Val::from(3)])
        );
    }

    #[test]
    fn test_index_of_is_one_based() {
        let list = E::ConstList(vec![E::num(1), E::num(2), E::num(1)]);
        assert_eq!(
            eval(&E::invoke("index of", vec![list, E::num(1)])),
            Val::List(vec![Val::from(1), Val::from(3)])
        );
    }

    #[test]
    fn test_flatten_is_deep() {
        let nested = E::ConstList(vec![
            E::num(1),
            E::ConstList(vec![E::num(2), E::ConstList(vec![E::num(3)])]),
        ]);
        assert_eq!(
            eval(&E::invoke("flatten", vec![nested])),
            Val::List(vec![Val::from(1), Val::from(2), Val::from(3)])
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(
            eval(&E::invoke("date", vec![E::string("2021-03-04")])),
            Val::Date(datetime::parse_date("2021-03-04").unwrap())
        );
        assert_eq!(
            eval(&E::invoke("date", vec![E::num(2021), E::num(3), E::num(4)])),
            Val::Date(datetime::parse_date("2021-03-04").unwrap())
        );
        assert_eq!(
            eval(&E::invoke("number", vec![E::string("1.5")])),
            Val::Number(dec("1.5"))
        );
        assert_eq!(
            eval(&E::invoke("string", vec![E::ConstNumber(dec("1.50"))])),
            Val::from("1.5")
        );
        assert!(matches!(
            eval(&E::invoke("duration", vec![E::string("P1Y6M")])),
            Val::YearMonthDuration(_)
        ));
        assert!(matches!(
            eval(&E::invoke("duration", vec![E::string("PT2H")])),
            Val::DayTimeDuration(_)
        ));
        assert!(eval(&E::invoke("date", vec![E::string("not a date")])).is_error());
    }

    #[test]
    fn test_time_conversion_with_and_without_offset() {
        assert!(matches!(
            eval(&E::invoke("time", vec![E::string("10:30:00")])),
            Val::LocalTime(_)
        ));
        assert!(matches!(
            eval(&E::invoke("time", vec![E::string("10:30:00+01:00")])),
            Val::Time(_)
        ));
    }

    #[test]
    fn test_not_builtin_is_three_valued() {
        assert_eq!(
            eval(&E::invoke("not", vec![E::boolean(true)])),
            Val::Boolean(false)
        );
        assert_eq!(eval(&E::invoke("not", vec![E::null()])), Val::Null);
        assert_eq!(eval(&E::invoke("not", vec![E::num(1)])), Val::Null);
    }
}
