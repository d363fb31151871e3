// feelcore - FEEL expression interpreter core
// Licensed under the MIT License

//! # feelcore
//!
//! The core expression interpreter for FEEL (Friendly Enough Expression
//! Language), the decision-table and expression dialect defined by the DMN
//! standard.
//!
//! Given a parsed expression tree and an evaluation context, the interpreter
//! produces a typed value or a typed error. Evaluation is total: failures
//! surface as [`Val::Error`], or as [`Val::Null`] plus a warning record for
//! the failure modes DMN suppresses (ill-typed arithmetic, non-boolean `if`
//! conditions). Parsing is out of scope; callers build [`Expression`] trees
//! programmatically or deserialize them from JSON.
//!
//! ## Architecture
//!
//! - `value` - the runtime value universe and its comparability relations
//! - `ast` - expression tree definitions
//! - `evaluator` - context frames, the recursive evaluator, operator
//!   semantics, and the function invoker
//! - `functions` - built-in function library
//! - `datetime` - duration kinds and ISO-8601 temporal handling
//! - `host` - value mapping and the host-function bridge
//!
//! ## Example
//!
//! ```
//! use feelcore::{evaluate, Context, Expression, Val};
//!
//! let mut ctx = Context::with_built_ins();
//! ctx.set_variable("x", Val::from(4));
//!
//! // x + 1
//! let exp = Expression::Addition(
//!     Box::new(Expression::var("x")),
//!     Box::new(Expression::num(1)),
//! );
//! assert_eq!(evaluate(&exp, &ctx), Val::from(5));
//! ```

pub mod ast;
pub mod datetime;
pub mod evaluator;
pub mod functions;
pub mod host;
pub mod value;

pub use ast::{Expression, FunctionParameters, RangeBoundary};
pub use evaluator::{CollectingSink, Context, Evaluator, Warning, WarningSink};
pub use value::Val;

/// Evaluate an expression in the given context with default collaborators
/// (warnings go to `tracing`, host functions are rejected).
pub fn evaluate(exp: &Expression, ctx: &Context) -> Val {
    Evaluator::new().evaluate(exp, ctx)
}
