//! Static type checking
//!
//! Runs after parsing and before a query is admitted, so a query that could
//! never evaluate is rejected without holding a concurrency slot.

use crate::query::ast::{BinaryExpr, Call, Expr};
use crate::query::error::{QueryError, QueryResult};
use crate::query::functions::Function;
use crate::query::value::ValueType;

/// Infer the result type of `expr`, rejecting unknown functions and
/// operands of the wrong type
pub fn check(expr: &Expr) -> QueryResult<ValueType> {
    match expr {
        Expr::NumberLiteral(_) => Ok(ValueType::Scalar),
        Expr::StringLiteral(_) => Ok(ValueType::String),
        Expr::VectorSelector(_) => Ok(ValueType::Vector),
        Expr::MatrixSelector(_) => Ok(ValueType::Matrix),
        Expr::Paren(inner) => check(inner),
        Expr::Negate(inner) => match check(inner)? {
            t @ (ValueType::Scalar | ValueType::Vector) => Ok(t),
            other => Err(QueryError::type_mismatch(format!(
                "unary expression only allowed on expressions of type scalar or instant vector, got {}",
                other
            ))),
        },
        Expr::Call(call) => check_call(call),
        Expr::Aggregate(agg) => {
            if let Some(param) = &agg.param {
                let param_type = check(param)?;
                if param_type != ValueType::Scalar {
                    return Err(QueryError::type_mismatch(format!(
                        "expected type scalar in aggregation parameter of {}, got {}",
                        agg.op, param_type
                    )));
                }
            }
            let inner = check(&agg.expr)?;
            if inner != ValueType::Vector {
                return Err(QueryError::type_mismatch(format!(
                    "expected type vector in aggregation {}, got {}",
                    agg.op, inner
                )));
            }
            Ok(ValueType::Vector)
        }
        Expr::Binary(bin) => check_binary(bin),
    }
}

fn check_call(call: &Call) -> QueryResult<ValueType> {
    let func = Function::from_name(&call.func)
        .ok_or_else(|| QueryError::UnknownFunction(call.func.clone()))?;
    let signature = func.signature();

    let max = signature.args.len();
    let min = max - signature.optional;
    if call.args.len() < min || call.args.len() > max {
        let expected = if min == max {
            max.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(QueryError::type_mismatch(format!(
            "expected {} argument(s) in call to {}, got {}",
            expected,
            call.func,
            call.args.len()
        )));
    }

    for (arg, expected) in call.args.iter().zip(signature.args) {
        let actual = check(arg)?;
        if actual != *expected {
            return Err(QueryError::type_mismatch(format!(
                "expected type {} in call to function {}, got {}",
                expected, call.func, actual
            )));
        }
    }

    Ok(signature.returns)
}

fn check_binary(bin: &BinaryExpr) -> QueryResult<ValueType> {
    let lhs = check(&bin.lhs)?;
    let rhs = check(&bin.rhs)?;

    for side in [lhs, rhs] {
        if !matches!(side, ValueType::Scalar | ValueType::Vector) {
            return Err(QueryError::type_mismatch(format!(
                "binary expression must contain only scalar and instant vector types, got {}",
                side
            )));
        }
    }

    let both_vectors = lhs == ValueType::Vector && rhs == ValueType::Vector;
    if bin.op.is_set() && !both_vectors {
        return Err(QueryError::type_mismatch(format!(
            "set operator {} not allowed in binary scalar expression",
            bin.op
        )));
    }
    if bin.matching.is_some() && !both_vectors {
        return Err(QueryError::type_mismatch(
            "vector matching only allowed between instant vectors",
        ));
    }
    if bin.op.is_comparison()
        && lhs == ValueType::Scalar
        && rhs == ValueType::Scalar
        && !bin.return_bool
    {
        return Err(QueryError::type_mismatch(
            "comparisons between scalars must use bool modifier",
        ));
    }

    if lhs == ValueType::Scalar && rhs == ValueType::Scalar {
        Ok(ValueType::Scalar)
    } else {
        Ok(ValueType::Vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_expr;

    fn check_str(query: &str) -> QueryResult<ValueType> {
        check(&parse_expr(query).unwrap())
    }

    #[test]
    fn test_infers_result_types() {
        assert_eq!(check_str("1 + 2").unwrap(), ValueType::Scalar);
        assert_eq!(check_str("up * 2").unwrap(), ValueType::Vector);
        assert_eq!(check_str("up[5m]").unwrap(), ValueType::Matrix);
        assert_eq!(check_str("\"hello\"").unwrap(), ValueType::String);
        assert_eq!(check_str("sum(rate(x[5m]))").unwrap(), ValueType::Vector);
        assert_eq!(check_str("scalar(up)").unwrap(), ValueType::Scalar);
        assert_eq!(check_str("time()").unwrap(), ValueType::Scalar);
        assert_eq!(check_str("round(up)").unwrap(), ValueType::Vector);
        assert_eq!(check_str("round(up, 0.5)").unwrap(), ValueType::Vector);
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            check_str("histogram_quantile(0.9, x)"),
            Err(QueryError::UnknownFunction(name)) if name == "histogram_quantile"
        ));
    }

    #[test]
    fn test_wrong_argument_type() {
        assert!(matches!(check_str("rate(up)"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("abs(up[5m])"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("clamp_min(up)"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("time(up)"), Err(QueryError::TypeMismatch(_))));
    }

    #[test]
    fn test_binary_type_rules() {
        assert!(matches!(check_str("up[5m] + 1"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("1 and up"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("1 > 2"), Err(QueryError::TypeMismatch(_))));
        assert_eq!(check_str("1 > bool 2").unwrap(), ValueType::Scalar);
        assert!(matches!(
            check_str("up + on(job) 1"),
            Err(QueryError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_aggregation_needs_vector() {
        assert!(matches!(check_str("sum(up[5m])"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("topk(up, up)"), Err(QueryError::TypeMismatch(_))));
        assert!(matches!(check_str("-\"a\""), Err(QueryError::TypeMismatch(_))));
    }
}
