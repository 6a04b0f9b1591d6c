//! Query AST types
//!
//! The tree produced by the parser. Selectors keep their compiled matchers so
//! regexes are built once per query.

use crate::storage::{LabelMatcher, MatchOp, METRIC_NAME};
use std::fmt;

/// An expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    NumberLiteral(f64),
    StringLiteral(String),
    VectorSelector(VectorSelector),
    MatrixSelector(MatrixSelector),
    Aggregate(AggregateExpr),
    Binary(BinaryExpr),
    Call(Call),
    Paren(Box<Expr>),
    /// Unary minus
    Negate(Box<Expr>),
}

impl Expr {
    /// Strip any enclosing parentheses
    pub fn unwrap_parens(&self) -> &Expr {
        match self {
            Expr::Paren(inner) => inner.unwrap_parens(),
            other => other,
        }
    }

    /// Visit every vector selector in the tree, depth-first
    pub fn for_each_selector<'a>(&'a self, f: &mut impl FnMut(&'a VectorSelector)) {
        match self {
            Expr::NumberLiteral(_) | Expr::StringLiteral(_) => {}
            Expr::VectorSelector(vs) => f(vs),
            Expr::MatrixSelector(ms) => f(&ms.selector),
            Expr::Aggregate(agg) => {
                if let Some(param) = &agg.param {
                    param.for_each_selector(f);
                }
                agg.expr.for_each_selector(f);
            }
            Expr::Binary(bin) => {
                bin.lhs.for_each_selector(f);
                bin.rhs.for_each_selector(f);
            }
            Expr::Call(call) => call.args.iter().for_each(|arg| arg.for_each_selector(f)),
            Expr::Paren(inner) | Expr::Negate(inner) => inner.for_each_selector(f),
        }
    }
}

/// `name{matchers} offset o`
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    /// Metric name if written outside the braces
    pub name: Option<String>,
    /// All matchers, including the `__name__` equality implied by `name`
    pub matchers: Vec<LabelMatcher>,
    /// Offset in milliseconds (negative looks forward)
    pub offset: i64,
}

impl VectorSelector {
    pub fn new(name: Option<String>, mut matchers: Vec<LabelMatcher>) -> Self {
        if let Some(name) = &name {
            matchers.insert(0, LabelMatcher::equal(METRIC_NAME, name.clone()));
        }
        Self {
            name,
            matchers,
            offset: 0,
        }
    }
}

/// `selector[range]`
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub selector: VectorSelector,
    /// Window width in milliseconds
    pub range: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Group,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    Quantile,
}

impl AggregateOp {
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "sum" => AggregateOp::Sum,
            "avg" => AggregateOp::Avg,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "count" => AggregateOp::Count,
            "group" => AggregateOp::Group,
            "stddev" => AggregateOp::Stddev,
            "stdvar" => AggregateOp::Stdvar,
            "topk" => AggregateOp::Topk,
            "bottomk" => AggregateOp::Bottomk,
            "quantile" => AggregateOp::Quantile,
            _ => return None,
        };
        Some(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
            AggregateOp::Group => "group",
            AggregateOp::Stddev => "stddev",
            AggregateOp::Stdvar => "stdvar",
            AggregateOp::Topk => "topk",
            AggregateOp::Bottomk => "bottomk",
            AggregateOp::Quantile => "quantile",
        }
    }

    /// Whether the operator takes a leading scalar parameter
    pub fn takes_param(&self) -> bool {
        matches!(
            self,
            AggregateOp::Topk | AggregateOp::Bottomk | AggregateOp::Quantile
        )
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which labels an aggregation keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
    By(Vec<String>),
    Without(Vec<String>),
}

impl Default for Grouping {
    fn default() -> Self {
        Grouping::By(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub op: AggregateOp,
    pub expr: Box<Expr>,
    pub param: Option<Box<Expr>>,
    pub grouping: Grouping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Unless => "unless",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le
        )
    }

    pub fn is_set(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }

    /// Apply an arithmetic or comparison operator to two numbers.
    ///
    /// Comparisons return 1.0 or 0.0. Set operators have no scalar form.
    pub fn apply(&self, lhs: f64, rhs: f64) -> Option<f64> {
        let bool_value = |b: bool| if b { 1.0 } else { 0.0 };
        let v = match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Mod => lhs % rhs,
            BinaryOp::Pow => lhs.powf(rhs),
            BinaryOp::Eq => bool_value(lhs == rhs),
            BinaryOp::Ne => bool_value(lhs != rhs),
            BinaryOp::Gt => bool_value(lhs > rhs),
            BinaryOp::Lt => bool_value(lhs < rhs),
            BinaryOp::Ge => bool_value(lhs >= rhs),
            BinaryOp::Le => bool_value(lhs <= rhs),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Unless => return None,
        };
        Some(v)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Label reduction applied before matching two vectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorMatching {
    On(Vec<String>),
    Ignoring(Vec<String>),
}

impl Default for VectorMatching {
    fn default() -> Self {
        VectorMatching::Ignoring(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub matching: Option<VectorMatching>,
    /// `bool` modifier on comparisons
    pub return_bool: bool,
}

/// Function call; the name is resolved during type checking
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub func: String,
    pub args: Vec<Expr>,
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[String]) -> fmt::Result {
    write!(f, "({})", items.join(", "))
}

fn write_duration(f: &mut fmt::Formatter<'_>, millis: i64) -> fmt::Result {
    const UNITS: [(i64, &str); 6] = [
        (7 * 24 * 3_600_000, "w"),
        (24 * 3_600_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
        (1, "ms"),
    ];
    if millis == 0 {
        return f.write_str("0s");
    }
    let mut rest = millis;
    for (size, unit) in UNITS {
        if rest >= size {
            write!(f, "{}{}", rest / size, unit)?;
            rest %= size;
        }
    }
    Ok(())
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        let shown: Vec<String> = self
            .matchers
            .iter()
            .filter(|m| {
                !(self.name.is_some() && m.name == METRIC_NAME && m.op == MatchOp::Equal)
            })
            .map(|m| m.to_string())
            .collect();
        if !shown.is_empty() || self.name.is_none() {
            write!(f, "{{{}}}", shown.join(", "))?;
        }
        Ok(())
    }
}

fn write_offset(f: &mut fmt::Formatter<'_>, offset: i64) -> fmt::Result {
    match offset {
        0 => Ok(()),
        o if o < 0 => {
            f.write_str(" offset -")?;
            write_duration(f, -o)
        }
        o => {
            f.write_str(" offset ")?;
            write_duration(f, o)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::NumberLiteral(n) => write!(f, "{}", n),
            Expr::StringLiteral(s) => write!(f, "{:?}", s),
            Expr::VectorSelector(vs) => {
                write!(f, "{}", vs)?;
                write_offset(f, vs.offset)
            }
            Expr::MatrixSelector(ms) => {
                write!(f, "{}[", ms.selector)?;
                write_duration(f, ms.range)?;
                f.write_str("]")?;
                write_offset(f, ms.selector.offset)
            }
            Expr::Aggregate(agg) => {
                write!(f, "{}", agg.op)?;
                match &agg.grouping {
                    Grouping::By(labels) if labels.is_empty() => {}
                    Grouping::By(labels) => {
                        f.write_str(" by ")?;
                        write_list(f, labels)?;
                        f.write_str(" ")?;
                    }
                    Grouping::Without(labels) => {
                        f.write_str(" without ")?;
                        write_list(f, labels)?;
                        f.write_str(" ")?;
                    }
                }
                f.write_str("(")?;
                if let Some(param) = &agg.param {
                    write!(f, "{}, ", param)?;
                }
                write!(f, "{})", agg.expr)
            }
            Expr::Binary(bin) => {
                write!(f, "{} {}", bin.lhs, bin.op)?;
                if bin.return_bool {
                    f.write_str(" bool")?;
                }
                match &bin.matching {
                    Some(VectorMatching::On(labels)) => {
                        f.write_str(" on")?;
                        write_list(f, labels)?;
                    }
                    Some(VectorMatching::Ignoring(labels)) => {
                        f.write_str(" ignoring")?;
                        write_list(f, labels)?;
                    }
                    None => {}
                }
                write!(f, " {}", bin.rhs)
            }
            Expr::Call(call) => {
                let args: Vec<String> = call.args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", call.func, args.join(", "))
            }
            Expr::Paren(inner) => write!(f, "({})", inner),
            Expr::Negate(inner) => write!(f, "-{}", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_adds_name_matcher() {
        let vs = VectorSelector::new(Some("up".into()), vec![LabelMatcher::equal("job", "api")]);
        assert_eq!(vs.matchers.len(), 2);
        assert_eq!(vs.matchers[0].name, METRIC_NAME);
        assert_eq!(vs.to_string(), "up{job=\"api\"}");
    }

    #[test]
    fn test_binary_apply() {
        assert_eq!(BinaryOp::Add.apply(1.0, 2.0), Some(3.0));
        assert_eq!(BinaryOp::Gt.apply(1.0, 2.0), Some(0.0));
        assert!(BinaryOp::Div.apply(1.0, 0.0).unwrap().is_infinite());
        assert!(BinaryOp::Mod.apply(1.0, 0.0).unwrap().is_nan());
        assert_eq!(BinaryOp::And.apply(1.0, 1.0), None);
    }

    #[test]
    fn test_aggregate_op_names() {
        assert_eq!(AggregateOp::from_name("SUM"), Some(AggregateOp::Sum));
        assert_eq!(AggregateOp::from_name("rate"), None);
        assert!(AggregateOp::Topk.takes_param());
        assert!(!AggregateOp::Avg.takes_param());
    }

    #[test]
    fn test_display_matrix_with_offset() {
        let mut selector = VectorSelector::new(Some("http_requests".into()), vec![]);
        selector.offset = 3_600_000;
        let expr = Expr::MatrixSelector(MatrixSelector {
            selector,
            range: 90_000,
        });
        assert_eq!(expr.to_string(), "http_requests[1m30s] offset 1h");
    }
}
