//! Query Parser
//!
//! Parses PromQL expressions into the AST.
//!
//! # Supported Syntax
//!
//! ```text
//! up{job="api", instance=~"web-.*"}            instant vector selector
//! http_requests_total[5m] offset 1h            range vector selector
//! sum by (job) (rate(http_requests_total[5m])) aggregation over a function
//! a / on(instance) b                           vector matching
//! node_load1 > bool 4                          comparison returning 0/1
//! ```
//!
//! Operator precedence, lowest first: `or`; `and` `unless`; comparisons;
//! `+` `-`; `*` `/` `%`; unary minus; `^` (right associative).

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_till, take_while},
    character::complete::{char, digit0, digit1, hex_digit1, multispace1, one_of, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, peek, recognize, value},
    error::{ContextError, ErrorKind, FromExternalError, ParseError as NomParseError},
    multi::{many0_count, many1, separated_list0},
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use std::time::Duration;

use crate::query::ast::*;
use crate::query::error::ParseError;
use crate::storage::{LabelMatcher, MatchOp, METRIC_NAME};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Parse a query string into an expression tree
pub fn parse_expr(input: &str) -> Result<Expr, ParseError> {
    match terminated(expr, skip)(input) {
        Ok(("", expr)) => Ok(expr),
        Ok((rest, _)) => Err(ParseError::new(
            input.len() - rest.len(),
            format!("unexpected {}", describe(rest)),
        )),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e.into_parse_error(input)),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::new(input.len(), "incomplete input")),
    }
}

/// Parse a duration such as `5m`, `1h30m` or `250ms`
pub fn parse_duration(text: &str) -> Result<Duration, ParseError> {
    match all_consuming(duration)(text.trim()) {
        Ok((_, millis)) => Ok(Duration::from_millis(millis as u64)),
        Err(_) => Err(ParseError {
            offset: 0,
            expected: Some("duration".to_string()),
            message: format!("invalid duration {:?}", text),
        }),
    }
}

/// Parser error carrying the position it was raised at
#[derive(Debug)]
struct SyntaxError<'a> {
    input: &'a str,
    expected: Option<&'static str>,
    message: Option<String>,
}

impl<'a> SyntaxError<'a> {
    fn failure(input: &'a str, message: impl Into<String>) -> nom::Err<Self> {
        nom::Err::Failure(Self {
            input: skipped(input),
            expected: None,
            message: Some(message.into()),
        })
    }

    fn into_parse_error(self, original: &str) -> ParseError {
        let at = skipped(self.input);
        let offset = original.len() - at.len();
        let message = match (self.message, self.expected) {
            (Some(message), _) => message,
            (None, Some(expected)) => format!("unexpected {}, expected {}", describe(at), expected),
            (None, None) => format!("unexpected {}", describe(at)),
        };
        ParseError {
            offset,
            expected: self.expected.map(String::from),
            message,
        }
    }
}

impl<'a> NomParseError<&'a str> for SyntaxError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self {
            input,
            expected: None,
            message: None,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    /// Keep whichever alternative got further
    fn or(self, other: Self) -> Self {
        if other.input.len() <= self.input.len() {
            other
        } else {
            self
        }
    }
}

impl<'a> ContextError<&'a str> for SyntaxError<'a> {
    fn add_context(input: &'a str, ctx: &'static str, mut other: Self) -> Self {
        if other.message.is_none()
            && (other.expected.is_none() || skipped(other.input).len() == skipped(input).len())
        {
            other.expected = Some(ctx);
        }
        other
    }
}

impl<'a, E> FromExternalError<&'a str, E> for SyntaxError<'a> {
    fn from_external_error(input: &'a str, kind: ErrorKind, _e: E) -> Self {
        Self::from_error_kind(input, kind)
    }
}

type PResult<'a, T> = IResult<&'a str, T, SyntaxError<'a>>;

/// Turn a recoverable error into a hard failure once a branch is committed
fn commit<T>(result: PResult<'_, T>) -> PResult<'_, T> {
    result.map_err(|e| match e {
        nom::Err::Error(e) => nom::Err::Failure(e),
        other => other,
    })
}

// ---------------------------------------------------------------------------
// Lexical helpers
// ---------------------------------------------------------------------------

fn comment(input: &str) -> PResult<'_, &str> {
    recognize(pair(char('#'), take_till(|c| c == '\n')))(input)
}

/// Whitespace and comments
fn skip(input: &str) -> PResult<'_, ()> {
    value((), many0_count(alt((multispace1, comment))))(input)
}

fn skipped(input: &str) -> &str {
    skip(input).map(|(rest, _)| rest).unwrap_or(input)
}

fn describe(rest: &str) -> String {
    let rest = skipped(rest);
    if rest.is_empty() {
        return "end of input".to_string();
    }
    let word: String = rest.chars().take_while(|c| is_ident_char(*c)).collect();
    if word.is_empty() {
        let first: String = rest.chars().take(1).collect();
        format!("{:?}", first)
    } else {
        format!("{:?}", word)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn sym<'a>(s: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(skip, tag(s))
}

/// Case-insensitive keyword that is not the prefix of a longer identifier
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    preceded(skip, terminated(tag_no_case(kw), not(satisfy(is_ident_char))))
}

fn metric_identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_' || c == ':'),
        take_while(is_ident_char),
    ))(input)
}

fn label_name(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn number(input: &str) -> PResult<'_, f64> {
    let mantissa = alt((
        recognize(pair(digit1, opt(pair(char('.'), digit0)))),
        recognize(pair(char('.'), digit1)),
    ));
    let exponent = opt(tuple((one_of("eE"), opt(one_of("+-")), digit1)));

    alt((
        map_res(preceded(tag_no_case("0x"), hex_digit1), |hex: &str| {
            i64::from_str_radix(hex, 16).map(|v| v as f64)
        }),
        map_res(recognize(pair(mantissa, exponent)), |s: &str| s.parse::<f64>()),
        value(
            f64::INFINITY,
            terminated(tag_no_case("inf"), not(satisfy(is_ident_char))),
        ),
        value(
            f64::NAN,
            terminated(tag_no_case("nan"), not(satisfy(is_ident_char))),
        ),
    ))(input)
}

/// Single, double or back-quoted string; back quotes take no escapes
fn string_literal(input: &str) -> PResult<'_, String> {
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('"' | '\'' | '`'))) => q,
        _ => {
            return Err(nom::Err::Error(SyntaxError::from_error_kind(
                input,
                ErrorKind::Char,
            )))
        }
    };

    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        if c == quote {
            return Ok((&input[i + c.len_utf8()..], out));
        }
        if quote == '`' {
            out.push(c);
            continue;
        }
        match c {
            '\n' => break,
            '\\' => {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };
                let decoded = match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    'a' => '\x07',
                    'b' => '\x08',
                    'f' => '\x0c',
                    'v' => '\x0b',
                    '\\' | '"' | '\'' | '`' => escaped,
                    'x' | 'u' => {
                        let width = if escaped == 'x' { 2 } else { 4 };
                        let start = i + 2;
                        let digits = input.get(start..start + width).unwrap_or("");
                        let code = u32::from_str_radix(digits, 16)
                            .ok()
                            .filter(|_| digits.len() == width)
                            .and_then(char::from_u32);
                        let Some(code) = code else {
                            return Err(SyntaxError::failure(
                                &input[i..],
                                format!("invalid escape sequence \\{}", escaped),
                            ));
                        };
                        for _ in 0..width {
                            chars.next();
                        }
                        code
                    }
                    other => {
                        return Err(SyntaxError::failure(
                            &input[i..],
                            format!("unknown escape sequence \\{}", other),
                        ))
                    }
                };
                out.push(decoded);
            }
            _ => out.push(c),
        }
    }
    Err(SyntaxError::failure(input, "unterminated quoted string"))
}

fn duration_unit(input: &str) -> PResult<'_, i64> {
    alt((
        value(1, tag("ms")),
        value(1_000, tag("s")),
        value(MINUTE, tag("m")),
        value(HOUR, tag("h")),
        value(DAY, tag("d")),
        value(7 * DAY, tag("w")),
        value(365 * DAY, tag("y")),
    ))(input)
}

/// Duration in milliseconds
fn duration(input: &str) -> PResult<'_, i64> {
    let (rest, parts) = many1(pair(map_res(digit1, str::parse::<i64>), duration_unit))(input)?;
    let mut total: i64 = 0;
    for (count, unit) in parts {
        total = count
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| SyntaxError::failure(input, "duration out of range"))?;
    }
    Ok((rest, total))
}

fn label_list(input: &str) -> PResult<'_, Vec<String>> {
    let (input, _) = context_sym("\"(\"", "(")(input)?;
    let (input, labels) =
        separated_list0(sym(","), map(preceded(skip, label_name), String::from))(input)?;
    let (input, _) = opt(sym(","))(input)?;
    let (input, _) = commit(context_sym("\")\"", ")")(input))?;
    Ok((input, labels))
}

fn context_sym<'a>(
    ctx: &'static str,
    s: &'static str,
) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    nom::error::context(ctx, sym(s))
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn expr(input: &str) -> PResult<'_, Expr> {
    binary_chain(input, or_op, and_expr)
}

fn and_expr(input: &str) -> PResult<'_, Expr> {
    binary_chain(input, and_op, comparison_expr)
}

fn comparison_expr(input: &str) -> PResult<'_, Expr> {
    binary_chain(input, comparison_op, additive_expr)
}

fn additive_expr(input: &str) -> PResult<'_, Expr> {
    binary_chain(input, additive_op, multiplicative_expr)
}

fn multiplicative_expr(input: &str) -> PResult<'_, Expr> {
    binary_chain(input, multiplicative_op, unary_expr)
}

fn or_op(input: &str) -> PResult<'_, BinaryOp> {
    value(BinaryOp::Or, keyword("or"))(input)
}

fn and_op(input: &str) -> PResult<'_, BinaryOp> {
    alt((
        value(BinaryOp::And, keyword("and")),
        value(BinaryOp::Unless, keyword("unless")),
    ))(input)
}

fn comparison_op(input: &str) -> PResult<'_, BinaryOp> {
    alt((
        value(BinaryOp::Eq, sym("==")),
        value(BinaryOp::Ne, sym("!=")),
        value(BinaryOp::Le, sym("<=")),
        value(BinaryOp::Ge, sym(">=")),
        value(BinaryOp::Lt, sym("<")),
        value(BinaryOp::Gt, sym(">")),
    ))(input)
}

fn additive_op(input: &str) -> PResult<'_, BinaryOp> {
    alt((value(BinaryOp::Add, sym("+")), value(BinaryOp::Sub, sym("-"))))(input)
}

fn multiplicative_op(input: &str) -> PResult<'_, BinaryOp> {
    alt((
        value(BinaryOp::Mul, sym("*")),
        value(BinaryOp::Div, sym("/")),
        value(BinaryOp::Mod, sym("%")),
    ))(input)
}

/// Left-associative chain of one precedence level
fn binary_chain<'a>(
    input: &'a str,
    mut op: impl FnMut(&'a str) -> PResult<'a, BinaryOp>,
    mut operand: impl FnMut(&'a str) -> PResult<'a, Expr>,
) -> PResult<'a, Expr> {
    let (mut input, mut lhs) = operand(input)?;
    loop {
        let (rest, op) = match op(input) {
            Ok(found) => found,
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        };
        let (rest, (return_bool, matching)) = modifiers(op, rest)?;
        let (rest, rhs) = commit(operand(rest))?;
        lhs = binary(op, lhs, rhs, matching, return_bool);
        input = rest;
    }
}

fn binary(
    op: BinaryOp,
    lhs: Expr,
    rhs: Expr,
    matching: Option<VectorMatching>,
    return_bool: bool,
) -> Expr {
    Expr::Binary(BinaryExpr {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        matching,
        return_bool,
    })
}

/// `bool` and `on(...)` / `ignoring(...)` after an operator
fn modifiers(op: BinaryOp, input: &str) -> PResult<'_, (bool, Option<VectorMatching>)> {
    let (input, return_bool) = if op.is_comparison() {
        map(opt(keyword("bool")), |b| b.is_some())(input)?
    } else {
        (input, false)
    };
    let (input, matching) = opt(alt((
        map(preceded(keyword("on"), cut(label_list)), VectorMatching::On),
        map(
            preceded(keyword("ignoring"), cut(label_list)),
            VectorMatching::Ignoring,
        ),
    )))(input)?;
    if matching.is_some() {
        if let Ok((_, found)) = alt((keyword("group_left"), keyword("group_right")))(input) {
            return Err(SyntaxError::failure(
                input,
                format!("{} matching is not supported", found.to_ascii_lowercase()),
            ));
        }
    }
    Ok((input, (return_bool, matching)))
}

fn unary_expr(input: &str) -> PResult<'_, Expr> {
    match additive_op(input) {
        Ok((rest, op)) => {
            let (rest, operand) = commit(unary_expr(rest))?;
            let expr = match (op, operand) {
                (BinaryOp::Sub, Expr::NumberLiteral(n)) => Expr::NumberLiteral(-n),
                (BinaryOp::Sub, other) => Expr::Negate(Box::new(other)),
                (_, other) => other,
            };
            Ok((rest, expr))
        }
        Err(nom::Err::Error(_)) => power_expr(input),
        Err(e) => Err(e),
    }
}

/// `^` binds tighter than unary minus and groups to the right
fn power_expr(input: &str) -> PResult<'_, Expr> {
    let (input, lhs) = postfix_expr(input)?;
    match sym("^")(input) {
        Ok((rest, _)) => {
            let (rest, (return_bool, matching)) = modifiers(BinaryOp::Pow, rest)?;
            let (rest, rhs) = commit(unary_expr(rest))?;
            Ok((rest, binary(BinaryOp::Pow, lhs, rhs, matching, return_bool)))
        }
        Err(nom::Err::Error(_)) => Ok((input, lhs)),
        Err(e) => Err(e),
    }
}

/// Range and offset modifiers
fn postfix_expr(input: &str) -> PResult<'_, Expr> {
    let (mut input, mut expr) = primary(input)?;

    if let Ok((rest, _)) = sym("[")(input) {
        let (rest, range) = commit(nom::error::context("duration", preceded(skip, duration))(rest))?;
        let (rest, _) = commit(context_sym("\"]\"", "]")(rest))?;
        if range <= 0 {
            return Err(SyntaxError::failure(input, "range must be greater than zero"));
        }
        expr = match expr {
            Expr::VectorSelector(selector) => Expr::MatrixSelector(MatrixSelector { selector, range }),
            _ => {
                return Err(SyntaxError::failure(
                    input,
                    "ranges are only allowed for vector selectors",
                ))
            }
        };
        input = rest;
    }

    if let Ok((rest, _)) = keyword("offset")(input) {
        let (rest, negative) = map(opt(sym("-")), |s| s.is_some())(rest)?;
        let (rest, offset) = commit(nom::error::context("duration", preceded(skip, duration))(rest))?;
        let offset = if negative { -offset } else { offset };
        match &mut expr {
            Expr::VectorSelector(vs) => vs.offset = offset,
            Expr::MatrixSelector(ms) => ms.selector.offset = offset,
            _ => {
                return Err(SyntaxError::failure(
                    input,
                    "offset modifier must follow a vector selector",
                ))
            }
        }
        input = rest;
    }

    Ok((input, expr))
}

fn primary(input: &str) -> PResult<'_, Expr> {
    nom::error::context(
        "expression",
        alt((
            map(preceded(skip, number), Expr::NumberLiteral),
            map(preceded(skip, string_literal), Expr::StringLiteral),
            paren_expr,
            identifier_expr,
            brace_selector,
        )),
    )(input)
}

fn paren_expr(input: &str) -> PResult<'_, Expr> {
    let (input, _) = sym("(")(input)?;
    let (input, inner) = commit(expr(input))?;
    let (input, _) = commit(context_sym("\")\"", ")")(input))?;
    Ok((input, Expr::Paren(Box::new(inner))))
}

/// Aggregation, function call or named selector
fn identifier_expr(input: &str) -> PResult<'_, Expr> {
    let start = skipped(input);
    let (rest, name) = metric_identifier(start)?;

    if let Some(op) = AggregateOp::from_name(name) {
        let opens = peek(alt((sym("("), keyword("by"), keyword("without"))))(rest);
        if opens.is_ok() {
            return aggregate_expr(op, rest);
        }
    }

    if let Ok((args, _)) = sym("(")(rest) {
        return call_expr(name, args);
    }

    let (rest, matchers) = opt(matcher_block)(rest)?;
    let selector = build_selector(start, Some(name), matchers.unwrap_or_default())?;
    Ok((rest, Expr::VectorSelector(selector)))
}

fn brace_selector(input: &str) -> PResult<'_, Expr> {
    let start = skipped(input);
    let (rest, matchers) = matcher_block(start)?;
    let selector = build_selector(start, None, matchers)?;
    Ok((rest, Expr::VectorSelector(selector)))
}

fn build_selector<'a>(
    at: &'a str,
    name: Option<&str>,
    matchers: Vec<LabelMatcher>,
) -> Result<VectorSelector, nom::Err<SyntaxError<'a>>> {
    if name.is_some() && matchers.iter().any(|m| m.name == METRIC_NAME) {
        return Err(SyntaxError::failure(at, "metric name must not be set twice"));
    }
    let selector = VectorSelector::new(name.map(String::from), matchers);
    if selector.matchers.iter().all(|m| m.matches_empty()) {
        return Err(SyntaxError::failure(
            at,
            "vector selector must contain at least one non-empty matcher",
        ));
    }
    Ok(selector)
}

fn matcher_block(input: &str) -> PResult<'_, Vec<LabelMatcher>> {
    let (input, _) = sym("{")(input)?;
    let (input, matchers) = separated_list0(sym(","), label_matcher)(input)?;
    let (input, _) = opt(sym(","))(input)?;
    let (input, _) = commit(context_sym("\"}\"", "}")(input))?;
    Ok((input, matchers))
}

fn match_op(input: &str) -> PResult<'_, MatchOp> {
    alt((
        value(MatchOp::RegexMatch, tag("=~")),
        value(MatchOp::RegexNoMatch, tag("!~")),
        value(MatchOp::NotEqual, tag("!=")),
        value(MatchOp::Equal, tag("=")),
    ))(input)
}

fn label_matcher(input: &str) -> PResult<'_, LabelMatcher> {
    let start = skipped(input);
    let (input, name) = label_name(start)?;
    let (input, op) = commit(nom::error::context(
        "label match operator",
        preceded(skip, match_op),
    )(input))?;
    let (input, value) = commit(nom::error::context(
        "quoted string",
        preceded(skip, string_literal),
    )(input))?;

    match LabelMatcher::new(op, name, value) {
        Ok(matcher) => Ok((input, matcher)),
        Err(e) => Err(SyntaxError::failure(
            start,
            format!("invalid regular expression in matcher: {}", e),
        )),
    }
}

fn aggregate_expr(op: AggregateOp, input: &str) -> PResult<'_, Expr> {
    let (input, leading) = opt(grouping)(input)?;
    let (input, _) = commit(context_sym("\"(\"", "(")(input))?;

    let (input, param) = if op.takes_param() {
        let (input, param) = commit(expr(input))?;
        let (input, _) = commit(context_sym("\",\"", ",")(input))?;
        (input, Some(Box::new(param)))
    } else {
        (input, None)
    };

    let (input, inner) = commit(expr(input))?;
    let (input, _) = commit(context_sym("\")\"", ")")(input))?;

    let (input, trailing) = if leading.is_none() {
        opt(grouping)(input)?
    } else {
        (input, None)
    };

    Ok((
        input,
        Expr::Aggregate(AggregateExpr {
            op,
            expr: Box::new(inner),
            param,
            grouping: leading.or(trailing).unwrap_or_default(),
        }),
    ))
}

fn grouping(input: &str) -> PResult<'_, Grouping> {
    alt((
        map(preceded(keyword("by"), cut(label_list)), Grouping::By),
        map(preceded(keyword("without"), cut(label_list)), Grouping::Without),
    ))(input)
}

fn call_expr<'a>(name: &str, input: &'a str) -> PResult<'a, Expr> {
    let (input, args) = separated_list0(sym(","), expr)(input)?;
    let (input, _) = commit(context_sym("\")\"", ")")(input))?;
    Ok((
        input,
        Expr::Call(Call {
            func: name.to_string(),
            args,
        }),
    ))
}
