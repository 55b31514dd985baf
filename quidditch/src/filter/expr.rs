//! Scalar expression AST and evaluator.
//!
//! The tree is a tagged sum over a closed node set: constants, typed field
//! access, binary and unary operators, a ternary conditional and a fixed
//! function table. Evaluation is pure; arithmetic domain errors surface as
//! [`EvalError`] and are handled at the filter boundary.

use serde_json::Value;
use std::fmt;

/// Scalar value domain.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ExprValue {
    pub fn result_type(&self) -> ResultType {
        match self {
            ExprValue::Bool(_) => ResultType::Bool,
            ExprValue::Int(_) => ResultType::Int,
            ExprValue::Float(_) => ResultType::Float,
            ExprValue::Str(_) => ResultType::Str,
        }
    }

    /// Filter verdict of a final value.
    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Bool(b) => *b,
            ExprValue::Int(n) => *n != 0,
            ExprValue::Float(f) => *f != 0.0,
            ExprValue::Str(s) => !s.is_empty(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ExprValue::Int(n) => Some(*n as f64),
            ExprValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Static type of an expression node, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Bool,
    Int,
    Float,
    Str,
}

impl ResultType {
    /// The zero value a missing field evaluates to.
    pub fn zero(self) -> ExprValue {
        match self {
            ResultType::Bool => ExprValue::Bool(false),
            ResultType::Int => ExprValue::Int(0),
            ResultType::Float => ExprValue::Float(0.0),
            ResultType::Str => ExprValue::Str(String::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Abs,
    Sqrt,
    Min,
    Max,
    Floor,
    Ceil,
    Round,
    Log,
    Log10,
    Exp,
    Pow,
    Sin,
    Cos,
    Tan,
}

impl FuncKind {
    /// Arity check; Min/Max/Pow take two arguments, the rest one.
    pub fn arity(self) -> usize {
        match self {
            FuncKind::Min | FuncKind::Max | FuncKind::Pow => 2,
            _ => 1,
        }
    }
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(ExprValue),
    Field { name: String, ty: ResultType },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call { func: FuncKind, args: Vec<Expr> },
}

/// Per-document evaluation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError(pub String);

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EvalError {}

fn err<T>(msg: impl Into<String>) -> Result<T, EvalError> {
    Err(EvalError(msg.into()))
}

impl Expr {
    /// Static result type, used for the wire tag.
    pub fn result_type(&self) -> ResultType {
        match self {
            Expr::Const(value) => value.result_type(),
            Expr::Field { ty, .. } => *ty,
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::And
                | BinaryOp::Or => ResultType::Bool,
                BinaryOp::Pow => ResultType::Float,
                _ => {
                    if lhs.result_type() == ResultType::Int
                        && rhs.result_type() == ResultType::Int
                    {
                        ResultType::Int
                    } else {
                        ResultType::Float
                    }
                }
            },
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => ResultType::Bool,
                UnaryOp::Neg => expr.result_type(),
            },
            Expr::Conditional { then_expr, .. } => then_expr.result_type(),
            Expr::Call { func, args } => match func {
                FuncKind::Abs | FuncKind::Min | FuncKind::Max => {
                    if args.iter().all(|a| a.result_type() == ResultType::Int) {
                        ResultType::Int
                    } else {
                        ResultType::Float
                    }
                }
                _ => ResultType::Float,
            },
        }
    }

    /// Evaluate against one document's stored fields.
    pub fn eval(&self, doc: &Value) -> Result<ExprValue, EvalError> {
        match self {
            Expr::Const(value) => Ok(value.clone()),
            Expr::Field { name, ty } => Ok(field_value(doc, name, *ty)),
            Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, doc),
            Expr::Unary { op, expr } => match op {
                UnaryOp::Neg => match expr.eval(doc)? {
                    ExprValue::Int(n) => n
                        .checked_neg()
                        .map(ExprValue::Int)
                        .ok_or_else(|| EvalError("integer overflow in negate".into())),
                    ExprValue::Float(f) => Ok(ExprValue::Float(-f)),
                    other => err(format!("cannot negate {other:?}")),
                },
                UnaryOp::Not => match expr.eval(doc)? {
                    ExprValue::Bool(b) => Ok(ExprValue::Bool(!b)),
                    other => err(format!("cannot apply not to {other:?}")),
                },
            },
            Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            } => match cond.eval(doc)? {
                ExprValue::Bool(true) => then_expr.eval(doc),
                ExprValue::Bool(false) => else_expr.eval(doc),
                other => err(format!("conditional guard is not a bool: {other:?}")),
            },
            Expr::Call { func, args } => eval_call(*func, args, doc),
        }
    }
}

/// Pull a field out of a document, coerced to the declared type; missing
/// fields become the type's zero value.
fn field_value(doc: &Value, name: &str, ty: ResultType) -> ExprValue {
    let Some(raw) = doc.get(name) else {
        return ty.zero();
    };
    match (ty, raw) {
        (ResultType::Bool, Value::Bool(b)) => ExprValue::Bool(*b),
        (ResultType::Int, Value::Number(n)) => n
            .as_i64()
            .map(ExprValue::Int)
            .unwrap_or_else(|| ty.zero()),
        (ResultType::Float, Value::Number(n)) => n
            .as_f64()
            .map(ExprValue::Float)
            .unwrap_or_else(|| ty.zero()),
        (ResultType::Str, Value::String(s)) => ExprValue::Str(s.clone()),
        // Wrong-typed field data degrades to the zero value rather than
        // failing the whole document.
        _ => ty.zero(),
    }
}

fn eval_binary(op: BinaryOp, lhs: &Expr, rhs: &Expr, doc: &Value) -> Result<ExprValue, EvalError> {
    // Logical operators short-circuit.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let left = match lhs.eval(doc)? {
            ExprValue::Bool(b) => b,
            other => return err(format!("logical operand is not a bool: {other:?}")),
        };
        match (op, left) {
            (BinaryOp::And, false) => return Ok(ExprValue::Bool(false)),
            (BinaryOp::Or, true) => return Ok(ExprValue::Bool(true)),
            _ => {}
        }
        return match rhs.eval(doc)? {
            ExprValue::Bool(b) => Ok(ExprValue::Bool(b)),
            other => err(format!("logical operand is not a bool: {other:?}")),
        };
    }

    let left = lhs.eval(doc)?;
    let right = rhs.eval(doc)?;

    match op {
        BinaryOp::Eq => Ok(ExprValue::Bool(values_eq(&left, &right)?)),
        BinaryOp::Ne => Ok(ExprValue::Bool(!values_eq(&left, &right)?)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = values_cmp(&left, &right)?;
            Ok(ExprValue::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &left, &right)
        }
        BinaryOp::Pow => {
            let (a, b) = both_f64(&left, &right)?;
            Ok(ExprValue::Float(a.powf(b)))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn arithmetic(op: BinaryOp, left: &ExprValue, right: &ExprValue) -> Result<ExprValue, EvalError> {
    match (left, right) {
        (ExprValue::Int(a), ExprValue::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Sub => a.checked_sub(*b),
                BinaryOp::Mul => a.checked_mul(*b),
                BinaryOp::Div => {
                    if *b == 0 {
                        return err("division by zero");
                    }
                    a.checked_div(*b)
                }
                BinaryOp::Mod => {
                    if *b == 0 {
                        return err("modulo by zero");
                    }
                    a.checked_rem(*b)
                }
                _ => unreachable!(),
            };
            result
                .map(ExprValue::Int)
                .ok_or_else(|| EvalError("integer overflow".into()))
        }
        _ => {
            let (a, b) = both_f64(left, right)?;
            match op {
                BinaryOp::Add => Ok(ExprValue::Float(a + b)),
                BinaryOp::Sub => Ok(ExprValue::Float(a - b)),
                BinaryOp::Mul => Ok(ExprValue::Float(a * b)),
                BinaryOp::Div => {
                    if b == 0.0 {
                        err("division by zero")
                    } else {
                        Ok(ExprValue::Float(a / b))
                    }
                }
                BinaryOp::Mod => {
                    if b == 0.0 {
                        err("modulo by zero")
                    } else {
                        Ok(ExprValue::Float(a % b))
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}

fn values_eq(left: &ExprValue, right: &ExprValue) -> Result<bool, EvalError> {
    match (left, right) {
        (ExprValue::Bool(a), ExprValue::Bool(b)) => Ok(a == b),
        (ExprValue::Str(a), ExprValue::Str(b)) => Ok(a == b),
        _ => {
            let (a, b) = both_f64(left, right)?;
            Ok(a == b)
        }
    }
}

fn values_cmp(left: &ExprValue, right: &ExprValue) -> Result<std::cmp::Ordering, EvalError> {
    match (left, right) {
        (ExprValue::Str(a), ExprValue::Str(b)) => Ok(a.cmp(b)),
        _ => {
            let (a, b) = both_f64(left, right)?;
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError("incomparable values".into()))
        }
    }
}

fn both_f64(left: &ExprValue, right: &ExprValue) -> Result<(f64, f64), EvalError> {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => err(format!("expected numeric operands, got {left:?} and {right:?}")),
    }
}

fn eval_call(func: FuncKind, args: &[Expr], doc: &Value) -> Result<ExprValue, EvalError> {
    if args.len() != func.arity() {
        return err(format!(
            "{func:?} expects {} arguments, got {}",
            func.arity(),
            args.len()
        ));
    }

    // Integer-preserving functions.
    match func {
        FuncKind::Abs => {
            if let ExprValue::Int(n) = args[0].eval(doc)? {
                return n
                    .checked_abs()
                    .map(ExprValue::Int)
                    .ok_or_else(|| EvalError("integer overflow in abs".into()));
            }
        }
        FuncKind::Min | FuncKind::Max => {
            let a = args[0].eval(doc)?;
            let b = args[1].eval(doc)?;
            if let (ExprValue::Int(x), ExprValue::Int(y)) = (&a, &b) {
                let v = if func == FuncKind::Min {
                    (*x).min(*y)
                } else {
                    (*x).max(*y)
                };
                return Ok(ExprValue::Int(v));
            }
            let (x, y) = both_f64(&a, &b)?;
            let v = if func == FuncKind::Min { x.min(y) } else { x.max(y) };
            return Ok(ExprValue::Float(v));
        }
        _ => {}
    }

    let x = args[0]
        .eval(doc)?
        .as_f64()
        .ok_or_else(|| EvalError(format!("{func:?} expects a numeric argument")))?;

    let result = match func {
        FuncKind::Abs => x.abs(),
        FuncKind::Sqrt => {
            if x < 0.0 {
                return err("sqrt of a negative number");
            }
            x.sqrt()
        }
        FuncKind::Floor => x.floor(),
        FuncKind::Ceil => x.ceil(),
        FuncKind::Round => x.round(),
        FuncKind::Log => {
            if x <= 0.0 {
                return err("log of a non-positive number");
            }
            x.ln()
        }
        FuncKind::Log10 => {
            if x <= 0.0 {
                return err("log10 of a non-positive number");
            }
            x.log10()
        }
        FuncKind::Exp => x.exp(),
        FuncKind::Sin => x.sin(),
        FuncKind::Cos => x.cos(),
        FuncKind::Tan => x.tan(),
        FuncKind::Pow => {
            let y = args[1]
                .eval(doc)?
                .as_f64()
                .ok_or_else(|| EvalError("pow expects numeric arguments".into()))?;
            x.powf(y)
        }
        FuncKind::Min | FuncKind::Max => unreachable!("handled above"),
    };

    Ok(ExprValue::Float(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn int(n: i64) -> Expr {
        Expr::Const(ExprValue::Int(n))
    }

    fn float(f: f64) -> Expr {
        Expr::Const(ExprValue::Float(f))
    }

    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    #[test]
    fn test_integer_arithmetic() {
        let doc = json!({});
        assert_eq!(
            binary(BinaryOp::Add, int(2), int(3)).eval(&doc).unwrap(),
            ExprValue::Int(5)
        );
        assert_eq!(
            binary(BinaryOp::Div, int(7), int(2)).eval(&doc).unwrap(),
            ExprValue::Int(3)
        );
        assert_eq!(
            binary(BinaryOp::Mod, int(7), int(2)).eval(&doc).unwrap(),
            ExprValue::Int(1)
        );
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_float() {
        let doc = json!({});
        assert_eq!(
            binary(BinaryOp::Mul, int(2), float(1.5)).eval(&doc).unwrap(),
            ExprValue::Float(3.0)
        );
    }

    #[test]
    fn test_division_by_zero_fails() {
        let doc = json!({});
        assert!(binary(BinaryOp::Div, int(1), int(0)).eval(&doc).is_err());
        assert!(binary(BinaryOp::Div, float(1.0), float(0.0)).eval(&doc).is_err());
        assert!(binary(BinaryOp::Mod, int(1), int(0)).eval(&doc).is_err());
    }

    #[test]
    fn test_sqrt_and_log_domains() {
        let doc = json!({});
        assert!(Expr::Call {
            func: FuncKind::Sqrt,
            args: vec![float(-1.0)],
        }
        .eval(&doc)
        .is_err());
        assert!(Expr::Call {
            func: FuncKind::Log,
            args: vec![float(0.0)],
        }
        .eval(&doc)
        .is_err());
        assert_eq!(
            Expr::Call {
                func: FuncKind::Sqrt,
                args: vec![float(9.0)],
            }
            .eval(&doc)
            .unwrap(),
            ExprValue::Float(3.0)
        );
    }

    #[test]
    fn test_missing_field_is_type_zero() {
        let doc = json!({"present": 5});
        let expr = Expr::Field {
            name: "absent".into(),
            ty: ResultType::Int,
        };
        assert_eq!(expr.eval(&doc).unwrap(), ExprValue::Int(0));

        let expr = Expr::Field {
            name: "absent".into(),
            ty: ResultType::Str,
        };
        assert_eq!(expr.eval(&doc).unwrap(), ExprValue::Str(String::new()));
    }

    #[test]
    fn test_conditional() {
        let doc = json!({"stock": 3});
        let expr = Expr::Conditional {
            cond: Box::new(binary(
                BinaryOp::Gt,
                Expr::Field {
                    name: "stock".into(),
                    ty: ResultType::Int,
                },
                int(0),
            )),
            then_expr: Box::new(int(1)),
            else_expr: Box::new(int(0)),
        };
        assert_eq!(expr.eval(&doc).unwrap(), ExprValue::Int(1));
    }

    #[test]
    fn test_logical_short_circuit() {
        let doc = json!({});
        // false AND (1/0 > 0) must not evaluate the failing side.
        let failing = binary(BinaryOp::Gt, binary(BinaryOp::Div, int(1), int(0)), int(0));
        let expr = binary(BinaryOp::And, Expr::Const(ExprValue::Bool(false)), failing);
        assert_eq!(expr.eval(&doc).unwrap(), ExprValue::Bool(false));
    }

    #[test]
    fn test_string_comparison() {
        let doc = json!({"name": "widget"});
        let expr = binary(
            BinaryOp::Eq,
            Expr::Field {
                name: "name".into(),
                ty: ResultType::Str,
            },
            Expr::Const(ExprValue::Str("widget".into())),
        );
        assert_eq!(expr.eval(&doc).unwrap(), ExprValue::Bool(true));
    }

    #[test]
    fn test_result_type_inference() {
        assert_eq!(
            binary(BinaryOp::Add, int(1), int(2)).result_type(),
            ResultType::Int
        );
        assert_eq!(
            binary(BinaryOp::Add, int(1), float(2.0)).result_type(),
            ResultType::Float
        );
        assert_eq!(
            binary(BinaryOp::Lt, int(1), int(2)).result_type(),
            ResultType::Bool
        );
        assert_eq!(
            Expr::Call {
                func: FuncKind::Min,
                args: vec![int(1), int(2)],
            }
            .result_type(),
            ResultType::Int
        );
    }

    #[test]
    fn test_wrong_arity_fails() {
        let doc = json!({});
        let expr = Expr::Call {
            func: FuncKind::Pow,
            args: vec![float(2.0)],
        };
        assert!(expr.eval(&doc).is_err());
    }

    #[test]
    fn test_unary() {
        let doc = json!({});
        assert_eq!(
            Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(int(5)),
            }
            .eval(&doc)
            .unwrap(),
            ExprValue::Int(-5)
        );
        assert_eq!(
            Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(Expr::Const(ExprValue::Bool(false))),
            }
            .eval(&doc)
            .unwrap(),
            ExprValue::Bool(true)
        );
    }
}
