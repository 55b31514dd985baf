//! Byte serialization of filter expressions.
//!
//! Layout per node: one expression-tag byte, one result-type byte, then the
//! node payload. Strings are u32 length-prefixed; integers and floats are
//! fixed-width little-endian. The format carries no version header: every
//! node is self-describing, so decoding is unambiguous.

use super::expr::{BinaryOp, Expr, ExprValue, FuncKind, ResultType, UnaryOp};
use crate::error::{Error, Result};

const TAG_CONST: u8 = 0;
const TAG_FIELD: u8 = 1;
const TAG_BINARY: u8 = 2;
const TAG_UNARY: u8 = 3;
const TAG_CONDITIONAL: u8 = 4;
const TAG_CALL: u8 = 5;

/// Serialize an expression tree.
pub fn encode(expr: &Expr) -> Vec<u8> {
    let mut out = Vec::new();
    encode_node(expr, &mut out);
    out
}

fn encode_node(expr: &Expr, out: &mut Vec<u8>) {
    match expr {
        Expr::Const(value) => {
            out.push(TAG_CONST);
            out.push(type_tag(value.result_type()));
            match value {
                ExprValue::Bool(b) => out.push(*b as u8),
                ExprValue::Int(n) => out.extend_from_slice(&n.to_le_bytes()),
                ExprValue::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
                ExprValue::Str(s) => encode_str(s, out),
            }
        }
        Expr::Field { name, ty } => {
            out.push(TAG_FIELD);
            out.push(type_tag(*ty));
            encode_str(name, out);
        }
        Expr::Binary { op, lhs, rhs } => {
            out.push(TAG_BINARY);
            out.push(type_tag(expr.result_type()));
            out.push(binary_tag(*op));
            encode_node(lhs, out);
            encode_node(rhs, out);
        }
        Expr::Unary { op, expr: inner } => {
            out.push(TAG_UNARY);
            out.push(type_tag(expr.result_type()));
            out.push(match op {
                UnaryOp::Neg => 0,
                UnaryOp::Not => 1,
            });
            encode_node(inner, out);
        }
        Expr::Conditional {
            cond,
            then_expr,
            else_expr,
        } => {
            out.push(TAG_CONDITIONAL);
            out.push(type_tag(expr.result_type()));
            encode_node(cond, out);
            encode_node(then_expr, out);
            encode_node(else_expr, out);
        }
        Expr::Call { func, args } => {
            out.push(TAG_CALL);
            out.push(type_tag(expr.result_type()));
            out.push(func_tag(*func));
            out.push(args.len() as u8);
            for arg in args {
                encode_node(arg, out);
            }
        }
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Deserialize an expression tree, rejecting trailing garbage.
pub fn decode(bytes: &[u8]) -> Result<Expr> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let expr = decode_node(&mut cursor)?;
    if cursor.pos != bytes.len() {
        return Err(Error::ExprDecode(format!(
            "{} trailing bytes after expression",
            bytes.len() - cursor.pos
        )));
    }
    Ok(expr)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| Error::ExprDecode("unexpected end of expression bytes".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::ExprDecode(
                "unexpected end of expression bytes".into(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        let raw = self.take(8)?;
        Ok(i64::from_le_bytes(raw.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        let raw = self.take(8)?;
        Ok(f64::from_le_bytes(raw.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::ExprDecode("invalid utf-8 in expression string".into()))
    }
}

fn decode_node(cursor: &mut Cursor<'_>) -> Result<Expr> {
    let tag = cursor.byte()?;
    let ty = result_type(cursor.byte()?)?;
    match tag {
        TAG_CONST => {
            let value = match ty {
                ResultType::Bool => ExprValue::Bool(cursor.byte()? != 0),
                ResultType::Int => ExprValue::Int(cursor.i64()?),
                ResultType::Float => ExprValue::Float(cursor.f64()?),
                ResultType::Str => ExprValue::Str(cursor.string()?),
            };
            Ok(Expr::Const(value))
        }
        TAG_FIELD => Ok(Expr::Field {
            name: cursor.string()?,
            ty,
        }),
        TAG_BINARY => {
            let op = binary_op(cursor.byte()?)?;
            let lhs = Box::new(decode_node(cursor)?);
            let rhs = Box::new(decode_node(cursor)?);
            Ok(Expr::Binary { op, lhs, rhs })
        }
        TAG_UNARY => {
            let op = match cursor.byte()? {
                0 => UnaryOp::Neg,
                1 => UnaryOp::Not,
                other => {
                    return Err(Error::ExprDecode(format!("unknown unary op tag {other}")))
                }
            };
            Ok(Expr::Unary {
                op,
                expr: Box::new(decode_node(cursor)?),
            })
        }
        TAG_CONDITIONAL => {
            let cond = Box::new(decode_node(cursor)?);
            let then_expr = Box::new(decode_node(cursor)?);
            let else_expr = Box::new(decode_node(cursor)?);
            Ok(Expr::Conditional {
                cond,
                then_expr,
                else_expr,
            })
        }
        TAG_CALL => {
            let func = func_kind(cursor.byte()?)?;
            let argc = cursor.byte()? as usize;
            if argc != func.arity() {
                return Err(Error::ExprDecode(format!(
                    "{func:?} encoded with {argc} arguments"
                )));
            }
            let mut args = Vec::with_capacity(argc);
            for _ in 0..argc {
                args.push(decode_node(cursor)?);
            }
            Ok(Expr::Call { func, args })
        }
        other => Err(Error::ExprDecode(format!("unknown expression tag {other}"))),
    }
}

fn type_tag(ty: ResultType) -> u8 {
    match ty {
        ResultType::Bool => 0,
        ResultType::Int => 1,
        ResultType::Float => 2,
        ResultType::Str => 3,
    }
}

fn result_type(tag: u8) -> Result<ResultType> {
    match tag {
        0 => Ok(ResultType::Bool),
        1 => Ok(ResultType::Int),
        2 => Ok(ResultType::Float),
        3 => Ok(ResultType::Str),
        other => Err(Error::ExprDecode(format!("unknown result type tag {other}"))),
    }
}

fn binary_tag(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Mod => 4,
        BinaryOp::Pow => 5,
        BinaryOp::Eq => 6,
        BinaryOp::Ne => 7,
        BinaryOp::Lt => 8,
        BinaryOp::Le => 9,
        BinaryOp::Gt => 10,
        BinaryOp::Ge => 11,
        BinaryOp::And => 12,
        BinaryOp::Or => 13,
    }
}

fn binary_op(tag: u8) -> Result<BinaryOp> {
    Ok(match tag {
        0 => BinaryOp::Add,
        1 => BinaryOp::Sub,
        2 => BinaryOp::Mul,
        3 => BinaryOp::Div,
        4 => BinaryOp::Mod,
        5 => BinaryOp::Pow,
        6 => BinaryOp::Eq,
        7 => BinaryOp::Ne,
        8 => BinaryOp::Lt,
        9 => BinaryOp::Le,
        10 => BinaryOp::Gt,
        11 => BinaryOp::Ge,
        12 => BinaryOp::And,
        13 => BinaryOp::Or,
        other => {
            return Err(Error::ExprDecode(format!("unknown binary op tag {other}")));
        }
    })
}

fn func_tag(func: FuncKind) -> u8 {
    match func {
        FuncKind::Abs => 0,
        FuncKind::Sqrt => 1,
        FuncKind::Min => 2,
        FuncKind::Max => 3,
        FuncKind::Floor => 4,
        FuncKind::Ceil => 5,
        FuncKind::Round => 6,
        FuncKind::Log => 7,
        FuncKind::Log10 => 8,
        FuncKind::Exp => 9,
        FuncKind::Pow => 10,
        FuncKind::Sin => 11,
        FuncKind::Cos => 12,
        FuncKind::Tan => 13,
    }
}

fn func_kind(tag: u8) -> Result<FuncKind> {
    Ok(match tag {
        0 => FuncKind::Abs,
        1 => FuncKind::Sqrt,
        2 => FuncKind::Min,
        3 => FuncKind::Max,
        4 => FuncKind::Floor,
        5 => FuncKind::Ceil,
        6 => FuncKind::Round,
        7 => FuncKind::Log,
        8 => FuncKind::Log10,
        9 => FuncKind::Exp,
        10 => FuncKind::Pow,
        11 => FuncKind::Sin,
        12 => FuncKind::Cos,
        13 => FuncKind::Tan,
        other => {
            return Err(Error::ExprDecode(format!("unknown function tag {other}")));
        }
    })
}
