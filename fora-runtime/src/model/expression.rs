//! Quoted expressions.

use std::collections::BTreeSet;

use super::{depth_over, Node, NodeBody, Value};
use crate::serialize::{SerializeError, Wire, WireSink, WireSource};

/// A literal.
#[derive(Debug, Clone)]
pub struct ConstantExpr {
    /// The literal value.
    pub value: Value,
}

/// A variable reference.
#[derive(Debug, Clone)]
pub struct VariableExpr {
    /// Variable name.
    pub name: String,
}

/// `let name = bound in body`.
#[derive(Debug, Clone)]
pub struct LetExpr {
    /// Bound name.
    pub name: String,
    /// Bound value.
    pub bound: Expression,
    /// Scope of the binding.
    pub body: Expression,
}

/// Function application.
#[derive(Debug, Clone)]
pub struct ApplyExpr {
    /// Callee.
    pub function: Expression,
    /// Arguments.
    pub args: Vec<Expression>,
}

/// Tuple construction.
#[derive(Debug, Clone)]
pub struct TupleExpr {
    /// Elements.
    pub elements: Vec<Expression>,
}

/// Conditional.
#[derive(Debug, Clone)]
pub struct IfExpr {
    /// Condition.
    pub condition: Expression,
    /// Taken when true.
    pub then_branch: Expression,
    /// Taken when false.
    pub else_branch: Expression,
}

crate::tagged_union! {
    /// Structure of an [`Expression`].
    #[derive(Debug)]
    pub enum ExpressionBody: ExpressionTag {
        /// Literal.
        Constant(ConstantExpr),
        /// Variable.
        Variable(VariableExpr),
        /// Binding.
        Let(LetExpr),
        /// Application.
        Apply(ApplyExpr),
        /// Tuple.
        Tuple(TupleExpr),
        /// Conditional.
        If(IfExpr),
    }
}

/// A quoted expression.
pub type Expression = Node<ExpressionBody>;

impl NodeBody for ExpressionBody {
    const DOMAIN: &'static str = "fora.expression";

    fn encode<S: WireSink>(&self, sink: &mut S) {
        match self {
            ExpressionBody::Constant(c) => {
                sink.put_u8(0);
                c.value.encode(sink);
            }
            ExpressionBody::Variable(v) => {
                sink.put_u8(1);
                sink.put_str(&v.name);
            }
            ExpressionBody::Let(l) => {
                sink.put_u8(2);
                sink.put_str(&l.name);
                sink.put_expression(&l.bound);
                sink.put_expression(&l.body);
            }
            ExpressionBody::Apply(a) => {
                sink.put_u8(3);
                sink.put_expression(&a.function);
                a.args.encode(sink);
            }
            ExpressionBody::Tuple(t) => {
                sink.put_u8(4);
                t.elements.encode(sink);
            }
            ExpressionBody::If(i) => {
                sink.put_u8(5);
                sink.put_expression(&i.condition);
                sink.put_expression(&i.then_branch);
                sink.put_expression(&i.else_branch);
            }
        }
    }

    fn decode<R: WireSource>(source: &mut R) -> Result<Self, SerializeError> {
        Ok(match source.get_u8()? {
            0 => ExpressionBody::Constant(ConstantExpr {
                value: Value::decode(source)?,
            }),
            1 => ExpressionBody::Variable(VariableExpr { name: source.get_str()? }),
            2 => ExpressionBody::Let(LetExpr {
                name: source.get_str()?,
                bound: source.get_expression()?,
                body: source.get_expression()?,
            }),
            3 => ExpressionBody::Apply(ApplyExpr {
                function: source.get_expression()?,
                args: Vec::<Expression>::decode(source)?,
            }),
            4 => ExpressionBody::Tuple(TupleExpr {
                elements: Vec::<Expression>::decode(source)?,
            }),
            5 => ExpressionBody::If(IfExpr {
                condition: source.get_expression()?,
                then_branch: source.get_expression()?,
                else_branch: source.get_expression()?,
            }),
            tag => {
                return Err(SerializeError::InvalidTag {
                    what: "expression",
                    tag: tag.into(),
                })
            }
        })
    }

    fn depth(&self) -> u32 {
        match self {
            ExpressionBody::Constant(_) | ExpressionBody::Variable(_) => 0,
            ExpressionBody::Let(l) => depth_over([&l.bound, &l.body]),
            ExpressionBody::Apply(a) => depth_over(std::iter::once(&a.function).chain(&a.args)),
            ExpressionBody::Tuple(t) => depth_over(&t.elements),
            ExpressionBody::If(i) => depth_over([&i.condition, &i.then_branch, &i.else_branch]),
        }
    }
}

impl Expression {
    /// A literal.
    pub fn constant(value: Value) -> Expression {
        Expression::new(ExpressionBody::Constant(ConstantExpr { value }))
    }

    /// A variable reference.
    pub fn variable(name: impl Into<String>) -> Expression {
        Expression::new(ExpressionBody::Variable(VariableExpr { name: name.into() }))
    }

    /// `let name = bound in body`.
    pub fn let_in(name: impl Into<String>, bound: Expression, body: Expression) -> Expression {
        Expression::new(ExpressionBody::Let(LetExpr {
            name: name.into(),
            bound,
            body,
        }))
    }

    /// `function(args...)`.
    pub fn apply(function: Expression, args: Vec<Expression>) -> Expression {
        Expression::new(ExpressionBody::Apply(ApplyExpr { function, args }))
    }

    /// `(elements...)`.
    pub fn tuple(elements: Vec<Expression>) -> Expression {
        Expression::new(ExpressionBody::Tuple(TupleExpr { elements }))
    }

    /// `if condition then_branch else else_branch`.
    pub fn if_then_else(condition: Expression, then_branch: Expression, else_branch: Expression) -> Expression {
        Expression::new(ExpressionBody::If(IfExpr {
            condition,
            then_branch,
            else_branch,
        }))
    }

    /// Variables referenced but not bound inside this expression.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_free(&mut Vec::new(), &mut out);
        out
    }

    fn collect_free(&self, bound: &mut Vec<String>, out: &mut BTreeSet<String>) {
        match self.body() {
            ExpressionBody::Constant(_) => {}
            ExpressionBody::Variable(v) => {
                if !bound.contains(&v.name) {
                    out.insert(v.name.clone());
                }
            }
            ExpressionBody::Let(l) => {
                l.bound.collect_free(bound, out);
                bound.push(l.name.clone());
                l.body.collect_free(bound, out);
                bound.pop();
            }
            ExpressionBody::Apply(a) => {
                a.function.collect_free(bound, out);
                for arg in &a.args {
                    arg.collect_free(bound, out);
                }
            }
            ExpressionBody::Tuple(t) => {
                for e in &t.elements {
                    e.collect_free(bound, out);
                }
            }
            ExpressionBody::If(i) => {
                i.condition.collect_free(bound, out);
                i.then_branch.collect_free(bound, out);
                i.else_branch.collect_free(bound, out);
            }
        }
    }
}
