//! The expression language used throughout format definitions to compute
//! sizes, offsets, availability, array dimensions, and detection
//! predicates.
//!
//! Expressions are trees of [`Expression`] nodes built through
//! [`Expression::new`] and the constant constructors; type checking
//! happens at construction time. Evaluation (in [`eval`]) runs against a
//! cursor position and may read the product and mutate product variables.

mod eval;

pub(crate) use eval::{parse_ascii_float, parse_ascii_integer};

use serde::Serialize;

use crate::error::{Error, Result};

/// Operation of an expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExprTag {
    Abs,
    Add,
    And,
    ArrayAdd,
    ArrayAll,
    ArrayCount,
    ArrayExists,
    ArrayIndex,
    ArrayMax,
    ArrayMin,
    AsciiLine,
    At,
    BitOffset,
    BitSize,
    ByteOffset,
    ByteSize,
    Bytes,
    Ceil,
    ConstantBoolean,
    ConstantFloat,
    ConstantInteger,
    ConstantRawString,
    ConstantString,
    Dim,
    Divide,
    Equal,
    Exists,
    FileSize,
    Filename,
    Float,
    Floor,
    For,
    ForIndex,
    Goto,
    GotoArrayElement,
    GotoAttribute,
    GotoBegin,
    GotoField,
    GotoHere,
    GotoParent,
    GotoRoot,
    Greater,
    GreaterEqual,
    If,
    Index,
    Integer,
    IsInf,
    IsMinInf,
    IsNan,
    IsPlusInf,
    Length,
    Less,
    LessEqual,
    LogicalAnd,
    LogicalOr,
    Ltrim,
    Max,
    Min,
    Modulo,
    Multiply,
    Neg,
    Not,
    NotEqual,
    NumDims,
    NumElements,
    Or,
    Power,
    ProductClass,
    ProductFormat,
    ProductType,
    ProductVersion,
    Regex,
    Round,
    Rtrim,
    Sequence,
    String,
    StrTime,
    Substr,
    Subtract,
    Time,
    Trim,
    VariableExists,
    VariableIndex,
    VariableSet,
    VariableValue,
    With,
}

/// What evaluating an expression yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultType {
    Boolean,
    Integer,
    Float,
    String,
    Void,
    Node,
}

impl ResultType {
    fn name(self) -> &'static str {
        match self {
            ResultType::Boolean => "boolean",
            ResultType::Integer => "integer",
            ResultType::Float => "float",
            ResultType::String => "string",
            ResultType::Void => "void",
            ResultType::Node => "node",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, ResultType::Integer | ResultType::Float)
    }
}

/// Value payload of a constant node. String constants compare by bytes
/// with explicit length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(Vec<u8>),
}

/// One node of an expression tree.
#[derive(Debug, Clone, Serialize)]
pub struct Expression {
    tag: ExprTag,
    result_type: ResultType,
    is_constant: bool,
    identifier: Option<std::string::String>,
    literal: Option<Literal>,
    operands: Vec<Expression>,
}

/// Structural equality: tags, identifiers (byte-for-byte), constant
/// values, and operands pairwise. Derived metadata is implied by these.
impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.identifier == other.identifier
            && self.literal == other.literal
            && self.operands == other.operands
    }
}

impl Expression {
    pub fn constant_boolean(value: bool) -> Expression {
        Expression {
            tag: ExprTag::ConstantBoolean,
            result_type: ResultType::Boolean,
            is_constant: true,
            identifier: None,
            literal: Some(Literal::Boolean(value)),
            operands: Vec::new(),
        }
    }

    pub fn constant_integer(value: i64) -> Expression {
        Expression {
            tag: ExprTag::ConstantInteger,
            result_type: ResultType::Integer,
            is_constant: true,
            identifier: None,
            literal: Some(Literal::Integer(value)),
            operands: Vec::new(),
        }
    }

    pub fn constant_float(value: f64) -> Expression {
        Expression {
            tag: ExprTag::ConstantFloat,
            result_type: ResultType::Float,
            is_constant: true,
            identifier: None,
            literal: Some(Literal::Float(value)),
            operands: Vec::new(),
        }
    }

    pub fn constant_string(value: impl Into<std::string::String>) -> Expression {
        Expression {
            tag: ExprTag::ConstantString,
            result_type: ResultType::String,
            is_constant: true,
            identifier: None,
            literal: Some(Literal::String(value.into().into_bytes())),
            operands: Vec::new(),
        }
    }

    pub fn constant_rawstring(value: Vec<u8>) -> Expression {
        Expression {
            tag: ExprTag::ConstantRawString,
            result_type: ResultType::String,
            is_constant: true,
            identifier: None,
            literal: Some(Literal::String(value)),
            operands: Vec::new(),
        }
    }

    /// Build an operation node. Operand result types are checked here and
    /// the node's result type is derived from them.
    pub fn new(
        tag: ExprTag,
        identifier: Option<std::string::String>,
        operands: Vec<Expression>,
    ) -> Result<Expression> {
        let result_type = infer_result_type(tag, &identifier, &operands)?;
        let is_constant = pure_tag(tag)
            && operands.iter().all(|op| op.is_constant)
            && result_type != ResultType::Void;
        Ok(Expression {
            tag,
            result_type,
            is_constant,
            identifier,
            literal: None,
            operands,
        })
    }

    pub fn tag(&self) -> ExprTag {
        self.tag
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    /// Whether this subtree can be evaluated without a product.
    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn literal(&self) -> Option<&Literal> {
        self.literal.as_ref()
    }

    pub fn operands(&self) -> &[Expression] {
        &self.operands
    }

    /// Behaviour-preserving constant folding: replace every constant
    /// subtree of scalar type by its pre-evaluated value.
    pub fn fold(self) -> Result<Expression> {
        if self.is_constant {
            match self.result_type {
                ResultType::Boolean => {
                    return Ok(Expression::constant_boolean(
                        self.eval_bool(None)?,
                    ));
                }
                ResultType::Integer => {
                    return Ok(Expression::constant_integer(
                        self.eval_integer(None)?,
                    ));
                }
                ResultType::Float => {
                    return Ok(Expression::constant_float(
                        self.eval_float(None)?,
                    ));
                }
                ResultType::String => {
                    return Ok(Expression::constant_rawstring(
                        self.eval_string(None)?,
                    ));
                }
                ResultType::Void | ResultType::Node => (),
            }
        }
        let Expression {
            tag,
            result_type,
            is_constant,
            identifier,
            literal,
            operands,
        } = self;
        let operands = operands
            .into_iter()
            .map(Expression::fold)
            .collect::<Result<Vec<_>>>()?;
        Ok(Expression {
            tag,
            result_type,
            is_constant,
            identifier,
            literal,
            operands,
        })
    }
}

fn want(
    tag: ExprTag,
    operands: &[Expression],
    index: usize,
    accepted: &[ResultType],
) -> Result<()> {
    let actual = operands[index].result_type;
    if accepted.contains(&actual) {
        return Ok(());
    }
    Err(Error::DataDefinition(format!(
        "invalid operand type ({}) for operand {index} of {tag:?} expression",
        actual.name()
    )))
}

fn want_arity(
    tag: ExprTag,
    operands: &[Expression],
    min: usize,
    max: usize,
) -> Result<()> {
    if operands.len() < min || operands.len() > max {
        return Err(Error::DataDefinition(format!(
            "invalid number of operands ({}) for {tag:?} expression",
            operands.len()
        )));
    }
    Ok(())
}

fn want_identifier(
    tag: ExprTag,
    identifier: &Option<std::string::String>,
) -> Result<()> {
    if identifier.is_none() {
        return Err(Error::DataDefinition(format!(
            "missing identifier for {tag:?} expression"
        )));
    }
    Ok(())
}

/// Numeric result of a binary operation: integer only when both operands
/// are integer.
fn numeric_pair(
    tag: ExprTag,
    operands: &[Expression],
) -> Result<ResultType> {
    want_arity(tag, operands, 2, 2)?;
    want(tag, operands, 0, &[ResultType::Integer, ResultType::Float])?;
    want(tag, operands, 1, &[ResultType::Integer, ResultType::Float])?;
    if operands[0].result_type == ResultType::Integer
        && operands[1].result_type == ResultType::Integer
    {
        Ok(ResultType::Integer)
    } else {
        Ok(ResultType::Float)
    }
}

fn infer_result_type(
    tag: ExprTag,
    identifier: &Option<std::string::String>,
    operands: &[Expression],
) -> Result<ResultType> {
    use ExprTag::*;
    use ResultType as RT;
    let num = &[RT::Integer, RT::Float][..];
    match tag {
        ConstantBoolean | ConstantInteger | ConstantFloat | ConstantString
        | ConstantRawString => Err(Error::DataDefinition(
            "constants are built through their own constructors".into(),
        )),

        Abs | Neg => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, num)?;
            Ok(operands[0].result_type)
        }
        Add | Subtract | Multiply | Divide | Modulo | Power | Min | Max => {
            numeric_pair(tag, operands)
        }
        Ceil | Floor => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Float])?;
            Ok(RT::Float)
        }
        Round => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Float])?;
            Ok(RT::Integer)
        }

        Equal | NotEqual | Less | LessEqual | Greater | GreaterEqual => {
            want_arity(tag, operands, 2, 2)?;
            let (a, b) =
                (operands[0].result_type, operands[1].result_type);
            let comparable = (a.is_numeric() && b.is_numeric())
                || (a == RT::String && b == RT::String)
                || (a == RT::Boolean
                    && b == RT::Boolean
                    && matches!(tag, Equal | NotEqual));
            if !comparable {
                return Err(Error::DataDefinition(format!(
                    "cannot compare {} against {} in {tag:?} expression",
                    a.name(),
                    b.name()
                )));
            }
            Ok(RT::Boolean)
        }
        And | Or => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Integer])?;
            want(tag, operands, 1, &[RT::Integer])?;
            Ok(RT::Integer)
        }
        Not => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Boolean])?;
            Ok(RT::Boolean)
        }
        LogicalAnd | LogicalOr => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Boolean])?;
            want(tag, operands, 1, &[RT::Boolean])?;
            Ok(RT::Boolean)
        }

        If => {
            want_arity(tag, operands, 3, 3)?;
            want(tag, operands, 0, &[RT::Boolean])?;
            let (a, b) =
                (operands[1].result_type, operands[2].result_type);
            if a == b {
                Ok(a)
            } else if a.is_numeric() && b.is_numeric() {
                Ok(RT::Float)
            } else {
                Err(Error::DataDefinition(format!(
                    "branches of if expression have incompatible types \
                     ({} and {})",
                    a.name(),
                    b.name()
                )))
            }
        }
        For => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 3, 3)?;
            want(tag, operands, 0, &[RT::Integer])?;
            want(tag, operands, 1, &[RT::Integer])?;
            want(tag, operands, 2, &[RT::Void])?;
            Ok(RT::Void)
        }
        With => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Integer])?;
            Ok(operands[1].result_type)
        }
        Sequence => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Void])?;
            want(tag, operands, 1, &[RT::Void])?;
            Ok(RT::Void)
        }

        GotoRoot | GotoHere | GotoBegin => {
            want_arity(tag, operands, 0, 0)?;
            Ok(RT::Node)
        }
        GotoParent => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Node])?;
            Ok(RT::Node)
        }
        GotoField | GotoAttribute => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Node])?;
            Ok(RT::Node)
        }
        GotoArrayElement => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Node])?;
            want(tag, operands, 1, &[RT::Integer])?;
            Ok(RT::Node)
        }
        Goto => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 0, 0)?;
            Ok(RT::Node)
        }
        At => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 1, 1)?;
            Ok(operands[0].result_type)
        }

        Exists => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Node])?;
            Ok(RT::Boolean)
        }
        NumElements | NumDims | BitSize | ByteSize | BitOffset
        | ByteOffset => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Node])?;
            Ok(RT::Integer)
        }
        Dim => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Node])?;
            want(tag, operands, 1, &[RT::Integer])?;
            Ok(RT::Integer)
        }
        FileSize | ProductVersion | Index => {
            want_arity(tag, operands, 0, 0)?;
            Ok(RT::Integer)
        }
        Filename | ProductClass | ProductType | ProductFormat => {
            want_arity(tag, operands, 0, 0)?;
            Ok(RT::String)
        }
        ForIndex => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 0, 0)?;
            Ok(RT::Integer)
        }

        ArrayAdd | ArrayMin | ArrayMax => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Node])?;
            want(tag, operands, 1, num)?;
            Ok(operands[1].result_type)
        }
        ArrayCount | ArrayIndex => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Node])?;
            want(tag, operands, 1, &[RT::Boolean])?;
            Ok(RT::Integer)
        }
        ArrayAll | ArrayExists => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::Node])?;
            want(tag, operands, 1, &[RT::Boolean])?;
            Ok(RT::Boolean)
        }

        String => {
            want_arity(tag, operands, 1, 2)?;
            want(tag, operands, 0, &[RT::Node])?;
            if operands.len() == 2 {
                want(tag, operands, 1, &[RT::Integer])?;
            }
            Ok(RT::String)
        }
        StrTime => {
            want_arity(tag, operands, 1, 2)?;
            want(tag, operands, 0, num)?;
            if operands.len() == 2 {
                want(tag, operands, 1, &[RT::String])?;
            }
            Ok(RT::String)
        }
        Substr => {
            want_arity(tag, operands, 3, 3)?;
            want(tag, operands, 0, &[RT::Integer])?;
            want(tag, operands, 1, &[RT::Integer])?;
            want(tag, operands, 2, &[RT::String])?;
            Ok(RT::String)
        }
        Ltrim | Rtrim | Trim => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::String])?;
            Ok(RT::String)
        }
        Length => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::String, RT::Node])?;
            Ok(RT::Integer)
        }
        Regex => {
            want_arity(tag, operands, 2, 3)?;
            want(tag, operands, 0, &[RT::String])?;
            want(tag, operands, 1, &[RT::String])?;
            if operands.len() == 3 {
                want(tag, operands, 2, &[RT::Integer])?;
                Ok(RT::String)
            } else {
                Ok(RT::Boolean)
            }
        }
        Bytes => {
            want_arity(tag, operands, 1, 3)?;
            want(tag, operands, 0, &[RT::Node])?;
            for index in 1..operands.len() {
                want(tag, operands, index, &[RT::Integer])?;
            }
            Ok(RT::String)
        }
        AsciiLine => {
            want_arity(tag, operands, 0, 1)?;
            if operands.len() == 1 {
                want(tag, operands, 0, &[RT::Boolean])?;
            }
            Ok(RT::String)
        }

        Integer => {
            want_arity(tag, operands, 1, 1)?;
            want(
                tag,
                operands,
                0,
                &[RT::String, RT::Integer, RT::Float, RT::Node],
            )?;
            Ok(RT::Integer)
        }
        Float => {
            want_arity(tag, operands, 1, 1)?;
            want(
                tag,
                operands,
                0,
                &[RT::String, RT::Integer, RT::Float, RT::Node],
            )?;
            Ok(RT::Float)
        }
        Time => {
            want_arity(tag, operands, 2, 2)?;
            want(tag, operands, 0, &[RT::String])?;
            want(tag, operands, 1, &[RT::String])?;
            Ok(RT::Float)
        }
        IsNan | IsInf | IsPlusInf | IsMinInf => {
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Float])?;
            Ok(RT::Boolean)
        }

        VariableExists => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 0, 0)?;
            Ok(RT::Boolean)
        }
        VariableValue => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 0, 1)?;
            if operands.len() == 1 {
                want(tag, operands, 0, &[RT::Integer])?;
            }
            Ok(RT::Integer)
        }
        VariableSet => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 1, 2)?;
            for index in 0..operands.len() {
                want(tag, operands, index, &[RT::Integer])?;
            }
            Ok(RT::Void)
        }
        VariableIndex => {
            want_identifier(tag, identifier)?;
            want_arity(tag, operands, 1, 1)?;
            want(tag, operands, 0, &[RT::Integer])?;
            Ok(RT::Integer)
        }
    }
}

/// Tags whose value depends only on their operands, never on a product.
fn pure_tag(tag: ExprTag) -> bool {
    use ExprTag::*;
    matches!(
        tag,
        Abs | Add
            | Subtract
            | Multiply
            | Divide
            | Modulo
            | Power
            | Neg
            | Ceil
            | Floor
            | Round
            | Min
            | Max
            | Equal
            | NotEqual
            | Less
            | LessEqual
            | Greater
            | GreaterEqual
            | And
            | Or
            | Not
            | LogicalAnd
            | LogicalOr
            | If
            | Substr
            | Ltrim
            | Rtrim
            | Trim
            | Regex
            | Integer
            | Float
            | Time
            | StrTime
            | IsNan
            | IsInf
            | IsPlusInf
            | IsMinInf
    ) || (tag == Length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(value: i64) -> Expression {
        Expression::constant_integer(value)
    }

    #[test]
    fn arithmetic_result_types() {
        let sum =
            Expression::new(ExprTag::Add, None, vec![int(1), int(2)]).unwrap();
        assert_eq!(sum.result_type(), ResultType::Integer);
        let mixed = Expression::new(
            ExprTag::Add,
            None,
            vec![int(1), Expression::constant_float(0.5)],
        )
        .unwrap();
        assert_eq!(mixed.result_type(), ResultType::Float);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = Expression::new(
            ExprTag::Add,
            None,
            vec![int(1), Expression::constant_string("x")],
        );
        assert!(err.is_err());
    }

    #[test]
    fn structural_equality_ignores_nothing_that_matters() {
        let a = Expression::new(
            ExprTag::Equal,
            None,
            vec![int(1), int(2)],
        )
        .unwrap();
        let b = Expression::new(
            ExprTag::Equal,
            None,
            vec![int(1), int(2)],
        )
        .unwrap();
        let c = Expression::new(
            ExprTag::Equal,
            None,
            vec![int(2), int(1)],
        )
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn equality_is_an_equivalence_relation() {
        let make = || {
            Expression::new(
                ExprTag::LogicalAnd,
                None,
                vec![
                    Expression::constant_boolean(true),
                    Expression::new(
                        ExprTag::Less,
                        None,
                        vec![int(1), int(2)],
                    )
                    .unwrap(),
                ],
            )
            .unwrap()
        };
        let (a, b, c) = (make(), make(), make());
        // reflexive, symmetric, transitive
        assert_eq!(a, a);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(b, c);
        assert_eq!(a, c);
    }

    #[test]
    fn constants_fold() {
        let expr = Expression::new(
            ExprTag::Multiply,
            None,
            vec![
                Expression::new(ExprTag::Add, None, vec![int(2), int(3)])
                    .unwrap(),
                int(4),
            ],
        )
        .unwrap();
        assert!(expr.is_constant());
        let folded = expr.fold().unwrap();
        assert_eq!(folded.tag(), ExprTag::ConstantInteger);
        assert_eq!(folded.literal(), Some(&Literal::Integer(20)));
    }

    #[test]
    fn goto_chain_builds_node_expression() {
        let root = Expression::new(ExprTag::GotoRoot, None, vec![]).unwrap();
        let field = Expression::new(
            ExprTag::GotoField,
            Some("mph".into()),
            vec![root],
        )
        .unwrap();
        let elem = Expression::new(
            ExprTag::GotoArrayElement,
            None,
            vec![field, int(3)],
        )
        .unwrap();
        assert_eq!(elem.result_type(), ResultType::Node);
        assert!(!elem.is_constant());
    }
}
