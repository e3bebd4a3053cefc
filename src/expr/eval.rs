//! Expression evaluation against a cursor position.
//!
//! Every evaluation owns a scratch clone of the caller's cursor; node
//! operations move that clone around, so the caller's position is never
//! disturbed (except by [`Expression::eval_node`], whose purpose is the
//! move). Product variables are reached through the cursor's product and
//! may be mutated by `variable_set`.

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::expr::{ExprTag, Expression, Literal, ResultType};
use crate::timeutil;

struct Env<'p> {
    cursor: Option<Cursor<'p>>,
    bindings: Vec<(String, i64)>,
}

impl<'p> Env<'p> {
    fn new(cursor: Option<&Cursor<'p>>) -> Self {
        Env {
            cursor: cursor.cloned(),
            bindings: Vec::new(),
        }
    }

    fn cursor(&mut self) -> Result<&mut Cursor<'p>> {
        self.cursor.as_mut().ok_or_else(|| {
            Error::InvalidArgument(
                "expression can not be evaluated without a product cursor"
                    .into(),
            )
        })
    }

    fn lookup(&self, name: &str) -> Result<i64> {
        self.bindings
            .iter()
            .rev()
            .find(|(binding, _)| binding == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                Error::InvalidName(format!(
                    "index variable '{name}' is not defined"
                ))
            })
    }
}

impl Expression {
    pub fn eval_bool(&self, cursor: Option<&Cursor>) -> Result<bool> {
        bool_(self, &mut Env::new(cursor))
    }

    pub fn eval_integer(&self, cursor: Option<&Cursor>) -> Result<i64> {
        int(self, &mut Env::new(cursor))
    }

    pub fn eval_float(&self, cursor: Option<&Cursor>) -> Result<f64> {
        float(self, &mut Env::new(cursor))
    }

    pub fn eval_string(&self, cursor: Option<&Cursor>) -> Result<Vec<u8>> {
        string(self, &mut Env::new(cursor))
    }

    pub fn eval_void(&self, cursor: &Cursor) -> Result<()> {
        void(self, &mut Env::new(Some(cursor)))
    }

    /// Evaluate a node expression, moving `cursor` to the resulting
    /// position.
    pub fn eval_node(&self, cursor: &mut Cursor) -> Result<()> {
        let mut env = Env::new(Some(cursor));
        node(self, &mut env)?;
        *cursor = env.cursor.unwrap();
        Ok(())
    }
}

/// Evaluate a numeric operand of either flavour as f64.
fn numeric<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<f64> {
    match expr.result_type() {
        ResultType::Integer => int(expr, env).map(|value| value as f64),
        _ => float(expr, env),
    }
}

fn int<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<i64> {
    use ExprTag::*;
    let ops = expr.operands();
    match expr.tag() {
        ConstantInteger => match expr.literal() {
            Some(Literal::Integer(value)) => Ok(*value),
            _ => unreachable!(),
        },
        Abs => int(&ops[0], env)?.checked_abs().ok_or_else(overflow),
        Neg => int(&ops[0], env)?.checked_neg().ok_or_else(overflow),
        Add => int(&ops[0], env)?
            .checked_add(int(&ops[1], env)?)
            .ok_or_else(overflow),
        Subtract => int(&ops[0], env)?
            .checked_sub(int(&ops[1], env)?)
            .ok_or_else(overflow),
        Multiply => int(&ops[0], env)?
            .checked_mul(int(&ops[1], env)?)
            .ok_or_else(overflow),
        Divide => {
            let denominator = int(&ops[1], env)?;
            if denominator == 0 {
                return Err(Error::Product("division by 0".into()));
            }
            Ok(int(&ops[0], env)? / denominator)
        }
        Modulo => {
            let denominator = int(&ops[1], env)?;
            if denominator == 0 {
                return Err(Error::Product("modulo by 0".into()));
            }
            Ok(int(&ops[0], env)? % denominator)
        }
        Power => {
            let base = int(&ops[0], env)?;
            let exponent = int(&ops[1], env)?;
            if exponent < 0 {
                return Err(Error::Product(format!(
                    "negative exponent ({exponent}) for integer power"
                )));
            }
            let exponent = u32::try_from(exponent).map_err(|_| overflow())?;
            base.checked_pow(exponent).ok_or_else(overflow)
        }
        Min => Ok(int(&ops[0], env)?.min(int(&ops[1], env)?)),
        Max => Ok(int(&ops[0], env)?.max(int(&ops[1], env)?)),
        Round => {
            let value = float(&ops[0], env)?;
            if !value.is_finite() {
                return Err(Error::Product(format!(
                    "cannot round ({value}) to an integer"
                )));
            }
            Ok(value.round() as i64)
        }
        If => {
            if bool_(&ops[0], env)? {
                int(&ops[1], env)
            } else {
                int(&ops[2], env)
            }
        }
        With => with(expr, env, int),
        At => at(expr, env, int),
        And => Ok(int(&ops[0], env)? & int(&ops[1], env)?),
        Or => Ok(int(&ops[0], env)? | int(&ops[1], env)?),
        Integer => match ops[0].result_type() {
            ResultType::String => {
                let text = string(&ops[0], env)?;
                parse_ascii_integer(&text)
            }
            ResultType::Integer => int(&ops[0], env),
            ResultType::Node => {
                let mut sub_env = env.fork()?;
                node(&ops[0], &mut sub_env)?;
                sub_env.cursor()?.read_int64()
            }
            _ => {
                let value = float(&ops[0], env)?;
                if value.is_nan() {
                    return Err(Error::Product(
                        "cannot convert NaN to an integer".into(),
                    ));
                }
                Ok(value as i64)
            }
        },
        Length => match ops[0].result_type() {
            ResultType::String => Ok(string(&ops[0], env)?.len() as i64),
            _ => {
                let mut sub_env = env.fork()?;
                node(&ops[0], &mut sub_env)?;
                sub_env.cursor()?.get_string_length()
            }
        },
        NumElements => reflect(expr, env, |cursor| cursor.get_num_elements()),
        NumDims => reflect(expr, env, |cursor| {
            Ok(cursor.get_array_dim()?.len() as i64)
        }),
        Dim => {
            let index = int(&ops[1], env)?;
            reflect(expr, env, |cursor| {
                let dims = cursor.get_array_dim()?;
                dims.get(index as usize).copied().ok_or_else(|| {
                    Error::InvalidIndex(format!(
                        "dimension index ({index}) is not in the range \
                         [0,{})",
                        dims.len()
                    ))
                })
            })
        }
        BitSize => reflect(expr, env, |cursor| cursor.get_bit_size()),
        ByteSize => reflect(expr, env, |cursor| cursor.get_byte_size()),
        BitOffset => reflect(expr, env, |cursor| Ok(cursor.get_file_bit_offset())),
        ByteOffset => {
            reflect(expr, env, |cursor| Ok(cursor.get_file_bit_offset() >> 3))
        }
        FileSize => Ok(env.cursor()?.product().file_size()),
        ProductVersion => {
            let product = env.cursor()?.product();
            product
                .definition()
                .map(|definition| definition.version() as i64)
                .ok_or_else(|| {
                    Error::Product(
                        "product has no definition bound".into(),
                    )
                })
        }
        Index => Ok(env.cursor()?.index() as i64),
        ForIndex => env.lookup(expr.identifier().unwrap()),
        ArrayAdd => array_fold_int(expr, env, 0, |acc, v| {
            acc.checked_add(v).ok_or_else(overflow)
        }),
        ArrayMin => array_extreme_int(expr, env, i64::min),
        ArrayMax => array_extreme_int(expr, env, i64::max),
        ArrayCount => {
            let mut count = 0;
            array_for_each(expr, env, |sub_env| {
                if bool_(&expr.operands()[1], sub_env)? {
                    count += 1;
                }
                Ok(true)
            })?;
            Ok(count)
        }
        ArrayIndex => {
            let mut found = -1;
            let mut index = 0;
            array_for_each(expr, env, |sub_env| {
                if bool_(&expr.operands()[1], sub_env)? {
                    found = index;
                    return Ok(false);
                }
                index += 1;
                Ok(true)
            })?;
            Ok(found)
        }
        VariableValue => {
            let name = expr.identifier().unwrap();
            let index = match ops.first() {
                Some(op) => int(op, env)?,
                None => 0,
            };
            env.cursor()?.product().variable_value(name, index)
        }
        VariableIndex => {
            let name = expr.identifier().unwrap();
            let value = int(&ops[0], env)?;
            env.cursor()?.product().variable_index(name, value)
        }
        tag => Err(Error::InvalidType(format!(
            "expression tag {tag:?} does not yield an integer"
        ))),
    }
}

fn float<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<f64> {
    use ExprTag::*;
    let ops = expr.operands();
    if expr.result_type() == ResultType::Integer {
        return int(expr, env).map(|value| value as f64);
    }
    match expr.tag() {
        ConstantFloat => match expr.literal() {
            Some(Literal::Float(value)) => Ok(*value),
            _ => unreachable!(),
        },
        Abs => Ok(numeric(&ops[0], env)?.abs()),
        Neg => Ok(-numeric(&ops[0], env)?),
        Add => Ok(numeric(&ops[0], env)? + numeric(&ops[1], env)?),
        Subtract => Ok(numeric(&ops[0], env)? - numeric(&ops[1], env)?),
        Multiply => Ok(numeric(&ops[0], env)? * numeric(&ops[1], env)?),
        Divide => {
            let denominator = numeric(&ops[1], env)?;
            if denominator == 0.0 {
                return Err(Error::Product("division by 0".into()));
            }
            Ok(numeric(&ops[0], env)? / denominator)
        }
        Modulo => {
            let denominator = numeric(&ops[1], env)?;
            if denominator == 0.0 {
                return Err(Error::Product("modulo by 0".into()));
            }
            Ok(numeric(&ops[0], env)? % denominator)
        }
        Power => Ok(numeric(&ops[0], env)?.powf(numeric(&ops[1], env)?)),
        Min => Ok(numeric(&ops[0], env)?.min(numeric(&ops[1], env)?)),
        Max => Ok(numeric(&ops[0], env)?.max(numeric(&ops[1], env)?)),
        Ceil => Ok(float(&ops[0], env)?.ceil()),
        Floor => Ok(float(&ops[0], env)?.floor()),
        If => {
            if bool_(&ops[0], env)? {
                numeric(&ops[1], env)
            } else {
                numeric(&ops[2], env)
            }
        }
        With => with(expr, env, numeric),
        At => at(expr, env, numeric),
        Float => match ops[0].result_type() {
            ResultType::String => {
                let text = string(&ops[0], env)?;
                parse_ascii_float(&text)
            }
            ResultType::Node => {
                let mut sub_env = env.fork()?;
                node(&ops[0], &mut sub_env)?;
                sub_env.cursor()?.read_double()
            }
            _ => numeric(&ops[0], env),
        },
        Time => {
            let value = string(&ops[0], env)?;
            let pattern = string(&ops[1], env)?;
            timeutil::parse(&std::string::String::from_utf8_lossy(&pattern), &value)
        }
        ArrayAdd => {
            let mut sum = 0.0;
            array_for_each(expr, env, |sub_env| {
                sum += numeric(&expr.operands()[1], sub_env)?;
                Ok(true)
            })?;
            Ok(sum)
        }
        ArrayMin => array_extreme_float(expr, env, f64::min),
        ArrayMax => array_extreme_float(expr, env, f64::max),
        tag => Err(Error::InvalidType(format!(
            "expression tag {tag:?} does not yield a float"
        ))),
    }
}

fn bool_<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<bool> {
    use ExprTag::*;
    let ops = expr.operands();
    match expr.tag() {
        ConstantBoolean => match expr.literal() {
            Some(Literal::Boolean(value)) => Ok(*value),
            _ => unreachable!(),
        },
        Not => Ok(!bool_(&ops[0], env)?),
        LogicalAnd => Ok(bool_(&ops[0], env)? && bool_(&ops[1], env)?),
        LogicalOr => Ok(bool_(&ops[0], env)? || bool_(&ops[1], env)?),
        Equal | NotEqual | Less | LessEqual | Greater | GreaterEqual => {
            compare(expr, env)
        }
        If => {
            if bool_(&ops[0], env)? {
                bool_(&ops[1], env)
            } else {
                bool_(&ops[2], env)
            }
        }
        With => with(expr, env, bool_),
        At => at(expr, env, bool_),
        Exists => {
            let mut sub_env = env.fork()?;
            Ok(node(&ops[0], &mut sub_env).is_ok())
        }
        IsNan => Ok(float(&ops[0], env)?.is_nan()),
        IsInf => Ok(float(&ops[0], env)?.is_infinite()),
        IsPlusInf => {
            let value = float(&ops[0], env)?;
            Ok(value.is_infinite() && value.is_sign_positive())
        }
        IsMinInf => {
            let value = float(&ops[0], env)?;
            Ok(value.is_infinite() && value.is_sign_negative())
        }
        Regex => {
            let regex = build_regex(&ops[0], env)?;
            let subject = string(&ops[1], env)?;
            Ok(regex.is_match(&std::string::String::from_utf8_lossy(&subject)))
        }
        ArrayAll => {
            let mut all = true;
            array_for_each(expr, env, |sub_env| {
                if !bool_(&expr.operands()[1], sub_env)? {
                    all = false;
                    return Ok(false);
                }
                Ok(true)
            })?;
            Ok(all)
        }
        ArrayExists => {
            let mut any = false;
            array_for_each(expr, env, |sub_env| {
                if bool_(&expr.operands()[1], sub_env)? {
                    any = true;
                    return Ok(false);
                }
                Ok(true)
            })?;
            Ok(any)
        }
        VariableExists => {
            let name = expr.identifier().unwrap();
            Ok(env.cursor()?.product().variable_exists(name))
        }
        tag => Err(Error::InvalidType(format!(
            "expression tag {tag:?} does not yield a boolean"
        ))),
    }
}

fn string<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<Vec<u8>> {
    use ExprTag::*;
    let ops = expr.operands();
    match expr.tag() {
        ConstantString | ConstantRawString => match expr.literal() {
            Some(Literal::String(value)) => Ok(value.clone()),
            _ => unreachable!(),
        },
        If => {
            if bool_(&ops[0], env)? {
                string(&ops[1], env)
            } else {
                string(&ops[2], env)
            }
        }
        With => with(expr, env, string),
        At => at(expr, env, string),
        String => {
            let mut sub_env = env.fork()?;
            node(&ops[0], &mut sub_env)?;
            let max = match ops.get(1) {
                Some(op) => Some(int(op, env)?),
                None => None,
            };
            sub_env.cursor()?.read_string_n(max)
        }
        Bytes => {
            let mut sub_env = env.fork()?;
            node(&ops[0], &mut sub_env)?;
            let offset = match ops.get(1) {
                Some(op) => int(op, env)?,
                None => 0,
            };
            let length = match ops.get(2) {
                Some(op) => int(op, env)?,
                None => {
                    let cursor = sub_env.cursor()?;
                    cursor.get_byte_size()? - offset
                }
            };
            sub_env.cursor()?.read_raw_bytes(offset, length)
        }
        AsciiLine => {
            let include_eol = match ops.first() {
                Some(op) => bool_(op, env)?,
                None => false,
            };
            env.cursor()?.read_ascii_line(include_eol)
        }
        Substr => {
            let start = int(&ops[0], env)?;
            let length = int(&ops[1], env)?;
            let text = string(&ops[2], env)?;
            if start < 0 || length < 0 {
                return Err(Error::InvalidArgument(format!(
                    "invalid substr range ({start},{length})"
                )));
            }
            let start = (start as usize).min(text.len());
            let end = (start + length as usize).min(text.len());
            Ok(text[start..end].to_vec())
        }
        Ltrim => {
            let mut text = string(&ops[0], env)?;
            let skip =
                text.iter().take_while(|b| b.is_ascii_whitespace()).count();
            text.drain(..skip);
            Ok(text)
        }
        Rtrim => {
            let mut text = string(&ops[0], env)?;
            while text.last().is_some_and(u8::is_ascii_whitespace) {
                text.pop();
            }
            Ok(text)
        }
        Trim => {
            let mut text = string(&ops[0], env)?;
            while text.last().is_some_and(u8::is_ascii_whitespace) {
                text.pop();
            }
            let skip =
                text.iter().take_while(|b| b.is_ascii_whitespace()).count();
            text.drain(..skip);
            Ok(text)
        }
        StrTime => {
            let seconds = numeric(&ops[0], env)?;
            let pattern = match ops.get(1) {
                Some(op) => std::string::String::from_utf8_lossy(&string(op, env)?)
                    .into_owned(),
                None => timeutil::DEFAULT_PATTERN.to_owned(),
            };
            timeutil::format(&pattern, seconds).map(std::string::String::into_bytes)
        }
        Regex => {
            let regex = build_regex(&ops[0], env)?;
            let subject = string(&ops[1], env)?;
            let subject = std::string::String::from_utf8_lossy(&subject).into_owned();
            let group = int(&ops[2], env)?;
            let captures = regex.captures(&subject);
            Ok(captures
                .and_then(|captures| captures.get(group as usize))
                .map(|capture| capture.as_str().as_bytes().to_vec())
                .unwrap_or_default())
        }
        Filename => {
            let product = env.cursor()?.product();
            Ok(product.filename_string().into_bytes())
        }
        ProductClass => product_info(env, |product| {
            product.class_name().map(str::to_owned)
        }),
        ProductType => product_info(env, |product| {
            product.type_name().map(str::to_owned)
        }),
        ProductFormat => {
            let product = env.cursor()?.product();
            Ok(product.format().name().as_bytes().to_vec())
        }
        tag => Err(Error::InvalidType(format!(
            "expression tag {tag:?} does not yield a string"
        ))),
    }
}

fn void<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<()> {
    use ExprTag::*;
    let ops = expr.operands();
    match expr.tag() {
        Sequence => {
            void(&ops[0], env)?;
            void(&ops[1], env)
        }
        For => {
            let start = int(&ops[0], env)?;
            let end = int(&ops[1], env)?;
            let name = expr.identifier().unwrap().to_owned();
            env.bindings.push((name, start));
            let result = (|| {
                for value in start..=end {
                    env.bindings.last_mut().unwrap().1 = value;
                    void(&ops[2], env)?;
                }
                Ok(())
            })();
            env.bindings.pop();
            result
        }
        With => with(expr, env, void),
        At => at(expr, env, void),
        If => {
            if bool_(&ops[0], env)? {
                void(&ops[1], env)
            } else {
                void(&ops[2], env)
            }
        }
        VariableSet => {
            let name = expr.identifier().unwrap();
            let (index, value) = if ops.len() == 2 {
                (int(&ops[0], env)?, int(&ops[1], env)?)
            } else {
                (0, int(&ops[0], env)?)
            };
            env.cursor()?.product().variable_set(name, index, value)
        }
        tag => Err(Error::InvalidType(format!(
            "expression tag {tag:?} is not a void expression"
        ))),
    }
}

fn node<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<()> {
    use ExprTag::*;
    let ops = expr.operands();
    match expr.tag() {
        GotoHere => Ok(()),
        GotoRoot | GotoBegin => env.cursor()?.goto_root(),
        GotoParent => {
            node(&ops[0], env)?;
            env.cursor()?.goto_parent()
        }
        GotoField => {
            node(&ops[0], env)?;
            let name = expr.identifier().unwrap().to_owned();
            env.cursor()?.goto_record_field_by_name(&name)
        }
        GotoAttribute => {
            node(&ops[0], env)?;
            let name = expr.identifier().unwrap().to_owned();
            let cursor = env.cursor()?;
            cursor.goto_attributes()?;
            cursor.goto_record_field_by_name(&name)
        }
        GotoArrayElement => {
            node(&ops[0], env)?;
            let index = int(&ops[1], env)?;
            env.cursor()?.goto_array_element_by_index(index)
        }
        Goto => {
            let path = expr.identifier().unwrap().to_owned();
            env.cursor()?.goto(&path)
        }
        tag => Err(Error::InvalidType(format!(
            "expression tag {tag:?} is not a node expression"
        ))),
    }
}

impl<'p> Env<'p> {
    /// A child environment sharing the bindings but owning a cursor copy.
    fn fork(&mut self) -> Result<Env<'p>> {
        Ok(Env {
            cursor: Some(self.cursor()?.clone()),
            bindings: self.bindings.clone(),
        })
    }
}

fn with<'p, T>(
    expr: &Expression,
    env: &mut Env<'p>,
    body: impl FnOnce(&Expression, &mut Env<'p>) -> Result<T>,
) -> Result<T> {
    let value = int(&expr.operands()[0], env)?;
    let name = expr.identifier().unwrap().to_owned();
    env.bindings.push((name, value));
    let result = body(&expr.operands()[1], env);
    env.bindings.pop();
    result
}

fn at<'p, T>(
    expr: &Expression,
    env: &mut Env<'p>,
    body: impl FnOnce(&Expression, &mut Env<'p>) -> Result<T>,
) -> Result<T> {
    let mut sub_env = env.fork()?;
    let path = expr.identifier().unwrap();
    sub_env.cursor()?.goto(path)?;
    body(&expr.operands()[0], &mut sub_env)
}

fn reflect<'p>(
    expr: &Expression,
    env: &mut Env<'p>,
    get: impl FnOnce(&mut Cursor<'p>) -> Result<i64>,
) -> Result<i64> {
    let mut sub_env = env.fork()?;
    node(&expr.operands()[0], &mut sub_env)?;
    get(sub_env.cursor()?)
}

/// Position a child environment at each element of the array denoted by
/// operand 0 and hand it to `visit`; `visit` returning false stops the
/// walk early.
fn array_for_each<'p>(
    expr: &Expression,
    env: &mut Env<'p>,
    mut visit: impl FnMut(&mut Env<'p>) -> Result<bool>,
) -> Result<()> {
    let mut array_env = env.fork()?;
    node(&expr.operands()[0], &mut array_env)?;
    let num_elements = array_env.cursor()?.get_num_elements()?;
    if num_elements == 0 {
        return Ok(());
    }
    array_env.cursor()?.goto_first_array_element()?;
    for index in 0..num_elements {
        if !visit(&mut array_env)? {
            return Ok(());
        }
        if index + 1 < num_elements {
            array_env.cursor()?.goto_next_array_element()?;
        }
    }
    Ok(())
}

fn array_fold_int<'p>(
    expr: &Expression,
    env: &mut Env<'p>,
    init: i64,
    mut fold: impl FnMut(i64, i64) -> Result<i64>,
) -> Result<i64> {
    let mut acc = init;
    array_for_each(expr, env, |sub_env| {
        let value = int(&expr.operands()[1], sub_env)?;
        acc = fold(acc, value)?;
        Ok(true)
    })?;
    Ok(acc)
}

fn array_extreme_int<'p>(
    expr: &Expression,
    env: &mut Env<'p>,
    pick: impl Fn(i64, i64) -> i64,
) -> Result<i64> {
    let mut extreme: Option<i64> = None;
    array_for_each(expr, env, |sub_env| {
        let value = int(&expr.operands()[1], sub_env)?;
        extreme = Some(match extreme {
            Some(current) => pick(current, value),
            None => value,
        });
        Ok(true)
    })?;
    extreme.ok_or_else(|| {
        Error::Product("array extreme of an empty array".into())
    })
}

fn array_extreme_float<'p>(
    expr: &Expression,
    env: &mut Env<'p>,
    pick: impl Fn(f64, f64) -> f64,
) -> Result<f64> {
    let mut extreme: Option<f64> = None;
    array_for_each(expr, env, |sub_env| {
        let value = numeric(&expr.operands()[1], sub_env)?;
        extreme = Some(match extreme {
            Some(current) => pick(current, value),
            None => value,
        });
        Ok(true)
    })?;
    extreme.ok_or_else(|| {
        Error::Product("array extreme of an empty array".into())
    })
}

fn compare<'p>(expr: &Expression, env: &mut Env<'p>) -> Result<bool> {
    use std::cmp::Ordering;
    use ExprTag::*;
    let ops = expr.operands();
    let (a, b) = (ops[0].result_type(), ops[1].result_type());
    let ordering = if a == ResultType::String {
        let left = string(&ops[0], env)?;
        let right = string(&ops[1], env)?;
        left.cmp(&right)
    } else if a == ResultType::Boolean {
        let left = bool_(&ops[0], env)?;
        let right = bool_(&ops[1], env)?;
        return Ok(match expr.tag() {
            Equal => left == right,
            NotEqual => left != right,
            _ => unreachable!(),
        });
    } else if a == ResultType::Integer && b == ResultType::Integer {
        int(&ops[0], env)?.cmp(&int(&ops[1], env)?)
    } else {
        let left = numeric(&ops[0], env)?;
        let right = numeric(&ops[1], env)?;
        match left.partial_cmp(&right) {
            Some(ordering) => ordering,
            // NaN compares unequal to everything
            None => {
                return Ok(expr.tag() == NotEqual);
            }
        }
    };
    Ok(match expr.tag() {
        Equal => ordering == Ordering::Equal,
        NotEqual => ordering != Ordering::Equal,
        Less => ordering == Ordering::Less,
        LessEqual => ordering != Ordering::Greater,
        Greater => ordering == Ordering::Greater,
        GreaterEqual => ordering != Ordering::Less,
        _ => unreachable!(),
    })
}

fn product_info<'p>(
    env: &mut Env<'p>,
    get: impl FnOnce(&crate::Product) -> Option<String>,
) -> Result<Vec<u8>> {
    let product = env.cursor()?.product();
    get(product).map(String::into_bytes).ok_or_else(|| {
        Error::Product("product has no definition bound".into())
    })
}

fn build_regex<'p>(
    pattern_expr: &Expression,
    env: &mut Env<'p>,
) -> Result<regex::Regex> {
    let pattern = string(pattern_expr, env)?;
    regex::Regex::new(&String::from_utf8_lossy(&pattern)).map_err(|err| {
        Error::InvalidArgument(format!("invalid regular expression: {err}"))
    })
}

fn overflow() -> Error {
    Error::Product("integer overflow in expression".into())
}

pub(crate) fn parse_ascii_integer(text: &[u8]) -> Result<i64> {
    let text = std::str::from_utf8(text)
        .map_err(|_| invalid_number(text))?
        .trim();
    text.parse::<i64>().map_err(|_| invalid_number(text.as_bytes()))
}

pub(crate) fn parse_ascii_float(text: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(text)
        .map_err(|_| invalid_number(text))?
        .trim();
    text.parse::<f64>().map_err(|_| invalid_number(text.as_bytes()))
}

fn invalid_number(text: &[u8]) -> Error {
    Error::Product(format!(
        "could not convert '{}' to a number",
        String::from_utf8_lossy(text)
    ))
}
