//! Special types: wrappers whose logical interpretation differs from the
//! raw storage of their base type.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::expr::{Expression, ExprTag, ResultType};
use crate::types::{
    Field, FloatMapping, Format, ReadType, Type, TypeClass, TypeVariant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SpecialKind {
    /// Zero-size placeholder for unavailable fields.
    NoData,
    /// `{scale_factor, value}` pair interpreted as `value * 10^scale`.
    VsfInteger,
    /// Base representation mapped to seconds since 2000-01-01T00:00:00.
    Time,
    /// `{real, imaginary}` pair of identical numeric fields.
    Complex,
}

impl SpecialKind {
    pub fn name(self) -> &'static str {
        match self {
            SpecialKind::NoData => "no_data",
            SpecialKind::VsfInteger => "vsf_integer",
            SpecialKind::Time => "time",
            SpecialKind::Complex => "complex",
        }
    }
}

/// The special payload of a [`Type`].
#[derive(Debug)]
pub struct SpecialType {
    kind: SpecialKind,
    base_type: Option<Arc<Type>>,
    unit: Option<String>,
    value_expr: Option<Expression>,
}

impl SpecialType {
    pub(crate) fn no_data(base: Arc<Type>) -> Self {
        SpecialType {
            kind: SpecialKind::NoData,
            base_type: Some(base),
            unit: None,
            value_expr: None,
        }
    }

    pub fn kind(&self) -> SpecialKind {
        self.kind
    }

    pub fn base_type(&self) -> &Arc<Type> {
        self.base_type
            .as_ref()
            .expect("special base type is set before use")
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// For time types: the expression mapping the base representation to
    /// seconds since 2000-01-01.
    pub fn value_expr(&self) -> Option<&Expression> {
        self.value_expr.as_ref()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.kind {
            SpecialKind::NoData => Ok(()),
            SpecialKind::VsfInteger => {
                let fields = self
                    .base_type
                    .as_ref()
                    .and_then(|base| base.as_record())
                    .map(|record| record.num_fields())
                    .unwrap_or(0);
                if fields != 2 {
                    return Err(Error::DataDefinition(
                        "vsf integer type requires both a base type and \
                         scale factor"
                            .into(),
                    ));
                }
                Ok(())
            }
            SpecialKind::Time => {
                if self.base_type.is_none() {
                    return Err(Error::DataDefinition(
                        "missing base type for time type".into(),
                    ));
                }
                Ok(())
            }
            SpecialKind::Complex => {
                if self.base_type.is_none() {
                    return Err(Error::DataDefinition(
                        "missing element type for complex type".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl Type {
    pub fn vsf_integer(format: Format) -> Type {
        let mut base = Type::record(format);
        base.set_description("Variable Scale Factor Integer").unwrap();
        Type::new(
            format,
            ReadType::Double,
            TypeVariant::Special(SpecialType {
                kind: SpecialKind::VsfInteger,
                base_type: Some(Arc::new(base)),
                unit: None,
                value_expr: None,
            }),
        )
    }

    /// Set the scale factor of a vsf integer. Must come before the value
    /// field; wider than 32-bit scales would lose precision in the pow10
    /// application.
    pub fn vsf_set_scale_factor(
        &mut self,
        scale_factor: Arc<Type>,
    ) -> Result<()> {
        let format = self.format();
        if format != scale_factor.format() {
            return Err(Error::DataDefinition(format!(
                "cannot use scale factor type with {} format for vsf \
                 integer with {} format",
                scale_factor.format(),
                format
            )));
        }
        match scale_factor.read_type() {
            ReadType::Int8
            | ReadType::UInt8
            | ReadType::Int16
            | ReadType::UInt16
            | ReadType::Int32 => (),
            read_type => {
                return Err(Error::DataDefinition(format!(
                    "invalid scalefactor type ({}) for vsf integer type",
                    read_type.name()
                )));
            }
        }
        self.vsf_add_base_field("scale_factor", scale_factor, 0)
    }

    /// Set the value of a vsf integer. Must come after the scale factor.
    pub fn vsf_set_type(&mut self, base_type: Arc<Type>) -> Result<()> {
        let format = self.format();
        if format != base_type.format() {
            return Err(Error::DataDefinition(format!(
                "cannot use element type with {} format for vsf integer \
                 with {} format",
                base_type.format(),
                format
            )));
        }
        self.vsf_add_base_field("value", base_type, 1)
    }

    fn vsf_add_base_field(
        &mut self,
        name: &str,
        field_type: Arc<Type>,
        expected_index: usize,
    ) -> Result<()> {
        let special = match self.variant_mut() {
            TypeVariant::Special(special)
                if special.kind == SpecialKind::VsfInteger =>
            {
                special
            }
            _ => {
                return Err(Error::InvalidType(
                    "operation requires a vsf integer type".into(),
                ));
            }
        };
        let base = special
            .base_type
            .as_mut()
            .and_then(Arc::get_mut)
            .ok_or_else(|| {
                Error::DataDefinition(
                    "vsf integer base record is already shared".into(),
                )
            })?;
        let num_fields = base.as_record().map(|r| r.num_fields()).unwrap_or(0);
        if num_fields != expected_index {
            return Err(Error::DataDefinition(if expected_index == 0 {
                "scale factor should be first field of a vsf integer record"
                    .into()
            } else {
                "value should be second field of a vsf integer record".into()
            }));
        }
        base.record_add_field(Field::new(name, field_type)?)?;
        let bit_size = base.bit_size();
        self.force_bit_size(bit_size);
        Ok(())
    }

    pub fn vsf_set_unit(&mut self, unit: &str) -> Result<()> {
        let special = match self.variant_mut() {
            TypeVariant::Special(special)
                if special.kind == SpecialKind::VsfInteger =>
            {
                special
            }
            _ => {
                return Err(Error::InvalidType(
                    "operation requires a vsf integer type".into(),
                ));
            }
        };
        if special.unit.is_some() {
            return Err(Error::DataDefinition(
                "type already has a unit".into(),
            ));
        }
        special.unit = Some(unit.to_owned());
        Ok(())
    }

    pub fn time(format: Format, value_expr: Expression) -> Result<Type> {
        if !matches!(
            value_expr.result_type(),
            ResultType::Float | ResultType::Integer
        ) {
            return Err(Error::DataDefinition(
                "value expression of time type should be a numeric \
                 expression"
                    .into(),
            ));
        }
        Ok(Type::new(
            format,
            ReadType::Double,
            TypeVariant::Special(SpecialType {
                kind: SpecialKind::Time,
                base_type: None,
                unit: Some("s since 2000-01-01".to_owned()),
                value_expr: Some(value_expr),
            }),
        ))
    }

    pub fn time_set_base_type(&mut self, base_type: Arc<Type>) -> Result<()> {
        match base_type.type_class() {
            TypeClass::Text
            | TypeClass::Integer
            | TypeClass::Real
            | TypeClass::Record => (),
            class => {
                return Err(Error::DataDefinition(format!(
                    "invalid base type class ({}) for time type",
                    class.name()
                )));
            }
        }
        let bit_size = base_type.bit_size();
        let special = match self.variant_mut() {
            TypeVariant::Special(special)
                if special.kind == SpecialKind::Time =>
            {
                special
            }
            _ => {
                return Err(Error::InvalidType(
                    "operation requires a time type".into(),
                ));
            }
        };
        if special.base_type.is_some() {
            return Err(Error::DataDefinition(
                "special type already has a base type".into(),
            ));
        }
        special.base_type = Some(base_type);
        self.force_bit_size(bit_size);
        Ok(())
    }

    /// Wrap the current value expression so that the mapped ascii string
    /// yields the mapped value instead:
    /// `if(str(., len) == "<str>", value, <previous>)`, or
    /// `if(length(.) == 0, value, <previous>)` for the empty mapping.
    pub fn time_add_float_mapping(
        &mut self,
        mapping: FloatMapping,
    ) -> Result<()> {
        let special = match self.variant_mut() {
            TypeVariant::Special(special)
                if special.kind == SpecialKind::Time =>
            {
                special
            }
            _ => {
                return Err(Error::DataDefinition(
                    "cannot add floating point ascii mapping to non-time \
                     special type"
                        .into(),
                ));
            }
        };
        let base = special.base_type.as_ref().ok_or_else(|| {
            Error::DataDefinition(
                "special type does not have a base type".into(),
            )
        })?;
        if base.type_class() != TypeClass::Text {
            return Err(Error::DataDefinition(format!(
                "cannot add floating point ascii mapping to time type with \
                 '{}' base class",
                base.type_class().name()
            )));
        }
        let node = Expression::new(ExprTag::GotoHere, None, vec![])?;
        let cond = if mapping.str.is_empty() {
            let length = Expression::new(ExprTag::Length, None, vec![node])?;
            Expression::new(
                ExprTag::Equal,
                None,
                vec![length, Expression::constant_integer(0)],
            )?
        } else {
            let read = Expression::new(
                ExprTag::String,
                None,
                vec![
                    node,
                    Expression::constant_integer(mapping.str.len() as i64),
                ],
            )?;
            Expression::new(
                ExprTag::Equal,
                None,
                vec![read, Expression::constant_string(mapping.str.clone())],
            )?
        };
        let prev = special
            .value_expr
            .take()
            .expect("time type always has a value expression");
        special.value_expr = Some(Expression::new(
            ExprTag::If,
            None,
            vec![cond, Expression::constant_float(mapping.value), prev],
        )?);
        Ok(())
    }

    pub fn complex(format: Format) -> Type {
        Type::new(
            format,
            ReadType::NotAvailable,
            TypeVariant::Special(SpecialType {
                kind: SpecialKind::Complex,
                base_type: None,
                unit: None,
                value_expr: None,
            }),
        )
    }

    pub fn complex_set_type(&mut self, element_type: Arc<Type>) -> Result<()> {
        match element_type.type_class() {
            TypeClass::Integer | TypeClass::Real => (),
            class => {
                return Err(Error::DataDefinition(format!(
                    "invalid type class ({}) for element type of complex \
                     type",
                    class.name()
                )));
            }
        }
        let format = self.format();
        if format != element_type.format() {
            return Err(Error::DataDefinition(format!(
                "cannot use element type with {} format for complex type \
                 with {} format",
                element_type.format(),
                format
            )));
        }
        let special = match self.variant_mut() {
            TypeVariant::Special(special)
                if special.kind == SpecialKind::Complex =>
            {
                special
            }
            _ => {
                return Err(Error::InvalidType(
                    "operation requires a complex type".into(),
                ));
            }
        };
        if special.base_type.is_some() {
            return Err(Error::DataDefinition(
                "complex type already has an element type".into(),
            ));
        }
        let mut base = Type::record(format);
        base.record_add_field(Field::new("real", element_type.clone())?)?;
        base.record_add_field(Field::new("imaginary", element_type)?)?;
        let bit_size = base.bit_size();
        special.base_type = Some(Arc::new(base));
        self.force_bit_size(bit_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i16_type(format: Format) -> Arc<Type> {
        let mut ty = Type::integer(format);
        ty.set_read_type(ReadType::Int16).unwrap();
        ty.set_bit_size(16).unwrap();
        Arc::new(ty)
    }

    #[test]
    fn vsf_builds_scale_then_value() {
        let mut vsf = Type::vsf_integer(Format::Binary);
        let mut value = Type::integer(Format::Binary);
        value.set_read_type(ReadType::Int32).unwrap();
        value.set_bit_size(32).unwrap();

        // value before scale factor is a definition error
        assert!(vsf.vsf_set_type(Arc::new(value)).is_err());

        vsf.vsf_set_scale_factor(i16_type(Format::Binary)).unwrap();
        let mut value = Type::integer(Format::Binary);
        value.set_read_type(ReadType::Int32).unwrap();
        value.set_bit_size(32).unwrap();
        vsf.vsf_set_type(Arc::new(value)).unwrap();
        assert_eq!(vsf.bit_size(), 48);
        assert!(vsf.validate().is_ok());
    }

    #[test]
    fn vsf_rejects_wide_scale_factor() {
        let mut vsf = Type::vsf_integer(Format::Binary);
        let mut scale = Type::integer(Format::Binary);
        scale.set_read_type(ReadType::Int64).unwrap();
        scale.set_bit_size(64).unwrap();
        assert!(vsf.vsf_set_scale_factor(Arc::new(scale)).is_err());
    }

    #[test]
    fn complex_wraps_two_identical_fields() {
        let mut complex = Type::complex(Format::Binary);
        let mut element = Type::real(Format::Binary);
        element.set_read_type(ReadType::Float).unwrap();
        element.set_bit_size(32).unwrap();
        complex.complex_set_type(Arc::new(element)).unwrap();
        assert_eq!(complex.bit_size(), 64);
        let base = complex.as_special().unwrap().base_type().clone();
        let record = base.as_record().unwrap();
        assert_eq!(record.field(0).name(), "real");
        assert_eq!(record.field(1).name(), "imaginary");
    }

    #[test]
    fn time_mapping_wraps_value_expression() {
        let mut time = Type::time(
            Format::Ascii,
            Expression::constant_float(0.0),
        )
        .unwrap();
        let mut base = Type::text(Format::Ascii);
        base.set_bit_size(27 * 8).unwrap();
        time.time_set_base_type(Arc::new(base)).unwrap();
        time.time_add_float_mapping(FloatMapping {
            str: "                           ".into(),
            value: f64::NAN,
        })
        .unwrap();
        let expr = time.as_special().unwrap().value_expr().unwrap();
        assert_eq!(expr.tag(), ExprTag::If);
    }
}
