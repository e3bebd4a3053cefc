//! Array types: a base type repeated along one or more dimensions, each
//! either fixed or computed from the product.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::expr::{Expression, ResultType};
use crate::types::{
    compatible_formats, Format, ReadType, Type, TypeClass, TypeVariant,
    MAX_NUM_DIMS,
};

/// One dimension descriptor.
#[derive(Debug)]
pub enum Dim {
    Fixed(i64),
    Expr(Expression),
}

/// The array payload of a [`Type`].
#[derive(Debug)]
pub struct ArrayType {
    base_type: Option<Arc<Type>>,
    dims: Vec<Dim>,
    num_elements: i64,
}

impl ArrayType {
    pub fn base_type(&self) -> &Arc<Type> {
        self.base_type
            .as_ref()
            .expect("array base type is set before use")
    }

    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Product of all dimensions, -1 when any dimension is an expression.
    pub fn num_elements(&self) -> i64 {
        self.num_elements
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.base_type.is_none() {
            return Err(Error::DataDefinition(
                "missing base type for array definition".into(),
            ));
        }
        if self.dims.is_empty() {
            return Err(Error::DataDefinition(
                "number of dimensions is 0 for array definition".into(),
            ));
        }
        Ok(())
    }
}

impl Type {
    pub fn array(format: Format) -> Type {
        let read_type = if format.is_ascbin() {
            ReadType::Bytes
        } else {
            ReadType::NotAvailable
        };
        Type::new(
            format,
            read_type,
            TypeVariant::Array(ArrayType {
                base_type: None,
                dims: Vec::new(),
                num_elements: 1,
            }),
        )
    }

    pub fn array_set_base_type(&mut self, base_type: Arc<Type>) -> Result<()> {
        let format = self.format();
        if !compatible_formats(format, base_type.format()) {
            return Err(Error::DataDefinition(format!(
                "cannot add element with {} format to array with {} format",
                base_type.format(),
                format
            )));
        }
        if format == Format::Xml
            && base_type.format() == Format::Xml
            && base_type.type_class() == TypeClass::Array
        {
            return Err(Error::DataDefinition(
                "arrays of arrays are not allowed for xml format".into(),
            ));
        }
        let array = match self.variant_mut() {
            TypeVariant::Array(array) => array,
            _ => {
                return Err(Error::InvalidType(
                    "cannot set base type for non-array type".into(),
                ));
            }
        };
        if array.base_type.is_some() {
            return Err(Error::DataDefinition(
                "array already has a base type".into(),
            ));
        }
        let elem_size = base_type.bit_size();
        array.base_type = Some(base_type);
        if format.is_ascbin() && array.num_elements >= 0 && elem_size >= 0 {
            let total = array.num_elements * elem_size;
            self.force_bit_size(total);
        }
        Ok(())
    }

    pub fn array_add_fixed_dimension(&mut self, dim: i64) -> Result<()> {
        let format = self.format();
        if dim < 0 {
            return Err(Error::DataDefinition(format!(
                "invalid dimension size ({dim}) for array type"
            )));
        }
        let array = match self.variant_mut() {
            TypeVariant::Array(array) => array,
            _ => {
                return Err(Error::InvalidType(
                    "cannot add dimension to non-array type".into(),
                ));
            }
        };
        if array.dims.len() == MAX_NUM_DIMS {
            return Err(Error::DataDefinition(format!(
                "maximum number of dimensions ({MAX_NUM_DIMS}) exceeded for \
                 array type"
            )));
        }
        array.dims.push(Dim::Fixed(dim));
        if array.num_elements != -1 {
            array.num_elements = if array.dims.len() == 1 {
                dim
            } else {
                array.num_elements * dim
            };
            if format.is_ascbin() {
                if let Some(base) = &array.base_type {
                    if base.bit_size() >= 0 {
                        let total = array.num_elements * base.bit_size();
                        self.force_bit_size(total);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn array_add_variable_dimension(
        &mut self,
        dim_expr: Expression,
    ) -> Result<()> {
        if dim_expr.result_type() != ResultType::Integer {
            return Err(Error::DataDefinition(
                "dimension expression should be an integer expression".into(),
            ));
        }
        let array = match self.variant_mut() {
            TypeVariant::Array(array) => array,
            _ => {
                return Err(Error::InvalidType(
                    "cannot add dimension to non-array type".into(),
                ));
            }
        };
        if array.dims.len() == MAX_NUM_DIMS {
            return Err(Error::DataDefinition(format!(
                "maximum number of dimensions ({MAX_NUM_DIMS}) exceeded for \
                 array definition"
            )));
        }
        array.dims.push(Dim::Expr(dim_expr));
        array.num_elements = -1;
        if self.bit_size() >= 0 {
            self.force_bit_size(-1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_dims_resolve_num_elements_and_size() {
        let mut base = Type::integer(Format::Binary);
        base.set_read_type(ReadType::UInt16).unwrap();
        base.set_bit_size(16).unwrap();

        let mut array = Type::array(Format::Binary);
        array.array_set_base_type(Arc::new(base)).unwrap();
        array.array_add_fixed_dimension(4).unwrap();
        array.array_add_fixed_dimension(3).unwrap();

        let a = array.as_array().unwrap();
        assert_eq!(a.num_elements(), 12);
        assert_eq!(array.bit_size(), 192);
    }

    #[test]
    fn variable_dim_collapses_size() {
        let mut base = Type::integer(Format::Binary);
        base.set_read_type(ReadType::UInt8).unwrap();
        base.set_bit_size(8).unwrap();

        let mut array = Type::array(Format::Binary);
        array.array_set_base_type(Arc::new(base)).unwrap();
        array
            .array_add_variable_dimension(Expression::constant_integer(7))
            .unwrap();
        assert_eq!(array.as_array().unwrap().num_elements(), -1);
        assert_eq!(array.bit_size(), -1);
    }

    #[test]
    fn array_needs_a_dimension() {
        let mut base = Type::raw(Format::Binary);
        base.set_bit_size(8).unwrap();
        let mut array = Type::array(Format::Binary);
        array.array_set_base_type(Arc::new(base)).unwrap();
        assert!(array.validate().is_err());
    }
}
