//! Record types: ordered named fields, plus the union flavour where a
//! sibling-driven expression selects the one field that is present.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::expr::{Expression, ResultType};
use crate::types::{
    compatible_formats, is_identifier, Format, ReadType, Type, TypeVariant,
};

/// One field of a [`RecordType`].
///
/// `bit_offset` is relative to the record start and is resolved at
/// definition time whenever every predecessor has a fixed size; -1 means it
/// has to be computed per product.
#[derive(Debug)]
pub struct Field {
    name: String,
    real_name: Option<String>,
    hidden: bool,
    optional: bool,
    available_expr: Option<Expression>,
    bit_offset: i64,
    bit_offset_expr: Option<Expression>,
    ty: Arc<Type>,
}

impl Field {
    pub fn new(name: &str, ty: Arc<Type>) -> Result<Self> {
        if !is_identifier(name) {
            return Err(Error::DataDefinition(format!(
                "name '{name}' is not a valid identifier for field definition"
            )));
        }
        Ok(Field {
            name: name.to_owned(),
            real_name: None,
            hidden: false,
            optional: false,
            available_expr: None,
            bit_offset: -1,
            bit_offset_expr: None,
            ty,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The on-disk label, when it differs from the field name.
    pub fn real_name(&self) -> &str {
        self.real_name.as_deref().unwrap_or(&self.name)
    }

    pub fn set_real_name(&mut self, real_name: &str) -> Result<()> {
        if self.real_name.is_some() {
            return Err(Error::DataDefinition(
                "field already has a real name".into(),
            ));
        }
        self.real_name = Some(real_name.to_owned());
        Ok(())
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }

    pub fn set_hidden(&mut self) {
        self.hidden = true;
    }

    pub fn optional(&self) -> bool {
        self.optional
    }

    pub fn set_optional(&mut self) {
        self.optional = true;
    }

    pub fn available_expr(&self) -> Option<&Expression> {
        self.available_expr.as_ref()
    }

    pub fn set_available_expression(&mut self, expr: Expression) -> Result<()> {
        if self.available_expr.is_some() {
            return Err(Error::DataDefinition(
                "field already has an available expression".into(),
            ));
        }
        if expr.result_type() != ResultType::Boolean {
            return Err(Error::DataDefinition(
                "available expression should be a boolean expression".into(),
            ));
        }
        self.optional = true;
        self.available_expr = Some(expr);
        Ok(())
    }

    /// Resolved relative bit offset, -1 when dynamic.
    pub fn bit_offset(&self) -> i64 {
        self.bit_offset
    }

    pub fn bit_offset_expr(&self) -> Option<&Expression> {
        self.bit_offset_expr.as_ref()
    }

    pub fn set_bit_offset_expression(&mut self, expr: Expression) -> Result<()> {
        if self.bit_offset_expr.is_some() {
            return Err(Error::DataDefinition(
                "field already has a bit offset expression".into(),
            ));
        }
        if !self.ty.format().is_ascbin() {
            return Err(Error::DataDefinition(format!(
                "bit offset expression not allowed for field with {} format",
                self.ty.format()
            )));
        }
        if expr.result_type() != ResultType::Integer {
            return Err(Error::DataDefinition(
                "bit offset expression should be an integer expression".into(),
            ));
        }
        self.bit_offset = -1;
        self.bit_offset_expr = Some(expr);
        Ok(())
    }

    pub fn field_type(&self) -> &Arc<Type> {
        &self.ty
    }

}

/// The record payload of a [`Type`].
#[derive(Debug, Default)]
pub struct RecordType {
    fields: Vec<Field>,
    name_index: HashMap<String, usize>,
    real_name_index: HashMap<String, usize>,
    is_union: bool,
    union_field_expr: Option<Expression>,
}

impl RecordType {
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_index_by_name(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    pub fn field_index_by_real_name(&self, real_name: &str) -> Option<usize> {
        self.real_name_index.get(real_name).copied()
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    pub fn union_field_expr(&self) -> Option<&Expression> {
        self.union_field_expr.as_ref()
    }

    pub(crate) fn validate(&self, format: Format) -> Result<()> {
        if self.is_union {
            if self.fields.is_empty() {
                return Err(Error::DataDefinition(
                    "number of fields should be >= 1 for union type".into(),
                ));
            }
            if format.is_ascbin() && self.union_field_expr.is_none() {
                return Err(Error::DataDefinition(
                    "missing union field expression".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Type {
    /// New empty record. Starts with a fixed bit size of zero which grows
    /// (or collapses to -1) as fields are added.
    pub fn record(format: Format) -> Type {
        let mut ty = Type::new(
            format,
            ReadType::NotAvailable,
            TypeVariant::Record(RecordType::default()),
        );
        ty.force_bit_size(0);
        ty
    }

    /// New empty union record.
    pub fn union(format: Format) -> Type {
        let mut ty = Type::record(format);
        match ty.variant_mut() {
            TypeVariant::Record(record) => record.is_union = true,
            _ => unreachable!(),
        }
        ty
    }

    pub fn record_add_field(&mut self, field: Field) -> Result<()> {
        let index = match self.as_record() {
            Some(record) => record.num_fields(),
            None => {
                return Err(Error::InvalidType(
                    "cannot add field to non-record type".into(),
                ));
            }
        };
        self.record_insert_field(index, field)
    }

    pub fn record_insert_field(
        &mut self,
        index: usize,
        field: Field,
    ) -> Result<()> {
        let format = self.format();
        let record = match self.variant_mut() {
            TypeVariant::Record(record) => record,
            _ => {
                return Err(Error::InvalidType(
                    "cannot add field to non-record type".into(),
                ));
            }
        };
        if index > record.fields.len() {
            return Err(Error::InvalidIndex(format!(
                "field index ({index}) is not in the range [0,{}]",
                record.fields.len()
            )));
        }
        if record.is_union && !field.optional {
            return Err(Error::DataDefinition(
                "fields added to a union need to be optional".into(),
            ));
        }
        if !compatible_formats(format, field.ty.format()) {
            return Err(Error::DataDefinition(format!(
                "cannot add field with {} format to record with {} format",
                field.ty.format(),
                format
            )));
        }
        if record.name_index.contains_key(&field.name) {
            return Err(Error::DataDefinition(format!(
                "duplicate field with name {} for record definition",
                field.name
            )));
        }

        record.fields.insert(index, field);
        // insertion in the middle shifts the tail, so rebuild both indices
        record.name_index.clear();
        record.real_name_index.clear();
        for (i, f) in record.fields.iter().enumerate() {
            record.name_index.insert(f.name.clone(), i);
            record
                .real_name_index
                .entry(f.real_name().to_owned())
                .or_insert(i);
        }

        if format.is_ascbin() {
            if record.is_union {
                self.union_update_layout(index)?;
            } else {
                self.record_update_layout(index)?;
            }
        }
        Ok(())
    }

    /// Union bookkeeping after a field insert: every union field sits at
    /// offset zero, and the union keeps a fixed size only while all fields
    /// agree on one. This fixed size is an optimisation hint; the true size
    /// always follows the active field.
    fn union_update_layout(&mut self, index: usize) -> Result<()> {
        let bit_size = self.bit_size();
        let record = match self.variant_mut() {
            TypeVariant::Record(record) => record,
            _ => unreachable!(),
        };
        let field = &mut record.fields[index];
        if field.bit_offset_expr.is_some() {
            return Err(Error::DataDefinition(
                "bit offset expression not allowed for union field".into(),
            ));
        }
        field.bit_offset = 0;
        let field_size = field.ty.bit_size();
        let new_size = if record.fields.len() == 1 {
            field_size
        } else if bit_size != field_size {
            -1
        } else {
            bit_size
        };
        self.force_bit_size(new_size);
        Ok(())
    }

    /// Plain-record bookkeeping after a field insert: propagate fixed
    /// offsets through fixed-size non-optional predecessors and update the
    /// record's own fixed size.
    fn record_update_layout(&mut self, index: usize) -> Result<()> {
        let bit_size = self.bit_size();
        let record = match self.variant_mut() {
            TypeVariant::Record(record) => record,
            _ => unreachable!(),
        };
        if record.fields[index].bit_offset_expr.is_none() {
            if index == 0 {
                record.fields[0].bit_offset = 0;
            } else if let Some(offset) = resolved_end(&record.fields[index - 1])
            {
                record.fields[index].bit_offset = offset;
            }
        }
        for i in index + 1..record.fields.len() {
            if record.fields[i].bit_offset_expr.is_none() {
                if let Some(offset) = resolved_end(&record.fields[i - 1]) {
                    record.fields[i].bit_offset = offset;
                }
            }
        }

        if bit_size >= 0 {
            let field_size = record.fields[index].ty.bit_size();
            let new_size =
                if field_size >= 0 && !record.fields[index].optional {
                    bit_size + field_size
                } else {
                    -1
                };
            self.force_bit_size(new_size);
        }
        Ok(())
    }

    pub fn union_set_field_expression(
        &mut self,
        field_expr: Expression,
    ) -> Result<()> {
        if field_expr.result_type() != ResultType::Integer {
            return Err(Error::DataDefinition(
                "union field expression should be an integer expression"
                    .into(),
            ));
        }
        let record = match self.variant_mut() {
            TypeVariant::Record(record) => record,
            _ => {
                return Err(Error::InvalidType(
                    "cannot set union field expression for non-record type"
                        .into(),
                ));
            }
        };
        if !record.is_union {
            return Err(Error::DataDefinition(
                "record type is not a union".into(),
            ));
        }
        if record.union_field_expr.is_some() {
            return Err(Error::DataDefinition(
                "record type already has a union field expression".into(),
            ));
        }
        record.union_field_expr = Some(field_expr);
        let mut common_size = 0;
        for (i, field) in record.fields.iter_mut().enumerate() {
            if field.bit_offset_expr.is_some() {
                return Err(Error::DataDefinition(format!(
                    "bit offset expression not allowed for union field '{}'",
                    field.name
                )));
            }
            field.bit_offset = 0;
            if i == 0 {
                common_size = field.ty.bit_size();
            } else if common_size != field.ty.bit_size() {
                common_size = -1;
            }
        }
        if !record.fields.is_empty() {
            self.force_bit_size(common_size);
        }
        Ok(())
    }
}

fn resolved_end(prev: &Field) -> Option<i64> {
    if prev.bit_offset >= 0 && prev.ty.bit_size() >= 0 && !prev.optional {
        Some(prev.bit_offset + prev.ty.bit_size())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u8_type() -> Arc<Type> {
        let mut ty = Type::integer(Format::Binary);
        ty.set_read_type(ReadType::UInt8).unwrap();
        ty.set_bit_size(8).unwrap();
        Arc::new(ty)
    }

    #[test]
    fn offsets_propagate_through_fixed_fields() {
        let mut record = Type::record(Format::Binary);
        record.record_add_field(Field::new("a", u8_type()).unwrap()).unwrap();
        record.record_add_field(Field::new("b", u8_type()).unwrap()).unwrap();
        record.record_add_field(Field::new("c", u8_type()).unwrap()).unwrap();
        let r = record.as_record().unwrap();
        assert_eq!(r.field(0).bit_offset(), 0);
        assert_eq!(r.field(1).bit_offset(), 8);
        assert_eq!(r.field(2).bit_offset(), 16);
        assert_eq!(record.bit_size(), 24);
    }

    #[test]
    fn optional_field_breaks_propagation() {
        let mut record = Type::record(Format::Binary);
        record.record_add_field(Field::new("a", u8_type()).unwrap()).unwrap();
        let mut opt = Field::new("b", u8_type()).unwrap();
        opt.set_optional();
        record.record_add_field(opt).unwrap();
        record.record_add_field(Field::new("c", u8_type()).unwrap()).unwrap();
        let r = record.as_record().unwrap();
        assert_eq!(r.field(1).bit_offset(), 8);
        assert_eq!(r.field(2).bit_offset(), -1);
        assert_eq!(record.bit_size(), -1);
    }

    #[test]
    fn union_rejects_mandatory_fields() {
        let mut union = Type::union(Format::Binary);
        let field = Field::new("a", u8_type()).unwrap();
        assert!(matches!(
            union.record_add_field(field),
            Err(crate::error::Error::DataDefinition(_))
        ));
    }

    #[test]
    fn duplicate_field_name_is_rejected() {
        let mut record = Type::record(Format::Binary);
        record.record_add_field(Field::new("a", u8_type()).unwrap()).unwrap();
        assert!(record
            .record_add_field(Field::new("a", u8_type()).unwrap())
            .is_err());
    }
}
