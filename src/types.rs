//! Static type definitions for product format descriptions.
//!
//! A [`Type`] describes the layout of a piece of a product: a record of
//! fields, an array, a number, a text or raw blob, or one of the special
//! wrapper types (time, vsf integer, complex, no-data). Construction is
//! append-only: mutators add information, they never unset it. Once a type
//! is finished it is shared immutably behind an [`Arc`].

pub mod array;
pub mod number;
pub mod raw;
pub mod record;
pub mod special;
pub mod text;

use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::expr::{ExprTag, Expression};

pub use array::{ArrayType, Dim};
pub use number::{Conversion, FloatMapping, IntegerMapping, NumberType};
pub use raw::RawType;
pub use record::{Field, RecordType};
pub use special::{SpecialKind, SpecialType};
pub use text::{SpecialTextKind, TextType};

/// Maximum number of dimensions of an array type.
pub const MAX_NUM_DIMS: usize = 8;

/// Storage format of a product or of a piece of its definition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub enum Format {
    Ascii,
    Binary,
    Xml,
    Cdf,
    NetCdf,
    Hdf4,
    Hdf5,
    Grib,
    Rinex,
    Sp3,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Ascii => "ascii",
            Format::Binary => "binary",
            Format::Xml => "xml",
            Format::Cdf => "cdf",
            Format::NetCdf => "netcdf",
            Format::Hdf4 => "hdf4",
            Format::Hdf5 => "hdf5",
            Format::Grib => "grib",
            Format::Rinex => "rinex",
            Format::Sp3 => "sp3",
        }
    }

    /// Ascii and binary products share one cursor implementation and one
    /// detection tree.
    pub fn is_ascbin(self) -> bool {
        matches!(self, Format::Ascii | Format::Binary)
    }

    /// Formats whose structure is stored in the file itself rather than in
    /// an external definition.
    pub fn is_self_describing(self) -> bool {
        !self.is_ascbin()
    }

    pub(crate) const ALL: [Format; 10] = [
        Format::Ascii,
        Format::Binary,
        Format::Xml,
        Format::Cdf,
        Format::NetCdf,
        Format::Hdf4,
        Format::Hdf5,
        Format::Grib,
        Format::Rinex,
        Format::Sp3,
    ];

    pub(crate) fn index(self) -> usize {
        Self::ALL.iter().position(|f| *f == self).unwrap()
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification of a [`Type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TypeClass {
    Record,
    Array,
    Integer,
    Real,
    Text,
    Raw,
    Special,
}

impl TypeClass {
    pub fn name(self) -> &'static str {
        match self {
            TypeClass::Record => "record",
            TypeClass::Array => "array",
            TypeClass::Integer => "integer",
            TypeClass::Real => "real",
            TypeClass::Text => "text",
            TypeClass::Raw => "raw",
            TypeClass::Special => "special",
        }
    }
}

/// The native type a leaf is presented as when read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReadType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Char,
    String,
    Bytes,
    NotAvailable,
}

impl ReadType {
    pub fn name(self) -> &'static str {
        match self {
            ReadType::Int8 => "int8",
            ReadType::UInt8 => "uint8",
            ReadType::Int16 => "int16",
            ReadType::UInt16 => "uint16",
            ReadType::Int32 => "int32",
            ReadType::UInt32 => "uint32",
            ReadType::Int64 => "int64",
            ReadType::UInt64 => "uint64",
            ReadType::Float => "float",
            ReadType::Double => "double",
            ReadType::Char => "char",
            ReadType::String => "string",
            ReadType::Bytes => "bytes",
            ReadType::NotAvailable => "not available",
        }
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(
            self,
            ReadType::Int8 | ReadType::Int16 | ReadType::Int32 | ReadType::Int64
        )
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            ReadType::UInt8
                | ReadType::UInt16
                | ReadType::UInt32
                | ReadType::UInt64
        )
    }

    pub fn is_integer(self) -> bool {
        self.is_signed_integer() || self.is_unsigned_integer()
    }

    /// Maximum bit size for an integer read type.
    pub(crate) fn max_bit_size(self) -> Option<i64> {
        match self {
            ReadType::Int8 | ReadType::UInt8 => Some(8),
            ReadType::Int16 | ReadType::UInt16 => Some(16),
            ReadType::Int32 | ReadType::UInt32 => Some(32),
            ReadType::Int64 | ReadType::UInt64 => Some(64),
            _ => None,
        }
    }
}

/// Byte order of a binary number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endianness {
    Big,
    Little,
}

/// Whether a size expression yields bits or bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeUnit {
    Bits,
    Bytes,
}

/// Size expression attached to a type whose size is computed from the
/// product data.
#[derive(Debug, Clone)]
pub struct SizeExpr {
    pub expr: Expression,
    pub unit: SizeUnit,
}

/// The per-class payload of a [`Type`].
#[derive(Debug)]
pub enum TypeVariant {
    Record(RecordType),
    Array(ArrayType),
    Integer(NumberType),
    Real(NumberType),
    Text(TextType),
    Raw(RawType),
    Special(SpecialType),
}

/// A static type definition.
///
/// `bit_size` is the fixed storage size in bits, or -1 when the size has to
/// be computed per product (through `size_expr`, per-field summation, or
/// mappings).
#[derive(Debug)]
pub struct Type {
    format: Format,
    name: Option<String>,
    description: Option<String>,
    bit_size: i64,
    size_expr: Option<SizeExpr>,
    read_type: ReadType,
    attributes: Option<Arc<Type>>,
    variant: TypeVariant,
}

impl Type {
    pub(crate) fn new(
        format: Format,
        read_type: ReadType,
        variant: TypeVariant,
    ) -> Self {
        Type {
            format,
            name: None,
            description: None,
            bit_size: -1,
            size_expr: None,
            read_type,
            attributes: None,
            variant,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn type_class(&self) -> TypeClass {
        match &self.variant {
            TypeVariant::Record(_) => TypeClass::Record,
            TypeVariant::Array(_) => TypeClass::Array,
            TypeVariant::Integer(_) => TypeClass::Integer,
            TypeVariant::Real(_) => TypeClass::Real,
            TypeVariant::Text(_) => TypeClass::Text,
            TypeVariant::Raw(_) => TypeClass::Raw,
            TypeVariant::Special(_) => TypeClass::Special,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Fixed storage size in bits, -1 when computed.
    pub fn bit_size(&self) -> i64 {
        self.bit_size
    }

    pub fn size_expr(&self) -> Option<&SizeExpr> {
        self.size_expr.as_ref()
    }

    pub fn read_type(&self) -> ReadType {
        self.read_type
    }

    pub fn variant(&self) -> &TypeVariant {
        &self.variant
    }

    pub(crate) fn variant_mut(&mut self) -> &mut TypeVariant {
        &mut self.variant
    }

    /// Layout bookkeeping during construction bypasses the append-only
    /// checks of [`Type::set_bit_size`].
    pub(crate) fn force_bit_size(&mut self, bit_size: i64) {
        self.bit_size = bit_size;
    }

    pub fn as_record(&self) -> Option<&RecordType> {
        match &self.variant {
            TypeVariant::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayType> {
        match &self.variant {
            TypeVariant::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&NumberType> {
        match &self.variant {
            TypeVariant::Integer(number) | TypeVariant::Real(number) => {
                Some(number)
            }
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextType> {
        match &self.variant {
            TypeVariant::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&RawType> {
        match &self.variant {
            TypeVariant::Raw(raw) => Some(raw),
            _ => None,
        }
    }

    pub fn as_special(&self) -> Option<&SpecialType> {
        match &self.variant {
            TypeVariant::Special(special) => Some(special),
            _ => None,
        }
    }

    /// The attributes record of this type, or the per-format empty record
    /// when none were defined.
    pub fn attributes_record(&self) -> Arc<Type> {
        match &self.attributes {
            Some(attributes) => attributes.clone(),
            None => empty_record_singleton(self.format),
        }
    }

    pub fn has_attributes(&self) -> bool {
        self.attributes.is_some()
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if self.name.is_some() {
            return Err(Error::DataDefinition(format!(
                "type already has a name ({})",
                self.name.as_deref().unwrap_or_default()
            )));
        }
        if !is_identifier(name) {
            return Err(Error::DataDefinition(format!(
                "name '{name}' is not a valid identifier for type definition"
            )));
        }
        self.name = Some(name.to_owned());
        Ok(())
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        if self.description.is_some() {
            return Err(Error::DataDefinition(
                "type already has a description".into(),
            ));
        }
        self.description = Some(description.to_owned());
        Ok(())
    }

    pub fn set_read_type(&mut self, read_type: ReadType) -> Result<()> {
        match self.type_class() {
            TypeClass::Integer => {
                if !read_type.is_integer() {
                    return Err(Error::DataDefinition(format!(
                        "invalid read type ({}) for integer type",
                        read_type.name()
                    )));
                }
            }
            TypeClass::Real => {
                if !matches!(read_type, ReadType::Float | ReadType::Double) {
                    return Err(Error::DataDefinition(format!(
                        "invalid read type ({}) for real type",
                        read_type.name()
                    )));
                }
            }
            TypeClass::Text => {
                if !matches!(read_type, ReadType::Char | ReadType::String) {
                    return Err(Error::DataDefinition(format!(
                        "invalid read type ({}) for text type",
                        read_type.name()
                    )));
                }
            }
            class => {
                return Err(Error::DataDefinition(format!(
                    "cannot set read type for {} type",
                    class.name()
                )));
            }
        }
        self.read_type = read_type;
        Ok(())
    }

    /// Fix the storage size of a type in bits.
    pub fn set_bit_size(&mut self, bit_size: i64) -> Result<()> {
        if self.size_expr.is_some() {
            return Err(Error::DataDefinition(
                "type already has a size expression".into(),
            ));
        }
        if bit_size < 0 {
            return Err(Error::DataDefinition(format!(
                "bit size ({bit_size}) must be >= 0"
            )));
        }
        if self.format == Format::Ascii && bit_size % 8 != 0 {
            return Err(Error::DataDefinition(format!(
                "bit size ({bit_size}) should be a rounded number of bytes \
                 for ascii type"
            )));
        }
        // A number type that already collected ascii mappings keeps its
        // fixed size only when every mapping string has that same length.
        let has_mappings =
            self.as_number().is_some_and(NumberType::has_mappings);
        if has_mappings {
            let resolved = match &mut self.variant {
                TypeVariant::Integer(number) | TypeVariant::Real(number) => {
                    number.resolve_bit_size_with_mappings(bit_size)?
                }
                _ => unreachable!(),
            };
            self.bit_size = resolved;
            return Ok(());
        }
        if self.bit_size >= 0 {
            return Err(Error::DataDefinition(
                "type already has a bit size".into(),
            ));
        }
        self.bit_size = bit_size;
        Ok(())
    }

    pub fn set_byte_size(&mut self, byte_size: i64) -> Result<()> {
        self.set_bit_size(byte_size.checked_mul(8).ok_or_else(|| {
            Error::DataDefinition(format!(
                "invalid byte size ({byte_size}) for type"
            ))
        })?)
    }

    pub fn set_bit_size_expression(&mut self, expr: Expression) -> Result<()> {
        self.set_size_expression(expr, SizeUnit::Bits)
    }

    pub fn set_byte_size_expression(&mut self, expr: Expression) -> Result<()> {
        self.set_size_expression(expr, SizeUnit::Bytes)
    }

    fn set_size_expression(
        &mut self,
        expr: Expression,
        unit: SizeUnit,
    ) -> Result<()> {
        if self.size_expr.is_some() {
            return Err(Error::DataDefinition(
                "type already has a size expression".into(),
            ));
        }
        // Compound types start out with bit size 0; a size expression may
        // still replace that as long as no field/dimension contributed.
        let compound = matches!(
            self.type_class(),
            TypeClass::Record | TypeClass::Array
        );
        if (compound && self.bit_size > 0) || (!compound && self.bit_size >= 0)
        {
            return Err(Error::DataDefinition(
                "type already has a fixed size".into(),
            ));
        }
        self.size_expr = Some(SizeExpr { expr, unit });
        self.bit_size = -1;
        Ok(())
    }

    /// Add one attribute field to this type's attributes record.
    pub fn add_attribute(&mut self, attribute: Field) -> Result<()> {
        let format = self.format;
        if self.attributes.is_none() {
            self.attributes = Some(Arc::new(Type::record(format)));
        }
        let attributes = Arc::get_mut(self.attributes.as_mut().unwrap())
            .ok_or_else(|| {
                Error::DataDefinition(
                    "attributes record is already shared".into(),
                )
            })?;
        attributes.record_add_field(attribute)
    }

    /// Replace the attributes record wholesale.
    pub fn set_attributes(&mut self, attributes: Arc<Type>) -> Result<()> {
        if self.attributes.is_some() {
            return Err(Error::DataDefinition(
                "type already has attributes".into(),
            ));
        }
        if attributes.type_class() != TypeClass::Record {
            return Err(Error::DataDefinition(
                "attributes should be a record type".into(),
            ));
        }
        self.attributes = Some(attributes);
        Ok(())
    }

    /// Class-specific validation, applied when a definition is finished.
    pub fn validate(&self) -> Result<()> {
        match &self.variant {
            TypeVariant::Record(record) => record.validate(self.format),
            TypeVariant::Array(array) => array.validate(),
            TypeVariant::Integer(_) | TypeVariant::Real(_) => {
                number::validate(self)
            }
            TypeVariant::Text(_) => text::validate(self),
            TypeVariant::Raw(_) => raw::validate(self),
            TypeVariant::Special(special) => special.validate(),
        }
    }
}

/// `name` must start with a letter and contain only letters, digits, and
/// underscores.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Field/element format compatibility: a field must have the format of its
/// container, except that ascii content may be embedded in binary or xml
/// containers.
pub(crate) fn compatible_formats(container: Format, element: Format) -> bool {
    container == element
        || (element == Format::Ascii
            && matches!(container, Format::Binary | Format::Xml))
}

static EMPTY_RECORD: [OnceLock<Arc<Type>>; Format::ALL.len()] =
    [const { OnceLock::new() }; Format::ALL.len()];

/// The shared empty attributes record for `format`.
pub fn empty_record_singleton(format: Format) -> Arc<Type> {
    EMPTY_RECORD[format.index()]
        .get_or_init(|| {
            let mut record = Type::record(format);
            record.bit_size = 0;
            Arc::new(record)
        })
        .clone()
}

static NO_DATA: [OnceLock<Arc<Type>>; Format::ALL.len()] =
    [const { OnceLock::new() }; Format::ALL.len()];

/// The shared zero-size type used for unavailable record fields.
pub fn no_data_singleton(format: Format) -> Arc<Type> {
    NO_DATA[format.index()]
        .get_or_init(|| {
            let mut base = Type::raw(format);
            base.set_bit_size(0).unwrap();
            let mut ty = Type::new(
                format,
                ReadType::NotAvailable,
                TypeVariant::Special(SpecialType::no_data(Arc::new(base))),
            );
            ty.bit_size = 0;
            Arc::new(ty)
        })
        .clone()
}

static RAW_FILE: OnceLock<Arc<Type>> = OnceLock::new();

/// The type a product is given before a definition is bound: one raw blob
/// covering the whole file.
pub fn raw_file_singleton() -> Arc<Type> {
    RAW_FILE
        .get_or_init(|| {
            let mut ty = Type::raw(Format::Binary);
            let file_size = Expression::new(ExprTag::FileSize, None, vec![])
                .expect("filesize is a valid expression");
            ty.set_byte_size_expression(file_size)
                .expect("fresh raw type accepts a size expression");
            Arc::new(ty)
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_rules() {
        assert!(is_identifier("mph"));
        assert!(is_identifier("dsd_1"));
        assert!(!is_identifier("1dsd"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn empty_record_is_shared_and_empty() {
        let a = empty_record_singleton(Format::Binary);
        let b = empty_record_singleton(Format::Binary);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.bit_size(), 0);
        assert_eq!(a.as_record().unwrap().num_fields(), 0);
    }

    #[test]
    fn no_data_has_zero_size() {
        let ty = no_data_singleton(Format::Ascii);
        assert_eq!(ty.bit_size(), 0);
        assert_eq!(
            ty.as_special().unwrap().kind(),
            SpecialKind::NoData
        );
    }
}
