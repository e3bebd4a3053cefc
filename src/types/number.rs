//! Integer and real number types, read-time conversions, and ascii
//! string-to-value mappings.

use crate::error::{Error, Result};
use crate::types::{
    Endianness, Format, ReadType, Type, TypeClass, TypeVariant,
};

/// Linear transform applied to numeric reads when conversions are enabled:
/// `value * numerator / denominator + add_offset`, with `invalid_value`
/// mapped to NaN.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub numerator: f64,
    pub denominator: f64,
    pub add_offset: f64,
    pub invalid_value: f64,
    pub unit: Option<String>,
}

impl Conversion {
    pub fn new(numerator: f64, denominator: f64) -> Result<Self> {
        if denominator == 0.0 {
            return Err(Error::DataDefinition(
                "denominator may not be 0 for conversion".into(),
            ));
        }
        Ok(Conversion {
            numerator,
            denominator,
            add_offset: 0.0,
            invalid_value: f64::NAN,
            unit: None,
        })
    }

    pub fn apply(&self, value: f64) -> f64 {
        if value == self.invalid_value {
            return f64::NAN;
        }
        value * self.numerator / self.denominator + self.add_offset
    }
}

/// Ascii representation of one integer value.
#[derive(Debug, Clone)]
pub struct IntegerMapping {
    pub str: String,
    pub value: i64,
}

/// Ascii representation of one floating point value.
#[derive(Debug, Clone)]
pub struct FloatMapping {
    pub str: String,
    pub value: f64,
}

#[derive(Debug)]
enum Mappings {
    Integer(Vec<IntegerMapping>),
    Float(Vec<FloatMapping>),
}

/// The number payload of a [`Type`] (shared between the integer and real
/// classes).
#[derive(Debug)]
pub struct NumberType {
    unit: Option<String>,
    endianness: Option<Endianness>,
    conversion: Option<Conversion>,
    mappings: Option<Mappings>,
    /// Size the type had before mappings of deviating lengths collapsed it.
    mappings_default_bit_size: i64,
}

impl NumberType {
    fn new() -> Self {
        NumberType {
            unit: None,
            endianness: None,
            conversion: None,
            mappings: None,
            mappings_default_bit_size: -1,
        }
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness.unwrap_or(Endianness::Big)
    }

    pub fn conversion(&self) -> Option<&Conversion> {
        self.conversion.as_ref()
    }

    pub fn has_mappings(&self) -> bool {
        self.mappings.is_some()
    }

    pub fn integer_mappings(&self) -> &[IntegerMapping] {
        match &self.mappings {
            Some(Mappings::Integer(mappings)) => mappings,
            _ => &[],
        }
    }

    pub fn float_mappings(&self) -> &[FloatMapping] {
        match &self.mappings {
            Some(Mappings::Float(mappings)) => mappings,
            _ => &[],
        }
    }

    /// Byte size the data occupies when none of the mappings match.
    pub fn mappings_default_bit_size(&self) -> i64 {
        self.mappings_default_bit_size
    }

    fn mapping_lengths(&self) -> Vec<usize> {
        match &self.mappings {
            Some(Mappings::Integer(mappings)) => {
                mappings.iter().map(|m| m.str.len()).collect()
            }
            Some(Mappings::Float(mappings)) => {
                mappings.iter().map(|m| m.str.len()).collect()
            }
            None => Vec::new(),
        }
    }

    /// A fixed bit size arriving after mappings were added only survives
    /// when every mapping string has exactly that byte length.
    pub(crate) fn resolve_bit_size_with_mappings(
        &mut self,
        bit_size: i64,
    ) -> Result<i64> {
        if self.mappings_default_bit_size >= 0 {
            return Err(Error::DataDefinition(
                "ascii type already has a size".into(),
            ));
        }
        self.mappings_default_bit_size = bit_size;
        let uniform = self
            .mapping_lengths()
            .iter()
            .all(|len| *len as i64 == bit_size / 8);
        Ok(if uniform { bit_size } else { -1 })
    }
}

impl Type {
    pub fn integer(format: Format) -> Type {
        Type::new(
            format,
            ReadType::Int32,
            TypeVariant::Integer(NumberType::new()),
        )
    }

    pub fn real(format: Format) -> Type {
        Type::new(
            format,
            ReadType::Double,
            TypeVariant::Real(NumberType::new()),
        )
    }

    pub fn number_set_unit(&mut self, unit: &str) -> Result<()> {
        let number = self.require_number_mut()?;
        if number.unit.is_some() {
            return Err(Error::DataDefinition(
                "type already has a unit".into(),
            ));
        }
        number.unit = Some(unit.to_owned());
        Ok(())
    }

    pub fn number_set_endianness(
        &mut self,
        endianness: Endianness,
    ) -> Result<()> {
        if self.format() != Format::Binary {
            return Err(Error::DataDefinition(format!(
                "endianness not applicable for {} type",
                self.format()
            )));
        }
        let number = self.require_number_mut()?;
        number.endianness = Some(endianness);
        Ok(())
    }

    pub fn number_set_conversion(
        &mut self,
        conversion: Conversion,
    ) -> Result<()> {
        let number = self.require_number_mut()?;
        if number.conversion.is_some() {
            return Err(Error::DataDefinition(
                "type already has a conversion".into(),
            ));
        }
        number.conversion = Some(conversion);
        Ok(())
    }

    pub fn number_add_integer_mapping(
        &mut self,
        mapping: IntegerMapping,
    ) -> Result<()> {
        if self.type_class() != TypeClass::Integer {
            return Err(Error::DataDefinition(format!(
                "cannot add integer mapping to {} type",
                self.type_class().name()
            )));
        }
        let bit_size = self.bit_size();
        let number = self.require_number_mut()?;
        let mapping_len = mapping.str.len();
        match &mut number.mappings {
            None => {
                number.mappings_default_bit_size =
                    if bit_size >= 0 { bit_size } else { -1 };
                number.mappings = Some(Mappings::Integer(vec![mapping]));
            }
            Some(Mappings::Integer(mappings)) => mappings.push(mapping),
            Some(Mappings::Float(_)) => {
                return Err(Error::DataDefinition(
                    "cannot mix integer and float mappings".into(),
                ));
            }
        }
        if bit_size >= 0
            && number.mappings_default_bit_size >= 0
            && mapping_len as i64 != number.mappings_default_bit_size / 8
        {
            self.force_bit_size(-1);
        }
        Ok(())
    }

    pub fn number_add_float_mapping(
        &mut self,
        mapping: FloatMapping,
    ) -> Result<()> {
        if self.type_class() != TypeClass::Real {
            return Err(Error::DataDefinition(format!(
                "cannot add float mapping to {} type",
                self.type_class().name()
            )));
        }
        let bit_size = self.bit_size();
        let number = self.require_number_mut()?;
        let mapping_len = mapping.str.len();
        match &mut number.mappings {
            None => {
                number.mappings_default_bit_size =
                    if bit_size >= 0 { bit_size } else { -1 };
                number.mappings = Some(Mappings::Float(vec![mapping]));
            }
            Some(Mappings::Float(mappings)) => mappings.push(mapping),
            Some(Mappings::Integer(_)) => {
                return Err(Error::DataDefinition(
                    "cannot mix integer and float mappings".into(),
                ));
            }
        }
        if bit_size >= 0
            && number.mappings_default_bit_size >= 0
            && mapping_len as i64 != number.mappings_default_bit_size / 8
        {
            self.force_bit_size(-1);
        }
        Ok(())
    }

    fn require_number_mut(&mut self) -> Result<&mut NumberType> {
        match self.variant_mut() {
            TypeVariant::Integer(number) | TypeVariant::Real(number) => {
                Ok(number)
            }
            _ => Err(Error::InvalidType(
                "operation requires a number type".into(),
            )),
        }
    }
}

pub(crate) fn validate(ty: &Type) -> Result<()> {
    let number = ty.as_number().expect("number validation on number type");
    if ty.format() == Format::Binary {
        if ty.bit_size() >= 0 {
            let read_type = ty.read_type();
            match read_type {
                ReadType::Float => {
                    if ty.bit_size() != 32 {
                        return Err(Error::DataDefinition(format!(
                            "incorrect bit size ({}) for floating point \
                             type - it should be 32 when the read type is \
                             float",
                            ty.bit_size()
                        )));
                    }
                }
                ReadType::Double => {
                    if ty.bit_size() != 64 {
                        return Err(Error::DataDefinition(format!(
                            "incorrect bit size ({}) for floating point \
                             type - it should be 64 when the read type is \
                             double",
                            ty.bit_size()
                        )));
                    }
                }
                _ => {
                    let max = read_type.max_bit_size().ok_or_else(|| {
                        Error::DataDefinition(format!(
                            "invalid read type ({}) for binary number type",
                            read_type.name()
                        ))
                    })?;
                    if ty.bit_size() > max {
                        return Err(Error::DataDefinition(format!(
                            "incorrect bit size ({}) for integer type - it \
                             should be <= {max} when the read type is {}",
                            ty.bit_size(),
                            read_type.name()
                        )));
                    }
                }
            }
        } else if ty.size_expr().is_none() {
            return Err(Error::DataDefinition(
                "missing bit size or bit size expression for binary number \
                 type"
                    .into(),
            ));
        }
        if number.endianness() == Endianness::Little
            && ty.bit_size() >= 0
            && ty.bit_size() % 8 != 0
        {
            return Err(Error::DataDefinition(format!(
                "bit size ({}) must be a multiple of 8 for little endian \
                 binary number type",
                ty.bit_size()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_requires_byte_alignment() {
        let mut ty = Type::integer(Format::Binary);
        ty.set_read_type(ReadType::UInt16).unwrap();
        ty.set_bit_size(12).unwrap();
        ty.number_set_endianness(Endianness::Little).unwrap();
        assert!(validate(&ty).is_err());
    }

    #[test]
    fn float_read_type_is_exactly_32_bits() {
        let mut ty = Type::real(Format::Binary);
        ty.set_read_type(ReadType::Float).unwrap();
        ty.set_bit_size(24).unwrap();
        assert!(validate(&ty).is_err());
    }

    #[test]
    fn deviating_mapping_length_collapses_bit_size() {
        let mut ty = Type::integer(Format::Ascii);
        ty.set_read_type(ReadType::Int32).unwrap();
        ty.set_bit_size(32).unwrap();
        ty.number_add_integer_mapping(IntegerMapping {
            str: "N/A".into(),
            value: -1,
        })
        .unwrap();
        assert_eq!(ty.bit_size(), -1);
        let number = ty.as_number().unwrap();
        assert_eq!(number.mappings_default_bit_size(), 32);
    }

    #[test]
    fn conversion_maps_invalid_value_to_nan() {
        let mut conversion = Conversion::new(1.0, 100.0).unwrap();
        conversion.invalid_value = -9999.0;
        assert!(conversion.apply(-9999.0).is_nan());
        assert_eq!(conversion.apply(50.0), 0.5);
    }
}
