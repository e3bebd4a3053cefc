//! Raw types: unstructured byte blobs, optionally with an expected
//! fixed value.

use crate::error::{Error, Result};
use crate::types::{Format, ReadType, Type, TypeVariant};

/// The raw payload of a [`Type`].
#[derive(Debug)]
pub struct RawType {
    fixed_value: Option<Vec<u8>>,
}

impl RawType {
    pub fn fixed_value(&self) -> Option<&[u8]> {
        self.fixed_value.as_deref()
    }
}

impl Type {
    pub fn raw(format: Format) -> Type {
        Type::new(
            format,
            ReadType::Bytes,
            TypeVariant::Raw(RawType { fixed_value: None }),
        )
    }

    pub fn raw_set_fixed_value(&mut self, fixed_value: Vec<u8>) -> Result<()> {
        let raw = match self.variant_mut() {
            TypeVariant::Raw(raw) => raw,
            _ => {
                return Err(Error::InvalidType(
                    "cannot set fixed value for non-raw type".into(),
                ));
            }
        };
        if raw.fixed_value.is_some() {
            return Err(Error::DataDefinition(
                "raw type already has a fixed value".into(),
            ));
        }
        raw.fixed_value = Some(fixed_value);
        Ok(())
    }
}

pub(crate) fn validate(ty: &Type) -> Result<()> {
    let raw = ty.as_raw().expect("raw validation on raw type");
    if ty.format().is_ascbin() && ty.size_expr().is_none() && ty.bit_size() < 0
    {
        return Err(Error::DataDefinition(
            "missing bit size or bit size expression for raw type".into(),
        ));
    }
    if let Some(fixed_value) = &raw.fixed_value {
        if ty.bit_size() < 0 {
            return Err(Error::DataDefinition(
                "bit size for raw type should be fixed if a fixed value is \
                 provided"
                    .into(),
            ));
        }
        let byte_size = (ty.bit_size() + 7) / 8;
        if byte_size != fixed_value.len() as i64 {
            return Err(Error::DataDefinition(format!(
                "length of fixed value ({}) should equal rounded byte size \
                 ({byte_size}) for raw type",
                fixed_value.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_value_matches_rounded_byte_size() {
        let mut ty = Type::raw(Format::Binary);
        ty.set_bit_size(12).unwrap();
        ty.raw_set_fixed_value(vec![0xAB, 0xC0]).unwrap();
        assert!(validate(&ty).is_ok());

        let mut bad = Type::raw(Format::Binary);
        bad.set_bit_size(12).unwrap();
        bad.raw_set_fixed_value(vec![0xAB]).unwrap();
        assert!(validate(&bad).is_err());
    }
}
