//! Text types: fixed or computed-size character data, plus the special
//! ascii flavours whose extent is found by scanning the product.

use crate::error::{Error, Result};
use crate::types::{Format, ReadType, Type, TypeVariant};

/// How the extent of an ascii text item is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialTextKind {
    /// Plain text with a fixed size or size expression.
    Default,
    /// The line separator at the current position (`\n`, `\r`, or `\r\n`).
    LineSeparator,
    /// Everything up to and including the next line separator.
    LineWithEol,
    /// Everything up to but excluding the next line separator.
    LineWithoutEol,
    /// The run of spaces and tabs at the current position.
    Whitespace,
}

/// The text payload of a [`Type`].
#[derive(Debug)]
pub struct TextType {
    fixed_value: Option<String>,
    special: SpecialTextKind,
}

impl TextType {
    pub fn fixed_value(&self) -> Option<&str> {
        self.fixed_value.as_deref()
    }

    pub fn special(&self) -> SpecialTextKind {
        self.special
    }
}

impl Type {
    pub fn text(format: Format) -> Type {
        Type::new(
            format,
            ReadType::String,
            TypeVariant::Text(TextType {
                fixed_value: None,
                special: SpecialTextKind::Default,
            }),
        )
    }

    pub fn text_set_fixed_value(&mut self, fixed_value: &str) -> Result<()> {
        let text = match self.variant_mut() {
            TypeVariant::Text(text) => text,
            _ => {
                return Err(Error::InvalidType(
                    "cannot set fixed value for non-text type".into(),
                ));
            }
        };
        if text.fixed_value.is_some() {
            return Err(Error::DataDefinition(
                "text type already has a fixed value".into(),
            ));
        }
        text.fixed_value = Some(fixed_value.to_owned());
        Ok(())
    }

    pub fn text_set_special(&mut self, special: SpecialTextKind) -> Result<()> {
        if self.format() != Format::Ascii && special != SpecialTextKind::Default
        {
            return Err(Error::DataDefinition(format!(
                "special text type not allowed for {} type",
                self.format()
            )));
        }
        let text = match self.variant_mut() {
            TypeVariant::Text(text) => text,
            _ => {
                return Err(Error::InvalidType(
                    "cannot set special text type for non-text type".into(),
                ));
            }
        };
        text.special = special;
        Ok(())
    }
}

pub(crate) fn validate(ty: &Type) -> Result<()> {
    let text = ty.as_text().expect("text validation on text type");
    if ty.format().is_ascbin()
        && text.special == SpecialTextKind::Default
        && ty.size_expr().is_none()
        && ty.bit_size() < 0
    {
        return Err(Error::DataDefinition(
            "missing bit size or bit size expression for text type".into(),
        ));
    }
    if ty.bit_size() >= 0 && ty.bit_size() % 8 != 0 {
        return Err(Error::DataDefinition(format!(
            "bit size ({}) must be a multiple of 8 for text type",
            ty.bit_size()
        )));
    }
    if ty.read_type() == ReadType::Char && ty.bit_size() != 8 {
        return Err(Error::DataDefinition(format!(
            "bit size ({}) must be 8 for text type when read type is 'char'",
            ty.bit_size()
        )));
    }
    if let Some(fixed_value) = &text.fixed_value {
        if ty.bit_size() < 0 {
            return Err(Error::DataDefinition(
                "bit size for text type should be fixed if a fixed value is \
                 provided"
                    .into(),
            ));
        }
        if ty.bit_size() / 8 != fixed_value.len() as i64 {
            return Err(Error::DataDefinition(format!(
                "byte size of fixed value ({}) should equal byte size ({}) \
                 for text type",
                fixed_value.len(),
                ty.bit_size() / 8
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_needs_eight_bits() {
        let mut ty = Type::text(Format::Ascii);
        ty.set_read_type(ReadType::Char).unwrap();
        ty.set_bit_size(16).unwrap();
        assert!(validate(&ty).is_err());
    }

    #[test]
    fn fixed_value_length_matches_size() {
        let mut ty = Type::text(Format::Ascii);
        ty.set_bit_size(32).unwrap();
        ty.text_set_fixed_value("abcd").unwrap();
        assert!(validate(&ty).is_ok());

        let mut bad = Type::text(Format::Ascii);
        bad.set_bit_size(32).unwrap();
        bad.text_set_fixed_value("ab").unwrap();
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn special_text_needs_no_size() {
        let mut ty = Type::text(Format::Ascii);
        ty.text_set_special(SpecialTextKind::LineWithoutEol).unwrap();
        assert!(validate(&ty).is_ok());
    }
}
