//! Capability surface contracted to format backends.
//!
//! The binary/ascii backend is implemented by the cursor engine in this
//! crate. Self-describing formats (xml, cdf, netcdf, hdf4, hdf5, grib,
//! rinex, sp3) are served by external backends; their stand-in refuses
//! every operation with a typed error, so callers can tell an absent
//! backend from a programming error.

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::types::Format;

/// The synchronous operations a backend supplies for cursors positioned on
/// nodes it owns. Every operation defaults to a typed refusal.
pub trait Backend {
    fn format(&self) -> Format;

    fn cursor_set_product(&self, _cursor: &mut Cursor) -> Result<()> {
        Err(refusal(self.format(), "set_product"))
    }

    fn cursor_goto_record_field_by_index(
        &self,
        _cursor: &mut Cursor,
        _index: usize,
    ) -> Result<()> {
        Err(refusal(self.format(), "goto_record_field_by_index"))
    }

    fn cursor_goto_next_record_field(&self, _cursor: &mut Cursor) -> Result<()> {
        Err(refusal(self.format(), "goto_next_record_field"))
    }

    fn cursor_goto_available_union_field(
        &self,
        _cursor: &mut Cursor,
    ) -> Result<()> {
        Err(refusal(self.format(), "goto_available_union_field"))
    }

    fn cursor_goto_array_element(
        &self,
        _cursor: &mut Cursor,
        _subs: &[i64],
    ) -> Result<()> {
        Err(refusal(self.format(), "goto_array_element"))
    }

    fn cursor_goto_array_element_by_index(
        &self,
        _cursor: &mut Cursor,
        _index: i64,
    ) -> Result<()> {
        Err(refusal(self.format(), "goto_array_element_by_index"))
    }

    fn cursor_goto_next_array_element(&self, _cursor: &mut Cursor) -> Result<()> {
        Err(refusal(self.format(), "goto_next_array_element"))
    }

    fn cursor_goto_attributes(&self, _cursor: &mut Cursor) -> Result<()> {
        Err(refusal(self.format(), "goto_attributes"))
    }

    fn cursor_use_base_type_of_special_type(
        &self,
        _cursor: &mut Cursor,
    ) -> Result<()> {
        Err(refusal(self.format(), "use_base_type_of_special_type"))
    }

    fn cursor_get_bit_size(&self, _cursor: &Cursor) -> Result<i64> {
        Err(refusal(self.format(), "get_bit_size"))
    }

    fn cursor_get_num_elements(&self, _cursor: &Cursor) -> Result<i64> {
        Err(refusal(self.format(), "get_num_elements"))
    }

    fn cursor_get_string_length(&self, _cursor: &Cursor) -> Result<i64> {
        Err(refusal(self.format(), "get_string_length"))
    }

    fn cursor_get_array_dim(&self, _cursor: &Cursor) -> Result<Vec<i64>> {
        Err(refusal(self.format(), "get_array_dim"))
    }

    fn cursor_get_record_field_available_status(
        &self,
        _cursor: &Cursor,
        _index: usize,
    ) -> Result<bool> {
        Err(refusal(self.format(), "get_record_field_available_status"))
    }

    fn cursor_get_available_union_field_index(
        &self,
        _cursor: &Cursor,
    ) -> Result<usize> {
        Err(refusal(self.format(), "get_available_union_field_index"))
    }

    fn cursor_read_int64(&self, _cursor: &Cursor) -> Result<i64> {
        Err(refusal(self.format(), "read_int64"))
    }

    fn cursor_read_double(&self, _cursor: &Cursor) -> Result<f64> {
        Err(refusal(self.format(), "read_double"))
    }

    fn cursor_read_string(&self, _cursor: &Cursor) -> Result<Vec<u8>> {
        Err(refusal(self.format(), "read_string"))
    }

    fn cursor_read_bytes(
        &self,
        _cursor: &Cursor,
        _offset: i64,
        _length: i64,
    ) -> Result<Vec<u8>> {
        Err(refusal(self.format(), "read_bytes"))
    }
}

/// Stand-in for a backend that is not present in this build.
pub struct UnsupportedBackend(pub Format);

impl Backend for UnsupportedBackend {
    fn format(&self) -> Format {
        self.0
    }
}

/// The typed error an absent backend raises for any operation.
pub(crate) fn refusal(format: Format, operation: &str) -> Error {
    match format {
        Format::Hdf4 => Error::NoHdf4Support,
        Format::Hdf5 => Error::NoHdf5Support,
        _ => Error::InvalidType(format!(
            "{operation} is not available for {format} products (backend \
             not present in this build)"
        )),
    }
}
