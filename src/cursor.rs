//! The cursor engine: a bounded stack of frames describing a position in a
//! product, with on-demand bit-offset and size computation for ascii and
//! binary products.
//!
//! Every operation is transactional with respect to the cursor stack: on
//! failure the cursor is restored to its pre-call state. Operations on
//! self-describing formats are dispatched to the (absent) backend, which
//! refuses them with a typed error.

use std::sync::Arc;

use num_traits::NumCast;

use crate::backend;
use crate::error::{Error, Result};
use crate::expr::{parse_ascii_float, parse_ascii_integer};
use crate::read;
use crate::types::{
    no_data_singleton, Dim, Format, ReadType, SizeUnit, SpecialKind,
    SpecialTextKind, Type, TypeClass,
};
use crate::Product;

/// Maximum nesting depth of a cursor.
pub const CURSOR_MAXDEPTH: usize = 32;

#[derive(Debug, Clone)]
struct Frame {
    ty: Arc<Type>,
    /// Field index for record children, element index for array children,
    /// -1 for the root and for attribute frames.
    index: isize,
    /// Absolute bit offset into the product; -1 for attribute frames.
    bit_offset: i64,
}

/// A position in a product tree.
///
/// Cursors are plain values: cloning one yields an independent cursor, and
/// the many internal probe cursors are exactly such clones.
#[derive(Debug, Clone)]
pub struct Cursor<'p> {
    product: &'p Product,
    stack: Vec<Frame>,
}

impl<'p> Cursor<'p> {
    /// Position a new cursor at the root of `product`.
    pub fn new(product: &'p Product) -> Result<Cursor<'p>> {
        Ok(Cursor::with_root(product, product.root_type().clone()))
    }

    /// A cursor viewing `product` through `root_type` instead of the
    /// product's own root; used by detection to probe candidate
    /// definitions before any is bound.
    pub(crate) fn with_root(
        product: &'p Product,
        root_type: Arc<Type>,
    ) -> Cursor<'p> {
        let mut stack = Vec::with_capacity(CURSOR_MAXDEPTH);
        stack.push(Frame {
            ty: root_type,
            index: -1,
            bit_offset: 0,
        });
        let mut cursor = Cursor { product, stack };
        cursor.maybe_bypass();
        cursor
    }

    pub fn product(&self) -> &'p Product {
        self.product
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Index of the current node within its parent; -1 at the root and on
    /// attribute frames.
    pub fn index(&self) -> isize {
        self.top().index
    }

    /// The type at the current position.
    pub fn current_type(&self) -> &Arc<Type> {
        &self.top().ty
    }

    /// Absolute bit offset of the current node; -1 on attribute frames.
    pub fn get_file_bit_offset(&self) -> i64 {
        self.top().bit_offset
    }

    /// Absolute byte offset (rounded down) of the current node.
    pub fn get_byte_offset(&self) -> i64 {
        self.top().bit_offset >> 3
    }

    pub fn has_ascii_content(&self) -> bool {
        let ty = &self.top().ty;
        ty.format() == Format::Ascii || ty.type_class() == TypeClass::Text
    }

    /// The native type reads at this position yield. A number with a
    /// conversion presents as a double while conversions are enabled.
    pub fn get_read_type(&self) -> ReadType {
        let ty = &self.top().ty;
        if self.product.options().perform_conversions
            && ty
                .as_number()
                .is_some_and(|number| number.conversion().is_some())
        {
            return ReadType::Double;
        }
        ty.read_type()
    }

    pub fn has_attributes(&self) -> bool {
        self.top().ty.has_attributes()
    }

    fn top(&self) -> &Frame {
        self.stack.last().expect("cursor stack is never empty")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("cursor stack is never empty")
    }

    fn push(&mut self, frame: Frame) -> Result<()> {
        if self.stack.len() >= CURSOR_MAXDEPTH {
            return Err(Error::InvalidArgument(format!(
                "maximum cursor depth ({CURSOR_MAXDEPTH}) exceeded"
            )));
        }
        self.stack.push(frame);
        Ok(())
    }

    fn require_ascbin(&self, operation: &'static str) -> Result<()> {
        let format = self.product.format();
        if format.is_ascbin() {
            Ok(())
        } else {
            Err(backend::refusal(format, operation))
        }
    }

    /// With the bypass option set, a goto landing on a special type
    /// immediately rebinds to its base type, repeatedly.
    fn maybe_bypass(&mut self) {
        if !self.product.options().bypass_special_types {
            return;
        }
        while let Some(special) = self.top().ty.as_special() {
            let base = special.base_type().clone();
            self.top_mut().ty = base;
        }
    }

    /// Run `operation` and restore the stack when it fails.
    fn transactional<T>(
        &mut self,
        operation: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let saved = self.stack.clone();
        match operation(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.stack = saved;
                Err(err)
            }
        }
    }

    /// Cursor path for error messages, e.g. `/mph/dsrs[3]`.
    pub(crate) fn path_string(&self) -> String {
        let mut out = String::new();
        for depth in 1..self.stack.len() {
            let parent = &self.stack[depth - 1].ty;
            let frame = &self.stack[depth];
            if frame.index < 0 {
                out.push('@');
                continue;
            }
            match parent.type_class() {
                TypeClass::Record => {
                    out.push('/');
                    if let Some(record) = parent.as_record() {
                        out.push_str(record.field(frame.index as usize).name());
                    }
                }
                TypeClass::Array => {
                    out.push_str(&format!("[{}]", frame.index));
                }
                _ => (),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    fn position_context(&self, err: Error) -> Error {
        err.with_context(&format!(" at {}", self.path_string()))
    }
}

/// Navigation.
impl<'p> Cursor<'p> {
    pub fn goto_root(&mut self) -> Result<()> {
        self.stack.truncate(1);
        self.maybe_bypass();
        Ok(())
    }

    pub fn goto_parent(&mut self) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::NoParent);
        }
        self.stack.pop();
        Ok(())
    }

    pub fn goto_first_record_field(&mut self) -> Result<()> {
        self.goto_record_field_by_index(0)
    }

    pub fn goto_record_field_by_index(&mut self, index: usize) -> Result<()> {
        self.require_ascbin("goto_record_field_by_index")?;
        self.transactional(|cursor| {
            cursor.goto_record_field_by_index_inner(index)
        })
    }

    fn goto_record_field_by_index_inner(&mut self, index: usize) -> Result<()> {
        let record_ty = self.top().ty.clone();
        let record = record_ty.as_record().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to a record".into())
        })?;
        if index >= record.num_fields() {
            return Err(Error::InvalidIndex(format!(
                "field index ({index}) is not in the range [0,{})",
                record.num_fields()
            )));
        }

        let mut bit_offset = self.top().bit_offset;
        let mut available = true;
        if record.union_field_expr().is_some() {
            let active = self.get_available_union_field_index()?;
            available = index == active;
        } else {
            let rel = self.rel_field_bit_offset(index)?;
            bit_offset += rel;
            if let Some(available_expr) = record.field(index).available_expr()
            {
                available = available_expr
                    .eval_bool(Some(self))
                    .map_err(|err| {
                        self.position_context(
                            err.with_context(" for available expression"),
                        )
                    })?;
            }
        }

        let ty = if available {
            record.field(index).field_type().clone()
        } else {
            no_data_singleton(record_ty.format())
        };
        self.push(Frame {
            ty,
            index: index as isize,
            bit_offset,
        })?;
        self.maybe_bypass();
        Ok(())
    }

    pub fn goto_record_field_by_name(&mut self, name: &str) -> Result<()> {
        let index = {
            let record = self.top().ty.as_record().ok_or_else(|| {
                Error::InvalidType(
                    "cursor does not refer to a record".into(),
                )
            })?;
            record
                .field_index_by_name(name)
                .or_else(|| record.field_index_by_real_name(name))
                .ok_or_else(|| {
                    Error::InvalidName(format!(
                        "record does not contain a field named '{name}'"
                    ))
                })?
        };
        self.goto_record_field_by_index(index)
    }

    pub fn goto_next_record_field(&mut self) -> Result<()> {
        self.require_ascbin("goto_next_record_field")?;
        self.transactional(Cursor::goto_next_record_field_inner)
    }

    fn goto_next_record_field_inner(&mut self) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(Error::InvalidType(
                "cursor does not refer to a record field".into(),
            ));
        }
        let record_ty = self.stack[self.stack.len() - 2].ty.clone();
        let record = record_ty.as_record().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to a record field".into())
        })?;
        let index = (self.top().index + 1) as usize;
        if index >= record.num_fields() {
            return Err(Error::InvalidIndex(format!(
                "field index ({index}) is not in the range [0,{})",
                record.num_fields()
            )));
        }

        let parent_offset = self.stack[self.stack.len() - 2].bit_offset;
        let mut bit_offset = parent_offset;
        let mut available = true;
        if record.union_field_expr().is_some() {
            let mut record_cursor = self.clone();
            record_cursor.stack.pop();
            let active = record_cursor.get_available_union_field_index()?;
            available = index == active;
        } else {
            let (rel, _) = self.rel_next_field_bit_offset()?;
            bit_offset += rel;
            if let Some(available_expr) = record.field(index).available_expr()
            {
                let mut record_cursor = self.clone();
                record_cursor.stack.pop();
                available = available_expr
                    .eval_bool(Some(&record_cursor))
                    .map_err(|err| {
                        self.position_context(
                            err.with_context(" for available expression"),
                        )
                    })?;
            }
        }

        let top = self.top_mut();
        top.ty = if available {
            record.field(index).field_type().clone()
        } else {
            no_data_singleton(record_ty.format())
        };
        top.index = index as isize;
        top.bit_offset = bit_offset;
        self.maybe_bypass();
        Ok(())
    }

    pub fn goto_available_union_field(&mut self) -> Result<()> {
        self.require_ascbin("goto_available_union_field")?;
        self.transactional(|cursor| {
            let index = cursor.get_available_union_field_index()?;
            let record_ty = cursor.top().ty.clone();
            let record = record_ty.as_record().unwrap();
            let bit_offset = cursor.top().bit_offset;
            cursor.push(Frame {
                ty: record.field(index).field_type().clone(),
                index: index as isize,
                bit_offset,
            })?;
            cursor.maybe_bypass();
            Ok(())
        })
    }

    pub fn goto_first_array_element(&mut self) -> Result<()> {
        self.goto_array_element_by_index(0)
    }

    pub fn goto_array_element(&mut self, subs: &[i64]) -> Result<()> {
        self.require_ascbin("goto_array_element")?;
        self.transactional(|cursor| cursor.goto_array_element_inner(subs))
    }

    fn goto_array_element_inner(&mut self, subs: &[i64]) -> Result<()> {
        let array_ty = self.top().ty.clone();
        let array = array_ty.as_array().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to an array".into())
        })?;
        if subs.len() != array.num_dims() {
            return Err(Error::ArrayNumDimsMismatch(format!(
                "number of dimensions argument ({}) does not match rank of \
                 array ({})",
                subs.len(),
                array.num_dims()
            )));
        }
        let dims = self.get_array_dim()?;
        let mut offset_elements = 0i64;
        for (i, (&sub, &dim)) in subs.iter().zip(dims.iter()).enumerate() {
            if sub < 0 || sub >= dim {
                return Err(Error::ArrayOutOfBounds(format!(
                    "array index ({sub}) exceeds array range [0:{dim}) for \
                     dimension {i}"
                )));
            }
            if i > 0 {
                offset_elements *= dim;
            }
            offset_elements += sub;
        }
        self.descend_to_element(array_ty, offset_elements)
    }

    pub fn goto_array_element_by_index(&mut self, index: i64) -> Result<()> {
        self.require_ascbin("goto_array_element_by_index")?;
        self.transactional(|cursor| {
            cursor.goto_array_element_by_index_inner(index)
        })
    }

    fn goto_array_element_by_index_inner(&mut self, index: i64) -> Result<()> {
        let array_ty = self.top().ty.clone();
        if array_ty.as_array().is_none() {
            return Err(Error::InvalidType(
                "cursor does not refer to an array".into(),
            ));
        }
        if self.product.options().perform_boundary_checks {
            let num_elements = self.get_num_elements()?;
            if index < 0 || index >= num_elements {
                return Err(Error::ArrayOutOfBounds(format!(
                    "array index ({index}) exceeds array range \
                     [0:{num_elements})"
                )));
            }
        } else if index < 0 {
            return Err(Error::ArrayOutOfBounds(format!(
                "array index ({index}) exceeds array range"
            )));
        }
        self.descend_to_element(array_ty, index)
    }

    /// Push an element frame, walking earlier elements when the base type
    /// has no fixed size.
    fn descend_to_element(
        &mut self,
        array_ty: Arc<Type>,
        offset_elements: i64,
    ) -> Result<()> {
        let array = array_ty.as_array().unwrap();
        let base = array.base_type().clone();
        let start_offset = self.top().bit_offset;
        self.push(Frame {
            ty: base.clone(),
            index: 0,
            bit_offset: start_offset,
        })?;
        if base.bit_size() >= 0 {
            self.top_mut().bit_offset += offset_elements * base.bit_size();
        } else {
            for i in 0..offset_elements {
                self.top_mut().index = i as isize;
                let bit_size = self.get_bit_size()?;
                self.top_mut().bit_offset += bit_size;
            }
        }
        self.top_mut().index = offset_elements as isize;
        self.maybe_bypass();
        Ok(())
    }

    pub fn goto_next_array_element(&mut self) -> Result<()> {
        self.require_ascbin("goto_next_array_element")?;
        self.transactional(Cursor::goto_next_array_element_inner)
    }

    fn goto_next_array_element_inner(&mut self) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(Error::InvalidType(
                "cursor does not refer to an array element".into(),
            ));
        }
        let array_ty = self.stack[self.stack.len() - 2].ty.clone();
        let array = array_ty.as_array().ok_or_else(|| {
            Error::InvalidType(
                "cursor does not refer to an array element".into(),
            )
        })?;
        let index = self.top().index as i64 + 1;
        if self.product.options().perform_boundary_checks {
            let mut array_cursor = self.clone();
            array_cursor.stack.pop();
            let num_elements = array_cursor.get_num_elements()?;
            if index >= num_elements {
                return Err(Error::ArrayOutOfBounds(format!(
                    "array index ({index}) exceeds array range \
                     [0:{num_elements})"
                )));
            }
        }
        let bit_size = self.get_bit_size()?;
        let top = self.top_mut();
        top.ty = array.base_type().clone();
        top.index = index as isize;
        top.bit_offset += bit_size;
        self.maybe_bypass();
        Ok(())
    }

    /// Move to the (possibly empty) attributes record of the current node.
    /// Attribute frames are virtual: they carry no bit offset.
    pub fn goto_attributes(&mut self) -> Result<()> {
        let attributes = self.top().ty.attributes_record();
        self.push(Frame {
            ty: attributes,
            index: -1,
            bit_offset: -1,
        })
    }

    /// Rebind the current frame to the base type of a special type.
    pub fn use_base_type_of_special_type(&mut self) -> Result<()> {
        let base = match self.top().ty.as_special() {
            Some(special) => special.base_type().clone(),
            None => {
                return Err(Error::InvalidType(
                    "cursor does not refer to a special type".into(),
                ));
            }
        };
        self.top_mut().ty = base;
        Ok(())
    }

    /// Interpret a path (`/`, field names, `[index]`, `@name`, `.`, `..`)
    /// and move accordingly. A leading `/` starts from the root.
    pub fn goto(&mut self, path: &str) -> Result<()> {
        self.transactional(|cursor| cursor.goto_inner(path))
    }

    fn goto_inner(&mut self, path: &str) -> Result<()> {
        let bytes = path.as_bytes();
        let mut start = 0;
        if bytes.first() == Some(&b'/') {
            self.goto_root()?;
            // keep the '/' only when followed by a field name
            if bytes.len() == 1
                || matches!(bytes[1], b'/' | b'[' | b'@')
            {
                start += 1;
            }
        }
        while start < bytes.len() {
            match bytes[start] {
                b'@' => {
                    self.goto_attributes()?;
                    start += 1;
                    let end = segment_end(bytes, start);
                    self.goto_path_segment(path, start, end)?;
                    start = end;
                }
                b'[' => {
                    start += 1;
                    let end = start
                        + bytes[start..]
                            .iter()
                            .position(|b| *b == b']')
                            .ok_or_else(|| {
                                Error::InvalidArgument(format!(
                                    "invalid path '{path}' (missing ']')"
                                ))
                            })?;
                    let index: i64 = path[start..end]
                        .trim()
                        .parse()
                        .map_err(|_| {
                            Error::InvalidArgument(format!(
                                "invalid array index '{}' in path",
                                &path[start..end]
                            ))
                        })?;
                    self.goto_array_element_by_index(index)?;
                    start = end + 1;
                }
                _ => {
                    if bytes[start] == b'/' {
                        start += 1;
                    } else if start > 0 {
                        return Err(Error::InvalidArgument(format!(
                            "invalid path '{path}' (missing '/'?)"
                        )));
                    }
                    let end = segment_end(bytes, start);
                    self.goto_path_segment(path, start, end)?;
                    start = end;
                }
            }
        }
        Ok(())
    }

    fn goto_path_segment(
        &mut self,
        path: &str,
        start: usize,
        end: usize,
    ) -> Result<()> {
        match &path[start..end] {
            "." => Ok(()),
            ".." => self.goto_parent(),
            "" => Err(Error::InvalidArgument(format!(
                "invalid path '{path}' (empty name)"
            ))),
            name => self.goto_record_field_by_name(name),
        }
    }
}

fn segment_end(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|b| matches!(b, b'/' | b'[' | b'@'))
        .map(|pos| start + pos)
        .unwrap_or(bytes.len())
}

/// Relative field offsets (§ record layout).
impl<'p> Cursor<'p> {
    /// Offset of field `field_index` relative to the record the cursor
    /// points at.
    fn rel_field_bit_offset(&self, field_index: usize) -> Result<i64> {
        let record_ty = self.top().ty.clone();
        let record = record_ty.as_record().unwrap();
        let field = record.field(field_index);

        if field.bit_offset() >= 0 {
            return Ok(field.bit_offset());
        }

        if let Some(offset_expr) = field.bit_offset_expr() {
            if let Some(available_expr) = field.available_expr() {
                let available = available_expr
                    .eval_bool(Some(self))
                    .map_err(|err| {
                        self.position_context(
                            err.with_context(" for available expression"),
                        )
                    })?;
                if !available {
                    // the field occupies no bits, reuse its predecessor
                    if field_index == 0 {
                        return Ok(0);
                    }
                    return self.rel_field_bit_offset(field_index - 1);
                }
            }
            return offset_expr.eval_integer(Some(self)).map_err(|err| {
                self.position_context(
                    err.with_context(" for offset expression"),
                )
            });
        }

        // field 0 always has a fixed offset or an offset expression
        debug_assert!(field_index > 0);

        // walk forward from the nearest resolved predecessor
        let mut resolved = field_index - 1;
        while record.field(resolved).bit_offset() < 0
            && record.field(resolved).bit_offset_expr().is_none()
        {
            resolved -= 1;
        }
        let mut prev = self.rel_field_bit_offset(resolved)?;
        let mut field_cursor = self.clone();
        field_cursor.push(Frame {
            ty: record.field(resolved).field_type().clone(),
            index: resolved as isize,
            bit_offset: self.top().bit_offset + prev,
        })?;
        for k in resolved..field_index {
            let field = record.field(k);
            let mut available = true;
            if let Some(available_expr) = field.available_expr() {
                available = available_expr
                    .eval_bool(Some(self))
                    .map_err(|err| {
                        err.with_context(" for available expression")
                    })?;
            }
            if available {
                let top = field_cursor.top_mut();
                top.ty = field.field_type().clone();
                top.index = k as isize;
                let bit_size = field_cursor.get_bit_size()?;
                prev += bit_size;
                field_cursor.top_mut().bit_offset += bit_size;
            }
        }
        Ok(prev)
    }

    /// The cursor points at field `i`; compute the relative offset of
    /// field `i + 1`. When the walk had to compute field `i`'s bit size it
    /// is returned as a by-product so record size computation can reuse
    /// it.
    fn rel_next_field_bit_offset(&self) -> Result<(i64, Option<i64>)> {
        let parent = &self.stack[self.stack.len() - 2];
        let record_ty = parent.ty.clone();
        let record = record_ty.as_record().unwrap();
        let field_index = (self.top().index + 1) as usize;
        debug_assert!(field_index < record.num_fields());
        let field = record.field(field_index);

        if field.bit_offset() >= 0 {
            return Ok((field.bit_offset(), None));
        }

        let prev_rel = self.top().bit_offset - parent.bit_offset;

        if let Some(offset_expr) = field.bit_offset_expr() {
            let mut record_cursor = self.clone();
            record_cursor.stack.pop();
            if let Some(available_expr) = field.available_expr() {
                let available = available_expr
                    .eval_bool(Some(&record_cursor))
                    .map_err(|err| {
                        self.position_context(
                            err.with_context(" for available expression"),
                        )
                    })?;
                if !available {
                    return Ok((prev_rel, None));
                }
            }
            let offset = offset_expr
                .eval_integer(Some(&record_cursor))
                .map_err(|err| {
                    self.position_context(
                        err.with_context(" for offset expression"),
                    )
                })?;
            return Ok((offset, None));
        }

        let bit_size = self.get_bit_size()?;
        Ok((prev_rel + bit_size, Some(bit_size)))
    }
}

/// Size and shape queries.
impl<'p> Cursor<'p> {
    pub fn get_num_elements(&self) -> Result<i64> {
        self.require_ascbin("get_num_elements")?;
        let ty = &self.top().ty;
        match ty.type_class() {
            TypeClass::Record => {
                Ok(ty.as_record().unwrap().num_fields() as i64)
            }
            TypeClass::Array => {
                let array = ty.as_array().unwrap();
                if array.num_elements() != -1 {
                    return Ok(array.num_elements());
                }
                Ok(self.get_array_dim()?.iter().product())
            }
            _ => Ok(1),
        }
    }

    /// Evaluate every dimension of the array at the cursor.
    pub fn get_array_dim(&self) -> Result<Vec<i64>> {
        self.require_ascbin("get_array_dim")?;
        let ty = self.top().ty.clone();
        let array = ty.as_array().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to an array".into())
        })?;
        let mut dims = Vec::with_capacity(array.num_dims());
        for (i, dim) in array.dims().iter().enumerate() {
            let value = match dim {
                Dim::Fixed(value) => *value,
                Dim::Expr(expr) => {
                    expr.eval_integer(Some(self)).map_err(|err| {
                        self.position_context(err.with_context(&format!(
                            " for dim[{i}] expression"
                        )))
                    })?
                }
            };
            if value < 0 {
                return Err(self.position_context(Error::Product(format!(
                    "product error detected (invalid array size - \
                     calculated size for dim[{i}] = {value})"
                ))));
            }
            dims.push(value);
        }
        Ok(dims)
    }

    pub fn get_bit_size(&self) -> Result<i64> {
        self.require_ascbin("get_bit_size")?;
        let ty = self.top().ty.clone();
        if ty.bit_size() >= 0 {
            return Ok(ty.bit_size());
        }
        match ty.type_class() {
            TypeClass::Record => self.record_bit_size(&ty),
            TypeClass::Array => self.array_bit_size(&ty),
            TypeClass::Special => {
                let mut base_cursor = self.clone();
                base_cursor.use_base_type_of_special_type()?;
                base_cursor.get_bit_size()
            }
            _ => self.leaf_bit_size(&ty),
        }
    }

    pub fn get_byte_size(&self) -> Result<i64> {
        let bit_size = self.get_bit_size()?;
        Ok((bit_size + 7) / 8)
    }

    fn record_bit_size(&self, ty: &Arc<Type>) -> Result<i64> {
        let record = ty.as_record().unwrap();

        if self.product.options().use_fast_size_expressions {
            if let Some(size_expr) = ty.size_expr() {
                let mut bit_size = size_expr
                    .expr
                    .eval_integer(Some(self))
                    .map_err(|err| {
                        self.position_context(
                            err.with_context(" for size expression"),
                        )
                    })?;
                if size_expr.unit == SizeUnit::Bytes {
                    bit_size *= 8;
                }
                if bit_size < 0 {
                    return Err(self.position_context(Error::Product(
                        format!("calculated size is negative ({bit_size} bits)"),
                    )));
                }
                return Ok(bit_size);
            }
        }

        if record.union_field_expr().is_some() {
            let mut field_cursor = self.clone();
            field_cursor.goto_available_union_field()?;
            return field_cursor.get_bit_size();
        }

        let num_fields = record.num_fields();
        if num_fields == 0 {
            return Ok(0);
        }
        let mut total = 0;
        let mut field_cursor = self.clone();
        field_cursor.goto_first_record_field()?;
        for i in 0..num_fields {
            let mut rel_offset = 0;
            let mut field_size = None;
            if i + 1 < num_fields {
                let (rel, size) = field_cursor.rel_next_field_bit_offset()?;
                rel_offset = rel;
                field_size = size;
            }
            let field_size = match field_size {
                Some(size) => size,
                None => field_cursor.get_bit_size()?,
            };
            total += field_size;
            if i + 1 < num_fields {
                let mut available = true;
                if let Some(available_expr) =
                    record.field(i + 1).available_expr()
                {
                    available = available_expr.eval_bool(Some(self))?;
                }
                let top = field_cursor.top_mut();
                top.ty = if available {
                    record.field(i + 1).field_type().clone()
                } else {
                    no_data_singleton(ty.format())
                };
                top.index = (i + 1) as isize;
                top.bit_offset = self.top().bit_offset + rel_offset;
            }
        }
        Ok(total)
    }

    fn array_bit_size(&self, ty: &Arc<Type>) -> Result<i64> {
        let array = ty.as_array().unwrap();
        let num_elements = self.get_num_elements()?;
        if num_elements == 0 {
            return Ok(0);
        }
        let base = array.base_type();
        if base.bit_size() >= 0 {
            return Ok(num_elements * base.bit_size());
        }
        let mut total = 0;
        let mut element_cursor = self.clone();
        element_cursor.push(Frame {
            ty: base.clone(),
            index: 0,
            bit_offset: self.top().bit_offset,
        })?;
        for i in 0..num_elements {
            element_cursor.top_mut().index = i as isize;
            let element_size = element_cursor.get_bit_size()?;
            total += element_size;
            element_cursor.top_mut().bit_offset += element_size;
        }
        Ok(total)
    }

    /// Size of a number/text/raw leaf whose extent is not fixed: resolved
    /// through ascii mappings, special text scanning, or the size
    /// expression.
    fn leaf_bit_size(&self, ty: &Arc<Type>) -> Result<i64> {
        if ty.format() == Format::Ascii {
            if let Some(number) = ty.as_number() {
                if number.has_mappings() {
                    if let Some(bits) = self.match_mapping_bit_size(ty)? {
                        return Ok(bits);
                    }
                    if number.mappings_default_bit_size() >= 0 {
                        return Ok(number.mappings_default_bit_size());
                    }
                }
            }
            if let Some(text) = ty.as_text() {
                let pos = self.byte_position()?;
                let data = self.product.data();
                match text.special() {
                    SpecialTextKind::Default => (),
                    SpecialTextKind::LineSeparator => {
                        return Ok(8 * read::eol_length(data, pos) as i64);
                    }
                    SpecialTextKind::LineWithEol => {
                        return Ok(8 * read::line_length(data, pos, true) as i64);
                    }
                    SpecialTextKind::LineWithoutEol => {
                        return Ok(
                            8 * read::line_length(data, pos, false) as i64
                        );
                    }
                    SpecialTextKind::Whitespace => {
                        return Ok(
                            8 * read::whitespace_length(data, pos) as i64
                        );
                    }
                }
            }
        }
        if let Some(size_expr) = ty.size_expr() {
            let mut bit_size =
                size_expr.expr.eval_integer(Some(self)).map_err(|err| {
                    self.position_context(
                        err.with_context(" for size expression"),
                    )
                })?;
            if size_expr.unit == SizeUnit::Bytes {
                bit_size *= 8;
            }
            if bit_size < 0 {
                return Err(self.position_context(Error::Product(format!(
                    "calculated size is negative ({bit_size} bits)"
                ))));
            }
            return Ok(bit_size);
        }
        Err(self.position_context(Error::Product(
            "cannot determine bit size".into(),
        )))
    }

    /// Try each ascii mapping against the data at the cursor; a match
    /// fixes the leaf's extent to the mapping string length.
    fn match_mapping_bit_size(&self, ty: &Arc<Type>) -> Result<Option<i64>> {
        let number = ty.as_number().unwrap();
        let pos = self.byte_position()?;
        let data = self.product.data();
        let matches = |s: &str| data[pos.min(data.len())..].starts_with(s.as_bytes());
        for mapping in number.integer_mappings() {
            if matches(&mapping.str) {
                return Ok(Some(8 * mapping.str.len() as i64));
            }
        }
        for mapping in number.float_mappings() {
            if matches(&mapping.str) {
                return Ok(Some(8 * mapping.str.len() as i64));
            }
        }
        Ok(None)
    }

    pub fn get_string_length(&self) -> Result<i64> {
        let ty = &self.top().ty;
        if ty.type_class() != TypeClass::Text {
            return Err(Error::InvalidType(
                "cursor does not refer to text".into(),
            ));
        }
        Ok(self.get_bit_size()? / 8)
    }

    pub fn get_record_field_available_status(
        &self,
        index: usize,
    ) -> Result<bool> {
        self.require_ascbin("get_record_field_available_status")?;
        let ty = self.top().ty.clone();
        let record = ty.as_record().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to a record".into())
        })?;
        if index >= record.num_fields() {
            return Err(Error::InvalidIndex(format!(
                "field index ({index}) is not in the range [0,{})",
                record.num_fields()
            )));
        }
        if record.union_field_expr().is_some() {
            return Ok(index == self.get_available_union_field_index()?);
        }
        match record.field(index).available_expr() {
            Some(available_expr) => available_expr.eval_bool(Some(self)),
            None => Ok(true),
        }
    }

    /// Evaluate the union field expression with a probe cursor positioned
    /// on the first union field and validate the resulting index.
    pub fn get_available_union_field_index(&self) -> Result<usize> {
        self.require_ascbin("get_available_union_field_index")?;
        let ty = self.top().ty.clone();
        let record = ty.as_record().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to a union".into())
        })?;
        let union_field_expr = record.union_field_expr().ok_or_else(|| {
            Error::InvalidType("cursor does not refer to a union".into())
        })?;
        debug_assert!(record.num_fields() > 0);

        let mut probe = self.clone();
        probe.push(Frame {
            ty: record.field(0).field_type().clone(),
            index: -1,
            bit_offset: self.top().bit_offset,
        })?;
        let index =
            union_field_expr.eval_integer(Some(&probe)).map_err(|err| {
                self.position_context(
                    err.with_context(" for union field expression"),
                )
            })?;
        if index < 0 || index >= record.num_fields() as i64 {
            let bit_offset = self.top().bit_offset;
            return Err(self.position_context(Error::Product(format!(
                "possible product error detected (invalid result ({index}) \
                 from union field expression - num fields = {} - byte:bit \
                 offset = {}:{})",
                record.num_fields(),
                bit_offset >> 3,
                bit_offset & 7
            ))));
        }
        Ok(index as usize)
    }

    /// Byte-aligned position of the current node.
    fn byte_position(&self) -> Result<usize> {
        let bit_offset = self.top().bit_offset;
        if bit_offset < 0 {
            return Err(Error::Product(
                "cannot read data at a virtual position".into(),
            ));
        }
        if bit_offset % 8 != 0 {
            return Err(Error::Product(format!(
                "ascii content must be byte aligned (byte:bit offset \
                 {}:{})",
                bit_offset >> 3,
                bit_offset & 7
            )));
        }
        let pos = (bit_offset / 8) as usize;
        if pos > self.product.data().len() {
            return Err(Error::FileRead(format!(
                "trying to read beyond the end of the file (byte offset \
                 {pos}, file size {} bytes)",
                self.product.data().len()
            )));
        }
        Ok(pos)
    }
}

/// Leaf reads.
impl<'p> Cursor<'p> {
    /// Raw integer value of the number leaf at the cursor, before any
    /// conversion.
    pub fn read_int64(&self) -> Result<i64> {
        self.require_ascbin("read_int64")?;
        let ty = self.top().ty.clone();
        match ty.type_class() {
            TypeClass::Integer => (),
            _ => {
                return Err(Error::InvalidType(format!(
                    "cannot read {} type as an integer",
                    ty.type_class().name()
                )));
            }
        }
        let bit_size = self.get_bit_size()?;
        if ty.format() == Format::Ascii {
            let text = self.leaf_bytes(bit_size)?;
            let number = ty.as_number().unwrap();
            for mapping in number.integer_mappings() {
                if text == mapping.str.as_bytes() {
                    return Ok(mapping.value);
                }
            }
            return parse_ascii_integer(&text)
                .map_err(|err| self.position_context(err));
        }
        let data = self.product.data();
        let number = ty.as_number().unwrap();
        let bit_offset = self.non_virtual_bit_offset()?;
        if ty.read_type().is_signed_integer() {
            read::read_signed(data, bit_offset, bit_size, number.endianness())
        } else {
            read::read_unsigned(
                data,
                bit_offset,
                bit_size,
                number.endianness(),
            )
            .map(|value| value as i64)
        }
    }

    /// Double value of the leaf at the cursor. Numbers go through their
    /// conversion when conversions are enabled; special types yield their
    /// logical value.
    pub fn read_double(&self) -> Result<f64> {
        self.require_ascbin("read_double")?;
        let ty = self.top().ty.clone();
        match ty.type_class() {
            TypeClass::Integer => {
                let value = self.read_int64()? as f64;
                Ok(self.apply_conversion(&ty, value))
            }
            TypeClass::Real => {
                let bit_size = self.get_bit_size()?;
                let value = if ty.format() == Format::Ascii {
                    let text = self.leaf_bytes(bit_size)?;
                    let number = ty.as_number().unwrap();
                    let mut mapped = None;
                    for mapping in number.float_mappings() {
                        if text == mapping.str.as_bytes() {
                            mapped = Some(mapping.value);
                            break;
                        }
                    }
                    match mapped {
                        Some(value) => value,
                        None => parse_ascii_float(&text)
                            .map_err(|err| self.position_context(err))?,
                    }
                } else {
                    let number = ty.as_number().unwrap();
                    let bit_offset = self.non_virtual_bit_offset()?;
                    let data = self.product.data();
                    match bit_size {
                        32 => <f64 as From<f32>>::from(read::read_f32(
                            data,
                            bit_offset,
                            number.endianness(),
                        )?),
                        64 => read::read_f64(
                            data,
                            bit_offset,
                            number.endianness(),
                        )?,
                        other => {
                            return Err(Error::Product(format!(
                                "invalid bit size ({other}) for floating \
                                 point read"
                            )));
                        }
                    }
                };
                Ok(self.apply_conversion(&ty, value))
            }
            TypeClass::Special => self.read_special_double(&ty),
            class => Err(Error::InvalidType(format!(
                "cannot read {} type as a double",
                class.name()
            ))),
        }
    }

    pub fn read_float(&self) -> Result<f32> {
        Ok(self.read_double()? as f32)
    }

    fn read_special_double(&self, ty: &Arc<Type>) -> Result<f64> {
        let special = ty.as_special().unwrap();
        match special.kind() {
            SpecialKind::Time => {
                let mut base_cursor = self.clone();
                base_cursor.use_base_type_of_special_type()?;
                let value_expr = special
                    .value_expr()
                    .expect("time type always has a value expression");
                value_expr.eval_float(Some(&base_cursor)).map_err(|err| {
                    self.position_context(
                        err.with_context(" for time value expression"),
                    )
                })
            }
            SpecialKind::VsfInteger => {
                let mut base_cursor = self.clone();
                base_cursor.use_base_type_of_special_type()?;
                let mut scale_cursor = base_cursor.clone();
                scale_cursor.goto_record_field_by_name("scale_factor")?;
                let scale = scale_cursor.read_int64()?;
                let mut value_cursor = base_cursor;
                value_cursor.goto_record_field_by_name("value")?;
                let value = value_cursor.read_int64()?;
                Ok(value as f64 * 10f64.powi(scale as i32))
            }
            SpecialKind::NoData => Err(Error::InvalidType(
                "cannot read no-data type as a double".into(),
            )),
            SpecialKind::Complex => Err(Error::InvalidType(
                "cannot read complex type as a single double".into(),
            )),
        }
    }

    /// Read a complex special type as `(real, imaginary)`.
    pub fn read_complex(&self) -> Result<(f64, f64)> {
        let ty = self.top().ty.clone();
        match ty.as_special().map(|special| special.kind()) {
            Some(SpecialKind::Complex) => (),
            _ => {
                return Err(Error::InvalidType(
                    "cursor does not refer to a complex type".into(),
                ));
            }
        }
        let mut base_cursor = self.clone();
        base_cursor.use_base_type_of_special_type()?;
        let mut real_cursor = base_cursor.clone();
        real_cursor.goto_record_field_by_name("real")?;
        let mut imaginary_cursor = base_cursor;
        imaginary_cursor.goto_record_field_by_name("imaginary")?;
        Ok((real_cursor.read_double()?, imaginary_cursor.read_double()?))
    }

    /// Seconds since 2000-01-01 for a time special type.
    pub fn read_time(&self) -> Result<f64> {
        let ty = self.top().ty.clone();
        match ty.as_special().map(|special| special.kind()) {
            Some(SpecialKind::Time) => self.read_special_double(&ty),
            _ => Err(Error::InvalidType(
                "cursor does not refer to a time type".into(),
            )),
        }
    }

    pub fn read_char(&self) -> Result<u8> {
        let ty = self.top().ty.clone();
        if ty.type_class() != TypeClass::Text
            || ty.read_type() != ReadType::Char
        {
            return Err(Error::InvalidType(
                "cursor does not refer to a char".into(),
            ));
        }
        let bytes = self.leaf_bytes(8)?;
        Ok(bytes[0])
    }

    /// The text at the cursor, without any trailing terminator.
    pub fn read_string(&self) -> Result<Vec<u8>> {
        let ty = self.top().ty.clone();
        if ty.type_class() != TypeClass::Text {
            return Err(Error::InvalidType(
                "cursor does not refer to text".into(),
            ));
        }
        let bit_size = self.get_bit_size()?;
        let bytes = self.leaf_bytes(bit_size)?;
        if let Some(fixed_value) = ty.as_text().unwrap().fixed_value() {
            if bytes != fixed_value.as_bytes() {
                return Err(self.position_context(Error::Product(format!(
                    "string data does not match fixed value '{fixed_value}'"
                ))));
            }
        }
        Ok(bytes)
    }

    /// Up to `max` bytes of the leaf's extent, for expression string
    /// reads; works on any readable leaf.
    pub(crate) fn read_string_n(&self, max: Option<i64>) -> Result<Vec<u8>> {
        let bit_size = self.get_bit_size()?;
        let mut byte_length = (bit_size + 7) / 8;
        if let Some(max) = max {
            if max < 0 {
                return Err(Error::InvalidArgument(format!(
                    "invalid string length ({max})"
                )));
            }
            byte_length = byte_length.min(max);
        }
        self.leaf_bytes(byte_length * 8)
    }

    /// The raw bytes of the blob at the cursor.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let ty = self.top().ty.clone();
        let bit_size = self.get_bit_size()?;
        let bytes = self.leaf_bytes(bit_size)?;
        if let Some(raw) = ty.as_raw() {
            if let Some(fixed_value) = raw.fixed_value() {
                if bytes != fixed_value {
                    return Err(self.position_context(Error::Product(
                        "raw data does not match fixed value".into(),
                    )));
                }
            }
        }
        Ok(bytes)
    }

    /// `length` bytes starting `offset` bytes into the current node.
    pub(crate) fn read_raw_bytes(
        &self,
        offset: i64,
        length: i64,
    ) -> Result<Vec<u8>> {
        if length < 0 || offset < 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid byte range ({offset},{length})"
            )));
        }
        let bit_offset = self.non_virtual_bit_offset()? + 8 * offset;
        read::read_bytes(self.product.data(), bit_offset, length)
    }

    /// The ascii line at the cursor position.
    pub(crate) fn read_ascii_line(
        &self,
        include_eol: bool,
    ) -> Result<Vec<u8>> {
        let pos = self.byte_position()?;
        let data = self.product.data();
        let length = read::line_length(data, pos, include_eol);
        Ok(data[pos..pos + length].to_vec())
    }

    fn leaf_bytes(&self, bit_size: i64) -> Result<Vec<u8>> {
        let bit_offset = self.non_virtual_bit_offset()?;
        read::read_bytes(self.product.data(), bit_offset, (bit_size + 7) / 8)
    }

    fn non_virtual_bit_offset(&self) -> Result<i64> {
        let bit_offset = self.top().bit_offset;
        if bit_offset < 0 {
            return Err(Error::Product(
                "cannot read data at a virtual position".into(),
            ));
        }
        Ok(bit_offset)
    }

    fn apply_conversion(&self, ty: &Arc<Type>, value: f64) -> f64 {
        if !self.product.options().perform_conversions {
            return value;
        }
        match ty.as_number().and_then(|number| number.conversion()) {
            Some(conversion) => conversion.apply(value),
            None => value,
        }
    }

    fn read_integer_as<T: NumCast>(&self) -> Result<T> {
        let ty = self.top().ty.clone();
        if self.product.options().perform_conversions
            && ty
                .as_number()
                .is_some_and(|number| number.conversion().is_some())
        {
            return Err(Error::InvalidType(
                "type has a conversion, read it as a double".into(),
            ));
        }
        let value = self.read_int64()?;
        NumCast::from(value).ok_or_else(|| {
            Error::Product(format!(
                "value ({value}) does not fit the requested integer type"
            ))
        })
    }

    pub fn read_i8(&self) -> Result<i8> {
        self.read_integer_as()
    }

    pub fn read_u8(&self) -> Result<u8> {
        self.read_integer_as()
    }

    pub fn read_i16(&self) -> Result<i16> {
        self.read_integer_as()
    }

    pub fn read_u16(&self) -> Result<u16> {
        self.read_integer_as()
    }

    pub fn read_i32(&self) -> Result<i32> {
        self.read_integer_as()
    }

    pub fn read_u32(&self) -> Result<u32> {
        self.read_integer_as()
    }

    pub fn read_i64(&self) -> Result<i64> {
        self.read_integer_as()
    }

    pub fn read_u64(&self) -> Result<u64> {
        let value = self.read_int64()?;
        Ok(value as u64)
    }
}
