//! Uniform, hierarchical, read-only access to structured scientific data
//! products whose on-disk layout is described by a format definition.
//!
//! A [`DataDictionary`] holds product classes, types, and versioned
//! definitions. [`DataDictionary::open`] sniffs the file format, walks the
//! detection tree to bind a definition, and returns a [`Product`]; a
//! [`Cursor`] then navigates the product tree and reads typed leaves at
//! bit-level offsets computed on demand.

#![deny(unsafe_code)]

pub mod backend;
pub mod cursor;
pub mod detection;
pub mod dictionary;
mod error;
pub mod expr;
pub(crate) mod read;
pub mod timeutil;
pub mod types;

#[cfg(test)]
mod test;

use std::cell::RefCell;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

pub use cursor::{Cursor, CURSOR_MAXDEPTH};
pub use dictionary::{
    DataDictionary, DetectionRule, DetectionRuleEntry, FileInfo,
    ProductClass, ProductDefinition, ProductType, ProductVariable,
};
pub use error::{Error, Result};
pub use expr::{ExprTag, Expression, Literal, ResultType};
pub use types::{Format, ReadType, Type, TypeClass};

use types::raw_file_singleton;

/// Size of the head-of-file buffer inspected for format magic numbers.
pub const DETECTION_BLOCK_SIZE: usize = 16384;

/// Per-open tunables.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Memory-map products instead of buffering them.
    pub use_mmap: bool,
    /// Re-validate array indices on `goto_*_by_index`.
    pub perform_boundary_checks: bool,
    /// After any goto landing on a special type, rebind to its base type.
    pub bypass_special_types: bool,
    /// Prefer a record's size expression over per-field summation.
    pub use_fast_size_expressions: bool,
    /// Apply number conversions on reads.
    pub perform_conversions: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            use_mmap: true,
            perform_boundary_checks: true,
            bypass_special_types: false,
            use_fast_size_expressions: true,
            perform_conversions: true,
        }
    }
}

#[derive(Debug)]
enum ProductData {
    Mapped(Mmap),
    Buffered(Vec<u8>),
}

impl ProductData {
    fn bytes(&self) -> &[u8] {
        match self {
            ProductData::Mapped(map) => map,
            ProductData::Buffered(buffer) => buffer,
        }
    }
}

/// An open product file, bound to a product definition when detection (or
/// `open_as`) succeeded.
///
/// Dropping the product releases the mapping or buffer and the product
/// variable storage.
#[derive(Debug)]
pub struct Product {
    filename: PathBuf,
    file_size: i64,
    format: Format,
    data: ProductData,
    root_type: Arc<Type>,
    definition: Option<Arc<ProductDefinition>>,
    class_name: Option<String>,
    type_name: Option<String>,
    variables: RefCell<Vec<Option<Vec<i64>>>>,
    options: Options,
}

impl Product {
    /// Open the file as a raw binary blob and sniff its format.
    fn open_raw(path: &Path, options: Options) -> Result<Product> {
        let file = File::open(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::FileNotFound(format!("{}: {err}", path.display()))
            }
            _ => Error::FileOpen(format!("{}: {err}", path.display())),
        })?;
        let metadata = file.metadata().map_err(|err| {
            Error::FileOpen(format!("{}: {err}", path.display()))
        })?;
        // empty files cannot be mapped
        let data = if options.use_mmap && metadata.len() > 0 {
            ProductData::Mapped(map_file(&file, path)?)
        } else {
            let mut buffer = Vec::with_capacity(metadata.len() as usize);
            let mut file = file;
            file.read_to_end(&mut buffer).map_err(|err| {
                Error::FileRead(format!("{}: {err}", path.display()))
            })?;
            ProductData::Buffered(buffer)
        };
        let format = detect_format(data.bytes());
        log::debug!(
            "opened {} ({} bytes, detected format {format})",
            path.display(),
            metadata.len()
        );
        Ok(Product {
            filename: path.to_owned(),
            file_size: metadata.len() as i64,
            format,
            data,
            root_type: raw_file_singleton(),
            definition: None,
            class_name: None,
            type_name: None,
            variables: RefCell::new(Vec::new()),
            options,
        })
    }

    /// Rebind the product to `definition`: swap in its root type and
    /// allocate (empty) product variable storage.
    fn bind_definition(
        &mut self,
        dictionary: &DataDictionary,
        definition: Arc<ProductDefinition>,
    ) -> Result<()> {
        if self.format != definition.format()
            && !(self.format == Format::Binary
                && definition.format() == Format::Ascii)
        {
            return Err(Error::UnsupportedProduct(Some(format!(
                "cannot use {} definition for {} product",
                definition.format(),
                self.format
            ))));
        }
        let root_type = definition.root_type().ok_or_else(|| {
            Error::DataDefinition(format!(
                "product definition '{}' has no root type",
                definition.name()
            ))
        })?;
        self.format = definition.format();
        self.root_type = root_type.clone();
        self.variables =
            RefCell::new(vec![None; definition.num_product_variables()]);
        if let Some((class, product_type)) = dictionary.owner_of(&definition) {
            self.class_name = Some(class.to_owned());
            self.type_name = Some(product_type.to_owned());
        }
        log::debug!(
            "bound {} to definition {} (version {})",
            self.filename.display(),
            definition.name(),
            definition.version()
        );
        self.definition = Some(definition);
        Ok(())
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub(crate) fn filename_string(&self) -> String {
        self.filename.display().to_string()
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn root_type(&self) -> &Arc<Type> {
        &self.root_type
    }

    pub fn definition(&self) -> Option<&Arc<ProductDefinition>> {
        self.definition.as_ref()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.data.bytes()
    }

    /// Release the product. Equivalent to dropping it.
    pub fn close(self) {}

    /// Create a cursor at the product root.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        Cursor::new(self)
    }
}

/// Product variables.
impl Product {
    fn require_definition(&self) -> Result<&Arc<ProductDefinition>> {
        self.definition.as_ref().ok_or_else(|| {
            Error::Product("product has no definition bound".into())
        })
    }

    fn variable_slot(&self, name: &str) -> Result<usize> {
        let definition = self.require_definition()?;
        definition.variable_index(name).ok_or_else(|| {
            Error::InvalidName(format!(
                "product definition {} (version {}) does not contain a \
                 product variable with name {name}",
                definition.name(),
                definition.version()
            ))
        })
    }

    pub fn variable_exists(&self, name: &str) -> bool {
        self.definition
            .as_ref()
            .and_then(|definition| definition.variable_index(name))
            .is_some()
    }

    /// Initialise variable storage on first access: evaluate the size
    /// expression, zero the array, run the init expression. A failed
    /// initialisation leaves the variable fully uninitialised.
    fn ensure_variable(&self, slot: usize) -> Result<()> {
        if self.variables.borrow()[slot].is_some() {
            return Ok(());
        }
        let definition = self.require_definition()?.clone();
        let variable = definition.product_variable(slot);
        let cursor = Cursor::new(self)?;
        let size = match variable.size_expr() {
            Some(size_expr) => {
                size_expr.eval_integer(Some(&cursor)).map_err(|err| {
                    err.with_context(&format!(
                        " while determining length of product variable {}",
                        variable.name()
                    ))
                })?
            }
            None => 1,
        };
        if size < 0 {
            return Err(Error::Product(format!(
                "calculated size ({size}) for product variable {} is \
                 negative",
                variable.name()
            )));
        }
        self.variables.borrow_mut()[slot] = Some(vec![0; size as usize]);
        let init_expr = variable
            .init_expr()
            .expect("validated product variable has an init expression");
        if let Err(err) = init_expr.eval_void(&cursor) {
            self.variables.borrow_mut()[slot] = None;
            return Err(err.with_context(&format!(
                " while initializing product variable {}",
                variable.name()
            )));
        }
        Ok(())
    }

    pub fn variable_size(&self, name: &str) -> Result<i64> {
        let slot = self.variable_slot(name)?;
        self.ensure_variable(slot)?;
        Ok(self.variables.borrow()[slot]
            .as_ref()
            .expect("variable was just initialised")
            .len() as i64)
    }

    pub fn variable_value(&self, name: &str, index: i64) -> Result<i64> {
        let size = self.variable_size(name)?;
        if index < 0 || index >= size {
            return Err(Error::InvalidIndex(format!(
                "request for index ({index}) exceeds size of product \
                 variable {name}"
            )));
        }
        let slot = self.variable_slot(name)?;
        Ok(self.variables.borrow()[slot].as_ref().unwrap()[index as usize])
    }

    pub fn variable_set(
        &self,
        name: &str,
        index: i64,
        value: i64,
    ) -> Result<()> {
        let size = self.variable_size(name)?;
        if index < 0 || index >= size {
            return Err(Error::InvalidIndex(format!(
                "request for index ({index}) exceeds size of product \
                 variable {name}"
            )));
        }
        let slot = self.variable_slot(name)?;
        self.variables.borrow_mut()[slot].as_mut().unwrap()
            [index as usize] = value;
        Ok(())
    }

    /// First index holding `value`, or -1.
    pub fn variable_index(&self, name: &str, value: i64) -> Result<i64> {
        let slot = self.variable_slot(name)?;
        self.ensure_variable(slot)?;
        let variables = self.variables.borrow();
        let storage = variables[slot].as_ref().unwrap();
        Ok(storage
            .iter()
            .position(|stored| *stored == value)
            .map(|index| index as i64)
            .unwrap_or(-1))
    }
}

#[allow(unsafe_code)]
fn map_file(file: &File, path: &Path) -> Result<Mmap> {
    // SAFETY: the mapping is read-only and backed by a file held open for
    // its lifetime; concurrent truncation of product files is outside the
    // access contract.
    unsafe { Mmap::map(file) }
        .map_err(|err| Error::FileOpen(format!("{}: {err}", path.display())))
}

/// Identify the format of a product file from its leading bytes.
fn detect_format(data: &[u8]) -> Format {
    let head = &data[..data.len().min(DETECTION_BLOCK_SIZE)];
    let n = head.len();
    if n < 4 {
        return Format::Binary;
    }
    if &head[..3] == b"CDF" && (head[3] == 1 || head[3] == 2) {
        return Format::NetCdf;
    }
    if &head[..4] == b"\x0E\x03\x13\x01" {
        return Format::Hdf4;
    }
    if n < 8 {
        return Format::Binary;
    }
    if &head[..8] == b"\x89HDF\r\n\x1A\n" {
        return Format::Hdf5;
    }
    const CDF_MAGIC: [&[u8; 8]; 5] = [
        b"\x00\x00\xFF\xFF\x00\x00\xFF\xFF",
        b"\xCD\xF2\x60\x02\x00\x00\xFF\xFF",
        b"\xCD\xF2\x60\x02\xCC\xCC\x00\x01",
        b"\xCD\xF3\x00\x01\x00\x00\xFF\xFF",
        b"\xCD\xF3\x00\x01\xCC\xCC\x00\x01",
    ];
    if CDF_MAGIC.iter().any(|magic| &head[..8] == *magic) {
        return Format::Cdf;
    }
    if &head[..4] == b"GRIB" && (head[7] == 1 || head[7] == 2) {
        return Format::Grib;
    }
    if head.starts_with(b"<?xml") || head.starts_with(b"\xEF\xBB\xBF<?xml") {
        return Format::Xml;
    }
    if n < 40 {
        return Format::Binary;
    }
    if n >= 60 && is_sp3_header(head) {
        return Format::Sp3;
    }
    if n < 80 {
        return Format::Binary;
    }
    if &head[60..80] == b"RINEX VERSION / TYPE" {
        return Format::Rinex;
    }
    // HDF5 allows user blocks of 512 * 2^k bytes before the signature
    let mut offset = 512usize;
    while offset + 8 < data.len() {
        if &data[offset..offset + 8] == b"\x89HDF\r\n\x1A\n" {
            return Format::Hdf5;
        }
        offset *= 2;
    }
    Format::Binary
}

fn is_sp3_header(head: &[u8]) -> bool {
    head[0] == b'#'
        && matches!(head[1], b'a' | b'b' | b'c')
        && matches!(head[2], b'P' | b'V')
        && head[3..7].iter().all(u8::is_ascii_digit)
        && head[7] == b' '
        && head[10] == b' '
        && head[13] == b' '
        && head[16] == b' '
        && head[19] == b' '
        && head[31] == b' '
        && head[39] == b' '
}

/// Product lifecycle entry points.
impl DataDictionary {
    /// Open a product, detect its format, and bind the definition the
    /// detection tree selects. Binary/ascii products that match no
    /// definition fail with [`Error::UnsupportedProduct`].
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Product> {
        self.open_with_options(path, Options::default())
    }

    pub fn open_with_options(
        &self,
        path: impl AsRef<Path>,
        options: Options,
    ) -> Result<Product> {
        let mut product = Product::open_raw(path.as_ref(), options)?;
        if product.format().is_self_describing() {
            return Err(backend::refusal(product.format(), "open"));
        }
        match self.find_definition_for_product(&product)? {
            Some(definition) => {
                product.bind_definition(self, definition)?;
            }
            None => {
                log::warn!(
                    "{} matches no product definition",
                    product.filename_string()
                );
                return Err(Error::UnsupportedProduct(None));
            }
        }
        Ok(product)
    }

    /// Open a product with an explicitly chosen definition, bypassing
    /// detection. A binary/ascii definition forces the file to be read as
    /// a raw binary blob regardless of its detected format.
    pub fn open_as(
        &self,
        path: impl AsRef<Path>,
        class: &str,
        product_type: &str,
        version: i32,
    ) -> Result<Product> {
        self.open_as_with_options(
            path,
            class,
            product_type,
            version,
            Options::default(),
        )
    }

    pub fn open_as_with_options(
        &self,
        path: impl AsRef<Path>,
        class: &str,
        product_type: &str,
        version: i32,
        options: Options,
    ) -> Result<Product> {
        let definition = self.get_definition(class, product_type, version)?;
        let mut product = Product::open_raw(path.as_ref(), options)?;
        if definition.format().is_ascbin() {
            // read the file as a plain binary blob
            product.format = Format::Binary;
        } else if product.format().is_self_describing() {
            return Err(backend::refusal(product.format(), "open_as"));
        }
        product.bind_definition(self, definition)?;
        Ok(product)
    }

    /// Determine file size, format, and (for binary/ascii products) the
    /// matching class, type, and version, without keeping the product
    /// open.
    pub fn recognize_file(&self, path: impl AsRef<Path>) -> Result<FileInfo> {
        let product = Product::open_raw(path.as_ref(), Options::default())?;
        let mut info = FileInfo {
            file_size: product.file_size(),
            format: product.format(),
            product_class: None,
            product_type: None,
            version: None,
        };
        if product.format().is_ascbin() {
            if let Some(definition) =
                self.find_definition_for_product(&product)?
            {
                info.format = definition.format();
                info.version = Some(definition.version());
                if let Some((class, product_type)) = self.owner_of(&definition)
                {
                    info.product_class = Some(class.to_owned());
                    info.product_type = Some(product_type.to_owned());
                }
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod format_tests {
    use super::*;

    #[test]
    fn magic_numbers() {
        assert_eq!(detect_format(b"CDF\x01rest"), Format::NetCdf);
        assert_eq!(detect_format(b"CDF\x02rest"), Format::NetCdf);
        assert_eq!(detect_format(b"\x0E\x03\x13\x01...."), Format::Hdf4);
        assert_eq!(detect_format(b"\x89HDF\r\n\x1A\n...."), Format::Hdf5);
        assert_eq!(
            detect_format(b"\x00\x00\xFF\xFF\x00\x00\xFF\xFF"),
            Format::Cdf
        );
        assert_eq!(detect_format(b"GRIB\x00\x00\x00\x01"), Format::Grib);
        assert_eq!(detect_format(b"<?xml version=\"1.0\"?>"), Format::Xml);
        assert_eq!(
            detect_format(b"\xEF\xBB\xBF<?xml version=\"1.0\"?>"),
            Format::Xml
        );
        assert_eq!(detect_format(b"just some bytes"), Format::Binary);
        assert_eq!(detect_format(b""), Format::Binary);
    }

    #[test]
    fn rinex_label_at_offset_60() {
        let mut data = vec![b' '; 100];
        data[60..80].copy_from_slice(b"RINEX VERSION / TYPE");
        assert_eq!(detect_format(&data), Format::Rinex);
    }

    #[test]
    fn hdf5_signature_after_user_block() {
        let mut data = vec![0u8; 1100];
        data[1024..1032].copy_from_slice(b"\x89HDF\r\n\x1A\n");
        assert_eq!(detect_format(&data), Format::Hdf5);
    }

    #[test]
    fn sp3_header() {
        let mut data = vec![b' '; 70];
        data[..7].copy_from_slice(b"#cP2004");
        assert_eq!(detect_format(&data), Format::Sp3);
    }
}
