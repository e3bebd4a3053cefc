use rstest::rstest;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::expr::{ExprTag, Expression};
use crate::types::{Field, ReadType, Type};
use crate::*;

fn write_product(name: &str, bytes: &[u8]) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("pfd-rs-test-{}-{name}", std::process::id()));
    fs::write(&path, bytes).unwrap();
    path
}

fn u8_t() -> Arc<Type> {
    let mut ty = Type::integer(Format::Binary);
    ty.set_read_type(ReadType::UInt8).unwrap();
    ty.set_bit_size(8).unwrap();
    Arc::new(ty)
}

fn u16_be() -> Arc<Type> {
    let mut ty = Type::integer(Format::Binary);
    ty.set_read_type(ReadType::UInt16).unwrap();
    ty.set_bit_size(16).unwrap();
    Arc::new(ty)
}

fn u32_be() -> Arc<Type> {
    let mut ty = Type::integer(Format::Binary);
    ty.set_read_type(ReadType::UInt32).unwrap();
    ty.set_bit_size(32).unwrap();
    Arc::new(ty)
}

fn f32_be() -> Arc<Type> {
    let mut ty = Type::real(Format::Binary);
    ty.set_read_type(ReadType::Float).unwrap();
    ty.set_bit_size(32).unwrap();
    Arc::new(ty)
}

fn text_t(bytes: i64) -> Arc<Type> {
    let mut ty = Type::text(Format::Ascii);
    ty.set_byte_size(bytes).unwrap();
    Arc::new(ty)
}

fn field(name: &str, ty: Arc<Type>) -> Field {
    Field::new(name, ty).unwrap()
}

/// `int(<node reached by walking `steps` from the current node>)`
fn int_at(steps: &[&str]) -> Expression {
    let mut node = Expression::new(ExprTag::GotoHere, None, vec![]).unwrap();
    for step in steps {
        node = match *step {
            ".." => {
                Expression::new(ExprTag::GotoParent, None, vec![node]).unwrap()
            }
            name => Expression::new(
                ExprTag::GotoField,
                Some(name.to_owned()),
                vec![node],
            )
            .unwrap(),
        };
    }
    Expression::new(ExprTag::Integer, None, vec![node]).unwrap()
}

fn dictionary_for(root: Type) -> DataDictionary {
    let mut definition =
        ProductDefinition::new("DEF", Format::Binary, 1).unwrap();
    definition.set_root_type(Arc::new(root)).unwrap();
    let mut product_type = ProductType::new("TYPE").unwrap();
    product_type.add_product_definition(definition).unwrap();
    let mut class = ProductClass::new("TEST").unwrap();
    class.add_product_type(product_type).unwrap();
    let mut dictionary = DataDictionary::new();
    dictionary.add_product_class(class).unwrap();
    dictionary
}

/// Open `bytes` through `root` with detection bypassed.
fn open_product(root: Type, bytes: &[u8], name: &str) -> Product {
    let dictionary = dictionary_for(root);
    let path = write_product(name, bytes);
    let product = dictionary.open_as(&path, "TEST", "TYPE", -1).unwrap();
    fs::remove_file(&path).unwrap();
    product
}

#[test]
fn fixed_offset_record_fields() {
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", u16_be())).unwrap();
    root.record_add_field(field("b", u16_be())).unwrap();
    let product = open_product(root, &[0x00, 0x01, 0x00, 0x02], "s1");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/a").unwrap();
    assert_eq!(cursor.read_u16().unwrap(), 1);
    cursor.goto_next_record_field().unwrap();
    assert_eq!(cursor.read_u16().unwrap(), 2);
    cursor.goto_parent().unwrap();
    assert_eq!(cursor.get_bit_size().unwrap(), 32);
}

#[test]
fn variable_offset_field_driven_by_sibling() {
    // data: text whose byte size is the value of the preceding len field
    let mut data_type = Type::text(Format::Ascii);
    let size = Expression::new(
        ExprTag::Multiply,
        None,
        vec![Expression::constant_integer(8), int_at(&["..", "len"])],
    )
    .unwrap();
    data_type.set_bit_size_expression(size).unwrap();

    let mut data_field = field("data", Arc::new(data_type));
    data_field
        .set_bit_offset_expression(Expression::constant_integer(8))
        .unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("len", u8_t())).unwrap();
    root.record_add_field(data_field).unwrap();
    let product =
        open_product(root, &[0x03, b'f', b'o', b'o', 0x00, 0x00], "s2");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/data").unwrap();
    assert_eq!(cursor.get_string_length().unwrap(), 3);
    assert_eq!(cursor.read_string().unwrap(), b"foo");
}

fn union_product(bytes: &[u8], name: &str) -> Product {
    let mut union = Type::union(Format::Binary);
    let mut a = field("as_int", u32_be());
    a.set_optional();
    union.record_add_field(a).unwrap();
    let mut b = field("as_float", f32_be());
    b.set_optional();
    union.record_add_field(b).unwrap();
    // the discriminant is a sibling of the union in the enclosing record
    union
        .union_set_field_expression(int_at(&["..", "..", "kind"]))
        .unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("kind", u8_t())).unwrap();
    root.record_add_field(field("u", Arc::new(union))).unwrap();
    open_product(root, bytes, name)
}

#[test]
fn union_selects_field_from_sibling_discriminant() {
    let product = union_product(&[0x01, 0x40, 0x49, 0x0F, 0xDB], "s3-float");
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/u").unwrap();
    assert_eq!(cursor.get_available_union_field_index().unwrap(), 1);
    cursor.goto_available_union_field().unwrap();
    let value = cursor.read_float().unwrap();
    assert!((value - std::f32::consts::PI).abs() < 1e-6);

    let product = union_product(&[0x00, 0x00, 0x00, 0x00, 0x2A], "s3-int");
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/u").unwrap();
    cursor.goto_available_union_field().unwrap();
    assert_eq!(cursor.index(), 0);
    assert_eq!(cursor.read_u32().unwrap(), 42);
}

#[test]
fn union_rejects_out_of_range_discriminant() {
    let product = union_product(&[0x07, 0x00, 0x00, 0x00, 0x00], "s3-bad");
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/u").unwrap();
    let err = cursor.goto_available_union_field().unwrap_err();
    assert!(matches!(err, Error::Product(_)));
    // failure leaves the cursor where it was
    assert_eq!(cursor.depth(), 2);
}

#[test]
fn optional_field_contributes_no_bits_when_unavailable() {
    // b is present only when a == 0
    let available = Expression::new(
        ExprTag::Equal,
        None,
        vec![int_at(&["a"]), Expression::constant_integer(0)],
    )
    .unwrap();
    let mut b = field("b", u8_t());
    b.set_available_expression(available).unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", u8_t())).unwrap();
    root.record_add_field(b).unwrap();
    root.record_add_field(field("c", u8_t())).unwrap();
    let product = open_product(root, &[0x05, 0x09], "s4");

    let cursor = product.cursor().unwrap();
    assert!(!cursor.get_record_field_available_status(1).unwrap());

    let mut b_cursor = cursor.clone();
    b_cursor.goto_record_field_by_index(1).unwrap();
    assert_eq!(b_cursor.get_bit_size().unwrap(), 0);

    let mut c_cursor = cursor.clone();
    c_cursor.goto("/c").unwrap();
    assert_eq!(c_cursor.get_file_bit_offset(), 8);
    assert_eq!(c_cursor.read_u8().unwrap(), 9);

    assert_eq!(cursor.get_bit_size().unwrap(), 16);
}

fn detection_definition(name: &str, marker: &str) -> ProductDefinition {
    let mut mph = Type::record(Format::Binary);
    mph.record_add_field(field("product", text_t(8))).unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("mph", Arc::new(mph))).unwrap();

    let mut definition =
        ProductDefinition::new(name, Format::Binary, 1).unwrap();
    definition.set_root_type(Arc::new(root)).unwrap();

    let read = Expression::new(
        ExprTag::String,
        None,
        vec![
            Expression::new(ExprTag::GotoHere, None, vec![]).unwrap(),
            Expression::constant_integer(8),
        ],
    )
    .unwrap();
    let matches = Expression::new(
        ExprTag::Equal,
        None,
        vec![read, Expression::constant_string(marker)],
    )
    .unwrap();
    let mut rule = DetectionRule::new();
    rule.add_entry(
        DetectionRuleEntry::new(Some("/mph/product".into()), None).unwrap(),
    );
    rule.add_entry(DetectionRuleEntry::new(None, Some(matches)).unwrap());
    definition.add_detection_rule(rule).unwrap();
    definition
}

fn detection_dictionary(order: &[(&str, &str)]) -> DataDictionary {
    let mut class = ProductClass::new("TEST").unwrap();
    for &(name, marker) in order {
        let mut product_type =
            ProductType::new(&format!("TYPE_{name}")).unwrap();
        product_type
            .add_product_definition(detection_definition(name, marker))
            .unwrap();
        class.add_product_type(product_type).unwrap();
    }
    let mut dictionary = DataDictionary::new();
    dictionary.add_product_class(class).unwrap();
    dictionary
}

#[test]
fn detection_tree_selects_matching_definition() {
    let dictionary =
        detection_dictionary(&[("A", "PROD_A__"), ("B", "PROD_B__")]);

    let path = write_product("s5-a", b"PROD_A__ rest of the product");
    let product = dictionary.open(&path).unwrap();
    assert_eq!(product.definition().unwrap().name(), "A");
    assert_eq!(product.class_name(), Some("TEST"));
    product.close();

    fs::write(&path, b"PROD_B__ rest of the product").unwrap();
    let product = dictionary.open(&path).unwrap();
    assert_eq!(product.definition().unwrap().name(), "B");
    product.close();

    fs::write(&path, b"SOMETHING else entirely here").unwrap();
    let err = dictionary.open(&path).unwrap_err();
    assert!(matches!(err, Error::UnsupportedProduct(_)));
    fs::remove_file(&path).unwrap();
}

#[test]
fn detection_is_insertion_order_independent() {
    let forward =
        detection_dictionary(&[("A", "PROD_A__"), ("B", "PROD_B__")]);
    let backward =
        detection_dictionary(&[("B", "PROD_B__"), ("A", "PROD_A__")]);

    let path = write_product("s5-order", b"PROD_B__ rest of the product");
    let first = forward.open(&path).unwrap();
    let second = backward.open(&path).unwrap();
    assert_eq!(
        first.definition().unwrap().name(),
        second.definition().unwrap().name()
    );
    fs::remove_file(&path).unwrap();
}

#[test]
fn shadowed_detection_rule_is_rejected() {
    let mut class = ProductClass::new("TEST").unwrap();
    for name in ["A", "B"] {
        let mut product_type =
            ProductType::new(&format!("TYPE_{name}")).unwrap();
        product_type
            .add_product_definition(detection_definition(name, "SAME____"))
            .unwrap();
        class.add_product_type(product_type).unwrap();
    }
    let mut dictionary = DataDictionary::new();
    let err = dictionary.add_product_class(class).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("shadowed"), "unexpected error: {message}");
}

#[test]
fn detection_tree_structure() {
    let mut root = Type::record(Format::Binary);
    let mut mph = Type::record(Format::Binary);
    mph.record_add_field(field("a", text_t(4))).unwrap();
    mph.record_add_field(field("b", text_t(4))).unwrap();
    root.record_add_field(field("mph", Arc::new(mph))).unwrap();
    let root = Arc::new(root);

    let mut definition =
        ProductDefinition::new("DEF_A", Format::Binary, 1).unwrap();
    definition.set_root_type(root.clone()).unwrap();
    let mut rule = DetectionRule::new();
    rule.add_entry(
        DetectionRuleEntry::new(Some("/mph/a".into()), None).unwrap(),
    );
    rule.add_entry(
        DetectionRuleEntry::new(None, Some(Expression::constant_boolean(true)))
            .unwrap(),
    );
    definition.add_detection_rule(rule).unwrap();

    let mut other = ProductDefinition::new("DEF_B", Format::Binary, 1).unwrap();
    other.set_root_type(root).unwrap();
    let mut rule = DetectionRule::new();
    rule.add_entry(
        DetectionRuleEntry::new(Some("/mph/b".into()), None).unwrap(),
    );
    other.add_detection_rule(rule).unwrap();

    let mut type_a = ProductType::new("TYPE_A").unwrap();
    type_a.add_product_definition(definition).unwrap();
    let mut type_b = ProductType::new("TYPE_B").unwrap();
    type_b.add_product_definition(other).unwrap();
    let mut class = ProductClass::new("TEST").unwrap();
    class.add_product_type(type_a).unwrap();
    class.add_product_type(type_b).unwrap();
    let mut dictionary = DataDictionary::new();
    dictionary.add_product_class(class).unwrap();

    let tree = dictionary.detection_tree(Format::Binary).unwrap();
    insta::assert_snapshot!(tree.describe().join("\n"), @r"
root
  path '/mph'
    path 'a'
      expression => DEF_A
    path 'b' => DEF_B
");
}

#[test]
fn product_variable_initialised_from_product() {
    let mut data = Type::array(Format::Binary);
    data.array_set_base_type(u8_t()).unwrap();
    data.array_add_fixed_dimension(100).unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("data", Arc::new(data))).unwrap();

    let mut definition =
        ProductDefinition::new("DEF", Format::Binary, 1).unwrap();
    definition.set_root_type(Arc::new(root)).unwrap();
    let mut variable = ProductVariable::new("n").unwrap();
    variable
        .set_size_expression(Expression::constant_integer(1))
        .unwrap();
    let count = Expression::new(
        ExprTag::NumElements,
        None,
        vec![
            Expression::new(ExprTag::Goto, Some("/data".into()), vec![])
                .unwrap(),
        ],
    )
    .unwrap();
    let init =
        Expression::new(ExprTag::VariableSet, Some("n".into()), vec![count])
            .unwrap();
    variable.set_init_expression(init).unwrap();
    definition.add_product_variable(variable).unwrap();

    let mut product_type = ProductType::new("TYPE").unwrap();
    product_type.add_product_definition(definition).unwrap();
    let mut class = ProductClass::new("TEST").unwrap();
    class.add_product_type(product_type).unwrap();
    let mut dictionary = DataDictionary::new();
    dictionary.add_product_class(class).unwrap();

    let path = write_product("s6", &[0u8; 100]);
    let product = dictionary.open_as(&path, "TEST", "TYPE", -1).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(product.variable_size("n").unwrap(), 1);
    assert_eq!(product.variable_value("n", 0).unwrap(), 100);
    // idempotent until a set intervenes
    assert_eq!(product.variable_value("n", 0).unwrap(), 100);
    product.variable_set("n", 0, 7).unwrap();
    assert_eq!(product.variable_value("n", 0).unwrap(), 7);
    assert!(product.variable_value("n", 1).is_err());
    assert!(product.variable_size("missing").is_err());
    assert!(product.variable_exists("n"));
    assert!(!product.variable_exists("missing"));
}

#[test]
fn cursor_depth_is_bounded() {
    let mut ty = Type::record(Format::Binary);
    ty.record_add_field(field("leaf", u8_t())).unwrap();
    for _ in 0..CURSOR_MAXDEPTH + 8 {
        let mut outer = Type::record(Format::Binary);
        outer.record_add_field(field("r", Arc::new(ty))).unwrap();
        ty = outer;
    }
    let product = open_product(ty, &[0x00], "depth");
    let mut cursor = product.cursor().unwrap();
    let mut depth = 1;
    let err = loop {
        match cursor.goto_record_field_by_index(0) {
            Ok(()) => depth += 1,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(depth, CURSOR_MAXDEPTH);
    assert_eq!(cursor.depth(), CURSOR_MAXDEPTH);
}

#[test]
fn goto_parent_restores_position() {
    let mut inner = Type::record(Format::Binary);
    inner.record_add_field(field("x", u16_be())).unwrap();
    let mut array = Type::array(Format::Binary);
    array.array_set_base_type(Arc::new(inner)).unwrap();
    array.array_add_fixed_dimension(3).unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("head", u8_t())).unwrap();
    root.record_add_field(field("body", Arc::new(array))).unwrap();
    let product = open_product(root, &[0u8; 7], "roundtrip");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/body[1]").unwrap();
    let depth = cursor.depth();
    let offset = cursor.get_file_bit_offset();

    cursor.goto_record_field_by_index(0).unwrap();
    cursor.goto_parent().unwrap();
    assert_eq!(cursor.depth(), depth);
    assert_eq!(cursor.get_file_bit_offset(), offset);

    cursor.goto_attributes().unwrap();
    cursor.goto_parent().unwrap();
    assert_eq!(cursor.get_file_bit_offset(), offset);

    cursor.goto_root().unwrap();
    assert_eq!(cursor.depth(), 1);
    assert!(matches!(cursor.goto_parent(), Err(Error::NoParent)));
}

#[test]
fn bit_offsets_add_up_across_variable_fields() {
    // head, a variable-size text, and a trailing field
    let mut data_type = Type::text(Format::Ascii);
    let size = Expression::new(
        ExprTag::Multiply,
        None,
        vec![Expression::constant_integer(8), int_at(&["..", "len"])],
    )
    .unwrap();
    data_type.set_bit_size_expression(size).unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("len", u8_t())).unwrap();
    root.record_add_field(field("data", Arc::new(data_type))).unwrap();
    root.record_add_field(field("tail", u16_be())).unwrap();
    let product = open_product(
        root,
        &[0x04, b'a', b'b', b'c', b'd', 0x01, 0x02],
        "add",
    );

    // direct indexing
    let mut direct = product.cursor().unwrap();
    direct.goto_record_field_by_index(2).unwrap();
    assert_eq!(direct.get_file_bit_offset(), 8 + 32);
    assert_eq!(direct.read_u16().unwrap(), 0x0102);

    // walking with next
    let mut walker = product.cursor().unwrap();
    walker.goto_first_record_field().unwrap();
    walker.goto_next_record_field().unwrap();
    walker.goto_next_record_field().unwrap();
    assert_eq!(walker.get_file_bit_offset(), direct.get_file_bit_offset());

    let root_cursor = product.cursor().unwrap();
    assert_eq!(root_cursor.get_bit_size().unwrap(), 8 + 32 + 16);
}

#[test]
fn array_of_fixed_elements_has_linear_size() {
    let mut array = Type::array(Format::Binary);
    array.array_set_base_type(u16_be()).unwrap();
    array.array_add_fixed_dimension(5).unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("data", Arc::new(array))).unwrap();
    let product = open_product(root, &[0u8; 10], "arrsize");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/data").unwrap();
    assert_eq!(cursor.get_num_elements().unwrap(), 5);
    assert_eq!(cursor.get_bit_size().unwrap(), 5 * 16);
    assert_eq!(cursor.get_array_dim().unwrap(), vec![5]);

    cursor.goto_array_element(&[4]).unwrap();
    assert_eq!(cursor.get_file_bit_offset(), 4 * 16);

    assert!(matches!(
        product.cursor().unwrap().goto("/data[5]").unwrap_err(),
        Error::ArrayOutOfBounds(_)
    ));
    let mut rank_mismatch = product.cursor().unwrap();
    rank_mismatch.goto("/data").unwrap();
    assert!(matches!(
        rank_mismatch.goto_array_element(&[0, 0]).unwrap_err(),
        Error::ArrayNumDimsMismatch(_)
    ));
}

#[test]
fn multi_dimensional_indexing_is_row_major() {
    let mut array = Type::array(Format::Binary);
    array.array_set_base_type(u8_t()).unwrap();
    array.array_add_fixed_dimension(2).unwrap();
    array.array_add_fixed_dimension(3).unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("m", Arc::new(array))).unwrap();
    let product = open_product(root, &[0, 1, 2, 3, 4, 5], "rowmajor");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/m").unwrap();
    cursor.goto_array_element(&[1, 2]).unwrap();
    assert_eq!(cursor.read_u8().unwrap(), 5);
    assert_eq!(cursor.index(), 5);
}

#[rstest]
#[case::mmap(true)]
#[case::buffered(false)]
fn io_modes_read_identically(#[case] use_mmap: bool) {
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", u32_be())).unwrap();
    let dictionary = dictionary_for(root);
    let path =
        write_product(&format!("io-{use_mmap}"), &[0xDE, 0xAD, 0xBE, 0xEF]);
    let options = Options {
        use_mmap,
        ..Options::default()
    };
    let product = dictionary
        .open_as_with_options(&path, "TEST", "TYPE", -1, options)
        .unwrap();
    fs::remove_file(&path).unwrap();
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/a").unwrap();
    assert_eq!(cursor.read_u32().unwrap(), 0xDEAD_BEEF);
}

#[test]
fn open_and_close_repeatedly() {
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", u8_t())).unwrap();
    let dictionary = dictionary_for(root);
    let path = write_product("openclose", &[0x2A]);
    for _ in 0..64 {
        let product = dictionary.open_as(&path, "TEST", "TYPE", -1).unwrap();
        let mut cursor = product.cursor().unwrap();
        cursor.goto("/a").unwrap();
        assert_eq!(cursor.read_u8().unwrap(), 42);
        product.close();
    }
    fs::remove_file(&path).unwrap();
}

#[test]
fn recognize_file_reports_definition() {
    let dictionary = detection_dictionary(&[("A", "PROD_A__")]);
    let path = write_product("recognize", b"PROD_A__ trailing bytes here");
    let info = dictionary.recognize_file(&path).unwrap();
    assert_eq!(info.file_size, 28);
    assert_eq!(info.format, Format::Binary);
    assert_eq!(info.product_class.as_deref(), Some("TEST"));
    assert_eq!(info.product_type.as_deref(), Some("TYPE_A"));
    assert_eq!(info.version, Some(1));

    fs::write(&path, b"unknown content with no match").unwrap();
    let info = dictionary.recognize_file(&path).unwrap();
    assert_eq!(info.product_class, None);
    assert_eq!(info.version, None);
    fs::remove_file(&path).unwrap();
}

#[test]
fn open_as_rejects_unknown_names() {
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", u8_t())).unwrap();
    let dictionary = dictionary_for(root);
    let path = write_product("openas", &[0x00]);
    assert!(matches!(
        dictionary.open_as(&path, "NOPE", "TYPE", -1).unwrap_err(),
        Error::InvalidName(_)
    ));
    assert!(matches!(
        dictionary.open_as(&path, "TEST", "NOPE", -1).unwrap_err(),
        Error::InvalidName(_)
    ));
    assert!(matches!(
        dictionary.open_as(&path, "TEST", "TYPE", 9).unwrap_err(),
        Error::InvalidName(_)
    ));
    fs::remove_file(&path).unwrap();
}

#[test]
fn conversions_apply_to_double_reads_only_when_enabled() {
    let mut ty = Type::integer(Format::Binary);
    ty.set_read_type(ReadType::Int16).unwrap();
    ty.set_bit_size(16).unwrap();
    let mut conversion = types::Conversion::new(1.0, 10.0).unwrap();
    conversion.add_offset = 5.0;
    ty.number_set_conversion(conversion).unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("v", Arc::new(ty))).unwrap();

    let dictionary = dictionary_for(root);
    let path = write_product("conv", &[0x00, 0x64]);
    let product = dictionary.open_as(&path, "TEST", "TYPE", -1).unwrap();
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/v").unwrap();
    assert_eq!(cursor.get_read_type(), ReadType::Double);
    assert_eq!(cursor.read_double().unwrap(), 15.0);
    // integer reads refuse converted types
    assert!(cursor.read_i16().is_err());

    let options = Options {
        perform_conversions: false,
        ..Options::default()
    };
    let product = dictionary
        .open_as_with_options(&path, "TEST", "TYPE", -1, options)
        .unwrap();
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/v").unwrap();
    assert_eq!(cursor.get_read_type(), ReadType::Int16);
    assert_eq!(cursor.read_double().unwrap(), 100.0);
    assert_eq!(cursor.read_i16().unwrap(), 100);
    fs::remove_file(&path).unwrap();
}

#[test]
fn time_type_yields_seconds_since_2000() {
    let value = Expression::new(
        ExprTag::Time,
        None,
        vec![
            Expression::new(
                ExprTag::String,
                None,
                vec![
                    Expression::new(ExprTag::GotoHere, None, vec![]).unwrap(),
                ],
            )
            .unwrap(),
            Expression::constant_string("yyyy-MM-dd HH:mm:ss"),
        ],
    )
    .unwrap();
    let mut time = Type::time(Format::Binary, value).unwrap();
    time.time_set_base_type(text_t(19)).unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("t", Arc::new(time))).unwrap();
    let product = open_product(root, b"2000-01-02 00:00:30", "time");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/t").unwrap();
    assert_eq!(cursor.read_time().unwrap(), 86430.0);
    assert_eq!(cursor.read_double().unwrap(), 86430.0);
    // the raw representation stays reachable through the base type
    cursor.use_base_type_of_special_type().unwrap();
    assert_eq!(cursor.read_string().unwrap(), b"2000-01-02 00:00:30");
}

#[test]
fn vsf_integer_applies_scale_factor() {
    let mut scale = Type::integer(Format::Binary);
    scale.set_read_type(ReadType::Int16).unwrap();
    scale.set_bit_size(16).unwrap();
    let mut value = Type::integer(Format::Binary);
    value.set_read_type(ReadType::Int32).unwrap();
    value.set_bit_size(32).unwrap();

    let mut vsf = Type::vsf_integer(Format::Binary);
    vsf.vsf_set_scale_factor(Arc::new(scale)).unwrap();
    vsf.vsf_set_type(Arc::new(value)).unwrap();

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("v", Arc::new(vsf))).unwrap();
    // scale = -2, value = 314159
    let product =
        open_product(root, &[0xFF, 0xFE, 0x00, 0x04, 0xCB, 0x2F], "vsf");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/v").unwrap();
    let read = cursor.read_double().unwrap();
    assert!((read - 3141.59).abs() < 1e-9, "got {read}");
}

#[test]
fn ascii_numbers_parse_and_map() {
    let mut ty = Type::integer(Format::Ascii);
    ty.set_read_type(ReadType::Int32).unwrap();
    ty.set_byte_size(4).unwrap();
    ty.number_add_integer_mapping(types::IntegerMapping {
        str: "N/A ".into(),
        value: -1,
    })
    .unwrap();
    let ty = Arc::new(ty);

    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", ty.clone())).unwrap();
    root.record_add_field(field("b", ty)).unwrap();
    let product = open_product(root, b"  42N/A ", "asciiint");

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/a").unwrap();
    assert_eq!(cursor.read_int64().unwrap(), 42);
    cursor.goto_root().unwrap();
    cursor.goto("/b").unwrap();
    assert_eq!(cursor.read_int64().unwrap(), -1);
}

#[test]
fn fixed_value_mismatch_is_a_product_error() {
    let mut magic = Type::text(Format::Ascii);
    magic.set_byte_size(4).unwrap();
    magic.text_set_fixed_value("MAGI").unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("magic", Arc::new(magic))).unwrap();

    let product = open_product(root, b"MAGI", "fixedok");
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/magic").unwrap();
    assert_eq!(cursor.read_string().unwrap(), b"MAGI");

    let mut bad_root = Type::record(Format::Binary);
    let mut magic = Type::text(Format::Ascii);
    magic.set_byte_size(4).unwrap();
    magic.text_set_fixed_value("MAGI").unwrap();
    bad_root
        .record_add_field(field("magic", Arc::new(magic)))
        .unwrap();
    let product = open_product(bad_root, b"BOGUS", "fixedbad");
    let mut cursor = product.cursor().unwrap();
    cursor.goto("/magic").unwrap();
    assert!(matches!(cursor.read_string().unwrap_err(), Error::Product(_)));
}

#[test]
fn attributes_are_virtual_and_empty_by_default() {
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("a", u8_t())).unwrap();
    let product = open_product(root, &[0x00], "attrs");
    let mut cursor = product.cursor().unwrap();
    assert!(!cursor.has_attributes());
    cursor.goto_attributes().unwrap();
    assert_eq!(cursor.get_file_bit_offset(), -1);
    assert_eq!(cursor.get_num_elements().unwrap(), 0);
    assert_eq!(cursor.index(), -1);
}

#[test]
fn bypass_special_types_lands_on_base() {
    let value = Expression::new(
        ExprTag::Time,
        None,
        vec![
            Expression::new(
                ExprTag::String,
                None,
                vec![
                    Expression::new(ExprTag::GotoHere, None, vec![]).unwrap(),
                ],
            )
            .unwrap(),
            Expression::constant_string("yyyy"),
        ],
    )
    .unwrap();
    let mut time = Type::time(Format::Binary, value).unwrap();
    time.time_set_base_type(text_t(4)).unwrap();
    let mut root = Type::record(Format::Binary);
    root.record_add_field(field("t", Arc::new(time))).unwrap();

    let dictionary = dictionary_for(root);
    let path = write_product("bypass", b"2004");
    let options = Options {
        bypass_special_types: true,
        ..Options::default()
    };
    let product = dictionary
        .open_as_with_options(&path, "TEST", "TYPE", -1, options)
        .unwrap();
    fs::remove_file(&path).unwrap();

    let mut cursor = product.cursor().unwrap();
    cursor.goto("/t").unwrap();
    // the goto landed on the text base type directly
    assert_eq!(cursor.current_type().type_class(), TypeClass::Text);
    assert_eq!(cursor.read_string().unwrap(), b"2004");
}
