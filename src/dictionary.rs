//! The data dictionary: the catalogue of product classes, their product
//! types, and the versioned product definitions those types carry, plus
//! the detection trees built from every definition's detection rules.
//!
//! A dictionary is an explicit object so embedders and tests can hold
//! several side by side; nothing in the crate is process-global.

use std::collections::HashMap;
use std::sync::Arc;

use crate::detection::{validate_path, DetectionNode};
use crate::error::{Error, Result};
use crate::expr::{Expression, ResultType};
use crate::types::{is_identifier, Format, Type};
use crate::{Cursor, Product};

/// A named, sized i64 array attached to every open product of a
/// definition, initialised by an expression on first access.
#[derive(Debug)]
pub struct ProductVariable {
    name: String,
    size_expr: Option<Expression>,
    init_expr: Option<Expression>,
}

impl ProductVariable {
    pub fn new(name: &str) -> Result<Self> {
        if !is_identifier(name) {
            return Err(Error::DataDefinition(format!(
                "name '{name}' is not a valid identifier for product \
                 variable definition"
            )));
        }
        Ok(ProductVariable {
            name: name.to_owned(),
            size_expr: None,
            init_expr: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_expr(&self) -> Option<&Expression> {
        self.size_expr.as_ref()
    }

    pub fn init_expr(&self) -> Option<&Expression> {
        self.init_expr.as_ref()
    }

    pub fn set_size_expression(&mut self, size_expr: Expression) -> Result<()> {
        if self.size_expr.is_some() {
            return Err(Error::DataDefinition(
                "product variable already has a size expression".into(),
            ));
        }
        if size_expr.result_type() != ResultType::Integer {
            return Err(Error::DataDefinition(
                "size expression of product variable should be an integer \
                 expression"
                    .into(),
            ));
        }
        self.size_expr = Some(size_expr);
        Ok(())
    }

    pub fn set_init_expression(&mut self, init_expr: Expression) -> Result<()> {
        if self.init_expr.is_some() {
            return Err(Error::DataDefinition(
                "product variable already has an init expression".into(),
            ));
        }
        if init_expr.result_type() != ResultType::Void {
            return Err(Error::DataDefinition(
                "init expression of product variable should be a void \
                 expression"
                    .into(),
            ));
        }
        self.init_expr = Some(init_expr);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_expr.is_none() {
            return Err(Error::DataDefinition(
                "missing init expression for product variable definition"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// One test of a detection rule: a path that must exist and/or a boolean
/// expression that must hold.
#[derive(Debug)]
pub struct DetectionRuleEntry {
    path: Option<String>,
    expression: Option<Expression>,
}

impl DetectionRuleEntry {
    pub fn new(
        path: Option<String>,
        expression: Option<Expression>,
    ) -> Result<Self> {
        if path.is_none() && expression.is_none() {
            return Err(Error::DataDefinition(
                "detection entry should have a path and/or an expression"
                    .into(),
            ));
        }
        if let Some(path) = &path {
            validate_path(path)?;
        }
        if let Some(expression) = &expression {
            if expression.result_type() != ResultType::Boolean {
                return Err(Error::DataDefinition(
                    "detection expression should be a boolean expression"
                        .into(),
                ));
            }
        }
        Ok(DetectionRuleEntry { path, expression })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn expression(&self) -> Option<&Expression> {
        self.expression.as_ref()
    }
}

/// A conjunction of entries; all must match for the rule to fire.
#[derive(Debug, Default)]
pub struct DetectionRule {
    entries: Vec<DetectionRuleEntry>,
}

impl DetectionRule {
    pub fn new() -> Self {
        DetectionRule::default()
    }

    pub fn add_entry(&mut self, entry: DetectionRuleEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[DetectionRuleEntry] {
        &self.entries
    }
}

/// The static description of one product layout: a root type, product
/// variables, and the detection rules that bind products to it.
#[derive(Debug)]
pub struct ProductDefinition {
    format: Format,
    version: i32,
    name: String,
    description: Option<String>,
    root_type: Option<Arc<Type>>,
    product_variables: Vec<ProductVariable>,
    variable_index: HashMap<String, usize>,
    detection_rules: Vec<DetectionRule>,
    initialized: bool,
}

impl ProductDefinition {
    pub fn new(name: &str, format: Format, version: i32) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::DataDefinition(
                "empty name for product definition".into(),
            ));
        }
        Ok(ProductDefinition {
            format,
            version,
            name: name.to_owned(),
            description: None,
            root_type: None,
            product_variables: Vec::new(),
            variable_index: HashMap::new(),
            detection_rules: Vec::new(),
            initialized: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Whether the root type and product variables have been set.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn root_type(&self) -> Option<&Arc<Type>> {
        self.root_type.as_ref()
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        if self.description.is_some() {
            return Err(Error::DataDefinition(
                "product definition already has a description".into(),
            ));
        }
        self.description = Some(description.to_owned());
        Ok(())
    }

    pub fn set_root_type(&mut self, root_type: Arc<Type>) -> Result<()> {
        if self.root_type.is_some() {
            return Err(Error::DataDefinition(
                "product definition already has a root type".into(),
            ));
        }
        if root_type.format() != self.format
            && !(root_type.format() == Format::Ascii
                && self.format == Format::Binary)
        {
            return Err(Error::DataDefinition(format!(
                "cannot use {} root type for {} product definition",
                root_type.format(),
                self.format
            )));
        }
        self.root_type = Some(root_type);
        self.initialized = true;
        Ok(())
    }

    pub fn add_detection_rule(&mut self, rule: DetectionRule) -> Result<()> {
        if rule.entries().is_empty() {
            return Err(Error::DataDefinition(format!(
                "detection rule for '{}' should have at least one entry",
                self.name
            )));
        }
        self.detection_rules.push(rule);
        Ok(())
    }

    pub fn detection_rules(&self) -> &[DetectionRule] {
        &self.detection_rules
    }

    pub fn add_product_variable(
        &mut self,
        variable: ProductVariable,
    ) -> Result<()> {
        variable.validate()?;
        if self.variable_index.contains_key(variable.name()) {
            return Err(Error::DataDefinition(format!(
                "duplicate product variable with name {}",
                variable.name()
            )));
        }
        self.variable_index
            .insert(variable.name().to_owned(), self.product_variables.len());
        self.product_variables.push(variable);
        Ok(())
    }

    pub fn num_product_variables(&self) -> usize {
        self.product_variables.len()
    }

    pub fn product_variable(&self, index: usize) -> &ProductVariable {
        &self.product_variables[index]
    }

    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variable_index.get(name).copied()
    }

    pub fn validate(&self) -> Result<()> {
        let root_type = self.root_type.as_ref().ok_or_else(|| {
            Error::DataDefinition(format!(
                "missing root type for product definition '{}'",
                self.name
            ))
        })?;
        root_type.validate()?;
        for variable in &self.product_variables {
            variable.validate()?;
        }
        Ok(())
    }
}

/// A named set of versioned product definitions.
#[derive(Debug)]
pub struct ProductType {
    name: String,
    description: Option<String>,
    definitions: Vec<Arc<ProductDefinition>>,
}

impl ProductType {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::DataDefinition(
                "empty name for product type".into(),
            ));
        }
        Ok(ProductType {
            name: name.to_owned(),
            description: None,
            definitions: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        if self.description.is_some() {
            return Err(Error::DataDefinition(
                "product type already has a description".into(),
            ));
        }
        self.description = Some(description.to_owned());
        Ok(())
    }

    pub fn add_product_definition(
        &mut self,
        definition: ProductDefinition,
    ) -> Result<()> {
        definition.validate()?;
        if self
            .definitions
            .iter()
            .any(|existing| existing.version() == definition.version())
        {
            return Err(Error::DataDefinition(format!(
                "product type {} already has a definition for version {}",
                self.name,
                definition.version()
            )));
        }
        self.definitions.push(Arc::new(definition));
        Ok(())
    }

    pub fn definitions(&self) -> &[Arc<ProductDefinition>] {
        &self.definitions
    }

    pub fn definition_by_version(
        &self,
        version: i32,
    ) -> Option<&Arc<ProductDefinition>> {
        self.definitions
            .iter()
            .find(|definition| definition.version() == version)
    }

    pub fn latest_definition(&self) -> Option<&Arc<ProductDefinition>> {
        self.definitions
            .iter()
            .max_by_key(|definition| definition.version())
    }
}

/// A named set of product types plus a pool of named types reusable
/// across its definitions.
#[derive(Debug)]
pub struct ProductClass {
    name: String,
    description: Option<String>,
    definition_file: Option<String>,
    revision: i32,
    named_types: Vec<Arc<Type>>,
    named_type_index: HashMap<String, usize>,
    product_types: Vec<ProductType>,
    product_type_index: HashMap<String, usize>,
}

impl ProductClass {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::DataDefinition(
                "empty name for product class".into(),
            ));
        }
        Ok(ProductClass {
            name: name.to_owned(),
            description: None,
            definition_file: None,
            revision: 0,
            named_types: Vec::new(),
            named_type_index: HashMap::new(),
            product_types: Vec::new(),
            product_type_index: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        if self.description.is_some() {
            return Err(Error::DataDefinition(
                "product class already has a description".into(),
            ));
        }
        self.description = Some(description.to_owned());
        Ok(())
    }

    pub fn set_definition_file(&mut self, filepath: &str) -> Result<()> {
        if self.definition_file.is_some() {
            return Err(Error::DataDefinition(
                "product class already has a definition file".into(),
            ));
        }
        self.definition_file = Some(filepath.to_owned());
        Ok(())
    }

    pub fn definition_file(&self) -> Option<&str> {
        self.definition_file.as_deref()
    }

    pub fn set_revision(&mut self, revision: i32) -> Result<()> {
        self.revision = revision;
        Ok(())
    }

    /// Register a reusable named type; reuse means cloning the handle.
    pub fn add_named_type(&mut self, ty: Arc<Type>) -> Result<()> {
        let name = ty.name().ok_or_else(|| {
            Error::DataDefinition(
                "cannot add a type without a name to a product class".into(),
            )
        })?;
        if self.named_type_index.contains_key(name) {
            return Err(Error::DataDefinition(format!(
                "duplicate named type {name} for product class {}",
                self.name
            )));
        }
        self.named_type_index
            .insert(name.to_owned(), self.named_types.len());
        self.named_types.push(ty);
        Ok(())
    }

    pub fn named_type(&self, name: &str) -> Option<&Arc<Type>> {
        self.named_type_index
            .get(name)
            .map(|index| &self.named_types[*index])
    }

    pub fn has_named_type(&self, name: &str) -> bool {
        self.named_type_index.contains_key(name)
    }

    pub fn add_product_type(&mut self, product_type: ProductType) -> Result<()> {
        if self.product_type_index.contains_key(product_type.name()) {
            return Err(Error::DataDefinition(format!(
                "duplicate product type {} for product class {}",
                product_type.name(),
                self.name
            )));
        }
        self.product_type_index
            .insert(product_type.name().to_owned(), self.product_types.len());
        self.product_types.push(product_type);
        Ok(())
    }

    pub fn product_type(&self, name: &str) -> Option<&ProductType> {
        self.product_type_index
            .get(name)
            .map(|index| &self.product_types[*index])
    }

    pub fn has_product_type(&self, name: &str) -> bool {
        self.product_type_index.contains_key(name)
    }

    pub fn product_types(&self) -> &[ProductType] {
        &self.product_types
    }
}

/// What `recognize_file` reports about a product file.
#[derive(Debug)]
pub struct FileInfo {
    pub file_size: i64,
    pub format: Format,
    pub product_class: Option<String>,
    pub product_type: Option<String>,
    pub version: Option<i32>,
}

/// The catalogue of product classes and the per-format-family detection
/// trees.
#[derive(Debug, Default)]
pub struct DataDictionary {
    classes: Vec<Arc<ProductClass>>,
    class_index: HashMap<String, usize>,
    trees: HashMap<Format, DetectionNode>,
}

impl DataDictionary {
    pub fn new() -> Self {
        DataDictionary::default()
    }

    /// Ascii and binary products share the binary detection tree.
    fn tree_format(format: Format) -> Format {
        if format.is_ascbin() {
            Format::Binary
        } else {
            format
        }
    }

    pub fn add_product_class(&mut self, class: ProductClass) -> Result<()> {
        if self.class_index.contains_key(class.name()) {
            return Err(Error::DataDefinition(format!(
                "duplicate product class {}",
                class.name()
            )));
        }
        let class = Arc::new(class);
        self.insert_rules_of(&class)?;
        let position = self
            .classes
            .iter()
            .position(|existing| existing.name() > class.name())
            .unwrap_or(self.classes.len());
        self.classes.insert(position, class);
        self.rebuild_class_index();
        Ok(())
    }

    pub fn remove_product_class(&mut self, name: &str) -> Result<()> {
        let index = self.class_index.get(name).copied().ok_or_else(|| {
            Error::InvalidName(format!("unknown product class {name}"))
        })?;
        self.classes.remove(index);
        self.rebuild_class_index();
        // rules of the remaining classes have to be re-inserted; the trees
        // interleave rules from many classes
        self.trees.clear();
        let classes = self.classes.clone();
        for class in &classes {
            self.insert_rules_of(class)?;
        }
        Ok(())
    }

    fn rebuild_class_index(&mut self) {
        self.class_index = self
            .classes
            .iter()
            .enumerate()
            .map(|(index, class)| (class.name().to_owned(), index))
            .collect();
    }

    fn insert_rules_of(&mut self, class: &Arc<ProductClass>) -> Result<()> {
        for product_type in class.product_types() {
            for definition in product_type.definitions() {
                let tree = self
                    .trees
                    .entry(Self::tree_format(definition.format()))
                    .or_default();
                for (rule_index, rule) in
                    definition.detection_rules().iter().enumerate()
                {
                    tree.add_rule(rule, definition, rule_index)?;
                }
            }
        }
        Ok(())
    }

    pub fn product_class(&self, name: &str) -> Option<&Arc<ProductClass>> {
        self.class_index
            .get(name)
            .map(|index| &self.classes[*index])
    }

    pub fn has_product_class(&self, name: &str) -> bool {
        self.class_index.contains_key(name)
    }

    pub fn product_classes(&self) -> &[Arc<ProductClass>] {
        &self.classes
    }

    pub fn detection_tree(&self, format: Format) -> Option<&DetectionNode> {
        self.trees.get(&Self::tree_format(format))
    }

    /// The definition for `(class, type, version)`; the latest version
    /// when `version` is -1.
    pub fn get_definition(
        &self,
        class: &str,
        product_type: &str,
        version: i32,
    ) -> Result<Arc<ProductDefinition>> {
        let class = self.product_class(class).ok_or_else(|| {
            Error::InvalidName(format!("unknown product class {class}"))
        })?;
        let product_type =
            class.product_type(product_type).ok_or_else(|| {
                Error::InvalidName(format!(
                    "product class {} has no product type {product_type}",
                    class.name()
                ))
            })?;
        let definition = if version == -1 {
            product_type.latest_definition()
        } else {
            product_type.definition_by_version(version)
        };
        definition.cloned().ok_or_else(|| {
            Error::InvalidName(format!(
                "product type {} has no definition for version {version}",
                product_type.name()
            ))
        })
    }

    /// Walk the detection tree of the product's format family from the
    /// product root.
    ///
    /// A binary/ascii product carries no structure before a definition is
    /// bound, so its candidate rules are checked one by one, each through
    /// a probe cursor typed with the candidate definition's root type (a
    /// hypothetical bind). The tree supplies the match order and the
    /// build-time shadow check.
    pub fn find_definition_for_product(
        &self,
        product: &Product,
    ) -> Result<Option<Arc<ProductDefinition>>> {
        let Some(tree) = self.detection_tree(product.format()) else {
            return Ok(None);
        };
        let definition = if product.format().is_ascbin() {
            let mut found = None;
            for candidate in tree.rules_in_match_order() {
                if self.rule_matches(product, &candidate)? {
                    found = Some(candidate.definition);
                    break;
                }
            }
            found
        } else {
            let cursor = Cursor::new(product)?;
            tree.evaluate(&cursor)
        };
        if let Some(definition) = &definition {
            log::debug!(
                "product {} matches definition {} (version {})",
                product.filename_string(),
                definition.name(),
                definition.version()
            );
        }
        Ok(definition)
    }

    /// Evaluate one rule's entries in sequence against a probe cursor
    /// typed with the candidate's root type. Path entries descend and
    /// expression entries test at the position reached so far; any
    /// failure means "does not match".
    fn rule_matches(
        &self,
        product: &Product,
        candidate: &crate::detection::RuleRef,
    ) -> Result<bool> {
        let Some(root_type) = candidate.definition.root_type() else {
            return Ok(false);
        };
        let mut cursor = Cursor::with_root(product, root_type.clone());
        let rule =
            &candidate.definition.detection_rules()[candidate.rule_index];
        for entry in rule.entries() {
            if let Some(path) = entry.path() {
                if cursor.goto(path).is_err() {
                    return Ok(false);
                }
            }
            if let Some(expression) = entry.expression() {
                match expression.eval_bool(Some(&cursor)) {
                    Ok(true) => (),
                    _ => return Ok(false),
                }
            }
        }
        Ok(true)
    }

    /// Locate the class and type that own `definition`.
    pub fn owner_of(
        &self,
        definition: &Arc<ProductDefinition>,
    ) -> Option<(&str, &str)> {
        for class in &self.classes {
            for product_type in class.product_types() {
                for candidate in product_type.definitions() {
                    if Arc::ptr_eq(candidate, definition) {
                        return Some((class.name(), product_type.name()));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_definition(
        name: &str,
        version: i32,
    ) -> ProductDefinition {
        let mut root = Type::record(Format::Binary);
        let mut field_type = Type::integer(Format::Binary);
        field_type.set_read_type(crate::types::ReadType::UInt8).unwrap();
        field_type.set_bit_size(8).unwrap();
        root.record_add_field(
            crate::types::Field::new("value", Arc::new(field_type)).unwrap(),
        )
        .unwrap();
        let mut definition =
            ProductDefinition::new(name, Format::Binary, version).unwrap();
        definition.set_root_type(Arc::new(root)).unwrap();
        definition
    }

    fn class_with_versions(versions: &[i32]) -> ProductClass {
        let mut product_type = ProductType::new("TYPE_A").unwrap();
        for &version in versions {
            product_type
                .add_product_definition(minimal_definition(
                    &format!("DEF_{version}"),
                    version,
                ))
                .unwrap();
        }
        let mut class = ProductClass::new("CLASS_A").unwrap();
        class.add_product_type(product_type).unwrap();
        class
    }

    #[test]
    fn version_lookup_and_latest() {
        let mut dictionary = DataDictionary::new();
        dictionary
            .add_product_class(class_with_versions(&[1, 3, 2]))
            .unwrap();
        let latest = dictionary.get_definition("CLASS_A", "TYPE_A", -1).unwrap();
        assert_eq!(latest.version(), 3);
        let v2 = dictionary.get_definition("CLASS_A", "TYPE_A", 2).unwrap();
        assert_eq!(v2.version(), 2);
        assert!(dictionary.get_definition("CLASS_A", "TYPE_A", 9).is_err());
    }

    #[test]
    fn duplicate_class_and_version_are_rejected() {
        let mut dictionary = DataDictionary::new();
        dictionary
            .add_product_class(class_with_versions(&[1]))
            .unwrap();
        assert!(dictionary
            .add_product_class(class_with_versions(&[1]))
            .is_err());

        let mut product_type = ProductType::new("TYPE_B").unwrap();
        product_type
            .add_product_definition(minimal_definition("DEF", 1))
            .unwrap();
        assert!(product_type
            .add_product_definition(minimal_definition("DEF", 1))
            .is_err());
    }

    #[test]
    fn classes_are_sorted_by_name() {
        let mut dictionary = DataDictionary::new();
        for name in ["ZULU", "ALPHA", "MIKE"] {
            let mut class = ProductClass::new(name).unwrap();
            class.set_revision(1).unwrap();
            dictionary.add_product_class(class).unwrap();
        }
        let names: Vec<_> = dictionary
            .product_classes()
            .iter()
            .map(|class| class.name().to_owned())
            .collect();
        assert_eq!(names, ["ALPHA", "MIKE", "ZULU"]);
    }
}
