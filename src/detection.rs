//! Detection trees: one trie per format family, built from the detection
//! rules of every product definition in the dictionary.
//!
//! Inner nodes test path existence or a boolean expression; a node whose
//! ancestor chain spells out one complete rule carries that rule's
//! product definition. Evaluation is depth-first, first matching leaf
//! wins; navigation and expression failures count as mismatches.

use std::sync::Arc;

use crate::cursor::Cursor;
use crate::dictionary::{DetectionRule, ProductDefinition};
use crate::error::{Error, Result};
use crate::expr::Expression;

/// A leaf's rule: the definition it binds and which of the definition's
/// detection rules the leaf's ancestor chain spells out.
#[derive(Debug, Clone)]
pub struct RuleRef {
    pub definition: Arc<ProductDefinition>,
    pub rule_index: usize,
}

/// One node of a detection tree. The root carries neither path nor
/// expression; every other node carries exactly one of the two.
#[derive(Debug, Default)]
pub struct DetectionNode {
    path: Option<String>,
    expression: Option<Expression>,
    rule: Option<RuleRef>,
    subnodes: Vec<DetectionNode>,
}

impl DetectionNode {
    fn new_path(path: String) -> DetectionNode {
        DetectionNode {
            path: Some(path),
            ..DetectionNode::default()
        }
    }

    fn new_expression(expression: Expression) -> DetectionNode {
        DetectionNode {
            expression: Some(expression),
            ..DetectionNode::default()
        }
    }

    fn is_attribute_path(&self) -> bool {
        self.path.as_deref().is_some_and(|path| path.starts_with('@'))
    }

    /// Insert keeping the evaluation-order rules: path tests before
    /// expression tests, and attribute paths after plain paths.
    fn insert_subnode(&mut self, new_node: DetectionNode) -> usize {
        let rank = |node: &DetectionNode| {
            if node.path.is_none() {
                2
            } else if node.is_attribute_path() {
                1
            } else {
                0
            }
        };
        let new_rank = rank(&new_node);
        let index = self
            .subnodes
            .iter()
            .position(|node| rank(node) > new_rank)
            .unwrap_or(self.subnodes.len());
        self.subnodes.insert(index, new_node);
        index
    }

    /// Add one rule of `definition` to the tree.
    pub(crate) fn add_rule(
        &mut self,
        rule: &DetectionRule,
        definition: &Arc<ProductDefinition>,
        rule_index: usize,
    ) -> Result<()> {
        if rule.entries().is_empty() {
            return Err(Error::DataDefinition(format!(
                "detection rule for '{}' should have at least one entry",
                definition.name()
            )));
        }
        let mut node = self;
        for entry in rule.entries() {
            node = descend(node, entry.path(), entry.expression())?;
        }
        if let Some(shadowing) = &node.rule {
            return Err(Error::DataDefinition(format!(
                "detection rule for '{}' is shadowed by detection rule for \
                 '{}'",
                definition.name(),
                shadowing.definition.name()
            )));
        }
        node.rule = Some(RuleRef {
            definition: definition.clone(),
            rule_index,
        });
        Ok(())
    }

    /// Evaluate the tree against a cursor at the product root. Returns the
    /// definition of the first rule whose tests all match.
    ///
    /// This requires a cursor that can already navigate paths, so it
    /// serves the self-describing backends; binary/ascii detection goes
    /// through [`DetectionNode::rules_in_match_order`] instead.
    pub(crate) fn evaluate(
        &self,
        cursor: &Cursor,
    ) -> Option<Arc<ProductDefinition>> {
        let mut subcursor = cursor.clone();
        if let Some(path) = &self.path {
            // failure means the node does not exist
            if subcursor.goto(path).is_err() {
                return None;
            }
        } else if let Some(expression) = &self.expression {
            // failures are mismatches
            match expression.eval_bool(Some(&subcursor)) {
                Ok(true) => (),
                _ => return None,
            }
        }
        for subnode in &self.subnodes {
            if let Some(definition) = subnode.evaluate(&subcursor) {
                return Some(definition);
            }
        }
        self.rule.as_ref().map(|rule| rule.definition.clone())
    }

    /// All leaf rules in the order evaluation would reach them. For
    /// binary/ascii products the file carries no structure of its own, so
    /// each candidate rule is re-checked through its definition's root
    /// type; the tree contributes ordering and shadow detection.
    pub(crate) fn rules_in_match_order(&self) -> Vec<RuleRef> {
        let mut rules = Vec::new();
        self.collect_rules(&mut rules);
        rules
    }

    fn collect_rules(&self, rules: &mut Vec<RuleRef>) {
        for subnode in &self.subnodes {
            subnode.collect_rules(rules);
        }
        if let Some(rule) = &self.rule {
            rules.push(rule.clone());
        }
    }

    /// Indented textual rendering, used by the structure snapshots.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.describe_into(0, &mut lines);
        lines
    }

    fn describe_into(&self, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        let test = if let Some(path) = &self.path {
            format!("path '{path}'")
        } else if self.expression.is_some() {
            "expression".to_owned()
        } else {
            "root".to_owned()
        };
        let rule = match &self.rule {
            Some(rule) => format!(" => {}", rule.definition.name()),
            None => String::new(),
        };
        lines.push(format!("{indent}{test}{rule}"));
        for subnode in &self.subnodes {
            subnode.describe_into(depth + 1, lines);
        }
    }
}

/// What to do with an entry at one tree level.
enum Placement {
    /// Subnode `i` matches the path (or expression) exactly.
    Reuse(usize),
    /// Subnode `i`'s path is a prefix; continue below it with the rest.
    Into(usize, String),
    /// Split subnode `i` at byte `pos` and continue with the rest.
    Split(usize, usize, String),
    Create,
}

fn descend<'a>(
    node: &'a mut DetectionNode,
    path: Option<&str>,
    expression: Option<&Expression>,
) -> Result<&'a mut DetectionNode> {
    let path = path.filter(|path| !path.is_empty());
    let Some(subpath) = path else {
        return descend_expression(node, expression.expect("entry has a test"));
    };

    let placement = place_path(node, subpath);
    match placement {
        Placement::Reuse(index) => {
            if expression.is_some() {
                return descend(&mut node.subnodes[index], None, expression);
            }
            Ok(&mut node.subnodes[index])
        }
        Placement::Into(index, rest) => {
            descend(&mut node.subnodes[index], Some(&rest), expression)
        }
        Placement::Split(index, pos, rest) => {
            let common = DetectionNode::new_path(subpath[..pos].to_owned());
            let mut old =
                std::mem::replace(&mut node.subnodes[index], common);
            let old_path = old.path.take().expect("split node has a path");
            let strip = pos
                + usize::from(old_path.as_bytes()[pos] == b'/');
            old.path = Some(old_path[strip..].to_owned());
            node.subnodes[index].insert_subnode(old);
            descend(&mut node.subnodes[index], Some(&rest), expression)
        }
        Placement::Create => {
            let index =
                node.insert_subnode(DetectionNode::new_path(subpath.to_owned()));
            if expression.is_some() {
                return descend(&mut node.subnodes[index], None, expression);
            }
            Ok(&mut node.subnodes[index])
        }
    }
}

fn descend_expression<'a>(
    node: &'a mut DetectionNode,
    expression: &Expression,
) -> Result<&'a mut DetectionNode> {
    let found = node.subnodes.iter().position(|subnode| {
        subnode.path.is_none()
            && subnode.expression.as_ref() == Some(expression)
    });
    let index = match found {
        Some(index) => index,
        None => node
            .insert_subnode(DetectionNode::new_expression(expression.clone())),
    };
    Ok(&mut node.subnodes[index])
}

fn is_boundary(byte: u8) -> bool {
    matches!(byte, b'/' | b'@' | b'[')
}

fn place_path(node: &DetectionNode, subpath: &str) -> Placement {
    for (index, subnode) in node.subnodes.iter().enumerate() {
        let Some(node_path) = subnode.path.as_deref() else {
            continue;
        };
        let node_bytes = node_path.as_bytes();
        let sub_bytes = subpath.as_bytes();
        let mut pos = 0;
        while pos < node_bytes.len()
            && pos < sub_bytes.len()
            && node_bytes[pos] == sub_bytes[pos]
        {
            pos += 1;
        }
        if pos == node_bytes.len() && pos == sub_bytes.len() {
            return Placement::Reuse(index);
        }
        if pos == node_bytes.len() {
            if is_boundary(sub_bytes[pos]) {
                let rest = pos + usize::from(sub_bytes[pos] == b'/');
                return Placement::Into(index, subpath[rest..].to_owned());
            }
        } else if pos < sub_bytes.len() {
            // back up over a trailing '/' or '[' shared by both paths
            let mut pos = pos;
            if pos > 1 && matches!(sub_bytes[pos - 1], b'/' | b'[') {
                pos -= 1;
            }
            if pos > 0
                && pos < sub_bytes.len()
                && is_boundary(sub_bytes[pos])
                && is_boundary(node_bytes[pos])
            {
                let rest = pos + usize::from(sub_bytes[pos] == b'/');
                return Placement::Split(
                    index,
                    pos,
                    subpath[rest..].to_owned(),
                );
            }
        }
    }
    Placement::Create
}

/// Light syntactic validation for detection-rule paths: the same segment
/// grammar the cursor's `goto` accepts.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    let invalid = |detail: &str| {
        Err(Error::DataDefinition(format!(
            "'{path}' is not a valid path for detection rule ({detail})"
        )))
    };
    if path.is_empty() {
        return invalid("empty path");
    }
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' => i += 1,
            b'@' => {
                i += 1;
                let named = bytes.get(i).is_some_and(|b| {
                    b.is_ascii_alphanumeric() || *b == b'_' || *b == b'.'
                });
                if !named {
                    return invalid("missing attribute name");
                }
            }
            b'[' => {
                let close = bytes[i..].iter().position(|b| *b == b']');
                let Some(close) = close else {
                    return invalid("missing ']'");
                };
                if path[i + 1..i + close].trim().parse::<i64>().is_err() {
                    return invalid("invalid array index");
                }
                i += close + 1;
            }
            b']' => return invalid("unexpected ']'"),
            _ => i += 1,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("/mph/product").is_ok());
        assert!(validate_path("/dsd[3]/name").is_ok());
        assert!(validate_path("@size").is_ok());
        assert!(validate_path("/dsd[").is_err());
        assert!(validate_path("/dsd[x]").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn subnode_ordering() {
        let mut root = DetectionNode::default();
        root.insert_subnode(DetectionNode::new_expression(
            Expression::constant_boolean(true),
        ));
        root.insert_subnode(DetectionNode::new_path("@attr".into()));
        root.insert_subnode(DetectionNode::new_path("/mph".into()));
        let kinds: Vec<_> = root
            .subnodes
            .iter()
            .map(|node| node.path.clone().unwrap_or_else(|| "expr".into()))
            .collect();
        assert_eq!(kinds, ["/mph", "@attr", "expr"]);
    }
}
