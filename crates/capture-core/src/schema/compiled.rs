//! ============================================================================
//! Compiled Form - Resolved field paths and the visibility dependency graph
//! ============================================================================
//! A `FormSchema` is flattened into document order. Each field gets a dotted
//! path (`vitals.pulse`), its `visibleWhen` references are resolved to
//! absolute paths, and the dependency graph (explicit references plus the
//! implicit child -> enclosing group edge) is checked for cycles.
//!
//! Reference resolution for a bare id searches the field's own scope first,
//! then enclosing scopes outward. A dotted reference is absolute. A target
//! must be a sibling or be declared earlier in document order.
//! ============================================================================

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::form::{FieldSpec, FormSchema};
use super::predicate::VisibleWhen;
use crate::types::SchemaValidationError;

/// One field of a compiled form
#[derive(Debug, Clone)]
pub struct FieldNode {
    pub path: String,
    pub parent: Option<usize>,
    pub depth: usize,
    pub spec: FieldSpec,
    /// `visibleWhen` with references rewritten to absolute paths
    pub visible_when: Option<VisibleWhen>,
}

/// Validated, flattened form ready for rendering
#[derive(Debug, Clone)]
pub struct CompiledForm {
    nodes: Vec<FieldNode>,
    index: HashMap<String, usize>,
}

impl CompiledForm {
    pub fn compile(schema: &FormSchema) -> Result<Self, SchemaValidationError> {
        let mut form = CompiledForm {
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        form.flatten(&schema.fields, None, 0)?;
        form.resolve_references()?;
        form.check_acyclic()?;
        Ok(form)
    }

    fn flatten(
        &mut self,
        fields: &[FieldSpec],
        parent: Option<usize>,
        depth: usize,
    ) -> Result<(), SchemaValidationError> {
        let mut scope = HashSet::new();

        for spec in fields {
            if spec.id.is_empty() || spec.id.contains('.') {
                return Err(SchemaValidationError::InvalidId(spec.id.clone()));
            }

            let path = match parent {
                Some(p) => format!("{}.{}", self.nodes[p].path, spec.id),
                None => spec.id.clone(),
            };

            if !scope.insert(spec.id.as_str()) {
                return Err(SchemaValidationError::DuplicateId(path));
            }
            spec.check_spec(&path)?;

            let idx = self.nodes.len();
            self.index.insert(path.clone(), idx);
            self.nodes.push(FieldNode {
                path,
                parent,
                depth,
                spec: spec.clone(),
                visible_when: None,
            });

            if let super::form::FieldKind::Group { fields: children } = &spec.kind {
                self.flatten(children, Some(idx), depth + 1)?;
            }
        }

        Ok(())
    }

    fn resolve_references(&mut self) -> Result<(), SchemaValidationError> {
        for idx in 0..self.nodes.len() {
            let Some(predicate) = self.nodes[idx].spec.visible_when.clone() else {
                continue;
            };

            let resolved = predicate.map_references(&mut |reference| {
                let target = self.lookup_reference(idx, reference)?;
                let node = &self.nodes[idx];
                let target_node = &self.nodes[target];

                if target == idx {
                    return Err(SchemaValidationError::VisibilityCycle(vec![
                        node.path.clone(),
                        node.path.clone(),
                    ]));
                }
                if target_node.spec.kind.is_group() {
                    return Err(SchemaValidationError::GroupReference {
                        field: node.path.clone(),
                        reference: reference.to_string(),
                    });
                }

                let sibling = target_node.parent == node.parent;
                if !sibling && target >= idx {
                    return Err(SchemaValidationError::ForwardReference {
                        field: node.path.clone(),
                        reference: reference.to_string(),
                    });
                }

                Ok(target_node.path.clone())
            })?;

            self.nodes[idx].visible_when = Some(resolved);
        }
        Ok(())
    }

    fn lookup_reference(&self, from: usize, reference: &str) -> Result<usize, SchemaValidationError> {
        let unknown = || SchemaValidationError::UnknownReference {
            field: self.nodes[from].path.clone(),
            reference: reference.to_string(),
        };

        if reference.contains('.') {
            return self.index.get(reference).copied().ok_or_else(unknown);
        }

        // Own scope, then enclosing scopes outward
        let mut scope = self.nodes[from].parent;
        loop {
            let candidate = match scope {
                Some(p) => format!("{}.{}", self.nodes[p].path, reference),
                None => reference.to_string(),
            };
            if let Some(&idx) = self.index.get(&candidate) {
                return Ok(idx);
            }
            match scope {
                Some(p) => scope = self.nodes[p].parent,
                None => return Err(unknown()),
            }
        }
    }

    fn dependencies(&self, idx: usize) -> Vec<usize> {
        let node = &self.nodes[idx];
        let mut deps: Vec<usize> = node
            .visible_when
            .as_ref()
            .map(|p| {
                p.references()
                    .into_iter()
                    .filter_map(|r| self.index.get(r).copied())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(parent) = node.parent {
            deps.push(parent);
        }
        deps
    }

    fn check_acyclic(&self) -> Result<(), SchemaValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        fn visit(
            form: &CompiledForm,
            idx: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Result<(), SchemaValidationError> {
            marks[idx] = Mark::Active;
            stack.push(idx);

            for dep in form.dependencies(idx) {
                match marks[dep] {
                    Mark::Active => {
                        let start = stack.iter().position(|&i| i == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&i| form.nodes[i].path.clone())
                            .collect();
                        cycle.push(form.nodes[dep].path.clone());
                        return Err(SchemaValidationError::VisibilityCycle(cycle));
                    }
                    Mark::Unvisited => visit(form, dep, marks, stack)?,
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks[idx] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();
        for idx in 0..self.nodes.len() {
            if marks[idx] == Mark::Unvisited {
                visit(self, idx, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    /// Fields in document order
    pub fn nodes(&self) -> &[FieldNode] {
        &self.nodes
    }

    pub fn node(&self, path: &str) -> Option<&FieldNode> {
        self.index.get(path).map(|&i| &self.nodes[i])
    }

    /// Evaluate every `visibleWhen` predicate in the form against the given
    /// values. A field is visible when its enclosing group is visible and its
    /// own predicate holds; hidden fields read as unset to other predicates.
    pub fn visibility(
        &self,
        values: &BTreeMap<String, Value>,
        attached: &BTreeSet<String>,
    ) -> BTreeMap<String, bool> {
        let mut memo: Vec<Option<bool>> = vec![None; self.nodes.len()];
        for idx in 0..self.nodes.len() {
            self.visible_at(idx, values, attached, &mut memo);
        }
        self.nodes
            .iter()
            .zip(memo)
            .map(|(node, visible)| (node.path.clone(), visible.unwrap_or(false)))
            .collect()
    }

    fn visible_at(
        &self,
        idx: usize,
        values: &BTreeMap<String, Value>,
        attached: &BTreeSet<String>,
        memo: &mut Vec<Option<bool>>,
    ) -> bool {
        if let Some(known) = memo[idx] {
            return known;
        }

        let node = &self.nodes[idx];
        let parent_visible = node
            .parent
            .map_or(true, |p| self.visible_at(p, values, attached, memo));

        let visible = parent_visible
            && match &node.visible_when {
                None => true,
                Some(predicate) => {
                    let attachment_marker = Value::Bool(true);
                    predicate.evaluate(&mut |path| {
                        let target = *self.index.get(path)?;
                        if !self.visible_at(target, values, attached, memo) {
                            return None;
                        }
                        if self.nodes[target].spec.kind.takes_attachment() {
                            return attached.contains(path).then_some(&attachment_marker);
                        }
                        values.get(path)
                    })
                }
            };

        memo[idx] = Some(visible);
        visible
    }
}
