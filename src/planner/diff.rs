//! Diff classification between the prior and desired graphs.
//!
//! Each URN is classified by comparing old and new inputs key by key. The
//! mutability of each changed key decides whether the resource can be
//! updated in place or must be replaced; replacement always wins.

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::graph::ResourceGraph;
use crate::resource::{
    FieldType, PropertyKey, PropertyMap, PropertyMutability, PropertyValue, Resource,
    SchemaRegistry, TypeToken, Urn,
};

/// How a resource is changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Inputs are unchanged.
    Same,
    /// Changes can be applied in place.
    Updated,
    /// At least one change requires a new instance.
    Replaced,
    /// Only in the desired graph.
    Added,
    /// Only in the prior graph.
    Deleted,
}

impl DiffKind {
    const fn rank(self) -> u8 {
        match self {
            Self::Same => 0,
            Self::Updated => 1,
            Self::Replaced => 2,
            Self::Added | Self::Deleted => 3,
        }
    }
}

impl std::fmt::Display for DiffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Same => "same",
            Self::Updated => "update",
            Self::Replaced => "replace",
            Self::Added => "create",
            Self::Deleted => "delete",
        };
        write!(f, "{kind}")
    }
}

/// One changed input key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Input key.
    pub key: PropertyKey,
    /// Prior value.
    pub old: Option<PropertyValue>,
    /// Desired value.
    pub new: Option<PropertyValue>,
    /// Whether this change alone forces replacement.
    pub replaces: bool,
}

/// Classification of one URN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub urn: Urn,
    /// Resource type.
    pub type_token: TypeToken,
    /// Overall kind.
    pub kind: DiffKind,
    /// Changed keys, old keys first then keys only in the desired inputs.
    pub changes: Vec<PropertyChange>,
    /// Replaced dependencies that escalated this diff.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cascaded_from: Vec<Urn>,
}

impl ResourceDiff {
    fn new(urn: Urn, type_token: TypeToken, kind: DiffKind) -> Self {
        Self {
            urn,
            type_token,
            kind,
            changes: Vec::new(),
            cascaded_from: Vec::new(),
        }
    }

    /// Every changed key.
    #[must_use]
    pub fn changed_keys(&self) -> Vec<PropertyKey> {
        self.changes.iter().map(|c| c.key.clone()).collect()
    }

    /// Keys whose changes force replacement.
    #[must_use]
    pub fn replace_keys(&self) -> Vec<PropertyKey> {
        self.changes
            .iter()
            .filter(|c| c.replaces)
            .map(|c| c.key.clone())
            .collect()
    }

    /// Keys relevant to the kind: replace keys for a replacement, all
    /// changed keys otherwise.
    #[must_use]
    pub fn keys(&self) -> Vec<PropertyKey> {
        if self.kind == DiffKind::Replaced {
            self.replace_keys()
        } else {
            self.changed_keys()
        }
    }

    /// Returns true if the resource has both a prior and desired instance.
    #[must_use]
    pub const fn is_matched(&self) -> bool {
        matches!(self.kind, DiffKind::Same | DiffKind::Updated | DiffKind::Replaced)
    }

    /// Raises a matched diff to at least `kind`; never lowers it.
    pub(crate) fn escalate(&mut self, kind: DiffKind) {
        if self.is_matched() && kind.rank() > self.kind.rank() && kind.rank() <= DiffKind::Replaced.rank() {
            self.kind = kind;
        }
    }

    fn recompute_kind(&mut self) {
        let kind = if self.changes.iter().any(|c| c.replaces) {
            DiffKind::Replaced
        } else if self.changes.is_empty() {
            DiffKind::Same
        } else {
            DiffKind::Updated
        };
        self.escalate(kind);
    }

    /// Records a changed key and escalates accordingly.
    pub(crate) fn add_change(&mut self, change: PropertyChange) {
        if self.changes.iter().any(|c| c.key == change.key) {
            return;
        }
        self.changes.push(change);
        self.recompute_kind();
    }
}

/// Diffs for every URN in either graph.
///
/// Ordered by desired declaration order, then prior-only resources in
/// prior order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffSet {
    diffs: IndexMap<Urn, ResourceDiff>,
}

impl DiffSet {
    /// Gets the diff of a resource.
    #[must_use]
    pub fn get(&self, urn: &Urn) -> Option<&ResourceDiff> {
        self.diffs.get(urn)
    }

    pub(crate) fn get_mut(&mut self, urn: &Urn) -> Option<&mut ResourceDiff> {
        self.diffs.get_mut(urn)
    }

    /// Kind of a resource's diff.
    #[must_use]
    pub fn kind(&self, urn: &Urn) -> Option<DiffKind> {
        self.diffs.get(urn).map(|d| d.kind)
    }

    /// Iterates over diffs in order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDiff> {
        self.diffs.values()
    }

    /// Number of diffs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    /// Returns true if there are no diffs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Number of diffs of a kind.
    #[must_use]
    pub fn count(&self, kind: DiffKind) -> usize {
        self.diffs.values().filter(|d| d.kind == kind).count()
    }

    /// Returns true if anything differs.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.diffs.values().any(|d| d.kind != DiffKind::Same)
    }
}

/// Compares prior and desired resources using the schema registry.
#[derive(Debug, Clone, Copy)]
pub struct DiffClassifier<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> DiffClassifier<'a> {
    /// Creates a classifier.
    #[must_use]
    pub const fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Classifies every URN in either graph.
    ///
    /// Replacement cascades are not applied here.
    #[must_use]
    pub fn classify(&self, prior: &ResourceGraph, desired: &ResourceGraph) -> DiffSet {
        let mut diffs = IndexMap::new();

        for new in desired.iter() {
            let diff = match prior.get(&new.urn) {
                Some(old) => self.compare(old, new),
                None => ResourceDiff::new(new.urn.clone(), new.type_token.clone(), DiffKind::Added),
            };
            diffs.insert(new.urn.clone(), diff);
        }

        for old in prior.iter() {
            if !desired.contains(&old.urn) {
                diffs.insert(
                    old.urn.clone(),
                    ResourceDiff::new(old.urn.clone(), old.type_token.clone(), DiffKind::Deleted),
                );
            }
        }

        let set = DiffSet { diffs };
        debug!(
            "Classified {} resources: {} create, {} update, {} replace, {} delete",
            set.len(),
            set.count(DiffKind::Added),
            set.count(DiffKind::Updated),
            set.count(DiffKind::Replaced),
            set.count(DiffKind::Deleted)
        );
        set
    }

    /// Compares the inputs of one matched resource.
    #[must_use]
    pub fn compare(&self, old: &Resource, new: &Resource) -> ResourceDiff {
        let mut diff = ResourceDiff::new(new.urn.clone(), new.type_token.clone(), DiffKind::Same);

        let new_only = new.inputs.keys().filter(|k| !old.inputs.contains_key(k));
        for key in old.inputs.keys().chain(new_only) {
            if let Some(change) = self.compare_key(&new.type_token, key, &old.inputs, &new.inputs) {
                diff.add_change(change);
            }
        }
        diff
    }

    fn compare_key(
        &self,
        type_token: &TypeToken,
        key: &str,
        old: &PropertyMap,
        new: &PropertyMap,
    ) -> Option<PropertyChange> {
        let mutability = self.registry.mutability(type_token, key);
        if mutability == PropertyMutability::OutputOnly {
            return None;
        }

        let old_value = old.get_set(key);
        let new_value = new.get_set(key);
        let field_type = self.registry.field_type(type_token, key);

        let equal = match (old_value, new_value) {
            (None, None) => true,
            (Some(a), Some(b)) => values_equal(a, b, field_type),
            _ => false,
        };
        if equal {
            return None;
        }

        Some(PropertyChange {
            key: key.to_string(),
            old: old_value.cloned(),
            new: new_value.cloned(),
            replaces: change_replaces(mutability, old_value.is_some()),
        })
    }

    /// Builds the change entry for a key whose value is about to change
    /// because a referenced resource is being replaced.
    #[must_use]
    pub fn forced_change(&self, resource: &Resource, key: &str) -> PropertyChange {
        let mutability = self.registry.mutability(&resource.type_token, key);
        let value = resource.inputs.get_set(key).cloned();
        PropertyChange {
            key: key.to_string(),
            replaces: change_replaces(mutability, value.is_some()),
            old: value.clone(),
            new: value,
        }
    }
}

/// Decides whether a change to a key with `mutability` forces replacement.
const fn change_replaces(mutability: PropertyMutability, was_set: bool) -> bool {
    match mutability {
        PropertyMutability::Replaces => true,
        PropertyMutability::ImmutableOnceSet => was_set,
        PropertyMutability::Updatable | PropertyMutability::OutputOnly => false,
    }
}

/// Structural equality honoring set semantics where the schema declares a set.
///
/// Unknown values never compare equal. Output references compare by
/// target; replacement of the target is handled by the cascade.
fn values_equal(a: &PropertyValue, b: &PropertyValue, ty: Option<&FieldType>) -> bool {
    if matches!(a, PropertyValue::Unknown) || matches!(b, PropertyValue::Unknown) {
        return false;
    }

    match (a, b) {
        (PropertyValue::Array(xs), PropertyValue::Array(ys)) => match ty {
            Some(FieldType::Set(element)) => sets_equal(xs, ys, Some(&**element)),
            Some(FieldType::Array(element)) => lists_equal(xs, ys, Some(&**element)),
            _ => lists_equal(xs, ys, None),
        },
        (PropertyValue::Object(x), PropertyValue::Object(y)) => match ty {
            Some(FieldType::Map(element)) => maps_equal(x, y, |_| Some(&**element)),
            Some(FieldType::Object(fields)) => maps_equal(x, y, |key| {
                fields.iter().find(|f| f.name == key).map(|f| &f.ty)
            }),
            _ => maps_equal(x, y, |_| None),
        },
        _ => a == b,
    }
}

fn lists_equal(xs: &[PropertyValue], ys: &[PropertyValue], element: Option<&FieldType>) -> bool {
    xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y, element))
}

fn sets_equal(xs: &[PropertyValue], ys: &[PropertyValue], element: Option<&FieldType>) -> bool {
    let covers = |from: &[PropertyValue], into: &[PropertyValue]| {
        from.iter().all(|x| into.iter().any(|y| values_equal(x, y, element)))
    };
    covers(xs, ys) && covers(ys, xs)
}

fn maps_equal<'t, F>(x: &PropertyMap, y: &PropertyMap, field_type: F) -> bool
where
    F: Fn(&str) -> Option<&'t FieldType>,
{
    let keys_match = |from: &PropertyMap, other: &PropertyMap| {
        from.iter()
            .filter(|(_, v)| !v.is_null())
            .all(|(k, _)| other.get_set(k).is_some())
    };
    if !keys_match(x, y) || !keys_match(y, x) {
        return false;
    }
    x.iter()
        .filter(|(_, v)| !v.is_null())
        .all(|(k, v)| y.get_set(k).is_some_and(|w| values_equal(v, w, field_type(k))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{FieldSchema, OutputRef, Schema};

    const WIDGET: &str = "test:index:Widget";

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry.register(Schema::new(
            TypeToken::new(WIDGET),
            vec![
                FieldSchema::required("name", FieldType::String).replaces(),
                FieldSchema::optional("size", FieldType::Number),
                FieldSchema::optional("zones", FieldType::set(FieldType::String)),
                FieldSchema::optional("order", FieldType::array(FieldType::String)),
                FieldSchema::optional("owner", FieldType::String).immutable_once_set(),
                FieldSchema::output("status", FieldType::String),
            ],
        ));
        registry
    }

    fn widget(name: &str, props: &[(&str, PropertyValue)]) -> Resource {
        let urn = Urn::new("dev", None, &TypeToken::new(WIDGET), name);
        let mut inputs = PropertyMap::new();
        inputs.insert("name", name);
        for (k, v) in props {
            inputs.insert(*k, v.clone());
        }
        Resource::new(urn, inputs)
    }

    fn strings(items: &[&str]) -> PropertyValue {
        PropertyValue::Array(items.iter().map(|s| PropertyValue::from(*s)).collect())
    }

    #[test]
    fn test_unchanged_is_same() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);
        let r = widget("a", &[("size", 1.0.into())]);
        let diff = classifier.compare(&r, &r.clone());
        assert_eq!(diff.kind, DiffKind::Same);
        assert!(diff.changes.is_empty());
    }

    #[test]
    fn test_updatable_change_is_update() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);
        let diff = classifier.compare(
            &widget("a", &[("size", 1.0.into())]),
            &widget("a", &[("size", 2.0.into())]),
        );
        assert_eq!(diff.kind, DiffKind::Updated);
        assert_eq!(diff.keys(), vec!["size"]);
    }

    #[test]
    fn test_replace_wins_over_update() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);
        let mut new = widget("a", &[("size", 2.0.into())]);
        new.inputs.insert("name", "renamed");
        let diff = classifier.compare(&widget("a", &[("size", 1.0.into())]), &new);

        assert_eq!(diff.kind, DiffKind::Replaced);
        assert_eq!(diff.changed_keys(), vec!["name", "size"]);
        assert_eq!(diff.keys(), vec!["name"]);
    }

    #[test]
    fn test_set_ignores_order_but_array_does_not() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);

        let same = classifier.compare(
            &widget("a", &[("zones", strings(&["a", "b"]))]),
            &widget("a", &[("zones", strings(&["b", "a"]))]),
        );
        assert_eq!(same.kind, DiffKind::Same);

        let reordered = classifier.compare(
            &widget("a", &[("order", strings(&["a", "b"]))]),
            &widget("a", &[("order", strings(&["b", "a"]))]),
        );
        assert_eq!(reordered.kind, DiffKind::Updated);
    }

    #[test]
    fn test_immutable_once_set() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);

        let first_set = classifier.compare(&widget("a", &[]), &widget("a", &[("owner", "ops".into())]));
        assert_eq!(first_set.kind, DiffKind::Updated);

        let changed = classifier.compare(
            &widget("a", &[("owner", "ops".into())]),
            &widget("a", &[("owner", "dev".into())]),
        );
        assert_eq!(changed.kind, DiffKind::Replaced);

        let unset = classifier.compare(&widget("a", &[("owner", "ops".into())]), &widget("a", &[]));
        assert_eq!(unset.kind, DiffKind::Replaced);
    }

    #[test]
    fn test_output_only_and_null_are_ignored() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);
        let diff = classifier.compare(
            &widget("a", &[("status", "ready".into())]),
            &widget("a", &[("status", "pending".into()), ("size", PropertyValue::Null)]),
        );
        assert_eq!(diff.kind, DiffKind::Same);
    }

    #[test]
    fn test_unknown_is_a_change_but_same_reference_is_not() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);
        let other = Urn::new("dev", None, &TypeToken::new(WIDGET), "other");
        let diff = classifier.compare(
            &widget("a", &[("size", 1.0.into())]),
            &widget("a", &[("size", PropertyValue::Unknown)]),
        );
        assert_eq!(diff.kind, DiffKind::Updated);

        let reference = PropertyValue::from(OutputRef::new(other, "size"));
        let unchanged = classifier.compare(
            &widget("a", &[("size", reference.clone())]),
            &widget("a", &[("size", reference)]),
        );
        assert_eq!(unchanged.kind, DiffKind::Same);
    }

    #[test]
    fn test_classify_orders_and_counts() {
        let registry = registry();
        let classifier = DiffClassifier::new(&registry);
        let prior = ResourceGraph::from_resources(vec![widget("gone", &[]), widget("kept", &[])]).unwrap();
        let desired = ResourceGraph::from_resources(vec![widget("new", &[]), widget("kept", &[])]).unwrap();

        let diffs = classifier.classify(&prior, &desired);
        let order: Vec<&str> = diffs.iter().map(|d| d.urn.name()).collect();
        assert_eq!(order, vec!["new", "kept", "gone"]);
        assert_eq!(diffs.count(DiffKind::Added), 1);
        assert_eq!(diffs.count(DiffKind::Deleted), 1);
        assert_eq!(diffs.count(DiffKind::Same), 1);
        assert!(diffs.has_changes());
    }
}
