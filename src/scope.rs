//! Variable scoping.
//!
//! A [`Scope`] is a view over a shared *stash* of values. Each scope owns a
//! private table of pointers from names to stash indices. Writing a name the
//! scope already knows writes through the stash, so every scope sharing that
//! stash observes the change. Declaring a new name only grows the local
//! pointer table, so the binding stays invisible to ancestors and siblings.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

use crate::value::Value;

/// Name to stash index table.
pub type Pointers = BTreeMap<String, usize>;

/// Errors raised by scope lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// The name has no binding in this scope
    #[error("Variable '{0}' is not defined")]
    UndefinedVariable(String),
}

/// Serialized form of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    /// Every value ever declared through the shared stash
    #[serde(with = "crate::value::persisted")]
    pub stash: Vec<Value>,
    /// Names visible to the serialized scope
    pub pointers: Pointers,
}

/// Binding store with a shared stash and private pointers.
#[derive(Debug, Clone)]
pub struct Scope {
    stash: Arc<Mutex<Vec<Value>>>,
    pointers: Pointers,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new(std::iter::empty::<(String, Value)>())
    }
}

impl Scope {
    /// Fresh scope with its own stash, seeded from `initial`.
    pub fn new<K, I>(initial: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut scope = Self {
            stash: Arc::new(Mutex::new(Vec::new())),
            pointers: Pointers::new(),
        };
        for (name, value) in initial {
            scope.set(name.into(), value);
        }
        scope
    }

    /// Restore a scope from an owned stash and pointer table.
    pub fn with_stash(stash: Vec<Value>, pointers: Pointers) -> Self {
        Self {
            stash: Arc::new(Mutex::new(stash)),
            pointers,
        }
    }

    /// Restore a scope from its serialized form.
    pub fn from_snapshot(snapshot: ScopeSnapshot) -> Self {
        Self::with_stash(snapshot.stash, snapshot.pointers)
    }

    /// Whether `name` is bound in this scope.
    pub fn exists(&self, name: &str) -> bool {
        self.pointers.contains_key(name)
    }

    /// Read `name`.
    pub fn get(&self, name: &str) -> Result<Value, ScopeError> {
        let index = self
            .pointers
            .get(name)
            .ok_or_else(|| ScopeError::UndefinedVariable(name.to_string()))?;
        Ok(self.stash.lock().get(*index).cloned().unwrap_or_default())
    }

    /// Write `name`, declaring it locally when it is not yet bound.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let existing = self.pointers.get(&name).copied();
        let mut stash = self.stash.lock();
        match existing {
            Some(index) if index < stash.len() => stash[index] = value,
            _ => {
                stash.push(value);
                self.pointers.insert(name, stash.len() - 1);
            }
        }
    }

    /// Bind `name` to a new stash slot, shadowing any inherited binding.
    pub fn declare(&mut self, name: impl Into<String>, value: Value) {
        let mut stash = self.stash.lock();
        stash.push(value);
        self.pointers.insert(name.into(), stash.len() - 1);
    }

    /// New scope over the same stash. Uses `pointers` when given, otherwise
    /// the current table.
    pub fn copy(&self, pointers: Option<Pointers>) -> Self {
        Self {
            stash: Arc::clone(&self.stash),
            pointers: pointers.unwrap_or_else(|| self.pointers.clone()),
        }
    }

    /// Snapshot of the shared stash.
    pub fn stash(&self) -> Vec<Value> {
        self.stash.lock().clone()
    }

    /// The local pointer table.
    pub fn pointers(&self) -> &Pointers {
        &self.pointers
    }

    /// Replace the local pointer table.
    pub fn set_pointers(&mut self, pointers: Pointers) {
        self.pointers = pointers;
    }

    /// Names visible from this scope.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pointers.keys().map(String::as_str)
    }

    /// Independent copy with its own stash, used to stage a step so that a
    /// failed step leaves the original untouched.
    pub fn deep_copy(&self) -> Self {
        Self::with_stash(self.stash(), self.pointers.clone())
    }

    /// Serialize the stash and pointers.
    pub fn serialize(&self) -> ScopeSnapshot {
        ScopeSnapshot {
            stash: self.stash(),
            pointers: self.pointers.clone(),
        }
    }
}

/// Bookkeeping for static scope analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeContext {
    /// When set, reads of undeclared names outside this list are errors
    pub only_predefined_variables: Option<BTreeSet<String>>,
    /// Names read before any declaration
    pub used_undefined_variables: BTreeSet<String>,
    /// Names declared so far
    pub defined_variables: BTreeSet<String>,
}

impl ScopeContext {
    /// Context that only permits the given names to be read undeclared.
    pub fn restricted<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            only_predefined_variables: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Branch copy: shares the restriction and usage, forks declarations.
    pub fn branch(&self) -> Self {
        self.clone()
    }

    /// Merge usage recorded by a branch back into this context.
    pub fn absorb_usage(&mut self, branch: ScopeContext) {
        self.used_undefined_variables
            .extend(branch.used_undefined_variables);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn writes_through_existing_names() {
        let mut parent = Scope::new([("foo", Value::from(1i64))]);
        let mut child = parent.copy(None);
        child.set("foo", Value::from(2i64));
        assert_eq!(parent.get("foo").unwrap(), Value::from(2i64));

        parent.set("foo", Value::from(3i64));
        assert_eq!(child.get("foo").unwrap(), Value::from(3i64));
    }

    #[test]
    fn new_declarations_do_not_leak_to_parent() {
        let parent = Scope::new([("foo", Value::from(1i64))]);
        let mut child = parent.copy(None);
        child.set("bar", Value::from(2i64));
        assert!(child.exists("bar"));
        assert!(!parent.exists("bar"));
        assert_eq!(
            parent.get("bar"),
            Err(ScopeError::UndefinedVariable("bar".into()))
        );
    }

    #[test]
    fn declare_shadows_without_writing_through() {
        let parent = Scope::new([("item", Value::from("outer"))]);
        let mut child = parent.copy(None);
        child.declare("item", Value::from("inner"));
        assert_eq!(child.get("item").unwrap(), Value::from("inner"));
        assert_eq!(parent.get("item").unwrap(), Value::from("outer"));
    }

    #[test]
    fn copy_with_pointers_restores_a_snapshot() {
        let mut scope = Scope::default();
        scope.set("a", Value::from(1i64));
        let saved = scope.pointers().clone();
        scope.set("b", Value::from(2i64));

        let restored = scope.copy(Some(saved));
        assert!(restored.exists("a"));
        assert!(!restored.exists("b"));
    }

    #[test]
    fn fresh_scopes_are_isolated() {
        let mut outer = Scope::new([("foo", Value::from("outer"))]);
        let inner = Scope::new([("foo", outer.get("foo").unwrap())]);
        outer.set("foo", Value::from("changed"));
        assert_eq!(inner.get("foo").unwrap(), Value::from("outer"));
    }

    #[test]
    fn serialize_roundtrips_through_json() {
        let scope = Scope::new([("n", Value::from(5i64)), ("s", Value::from("x"))]);
        let json = serde_json::to_string(&scope.serialize()).unwrap();
        let restored = Scope::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.get("n").unwrap(), Value::Number(5.0));
        assert_eq!(restored.get("s").unwrap(), Value::from("x"));
    }

    #[test]
    fn snapshots_keep_undefined_apart_from_null() {
        let scope = Scope::new([
            ("missing", Value::Undefined),
            ("empty", Value::Null),
            ("nested", Value::Array(vec![Value::Undefined, Value::from(1i64)])),
        ]);
        let json = serde_json::to_string(&scope.serialize()).unwrap();
        let restored = Scope::from_snapshot(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.get("missing").unwrap(), Value::Undefined);
        assert_eq!(restored.get("empty").unwrap(), Value::Null);
        assert_eq!(
            restored.get("nested").unwrap(),
            Value::Array(vec![Value::Undefined, Value::from(1i64)])
        );
    }

    #[test]
    fn deep_copy_detaches_the_stash() {
        let scope = Scope::new([("n", Value::from(1i64))]);
        let mut staged = scope.deep_copy();
        staged.set("n", Value::from(2i64));
        assert_eq!(scope.get("n").unwrap(), Value::from(1i64));
    }

    proptest! {
        #[test]
        fn stash_only_grows(names in proptest::collection::vec("[a-e]", 1..20)) {
            let mut scope = Scope::default();
            let mut last = 0;
            for (i, name) in names.iter().enumerate() {
                scope.set(name.clone(), Value::from(i as i64));
                let len = scope.stash().len();
                prop_assert!(len >= last);
                last = len;
                prop_assert_eq!(scope.get(name).unwrap(), Value::from(i as i64));
            }
            prop_assert_eq!(last, scope.pointers().len());
        }
    }
}
