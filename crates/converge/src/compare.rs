//! Declarative field comparator.
//!
//! A [`ComparatorTable`] is an ordered list of [`FieldToCompare`] entries. Diffing walks every
//! entry: where the existing value differs from the desired one, the desired value is copied into
//! the existing object and the entry's action (if any) runs. The desired object is only read.

use std::borrow::Cow;
use std::fmt;

use kube::Resource;

type SyncFn<K> = dyn Fn(&mut K, &K) -> bool + Send + Sync;
type Action<K> = dyn Fn(&mut K) + Send + Sync;

pub struct FieldToCompare<K> {
    name: Cow<'static, str>,
    sync: Box<SyncFn<K>>,
    action: Option<Box<Action<K>>>,
}

impl<K: 'static> FieldToCompare<K> {
    /// Entry for any field reachable through a getter/setter pair. The getter returns an owned
    /// value; equality is the value's `PartialEq`.
    pub fn new<T, G, S>(name: impl Into<Cow<'static, str>>, get: G, set: S) -> Self
    where
        T: PartialEq + 'static,
        G: Fn(&K) -> T + Send + Sync + 'static,
        S: Fn(&mut K, T) + Send + Sync + 'static,
    {
        Self::with_eq(name, get, set, |a: &T, b: &T| a == b)
    }

    /// Like [`new`](Self::new) with a custom equality, for fields the server defaults
    /// (a missing service type reads back as `ClusterIP`).
    pub fn with_eq<T, G, S, E>(name: impl Into<Cow<'static, str>>, get: G, set: S, eq: E) -> Self
    where
        T: 'static,
        G: Fn(&K) -> T + Send + Sync + 'static,
        S: Fn(&mut K, T) + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let sync = move |existing: &mut K, desired: &K| {
            let want = get(desired);
            if eq(&get(existing), &want) {
                return false;
            }
            set(existing, want);
            true
        };
        Self { name: name.into(), sync: Box::new(sync), action: None }
    }

    /// Run `action` on the existing object after this field was copied forward.
    pub fn on_change<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut K) + Send + Sync + 'static,
    {
        self.action = Some(Box::new(action));
        self
    }

    fn apply(&self, existing: &mut K, desired: &K) -> bool {
        let changed = (self.sync)(existing, desired);
        if changed {
            if let Some(action) = &self.action {
                action(existing);
            }
        }
        changed
    }
}

impl<K> FieldToCompare<K> {
    pub fn name(&self) -> &str { &self.name }
}

impl<K: Resource + 'static> FieldToCompare<K> {
    pub fn labels() -> Self {
        Self::new("metadata.labels", |o: &K| o.meta().labels.clone(), |o: &mut K, v| o.meta_mut().labels = v)
    }

    pub fn annotations() -> Self {
        Self::new(
            "metadata.annotations",
            |o: &K| o.meta().annotations.clone(),
            |o: &mut K, v| o.meta_mut().annotations = v,
        )
    }
}

impl<K> fmt::Debug for FieldToCompare<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldToCompare")
            .field("name", &self.name)
            .field("action", &self.action.is_some())
            .finish()
    }
}

/// Ordered comparator entries for one kind. Order only affects when actions fire.
pub struct ComparatorTable<K> {
    fields: Vec<FieldToCompare<K>>,
}

impl<K> Default for ComparatorTable<K> {
    fn default() -> Self { Self { fields: Vec::new() } }
}

impl<K> fmt::Debug for ComparatorTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_list().entries(self.fields.iter()).finish() }
}

impl<K> ComparatorTable<K> {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, field: FieldToCompare<K>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn push(&mut self, field: FieldToCompare<K>) { self.fields.push(field); }

    pub fn len(&self) -> usize { self.fields.len() }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ { self.fields.iter().map(|f| f.name()) }
}

impl<K: 'static> ComparatorTable<K> {
    /// Copy every differing field from `desired` into `existing`; true when anything changed.
    pub fn diff(&self, existing: &mut K, desired: &K) -> bool { !self.changed_fields(existing, desired).is_empty() }

    /// Same as [`diff`](Self::diff) but reports which entries changed, in table order.
    pub fn changed_fields(&self, existing: &mut K, desired: &K) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.apply(existing, desired))
            .map(|f| f.name())
            .collect()
    }
}

impl<K> FromIterator<FieldToCompare<K>> for ComparatorTable<K> {
    fn from_iter<I: IntoIterator<Item = FieldToCompare<K>>>(iter: I) -> Self { Self { fields: iter.into_iter().collect() } }
}

/// Build a [`FieldToCompare`] for a plain struct path: `field!(ConfigMap, data)`.
/// The entry is named after the path (`"spec.replicas"`).
#[macro_export]
macro_rules! field {
    ($kind:ty, $first:ident $(. $rest:ident)*) => {
        $crate::compare::FieldToCompare::<$kind>::new(
            concat!(stringify!($first) $(, ".", stringify!($rest))*),
            |o: &$kind| o.$first $(.$rest)*.clone(),
            |o: &mut $kind, v| o.$first $(.$rest)* = v,
        )
    };
}
