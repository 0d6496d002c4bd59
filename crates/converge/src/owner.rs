//! Controller owner references between a parent instance and its children.

use keel_core::Parent;
use kube::Resource;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnerError {
    #[error("parent {0} has no uid")]
    MissingUid(String),
    #[error("parent {0} has no kind/apiVersion")]
    MissingType(String),
    #[error("cross-namespace owner {parent_ns}/{parent} for child in {child_ns}")]
    CrossNamespace { parent: String, parent_ns: String, child_ns: String },
    #[error("namespaced owner {0} cannot own a cluster-scoped child")]
    NamespacedOwnerOfClusterChild(String),
    #[error("child is already controlled by {kind} {name}")]
    AlreadyControlled { kind: String, name: String },
}

/// Record `parent` as the controller of `child`. Re-attaching the same parent replaces its
/// existing reference in place.
pub fn attach<K: Resource>(child: &mut K, parent: &Parent) -> Result<(), OwnerError> {
    let display = parent.key().to_string();
    if parent.uid.as_deref().map_or(true, str::is_empty) {
        return Err(OwnerError::MissingUid(display));
    }
    let oref = parent.owner_reference().ok_or(OwnerError::MissingType(display))?;

    match (parent.namespace.as_deref(), child.meta().namespace.as_deref()) {
        (Some(pns), Some(cns)) if pns != cns => {
            return Err(OwnerError::CrossNamespace {
                parent: parent.name.clone(),
                parent_ns: pns.to_string(),
                child_ns: cns.to_string(),
            });
        }
        (Some(_), None) => return Err(OwnerError::NamespacedOwnerOfClusterChild(parent.key().to_string())),
        _ => {}
    }

    let refs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != oref.uid) {
        return Err(OwnerError::AlreadyControlled { kind: other.kind.clone(), name: other.name.clone() });
    }
    match refs.iter_mut().find(|r| r.uid == oref.uid) {
        Some(slot) => *slot = oref,
        None => refs.push(oref),
    }
    Ok(())
}

/// True when `child` carries an owner reference to `parent` (by uid).
pub fn is_owned_by<K: Resource>(child: &K, parent: &Parent) -> bool {
    let Some(uid) = parent.uid.as_deref() else { return false };
    child
        .meta()
        .owner_references
        .as_ref()
        .map_or(false, |refs| refs.iter().any(|r| r.uid == uid))
}
