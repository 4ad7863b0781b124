//! Cycle-guarded pytree traversal.
//!
//! The host-language binding layer's own object introspection and value
//! copying are out of scope; what belongs here is
//! the traversal *algorithm* and the [`PyTree`] contract a composite
//! state type implements to participate in it. A leaf is a single
//! [`AdHandle`] — everything this crate's strategies and control-flow
//! frontends operate on.

use alloc::string::String;
use alloc::vec::Vec;
use vcall_types::AdHandle;

use crate::error::{Bug, BugVariant};
use crate::Result;

/// One step of a leaf's path. Rendered without separators except
/// [`PathSegment::Field`], which is dot-prefixed.
#[derive(Debug, Clone)]
pub enum PathSegment {
    /// A numeric position within a list/tuple/array.
    Index(u32),
    /// A string key within a map.
    Key(String),
    /// A named field of a user record.
    Field(&'static str),
}

/// A heterogeneous tree of containers and leaves describing composite
/// state. Leaves are [`AdHandle`]s; containers
/// recurse into their children via [`Self::pytree_walk`].
pub trait PyTree {
    /// Visit every leaf reachable from `self`, in a fixed, deterministic
    /// order, via `t`.
    fn pytree_walk(&mut self, t: &mut Traverser<'_>) -> Result<()>;

    /// A stable identity for cycle detection, for container types
    /// allocated behind a pointer. Leaves and by-value containers that
    /// can never participate in a cycle return `None`.
    fn pytree_identity(&self) -> Option<*const ()> {
        None
    }
}

impl PyTree for AdHandle {
    fn pytree_walk(&mut self, t: &mut Traverser<'_>) -> Result<()> {
        t.leaf(self)
    }
}

impl<T: PyTree> PyTree for Vec<T> {
    fn pytree_identity(&self) -> Option<*const ()> {
        if self.is_empty() {
            None
        } else {
            Some(self.as_ptr() as *const ())
        }
    }

    fn pytree_walk(&mut self, t: &mut Traverser<'_>) -> Result<()> {
        if let Some(id) = self.pytree_identity() {
            t.push_container(id)?;
        }
        for (i, item) in self.iter_mut().enumerate() {
            t.with_segment(PathSegment::Index(i as u32), |t| item.pytree_walk(t))?;
        }
        if self.pytree_identity().is_some() {
            t.pop_container();
        }
        Ok(())
    }
}

impl<T: PyTree> PyTree for alloc::collections::BTreeMap<String, T> {
    fn pytree_identity(&self) -> Option<*const ()> {
        if self.is_empty() {
            None
        } else {
            // Any stable, per-map address works; the first key's address
            // is as good as any allocation pointer we don't otherwise
            // have access to through the public `BTreeMap` API.
            self.values().next().map(|v| v as *const T as *const ())
        }
    }

    fn pytree_walk(&mut self, t: &mut Traverser<'_>) -> Result<()> {
        let id = self.pytree_identity();
        if let Some(id) = id {
            t.push_container(id)?;
        }
        for (k, v) in self.iter_mut() {
            t.with_segment(PathSegment::Key(k.clone()), |t| v.pytree_walk(t))?;
        }
        if id.is_some() {
            t.pop_container();
        }
        Ok(())
    }
}

macro_rules! impl_pytree_tuple {
    ($($idx:tt => $ty:ident),+) => {
        impl<$($ty: PyTree),+> PyTree for ($($ty,)+) {
            fn pytree_walk(&mut self, t: &mut Traverser<'_>) -> Result<()> {
                $(
                    t.with_segment(PathSegment::Index($idx), |t| self.$idx.pytree_walk(t))?;
                )+
                Ok(())
            }
        }
    };
}

impl_pytree_tuple!(0 => A);
impl_pytree_tuple!(0 => A, 1 => B);
impl_pytree_tuple!(0 => A, 1 => B, 2 => C);
impl_pytree_tuple!(0 => A, 1 => B, 2 => C, 3 => D);

/// Threaded through one traversal: the current path, the cycle-guard
/// stack of container identities currently being visited, and optional
/// per-top-level-slot labels overriding the default `arg{n}` naming.
pub struct Traverser<'a> {
    path: Vec<PathSegment>,
    seen: Vec<*const ()>,
    labels: Option<&'a [&'a str]>,
    sink: &'a mut dyn FnMut(String, &mut AdHandle) -> Result<()>,
}

impl<'a> Traverser<'a> {
    fn new(labels: Option<&'a [&'a str]>, sink: &'a mut dyn FnMut(String, &mut AdHandle) -> Result<()>) -> Self {
        Self {
            path: Vec::new(),
            seen: Vec::new(),
            labels,
            sink,
        }
    }

    /// Enter a container with the given pointer identity, failing if it
    /// is already on the path (a cycle).
    pub fn push_container(&mut self, identity: *const ()) -> Result<()> {
        if self.seen.contains(&identity) {
            return Err(Bug::new(BugVariant::CyclicPyTree).into());
        }
        self.seen.push(identity);
        Ok(())
    }

    /// Leave the container most recently entered via
    /// [`Self::push_container`].
    pub fn pop_container(&mut self) {
        self.seen.pop();
    }

    /// Append `segment` to the path for the duration of `f`.
    pub fn with_segment<R>(&mut self, segment: PathSegment, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.path.push(segment);
        let result = f(self);
        self.path.pop();
        result
    }

    /// Visit a leaf at the current path.
    pub fn leaf(&mut self, handle: &mut AdHandle) -> Result<()> {
        let rendered = render_path(&self.path, self.labels);
        (self.sink)(rendered, handle)
    }
}

fn render_path(path: &[PathSegment], labels: Option<&[&str]>) -> String {
    let mut out = String::new();
    for (i, segment) in path.iter().enumerate() {
        match (i, segment) {
            (0, PathSegment::Index(n)) => match labels.and_then(|l| l.get(*n as usize)) {
                Some(label) => out.push_str(label),
                None => out.push_str(&alloc::format!("arg{n}")),
            },
            (_, PathSegment::Index(n)) => out.push_str(&alloc::format!("[{n}]")),
            (_, PathSegment::Key(k)) => out.push_str(&alloc::format!("['{k}']")),
            (_, PathSegment::Field(f)) => {
                out.push('.');
                out.push_str(f);
            }
        }
    }
    out
}

/// Flatten `tree` into its leaves, in traversal order, each paired with
/// its path-derived name.
pub fn flatten<T: PyTree>(tree: &mut T, labels: Option<&[&str]>) -> Result<Vec<(String, AdHandle)>> {
    let mut out = Vec::new();
    {
        let mut sink = |path: String, handle: &mut AdHandle| {
            out.push((path, *handle));
            Ok(())
        };
        let mut t = Traverser::new(labels, &mut sink);
        tree.pytree_walk(&mut t)?;
    }
    Ok(out)
}

/// Overwrite every leaf of `tree`, in the same traversal order
/// [`flatten`] would visit them, with the corresponding entry of
/// `values`. Fails with [`BugVariant::LeafCountMismatch`] if `values`
/// has a different length than the tree has leaves.
pub fn write_back<T: PyTree>(tree: &mut T, labels: Option<&[&str]>, values: &[AdHandle]) -> Result<()> {
    let mut index = 0usize;
    let mut err: Option<crate::error::DispatchError> = None;
    {
        let mut sink = |_path: String, handle: &mut AdHandle| match values.get(index) {
            Some(value) => {
                *handle = *value;
                index += 1;
                Ok(())
            }
            None => {
                let bug = Bug::new(BugVariant::LeafCountMismatch).with_message("write_back received fewer values than the tree has leaves");
                Err(bug.into())
            }
        };
        let mut t = Traverser::new(labels, &mut sink);
        if let Err(e) = tree.pytree_walk(&mut t) {
            err = Some(e);
        }
    }
    if let Some(e) = err {
        return Err(e);
    }
    if index != values.len() {
        return Err(Bug::new(BugVariant::LeafCountMismatch)
            .with_message("write_back received more values than the tree has leaves")
            .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcall_types::IrHandle;

    fn h(n: u32) -> AdHandle {
        AdHandle::from_ir(IrHandle::new(n))
    }

    #[test]
    fn flattens_nested_tuple_with_default_names() {
        let mut state = (h(1), alloc::vec![h(2), h(3)]);
        let leaves = flatten(&mut state, None).unwrap();
        let names: Vec<&str> = leaves.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["arg0", "arg1[0]", "arg1[1]"]);
    }

    #[test]
    fn respects_override_labels() {
        let mut state = (h(1), h(2));
        let leaves = flatten(&mut state, Some(&["i", "s"])).unwrap();
        let names: Vec<&str> = leaves.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["i", "s"]);
    }

    #[test]
    fn write_back_round_trips() {
        let mut state = (h(1), h(2));
        write_back(&mut state, None, &[h(10), h(20)]).unwrap();
        let leaves = flatten(&mut state, None).unwrap();
        assert_eq!(leaves[0].1, h(10));
        assert_eq!(leaves[1].1, h(20));
    }

    #[test]
    fn write_back_rejects_wrong_leaf_count() {
        let mut state = (h(1), h(2));
        let err = write_back(&mut state, None, &[h(10)]).unwrap_err();
        assert!(matches!(err, crate::DispatchError::InternalInvariant(_)));
    }

    #[test]
    fn map_keys_are_quoted() {
        let mut m = alloc::collections::BTreeMap::new();
        m.insert(String::from("k"), h(1));
        let leaves = flatten(&mut m, None).unwrap();
        assert_eq!(leaves[0].0, "['k']");
    }
}
