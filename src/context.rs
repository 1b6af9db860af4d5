// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-fiber dependency injection: an immutable, structurally-shared map from
//! typed keys to service values.
//!
//! A [`Context`] is cheap to clone (an `Rc` bump) and `insert` never mutates an
//! existing `Context` in place; it returns a new one that shares the tail of
//! the old one — "push a frame, keep a pointer to the rest," generalized from
//! a single overridable slot to an arbitrary number of keyed ones.

use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;

/// A marker type identifying a required service of type [`Tag::Value`].
///
/// There is no default: looking up a `Service` that was never provided is an
/// error (see [`Context::get_service`]).
pub trait Tag: 'static {
    type Value: 'static;
}

/// A marker type identifying a service with a default value, produced lazily
/// the first time it's looked up and not found.
pub trait ReferenceTag: 'static {
    type Value: 'static;

    fn default_value() -> Self::Value;
}

struct Node {
    key: TypeId,
    name: &'static str,
    value: Rc<dyn Any>,
    parent: Option<Rc<Node>>,
}

/// An immutable, persistent, per-fiber map of services.
///
/// Every fiber owns a `Context`; forking a child fiber clones the parent's
/// `Context` (an O(1) `Rc` clone) unless the fork site overrides specific
/// services via [`Context::with`].
#[derive(Clone, Default)]
pub struct Context {
    head: Option<Rc<Node>>,
}

impl Context {
    pub fn empty() -> Self {
        Self { head: None }
    }

    /// Returns a new `Context` with `T::Value` bound to `value`, shadowing any
    /// prior binding for `T` without disturbing it (restored once the child
    /// scope that called `with` drops its copy of the returned `Context`).
    #[must_use]
    pub fn with<T: Tag>(&self, value: T::Value) -> Context {
        Context {
            head: Some(Rc::new(Node {
                key: TypeId::of::<T>(),
                name: std::any::type_name::<T>(),
                value: Rc::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    /// Returns a new `Context` with `R::Value` bound to `value`, for a
    /// [`ReferenceTag`] default override.
    #[must_use]
    pub fn with_reference<R: ReferenceTag>(&self, value: R::Value) -> Context {
        Context {
            head: Some(Rc::new(Node {
                key: TypeId::of::<R>(),
                name: std::any::type_name::<R>(),
                value: Rc::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    fn find(&self, key: TypeId) -> Option<&Rc<dyn Any>> {
        let mut cur = self.head.as_ref();
        while let Some(node) = cur {
            if node.key == key {
                return Some(&node.value);
            }
            cur = node.parent.as_ref();
        }
        None
    }

    /// Look up a required service. Returns `None` if it was never bound.
    pub fn get_service<T: Tag>(&self) -> Option<Rc<T::Value>> {
        self.find(TypeId::of::<T>())
            .map(|v| v.clone().downcast::<T::Value>().expect("Context invariant: TypeId collision"))
    }

    /// Look up a reference service, falling back to [`ReferenceTag::default_value`]
    /// if it was never overridden.
    pub fn get_reference<R: ReferenceTag>(&self) -> Rc<R::Value> {
        match self.find(TypeId::of::<R>()) {
            Some(v) => v.clone().downcast::<R::Value>().expect("Context invariant: TypeId collision"),
            None => Rc::new(R::default_value()),
        }
    }

    pub fn contains<T: Tag>(&self) -> bool {
        self.find(TypeId::of::<T>()).is_some()
    }

    /// Names of every binding currently shadowing the empty context, innermost
    /// first. Diagnostic use only (e.g. logging a fiber's service set).
    pub fn binding_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut cur = self.head.as_ref();
        while let Some(node) = cur {
            names.push(node.name);
            cur = node.parent.as_ref();
        }
        names
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("bindings", &self.binding_names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Greeting;
    impl Tag for Greeting {
        type Value = String;
    }

    struct RetryBudget;
    impl ReferenceTag for RetryBudget {
        type Value = u32;

        fn default_value() -> u32 {
            3
        }
    }

    #[test]
    fn missing_service_is_none() {
        let ctx = Context::empty();
        assert!(ctx.get_service::<Greeting>().is_none());
    }

    #[test]
    fn with_shadows_and_restores() {
        let base = Context::empty().with::<Greeting>("hello".to_string());
        let shadowed = base.with::<Greeting>("goodbye".to_string());

        assert_eq!(*shadowed.get_service::<Greeting>().unwrap(), "goodbye");
        assert_eq!(*base.get_service::<Greeting>().unwrap(), "hello");
    }

    #[test]
    fn reference_falls_back_to_default() {
        let ctx = Context::empty();
        assert_eq!(*ctx.get_reference::<RetryBudget>(), 3);

        let overridden = ctx.with_reference::<RetryBudget>(10);
        assert_eq!(*overridden.get_reference::<RetryBudget>(), 10);
        assert_eq!(*ctx.get_reference::<RetryBudget>(), 3);
    }

    #[test]
    fn clone_is_cheap_and_shares_tail() {
        let base = Context::empty().with::<Greeting>("hi".to_string());
        let a = base.clone().with_reference::<RetryBudget>(1);
        let b = base.clone().with_reference::<RetryBudget>(2);

        assert_eq!(*a.get_service::<Greeting>().unwrap(), "hi");
        assert_eq!(*b.get_service::<Greeting>().unwrap(), "hi");
        assert_eq!(*a.get_reference::<RetryBudget>(), 1);
        assert_eq!(*b.get_reference::<RetryBudget>(), 2);
    }
}
