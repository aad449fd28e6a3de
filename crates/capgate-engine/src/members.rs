//! Member enumeration.
//!
//! Walks a class and its bases lazily, yielding each visible member once
//! (the most-derived definition wins). Nothing is collected or sorted up
//! front; callers filter with ordinary iterator adapters.

use std::collections::HashSet;

use crate::class::{ClassDef, Member};

/// The class followed by its bases, nearest first.
pub struct Mro<'a, T> {
    next: Option<&'a ClassDef<T>>,
}

impl<'a, T> Mro<'a, T> {
    pub(crate) fn new(class: &'a ClassDef<T>) -> Self {
        Self { next: Some(class) }
    }
}

impl<'a, T> Iterator for Mro<'a, T> {
    type Item = &'a ClassDef<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.base().map(|b| b.as_ref());
        Some(cur)
    }
}

/// Lazy `(name, member)` iterator over a class hierarchy.
pub struct Members<'a, T> {
    classes: Mro<'a, T>,
    current: std::slice::Iter<'a, Member<T>>,
    seen: HashSet<&'a str>,
}

impl<'a, T> Members<'a, T> {
    pub(crate) fn new(class: &'a ClassDef<T>) -> Self {
        Self { classes: Mro::new(class), current: <&[Member<T>]>::default().iter(), seen: HashSet::new() }
    }
}

impl<'a, T> Iterator for Members<'a, T> {
    type Item = (&'a str, &'a Member<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.current.next() {
                Some(m) => {
                    if self.seen.insert(m.name()) {
                        return Some((m.name(), m));
                    }
                }
                None => self.current = self.classes.next()?.own_members().iter(),
            }
        }
    }
}
