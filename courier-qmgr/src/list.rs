//! Doubly-linked lists threaded through arena slots.
//!
//! The links live inside the listed object, so an object can sit on several
//! lists at once (an entry is on its queue's todo or busy list and on its
//! peer's list). A [`Field`] names which set of links a list uses.

use crate::arena::{Arena, Key};

pub struct Links<T> {
    prev: Option<Key<T>>,
    next: Option<Key<T>>,
    linked: bool,
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
        }
    }
}

/// Accessors for one set of links inside `T`
pub struct Field<T> {
    get: fn(&T) -> &Links<T>,
    get_mut: fn(&mut T) -> &mut Links<T>,
}

impl<T> Field<T> {
    pub const fn new(get: fn(&T) -> &Links<T>, get_mut: fn(&mut T) -> &mut Links<T>) -> Self {
        Self { get, get_mut }
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Field<T> {}

pub struct List<T> {
    head: Option<Key<T>>,
    tail: Option<Key<T>>,
    len: usize,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T> List<T> {
    pub const fn front(&self) -> Option<Key<T>> {
        self.head
    }

    pub const fn back(&self) -> Option<Key<T>> {
        self.tail
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Successor of `key` on the list that `field` threads
    pub fn next_of(arena: &Arena<T>, key: Key<T>, field: Field<T>) -> Option<Key<T>> {
        (field.get)(&arena[key]).next
    }

    pub fn iter<'a>(&self, arena: &'a Arena<T>, field: Field<T>) -> Iter<'a, T> {
        Iter {
            arena,
            field,
            cursor: self.head,
        }
    }

    pub fn push_back(&mut self, arena: &mut Arena<T>, key: Key<T>, field: Field<T>) {
        let links = (field.get_mut)(&mut arena[key]);
        assert!(!links.linked, "object {key:?} is already on a list");
        links.linked = true;
        links.prev = self.tail;
        links.next = None;

        match self.tail {
            Some(tail) => (field.get_mut)(&mut arena[tail]).next = Some(key),
            None => self.head = Some(key),
        }

        self.tail = Some(key);
        self.len += 1;
    }

    /// Link `key` immediately in front of `before`, which must be on this list.
    pub fn insert_before(
        &mut self,
        arena: &mut Arena<T>,
        key: Key<T>,
        before: Key<T>,
        field: Field<T>,
    ) {
        let anchor = (field.get)(&arena[before]);
        assert!(anchor.linked, "anchor {before:?} is not on a list");
        let prev = anchor.prev;

        let links = (field.get_mut)(&mut arena[key]);
        assert!(!links.linked, "object {key:?} is already on a list");
        links.linked = true;
        links.prev = prev;
        links.next = Some(before);

        (field.get_mut)(&mut arena[before]).prev = Some(key);
        match prev {
            Some(prev) => (field.get_mut)(&mut arena[prev]).next = Some(key),
            None => self.head = Some(key),
        }

        self.len += 1;
    }

    /// Remove `key` from this list.
    ///
    /// # Panics
    ///
    /// Panics if the object is not linked.
    pub fn unlink(&mut self, arena: &mut Arena<T>, key: Key<T>, field: Field<T>) {
        let links = (field.get_mut)(&mut arena[key]);
        assert!(links.linked, "unlink of object {key:?} not on list");
        let (prev, next) = (links.prev.take(), links.next.take());
        links.linked = false;

        match prev {
            Some(prev) => (field.get_mut)(&mut arena[prev]).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => (field.get_mut)(&mut arena[next]).prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
    }

    /// Rotate the list so that `key` becomes the tail, keeping cyclic order.
    ///
    /// The object after `key` becomes the new head.
    pub fn rotate_after(&mut self, arena: &mut Arena<T>, key: Key<T>, field: Field<T>) {
        assert!(
            (field.get)(&arena[key]).linked,
            "rotate around object {key:?} not on list"
        );

        if self.tail == Some(key) {
            return;
        }

        let (Some(old_head), Some(old_tail)) = (self.head, self.tail) else {
            unreachable!("non-empty list without head or tail");
        };
        let Some(new_head) = (field.get)(&arena[key]).next else {
            unreachable!("object before the tail has no successor");
        };

        (field.get_mut)(&mut arena[old_tail]).next = Some(old_head);
        (field.get_mut)(&mut arena[old_head]).prev = Some(old_tail);
        (field.get_mut)(&mut arena[key]).next = None;
        (field.get_mut)(&mut arena[new_head]).prev = None;

        self.head = Some(new_head);
        self.tail = Some(key);
    }
}

pub struct Iter<'a, T> {
    arena: &'a Arena<T>,
    field: Field<T>,
    cursor: Option<Key<T>>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = Key<T>;

    fn next(&mut self) -> Option<Key<T>> {
        let key = self.cursor?;
        self.cursor = (self.field.get)(&self.arena[key]).next;
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node {
        value: u32,
        links: Links<Node>,
    }

    const LINKS: Field<Node> = Field::new(|n| &n.links, |n| &mut n.links);

    fn setup(n: u32) -> (Arena<Node>, List<Node>, Vec<Key<Node>>) {
        let mut arena = Arena::new();
        let mut list = List::default();
        let keys = (0..n)
            .map(|value| {
                let key = arena.insert(Node {
                    value,
                    ..Node::default()
                });
                list.push_back(&mut arena, key, LINKS);
                key
            })
            .collect();
        (arena, list, keys)
    }

    fn values(list: &List<Node>, arena: &Arena<Node>) -> Vec<u32> {
        list.iter(arena, LINKS).map(|k| arena[k].value).collect()
    }

    #[test]
    fn push_and_unlink() {
        let (mut arena, mut list, keys) = setup(4);
        assert_eq!(values(&list, &arena), [0, 1, 2, 3]);

        list.unlink(&mut arena, keys[0], LINKS);
        list.unlink(&mut arena, keys[2], LINKS);
        assert_eq!(values(&list, &arena), [1, 3]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.front(), Some(keys[1]));
        assert_eq!(list.back(), Some(keys[3]));

        list.unlink(&mut arena, keys[3], LINKS);
        list.unlink(&mut arena, keys[1], LINKS);
        assert!(list.is_empty());
        assert_eq!(list.front(), None);
    }

    #[test]
    fn rotate_keeps_cyclic_order() {
        let (mut arena, mut list, keys) = setup(4);

        list.rotate_after(&mut arena, keys[1], LINKS);
        assert_eq!(values(&list, &arena), [2, 3, 0, 1]);

        list.rotate_after(&mut arena, keys[1], LINKS);
        assert_eq!(values(&list, &arena), [2, 3, 0, 1]);

        list.rotate_after(&mut arena, keys[2], LINKS);
        assert_eq!(values(&list, &arena), [3, 0, 1, 2]);
    }

    #[test]
    fn insert_before_head_and_middle() {
        let (mut arena, mut list, keys) = setup(2);
        let a = arena.insert(Node {
            value: 10,
            ..Node::default()
        });
        let b = arena.insert(Node {
            value: 11,
            ..Node::default()
        });

        list.insert_before(&mut arena, a, keys[0], LINKS);
        list.insert_before(&mut arena, b, keys[1], LINKS);
        assert_eq!(values(&list, &arena), [10, 0, 11, 1]);
        assert_eq!(List::next_of(&arena, a, LINKS), Some(keys[0]));
    }

    #[test]
    #[should_panic(expected = "not on list")]
    fn unlink_twice_panics() {
        let (mut arena, mut list, keys) = setup(1);
        list.unlink(&mut arena, keys[0], LINKS);
        list.unlink(&mut arena, keys[0], LINKS);
    }
}
