//! Reference-counted [`ObjectSpace`] used by embedding hosts without an object model of their own
//! and by the test-suite.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use pyni_core::{ObjectKind, ObjectRef, ObjectSpace};

const NONE_ID: u64 = 1;

#[derive(Debug, Clone)]
enum Value {
    None,
    Int(i64),
    Float(f64),
    List(Vec<ObjectRef>),
    Bytes(Arc<[u8]>),
}

impl Value {
    fn kind(&self) -> ObjectKind {
        match self {
            Value::None => ObjectKind::None,
            Value::Int(_) => ObjectKind::Int,
            Value::Float(_) => ObjectKind::Float,
            Value::List(_) => ObjectKind::List,
            Value::Bytes(_) => ObjectKind::Bytes,
        }
    }
}

#[derive(Debug)]
struct Entry {
    refcount: usize,
    value: Value,
}

#[derive(Debug)]
struct HeapInner {
    entries: HashMap<u64, Entry>,
    next_id: u64,
}

/// Object heap with plain reference counts. The none singleton is immortal.
#[derive(Debug)]
pub struct RcHeap {
    inner: Mutex<HeapInner>,
}

impl Default for RcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl RcHeap {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            NONE_ID,
            Entry {
                refcount: 1,
                value: Value::None,
            },
        );
        Self {
            inner: Mutex::new(HeapInner {
                entries,
                next_id: NONE_ID + 1,
            }),
        }
    }

    fn alloc(&self, value: Value) -> ObjectRef {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Entry { refcount: 1, value });
        ObjectRef::from_raw(id)
    }

    fn read<T>(&self, obj: ObjectRef, f: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        let inner = self.inner.lock();
        inner.entries.get(&obj.as_raw()).and_then(|entry| f(&entry.value))
    }

    /// Current reference count of a live object.
    pub fn refcount(&self, obj: ObjectRef) -> Option<usize> {
        self.inner
            .lock()
            .entries
            .get(&obj.as_raw())
            .map(|entry| entry.refcount)
    }

    /// Number of live objects, not counting the none singleton.
    pub fn live_count(&self) -> usize {
        self.inner.lock().entries.len() - 1
    }

    pub fn is_alive(&self, obj: ObjectRef) -> bool {
        self.inner.lock().entries.contains_key(&obj.as_raw())
    }
}

impl ObjectSpace for RcHeap {
    fn retain(&self, obj: ObjectRef) {
        if obj.as_raw() == NONE_ID {
            return;
        }
        if let Some(entry) = self.inner.lock().entries.get_mut(&obj.as_raw()) {
            entry.refcount += 1;
        }
    }

    fn release(&self, obj: ObjectRef) {
        let mut inner = self.inner.lock();
        let mut pending = vec![obj];
        while let Some(obj) = pending.pop() {
            let id = obj.as_raw();
            if id == NONE_ID {
                continue;
            }
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount > 0 {
                continue;
            }
            if let Some(Entry {
                value: Value::List(items),
                ..
            }) = inner.entries.remove(&id)
            {
                pending.extend(items);
            }
        }
    }

    fn kind(&self, obj: ObjectRef) -> Option<ObjectKind> {
        self.read(obj, |value| Some(value.kind()))
    }

    fn none(&self) -> ObjectRef {
        ObjectRef::from_raw(NONE_ID)
    }

    fn new_int(&self, value: i64) -> ObjectRef {
        self.alloc(Value::Int(value))
    }

    fn new_float(&self, value: f64) -> ObjectRef {
        self.alloc(Value::Float(value))
    }

    fn new_list(&self) -> ObjectRef {
        self.alloc(Value::List(Vec::new()))
    }

    fn new_bytes(&self, data: &[u8]) -> ObjectRef {
        self.alloc(Value::Bytes(Arc::from(data)))
    }

    fn int_value(&self, obj: ObjectRef) -> Option<i64> {
        self.read(obj, |value| match value {
            Value::Int(v) => Some(*v),
            _ => None,
        })
    }

    fn float_value(&self, obj: ObjectRef) -> Option<f64> {
        self.read(obj, |value| match value {
            Value::Float(v) => Some(*v),
            _ => None,
        })
    }

    fn list_append(&self, list: ObjectRef, item: ObjectRef) -> bool {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&item.as_raw()) {
            return false;
        }
        match inner.entries.get_mut(&list.as_raw()) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => items.push(item),
            _ => return false,
        }
        if item.as_raw() != NONE_ID {
            if let Some(entry) = inner.entries.get_mut(&item.as_raw()) {
                entry.refcount += 1;
            }
        }
        true
    }

    fn list_len(&self, list: ObjectRef) -> Option<usize> {
        self.read(list, |value| match value {
            Value::List(items) => Some(items.len()),
            _ => None,
        })
    }

    fn list_item(&self, list: ObjectRef, index: usize) -> Option<ObjectRef> {
        let item = self.read(list, |value| match value {
            Value::List(items) => items.get(index).copied(),
            _ => None,
        })?;
        self.retain(item);
        Some(item)
    }

    fn bytes_data(&self, obj: ObjectRef) -> Option<Arc<[u8]>> {
        self.read(obj, |value| match value {
            Value::Bytes(data) => Some(Arc::clone(data)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releasing_a_list_releases_its_items() {
        let heap = RcHeap::new();
        let list = heap.new_list();
        let item = heap.new_int(4);
        assert!(heap.list_append(list, item));
        heap.release(item);
        assert_eq!(heap.refcount(item), Some(1));
        heap.release(list);
        assert!(!heap.is_alive(item));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn none_is_immortal() {
        let heap = RcHeap::new();
        let none = heap.none();
        heap.release(none);
        heap.release(none);
        assert_eq!(heap.kind(none), Some(ObjectKind::None));
    }
}
