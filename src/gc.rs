//! Mark-sweep collector over the object heap.
//!
//! Roots are handed in by the caller (every register of every live frame,
//! pending results and exceptions); static fields are added here. Marking
//! uses an explicit worklist so deep object graphs cannot exhaust the host
//! stack.
use log::{debug, info};

use crate::heap::{Heap, ObjectId};

/// Totals over the collector's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
}

/// Outcome of a single collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collection {
    pub marked: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

#[derive(Debug)]
pub struct GarbageCollector {
    // Occupancy ratio at which `collect_if_needed` runs a collection.
    threshold: f64,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    pub fn should_collect(&self, heap: &Heap) -> bool {
        heap.capacity() > 0 && heap.used() as f64 / heap.capacity() as f64 >= self.threshold
    }

    /// Collects only once heap occupancy reaches the threshold.
    pub fn collect_if_needed<I>(&mut self, heap: &mut Heap, roots: I) -> Option<Collection>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        if self.should_collect(heap) {
            Some(self.collect(heap, roots))
        } else {
            None
        }
    }

    /// Runs a full mark and sweep.
    pub fn collect<I>(&mut self, heap: &mut Heap, roots: I) -> Collection
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let before = heap.used();
        let mut worklist: Vec<ObjectId> = roots.into_iter().collect();
        worklist.extend(heap.static_roots());
        let marked = mark(heap, worklist);
        let (objects_freed, bytes_freed) = sweep(heap);

        self.stats.collections += 1;
        self.stats.objects_freed += objects_freed as u64;
        self.stats.bytes_freed += bytes_freed as u64;
        info!(
            target: "gc",
            "collection #{}: {} live, {} freed, {} -> {} bytes",
            self.stats.collections,
            marked,
            objects_freed,
            before,
            heap.used()
        );
        Collection {
            marked,
            objects_freed,
            bytes_freed,
        }
    }
}

fn mark(heap: &mut Heap, mut worklist: Vec<ObjectId>) -> usize {
    let mut marked = 0;
    while let Some(id) = worklist.pop() {
        let Some(object) = heap.get_mut(id) else {
            // Stale id in a dead register.
            continue;
        };
        if object.marked {
            continue;
        }
        object.marked = true;
        marked += 1;
        worklist.extend(object.references());
    }
    marked
}

fn sweep(heap: &mut Heap) -> (usize, usize) {
    let ids: Vec<ObjectId> = heap.ids().collect();
    let (mut objects, mut bytes) = (0, 0);
    for id in ids {
        let Some(object) = heap.get_mut(id) else {
            continue;
        };
        if object.marked {
            object.marked = false;
        } else {
            bytes += heap.free(id);
            objects += 1;
            debug!(target: "gc", "swept {}", id);
        }
    }
    (objects, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjectKind, Value};

    fn instance(heap: &mut Heap, field: Value) -> ObjectId {
        heap.allocate("LNode;", ObjectKind::Instance { fields: vec![field] })
            .unwrap()
    }

    #[test]
    fn keeps_transitive_closure_and_frees_unreachable_chain() {
        let mut heap = Heap::new(1 << 20);
        let mut gc = GarbageCollector::new(0.7);
        let before = heap.used();

        let c = instance(&mut heap, Value::Null);
        let b = instance(&mut heap, Value::Object(c));
        let a = instance(&mut heap, Value::Object(b));

        let first = gc.collect(&mut heap, [a]);
        assert_eq!(first.objects_freed, 0);
        assert!(heap.contains(a) && heap.contains(b) && heap.contains(c));

        let second = gc.collect(&mut heap, []);
        assert_eq!(second.objects_freed, 3);
        assert!(!heap.contains(a) && !heap.contains(b) && !heap.contains(c));
        assert_eq!(heap.used(), before);
        assert_eq!(gc.stats().collections, 2);
    }

    #[test]
    fn cycles_terminate() {
        let mut heap = Heap::new(1 << 20);
        let mut gc = GarbageCollector::new(0.7);
        let a = instance(&mut heap, Value::Null);
        let b = instance(&mut heap, Value::Object(a));
        if let Some(object) = heap.get_mut(a) {
            object.kind = ObjectKind::Instance { fields: vec![Value::Object(b)] };
        }
        assert_eq!(gc.collect(&mut heap, [a]).marked, 2);
        assert_eq!(gc.collect(&mut heap, []).objects_freed, 2);
    }

    #[test]
    fn statics_and_array_elements_are_followed() {
        let mut heap = Heap::new(1 << 20);
        let mut gc = GarbageCollector::new(0.7);
        let s = heap.allocate_string("kept").unwrap();
        let array = heap
            .allocate(
                "[Ljava/lang/String;",
                ObjectKind::Array {
                    component: "Ljava/lang/String;".into(),
                    elements: vec![Value::Object(s), Value::Null],
                },
            )
            .unwrap();
        heap.set_static("LHolder;", "items", Value::Object(array));
        let garbage = heap.allocate_string("dropped").unwrap();

        let report = gc.collect(&mut heap, []);
        assert_eq!(report.objects_freed, 1);
        assert!(heap.contains(s) && heap.contains(array));
        assert!(!heap.contains(garbage));
    }

    #[test]
    fn collects_once_occupancy_reaches_threshold() {
        let mut heap = Heap::new(100);
        let mut gc = GarbageCollector::new(0.5);
        heap.allocate_string("0123456789").unwrap();
        assert!(gc.collect_if_needed(&mut heap, []).is_none());
        // 26 + 24 bytes puts occupancy at exactly 0.5.
        heap.allocate_string("01234567").unwrap();
        assert_eq!(heap.used(), 50);
        let report = gc.collect_if_needed(&mut heap, []).unwrap();
        assert_eq!(report.objects_freed, 2);
        assert_eq!(heap.used(), 0);
    }
}
