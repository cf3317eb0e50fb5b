//! The process-wide thread registry: a map from numeric thread ids to thread
//! objects, plus the id generator. Ids are recycled on wrap-around by probing
//! past live ids; the top 4096 ids are reserved for special uses.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::thread::ThreadRef;

pub(crate) const TID_MAX: u32 = u32::MAX - 4096;

struct Inner {
    map: BTreeMap<u32, ThreadRef>,
    idgen: u32,
    exited_cpu_time: u64,
}

static REGISTRY: Mutex<Inner> = Mutex::new(Inner {
    map: BTreeMap::new(),
    idgen: 0,
    exited_cpu_time: 0,
});

fn allocate_id(idgen: &mut u32, taken: impl Fn(u32) -> bool) -> u32 {
    let mut tid = *idgen;
    let mut probes = 0u64;
    loop {
        tid += 1;
        if tid > TID_MAX {
            tid = 1;
        }
        if !taken(tid) {
            *idgen = tid;
            return tid;
        }
        probes += 1;
        if probes >= TID_MAX as u64 {
            panic!("can't allocate a thread id");
        }
    }
}

/// Allocate an id, build the thread with it and insert it, all under the
/// registry lock so a concurrent creator cannot probe to the same id.
pub(crate) fn register(build: impl FnOnce(u32) -> ThreadRef) -> ThreadRef {
    let mut g = REGISTRY.lock();
    let Inner { map, idgen, .. } = &mut *g;
    let id = allocate_id(idgen, |id| map.contains_key(&id));
    let t = build(id);
    map.insert(id, t.clone());
    t
}

pub(crate) fn unregister(id: u32, cpu_time: u64) {
    let mut g = REGISTRY.lock();
    if g.map.remove(&id).is_some() {
        g.exited_cpu_time += cpu_time;
    }
}

pub fn find_by_id(id: u32) -> Option<ThreadRef> {
    REGISTRY.lock().map.get(&id).cloned()
}

pub fn numthreads() -> usize {
    REGISTRY.lock().map.len()
}

/// Total CPU time accumulated by threads that have been finalized.
pub fn exited_cpu_time() -> u64 {
    REGISTRY.lock().exited_cpu_time
}

pub fn with_all_threads(mut f: impl FnMut(&ThreadRef)) {
    let g = REGISTRY.lock();
    for t in g.map.values() {
        f(t);
    }
}

pub fn with_thread_by_id<R>(id: u32, f: impl FnOnce(Option<&ThreadRef>) -> R) -> R {
    let g = REGISTRY.lock();
    f(g.map.get(&id))
}

/// Snapshot of all registered threads, for callers that must not hold the
/// registry lock while acting on them.
pub(crate) fn snapshot() -> Vec<ThreadRef> {
    REGISTRY.lock().map.values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn ids_skip_live_ones() {
        let live: BTreeSet<u32> = [2, 3, 5].into_iter().collect();
        let mut idgen = 1;
        assert_eq!(allocate_id(&mut idgen, |id| live.contains(&id)), 4);
        assert_eq!(allocate_id(&mut idgen, |id| live.contains(&id)), 6);
    }

    #[test]
    fn ids_wrap_at_tid_max() {
        let mut idgen = TID_MAX;
        assert_eq!(allocate_id(&mut idgen, |_| false), 1);
        let mut idgen = TID_MAX - 1;
        assert_eq!(allocate_id(&mut idgen, |id| id == TID_MAX), 1);
    }

    #[test]
    #[should_panic(expected = "can't allocate a thread id")]
    fn exhaustion_aborts_after_one_sweep() {
        let mut idgen = 0;
        allocate_id(&mut idgen, |_| true);
    }
}
