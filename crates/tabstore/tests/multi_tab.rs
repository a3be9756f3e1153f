//! Several processes ("tabs") sharing one object store through `Kv`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;
use tabstore::{Kv, LocalChannel, MemoryObjectStore, SyncAdapter, TaskQueue};

type TabKv = Kv<SyncAdapter<MemoryObjectStore>>;

fn open_tab(store: &MemoryObjectStore, hub: &LocalChannel, queue: &TaskQueue) -> TabKv {
    let adapter = SyncAdapter::open(
        store.clone(),
        Arc::new(hub.endpoint()),
        Arc::new(queue.clone()),
    )
    .unwrap();
    Kv::builder(adapter).namespace("app").build().unwrap()
}

fn hits() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn write_in_one_tab_reaches_the_other() {
    let store = MemoryObjectStore::new();
    let hub = LocalChannel::new();
    let queue = TaskQueue::new();
    let a = open_tab(&store, &hub, &queue);
    let b = open_tab(&store, &hub, &queue);

    let (seen, listener) = hits();
    let _sub = b.subscribe("theme", listener);

    a.save("theme", "dark").unwrap();
    assert_eq!(a.get_or("theme", String::from("light")), "dark");
    assert_eq!(b.get_or("theme", String::from("light")), "light");

    queue.run_until_idle();
    assert_eq!(b.get_or("theme", String::from("light")), "dark");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(a.store().backend().revision(), 1);
    assert_eq!(b.store().backend().revision(), 1);
}

#[test]
fn writes_before_a_flush_commit_together() {
    let store = MemoryObjectStore::new();
    let hub = LocalChannel::new();
    let queue = TaskQueue::new();
    let a = open_tab(&store, &hub, &queue);

    a.save("x", &1).unwrap();
    a.save("y", &2).unwrap();
    a.save("x", &3).unwrap();
    a.remove("y");
    assert_eq!(a.store().backend().pending(), 2);
    assert_eq!(queue.pending(), 1);

    queue.run_until_idle();
    assert_eq!(a.store().backend().revision(), 1);
    assert_eq!(
        store.get_raw("app:x").as_deref(),
        Some(r#"{"version":0,"payload":"3"}"#)
    );
    assert_eq!(store.get_raw("app:y"), None);
}

#[test]
fn losing_tab_discards_its_batch_and_converges() {
    let store = MemoryObjectStore::new();
    // Separate channels: neither tab hears the other's commit.
    let (hub_a, hub_b) = (LocalChannel::new(), LocalChannel::new());
    let (queue_a, queue_b) = (TaskQueue::new(), TaskQueue::new());
    let a = open_tab(&store, &hub_a, &queue_a);
    let b = open_tab(&store, &hub_b, &queue_b);

    let (seen, listener) = hits();
    let _sub = b.subscribe("k", listener);

    a.save("k", &1).unwrap();
    b.save("k", &2).unwrap();
    b.save("only-b", &true).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    queue_a.run_until_idle();
    queue_b.run_until_idle();

    assert_eq!(b.store().backend().revision(), 1);
    assert_eq!(b.get_or("k", 0), 1);
    assert!(!b.get_or("only-b", false));
    assert_eq!(b.keys(), vec!["k"]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(a.get_or("k", 0), b.get_or("k", 0));
}

#[test]
fn unrelated_commit_keeps_snapshot_identity() {
    let store = MemoryObjectStore::new();
    let hub = LocalChannel::new();
    let queue = TaskQueue::new();
    let a = open_tab(&store, &hub, &queue);
    let b = open_tab(&store, &hub, &queue);

    a.save("k", "stable").unwrap();
    queue.run_until_idle();

    let (seen, listener) = hits();
    let _sub = b.subscribe("k", listener);
    let before = b.snapshot("k").unwrap();

    a.save("other", "noise").unwrap();
    queue.run_until_idle();

    let after = b.snapshot("k").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(b.get_or("other", String::new()), "noise");
}

#[test]
fn revision_key_is_hidden() {
    let store = MemoryObjectStore::new();
    let hub = LocalChannel::new();
    let queue = TaskQueue::new();
    let a = open_tab(&store, &hub, &queue);

    a.save("k", &1).unwrap();
    queue.run_until_idle();
    assert_eq!(store.get_raw(tabstore::REVISION_KEY).as_deref(), Some("1"));
    assert_eq!(a.keys(), vec!["k"]);
}

#[derive(Debug, Clone)]
enum Step {
    Save { tab: usize, key: usize, value: i32 },
    Remove { tab: usize, key: usize },
    Flush,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..3usize, 0..3usize, any::<i32>())
            .prop_map(|(tab, key, value)| Step::Save { tab, key, value }),
        (0..3usize, 0..3usize).prop_map(|(tab, key)| Step::Remove { tab, key }),
        Just(Step::Flush),
    ]
}

const KEYS: [&str; 3] = ["a", "b", "c"];

proptest! {
    #[test]
    fn tabs_converge_on_the_store(steps in prop::collection::vec(step(), 1..40)) {
        let store = MemoryObjectStore::new();
        let hub = LocalChannel::new();
        let queue = TaskQueue::new();
        let tabs: Vec<TabKv> = (0..3).map(|_| open_tab(&store, &hub, &queue)).collect();

        for step in steps {
            match step {
                Step::Save { tab, key, value } => tabs[tab].save(KEYS[key], &value).unwrap(),
                Step::Remove { tab, key } => tabs[tab].remove(KEYS[key]),
                Step::Flush => {
                    queue.run_until_idle();
                }
            }
        }
        queue.run_until_idle();

        for tab in &tabs {
            prop_assert_eq!(tab.store().backend().pending(), 0);
            for key in KEYS {
                let stored = store.get_raw(&format!("app:{key}"));
                let snap = tab.snapshot(key);
                prop_assert_eq!(snap.as_deref(), stored.as_deref());
            }
        }
    }
}
