// isolation.rs — Multi-threaded checks of the store's transaction guarantees.
//
// Each test drives one store from several threads:
//
//   1. A reader opened before a commit keeps its snapshot until it closes
//   2. Readers never see the counter go backwards while a writer commits
//   3. Write transactions never overlap, so concurrent increments add up
//   4. Every reader opened after a commit sees that commit
//   5. A bundle reload through truncate notifies observers once
//   6. A second reader opens while a commit waits on the first one
//   7. A commit touching several paths and a policy is seen whole or not at all
//
// Transactions are tied to the thread that opened them; only `Store`
// clones cross thread boundaries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use ta_store::{
    CommitEvent, Map, PatchOp, Path, Store, Transaction, TransactionParams, TriggerConfig,
    TruncateParams, TxnContext, Update, Value,
};

fn counter_store() -> Store {
    let mut root = Map::new();
    root.insert("counter".into(), Value::from(0));
    Store::from_object(root).unwrap()
}

fn read_counter(store: &Store) -> f64 {
    let mut r = store.read_transaction().unwrap();
    let n = store
        .read(&r, &Path::from(["counter"]))
        .unwrap()
        .as_f64()
        .unwrap();
    store.commit(&mut r).unwrap();
    n
}

#[test]
fn reader_opened_before_commit_keeps_its_snapshot() {
    let store = counter_store();
    let mut reader = store.read_transaction().unwrap();

    let (staged_tx, staged_rx) = mpsc::channel();
    let writer_store = store.clone();
    let writer = thread::spawn(move || {
        let mut w = writer_store.write_transaction().unwrap();
        writer_store
            .write(&mut w, PatchOp::Replace, &Path::from(["counter"]), Value::from(1))
            .unwrap();
        staged_tx.send(()).unwrap();
        // Blocks until the reader above has closed.
        writer_store.commit(&mut w).unwrap();
    });

    staged_rx.recv().unwrap();
    assert_eq!(
        store.read(&reader, &Path::from(["counter"])).unwrap(),
        &Value::from(0)
    );
    store.commit(&mut reader).unwrap();

    writer.join().unwrap();
    assert_eq!(read_counter(&store), 1.0);
}

#[test]
fn readers_never_see_counter_go_backwards() {
    const COMMITS: i32 = 50;
    const READERS: usize = 4;

    let store = counter_store();
    let start = Arc::new(Barrier::new(READERS + 1));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let store = store.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut last = 0.0;
                loop {
                    let n = read_counter(&store);
                    assert!(n >= last, "counter went from {last} to {n}");
                    last = n;
                    if n >= f64::from(COMMITS) {
                        break;
                    }
                }
            })
        })
        .collect();

    start.wait();
    for i in 1..=COMMITS {
        let mut w = store.write_transaction().unwrap();
        store
            .write(&mut w, PatchOp::Replace, &Path::from(["counter"]), Value::from(i))
            .unwrap();
        store.commit(&mut w).unwrap();
    }

    for r in readers {
        r.join().unwrap();
    }
}

#[test]
fn concurrent_writers_are_serialized() {
    const WRITERS: usize = 8;
    const ROUNDS: usize = 10;

    let store = counter_store();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let store = store.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ROUNDS {
                    let mut w = store.write_transaction().unwrap();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);

                    let n = store
                        .read(&w, &Path::from(["counter"]))
                        .unwrap()
                        .as_f64()
                        .unwrap();
                    thread::yield_now();
                    store
                        .write(&mut w, PatchOp::Replace, &Path::from(["counter"]), Value::from(n + 1.0))
                        .unwrap();

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    store.commit(&mut w).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(read_counter(&store), (WRITERS * ROUNDS) as f64);
}

#[test]
fn every_reader_opened_after_commit_sees_it() {
    const READERS: usize = 8;

    let store = counter_store();
    let mut w = store.write_transaction().unwrap();
    store
        .write(&mut w, PatchOp::Replace, &Path::from(["counter"]), Value::from(42))
        .unwrap();
    store.commit(&mut w).unwrap();

    let start = Arc::new(Barrier::new(READERS));
    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let store = store.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                read_counter(&store)
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 42.0);
    }
}

#[test]
fn bundle_reload_notifies_observers_once() {
    let store = Store::new();
    let events: Arc<Mutex<Vec<CommitEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let mut w = store.write_transaction().unwrap();
    store
        .register(
            &mut w,
            TriggerConfig::new(move |_: &Store, _: &Transaction, e: &CommitEvent| {
                sink.lock().unwrap().push(e.clone());
            })
            .named("compiler"),
        )
        .unwrap();
    store.commit(&mut w).unwrap();

    let loader = store.clone();
    thread::spawn(move || {
        let params = TransactionParams::write()
            .with_context(TxnContext::new().with("source", "bundle"));
        let mut w = loader.new_transaction(params).unwrap();
        let updates = vec![
            Update::data(["roles"], Value::from_json_slice(br#"{"admin":{"level":3}}"#).unwrap()),
            Update::data(["users", "alice"], Value::from_json_slice(br#"{"role":"admin"}"#).unwrap()),
            Update::policy("authz.rego", b"package authz".to_vec()),
        ];
        loader
            .truncate(
                &mut w,
                &TruncateParams::with_base_paths([Path::from(["roles"]), Path::from(["users"])]),
                updates.into_iter().map(Ok::<_, std::io::Error>),
            )
            .unwrap();
        loader.commit(&mut w).unwrap();
    })
    .join()
    .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    let reload = &events[1];
    assert!(reload.touches(&Path::from(["users", "alice"])));
    assert!(reload.policy_changed());
    assert_eq!(reload.context.get("source"), Some(&Value::from("bundle")));

    let mut r = store.read_transaction().unwrap();
    assert_eq!(
        store
            .read(&r, &Path::parse("/users/alice/role").unwrap())
            .unwrap()
            .as_str(),
        Some("admin")
    );
    assert_eq!(store.list_policies(&r).unwrap(), vec!["authz.rego"]);
    store.commit(&mut r).unwrap();
}

#[test]
fn second_reader_opens_while_commit_is_pending() {
    let store = counter_store();
    let (r1_open_tx, r1_open_rx) = mpsc::channel();
    let (pending_tx, pending_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();

    let reader_store = store.clone();
    let reader = thread::spawn(move || {
        let mut r1 = reader_store.read_transaction().unwrap();
        r1_open_tx.send(()).unwrap();
        pending_rx.recv().unwrap();
        // Give the writer time to park on the publish lock.
        thread::sleep(Duration::from_millis(200));
        let mut r2 = reader_store.read_transaction().unwrap();
        let seen = reader_store
            .read(&r2, &Path::from(["counter"]))
            .unwrap()
            .as_f64()
            .unwrap();
        reader_store.commit(&mut r2).unwrap();
        reader_store.commit(&mut r1).unwrap();
        done_tx.send(seen).unwrap();
    });

    r1_open_rx.recv().unwrap();
    let (staged_tx, staged_rx) = mpsc::channel();
    let writer_store = store.clone();
    let writer = thread::spawn(move || {
        let mut w = writer_store.write_transaction().unwrap();
        writer_store
            .write(&mut w, PatchOp::Replace, &Path::from(["counter"]), Value::from(1))
            .unwrap();
        staged_tx.send(()).unwrap();
        writer_store.commit(&mut w).unwrap();
    });

    staged_rx.recv().unwrap();
    pending_tx.send(()).unwrap();
    let seen = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second read transaction blocked behind a pending commit");
    assert_eq!(seen, 0.0);

    reader.join().unwrap();
    writer.join().unwrap();
    assert_eq!(read_counter(&store), 1.0);
}

#[test]
fn readers_never_see_a_partial_commit() {
    const COMMITS: i32 = 50;
    const READERS: usize = 4;

    let mut root = Map::new();
    root.insert("x".into(), Value::from(0));
    root.insert("y".into(), Value::from(0));
    let store = Store::from_object(root).unwrap();
    let mut w = store.write_transaction().unwrap();
    store.upsert_policy(&mut w, "gen", b"v0".to_vec()).unwrap();
    store.commit(&mut w).unwrap();

    let start = Arc::new(Barrier::new(READERS + 1));
    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let store = store.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                loop {
                    let mut r = store.read_transaction().unwrap();
                    let x = store.read(&r, &Path::from(["x"])).unwrap().clone();
                    let y = store.read(&r, &Path::from(["y"])).unwrap().clone();
                    let policy = store.get_policy(&r, "gen").unwrap().to_vec();
                    store.commit(&mut r).unwrap();

                    assert_eq!(x, y, "x and y split across commits");
                    let n = x.as_f64().unwrap();
                    assert_eq!(policy, format!("v{n}").into_bytes());
                    if n >= f64::from(COMMITS) {
                        break;
                    }
                }
            })
        })
        .collect();

    start.wait();
    for i in 1..=COMMITS {
        let mut w = store.write_transaction().unwrap();
        store
            .write(&mut w, PatchOp::Replace, &Path::from(["x"]), Value::from(i))
            .unwrap();
        thread::yield_now();
        store
            .write(&mut w, PatchOp::Replace, &Path::from(["y"]), Value::from(i))
            .unwrap();
        store
            .upsert_policy(&mut w, "gen", format!("v{i}").into_bytes())
            .unwrap();
        store.commit(&mut w).unwrap();
    }

    for r in readers {
        r.join().unwrap();
    }
}
