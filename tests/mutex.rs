//! Integration coverage for the futex mutex/condvar (L3) and their
//! agent-table-backed FIFO counterparts (`mutex_list`), exercised only
//! through `agent_mesh_sync`'s public API.

use agent_mesh_sync::agent::AgentTable;
use agent_mesh_sync::mutex::{Condvar, Mutex};
use agent_mesh_sync::mutex_list::{ListCondvar, ListMutex};
use agent_mesh_sync::region::Layout;
use agent_mesh_sync::SharedRegion;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn six_threads_share_a_counter_exclusively() {
    let region = SharedRegion::new(64);
    let mutex = Arc::new(Mutex::init(region.clone(), 0).unwrap());
    let counter_offset = Mutex::BYTES;
    region.atomic_u32(counter_offset).store(0, SeqCst);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let mutex = mutex.clone();
            let region = region.clone();
            thread::spawn(move || {
                for _ in 0..3000 {
                    mutex.with_lock(|| {
                        let v = region.atomic_u32(counter_offset).load(SeqCst);
                        region.atomic_u32(counter_offset).store(v + 1, SeqCst);
                    });
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(region.atomic_u32(counter_offset).load(SeqCst), 18_000);
}

/// A single-slot mailbox handed back and forth between a producer and a
/// consumer through a mutex and condvar, fifty times.
#[test]
fn condvar_single_slot_handoff_runs_many_rounds() {
    let region = SharedRegion::new(64);
    let mutex = Arc::new(Mutex::init(region.clone(), 0).unwrap());
    let condvar = Arc::new(Condvar::init(region.clone(), Mutex::BYTES).unwrap());
    let payload_offset = Mutex::BYTES + Condvar::BYTES;
    let full_offset = payload_offset + 4;
    region.atomic_u32(full_offset).store(0, SeqCst);

    let consumer = {
        let (mutex, condvar, region) = (mutex.clone(), condvar.clone(), region.clone());
        thread::spawn(move || {
            let mut received = Vec::with_capacity(50);
            mutex.lock();
            for _ in 0..50 {
                while region.atomic_u32(full_offset).load(SeqCst) == 0 {
                    condvar.wait(&mutex);
                }
                received.push(region.atomic_u32(payload_offset).load(SeqCst));
                region.atomic_u32(full_offset).store(0, SeqCst);
                condvar.notify_one();
            }
            mutex.unlock();
            received
        })
    };

    mutex.lock();
    for i in 0..50u32 {
        while region.atomic_u32(full_offset).load(SeqCst) != 0 {
            condvar.wait(&mutex);
        }
        region.atomic_u32(payload_offset).store(i, SeqCst);
        region.atomic_u32(full_offset).store(1, SeqCst);
        condvar.notify_one();
    }
    mutex.unlock();

    let received = consumer.join().unwrap();
    assert_eq!(received, (0..50).collect::<Vec<_>>());
}

/// Distinct from `mutex_list`'s own single-waiter unit test: here every
/// waiter blocks on the same condvar and `notify_all` must release all of
/// them, not just one.
#[test]
fn list_condvar_notify_all_wakes_every_waiter() {
    let region = Arc::new(SharedRegion::new(4096));
    let agents = Arc::new(AgentTable::init((*region).clone(), 0, 8).unwrap());
    let mutex = Arc::new(ListMutex::init((*region).clone(), 64).unwrap());
    let condvar = Arc::new(ListCondvar::init((*region).clone(), 80).unwrap());
    let ready_offset = 128;
    region.atomic_u32(ready_offset).store(0, SeqCst);

    let waiters: Vec<_> = (0..5u32)
        .map(|id| {
            let (mutex, condvar, agents, region) =
                (mutex.clone(), condvar.clone(), agents.clone(), region.clone());
            thread::spawn(move || {
                mutex.lock(&agents, id);
                while region.atomic_u32(ready_offset).load(SeqCst) == 0 {
                    condvar.wait(&agents, &mutex, id, Some(Duration::from_secs(5)));
                }
                mutex.unlock(&agents, id);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    mutex.lock(&agents, 7);
    region.atomic_u32(ready_offset).store(1, SeqCst);
    condvar.notify_all(&agents);
    mutex.unlock(&agents, 7);

    for w in waiters {
        w.join().unwrap();
    }
}
