//! Integration coverage for the bounded integer-bundle queues (L6),
//! exercised only through `agent_mesh_sync`'s public API.

use agent_mesh_sync::message::MasterLoop;
use agent_mesh_sync::queue::{Mpiq, Role, Wpiq};
use agent_mesh_sync::SharedRegion;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A master feeding a small `Mpiq` through `call_when_can_put` (rather than
/// the crate's own inline test, which busy-polls `put_or_fail`), with eight
/// workers draining it, must deliver every item exactly once.
#[test]
fn mpiq_backpressure_callback_delivers_every_item_once() {
    let capacity = 10;
    let region = Arc::new(SharedRegion::new(Mpiq::bytes_needed(capacity) + 64));
    let mut master = MasterLoop::new();
    let mailbox = master.mailbox();
    let queue = Mpiq::init((*region).clone(), 0, capacity, Role::Master, 1, 2, mailbox.clone()).unwrap();

    let consumers: Vec<_> = (0..8)
        .map(|_| {
            let region = region.clone();
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                let queue = Mpiq::at((*region).clone(), 0, capacity, Role::Worker, 1, 2, mailbox).unwrap();
                let mut received = Vec::new();
                while let Some(item) = queue.take(Some(Duration::from_millis(500))).unwrap() {
                    received.push(item);
                }
                received
            })
        })
        .collect();

    let items: Vec<Vec<u32>> = (0..40u32).map(|i| vec![i]).collect();
    let mut pending: VecDeque<Vec<u32>> = items.clone().into();
    while let Some(item) = pending.pop_front() {
        loop {
            if queue.put_or_fail(&item).unwrap() {
                break;
            }
            let notified = Arc::new(AtomicBool::new(false));
            let n = notified.clone();
            queue
                .call_when_can_put(&mut master, item.len() as u32 + 1, Some(Duration::from_secs(5)), move |_reason| {
                    n.store(true, SeqCst);
                })
                .unwrap();
            while !notified.load(SeqCst) {
                master.run_once();
            }
        }
    }

    let mut delivered: Vec<Vec<u32>> = Vec::new();
    for c in consumers {
        delivered.extend(c.join().unwrap());
    }
    delivered.sort();
    let mut expected = items;
    expected.sort();
    assert_eq!(delivered, expected);
}

/// Six producers racing to fill a `Wpiq` while the master alternates between
/// `take_or_fail` and `call_when_can_take`, confirming every produced item is
/// eventually observed exactly once.
#[test]
fn wpiq_call_when_can_take_observes_every_producer_item() {
    let capacity = 32;
    let region = Arc::new(SharedRegion::new(Wpiq::bytes_needed(capacity) + 64));
    let mut master = MasterLoop::new();
    let mailbox = master.mailbox();
    let queue = Wpiq::init((*region).clone(), 0, capacity, Role::Master, 1, 2, mailbox.clone()).unwrap();

    let producers: Vec<_> = (0..6u32)
        .map(|id| {
            let region = region.clone();
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                let queue = Wpiq::at((*region).clone(), 0, capacity, Role::Worker, 1, 2, mailbox).unwrap();
                for i in 0..10u32 {
                    queue.put(&[id, i], Some(Duration::from_secs(5))).unwrap();
                }
            })
        })
        .collect();

    let mut taken = Vec::new();
    while taken.len() < 60 {
        match queue.take_or_fail().unwrap() {
            Some(item) => taken.push(item),
            None => {
                let notified = Arc::new(AtomicBool::new(false));
                let n = notified.clone();
                queue
                    .call_when_can_take(&mut master, Some(Duration::from_secs(5)), move |_reason| {
                        n.store(true, SeqCst);
                    })
                    .unwrap();
                while !notified.load(SeqCst) {
                    master.run_once();
                }
            }
        }
    }
    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(taken.len(), 60);
    let mut seen_per_producer = [0u32; 6];
    for item in &taken {
        seen_per_producer[item[0] as usize] += 1;
    }
    assert_eq!(seen_per_producer, [10; 6]);
}
