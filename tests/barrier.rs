//! Integration coverage for the symmetric and asymmetric barriers (L4),
//! exercised only through `agent_mesh_sync`'s public API.

use agent_mesh_sync::barrier::{AsymmetricBarrier, Barrier};
use agent_mesh_sync::message::MasterLoop;
use agent_mesh_sync::SharedRegion;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Six parties, ten rounds: after every `enter()` returns, the shared
/// "rounds completed" counter must read exactly `round * parties`, proving
/// no party ever observed a round boundary before every other party had
/// crossed it too.
#[test]
fn symmetric_barrier_never_lets_a_party_race_ahead() {
    let parties = 6;
    let rounds = 10;
    let region = Arc::new(SharedRegion::new(16));
    let barrier = Arc::new(Barrier::init((*region).clone(), 0, parties).unwrap());
    let completed: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..parties)
        .map(|_| {
            let barrier = barrier.clone();
            let completed = completed.clone();
            thread::spawn(move || {
                for round in 0..rounds {
                    barrier.enter();
                    completed.fetch_add(1, SeqCst);
                    barrier.enter();
                    // Every party has now bumped `completed` for this round.
                    assert_eq!(completed.load(SeqCst), (round + 1) * parties);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

/// Drives an `AsymmetricBarrier` through `MasterLoop::run_until` rather than
/// a hand-rolled poll loop, checking that the master sees exactly one
/// `BarrierArrived` per round across a pool of five workers and four rounds.
#[test]
fn asymmetric_barrier_driven_by_run_until() {
    let workers = 5;
    let rounds = 4;
    let region = Arc::new(SharedRegion::new(16));
    let mut master_loop = MasterLoop::new();
    let mailbox = master_loop.mailbox();
    let barrier = Arc::new(AsymmetricBarrier::init((*region).clone(), 0, workers, 42, mailbox).unwrap());

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                for _ in 0..rounds {
                    barrier.enter();
                }
            })
        })
        .collect();

    let rounds_seen = Arc::new(AtomicU32::new(0));
    let rs = rounds_seen.clone();
    let barrier_for_cb = barrier.clone();
    master_loop.register(42, move |_reason, _loop| {
        assert!(barrier_for_cb.release());
        rs.fetch_add(1, SeqCst);
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    master_loop.run_until(|| rounds_seen.load(SeqCst) >= rounds || std::time::Instant::now() >= deadline);

    assert_eq!(rounds_seen.load(SeqCst), rounds);
    for h in handles {
        h.join().unwrap();
    }
}

/// A completion callback that re-registers itself (mirroring the dispatcher's
/// own `install_callback` pattern) sees every round, not just the first.
#[test]
fn asymmetric_barrier_callback_can_rearm_itself_every_round() {
    let workers = 3;
    let rounds = 6;
    let region = Arc::new(SharedRegion::new(16));
    let mut master_loop = MasterLoop::new();
    let mailbox = master_loop.mailbox();
    let barrier = Arc::new(AsymmetricBarrier::init((*region).clone(), 0, workers, 9, mailbox).unwrap());

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                for _ in 0..rounds {
                    barrier.enter();
                }
            })
        })
        .collect();

    fn install(barrier: Arc<AsymmetricBarrier>, seen: Arc<AtomicU32>, master_loop: &mut MasterLoop) {
        let id = barrier.id();
        master_loop.register(id, move |_reason, loop_| {
            assert!(barrier.release());
            seen.fetch_add(1, SeqCst);
            install(barrier.clone(), seen.clone(), loop_);
        });
    }
    let seen = Arc::new(AtomicU32::new(0));
    install(barrier.clone(), seen.clone(), &mut master_loop);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while seen.load(SeqCst) < rounds && std::time::Instant::now() < deadline {
        master_loop.run_once();
    }
    assert_eq!(seen.load(SeqCst), rounds);
    for h in handles {
        h.join().unwrap();
    }
}
