use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use gridflow::message::{Communicator, TcpCommunicator};
use gridflow::{range2d, IndexSpace, Partition, Patch, Periodicity, Runtime, RuntimeConfig, TaskGraph, TaskOptions};




#[test]
fn two_ranks_exchange_guard_zones_over_tcp() {
    const STEPS: usize = 5;

    let listeners: Vec<_> = (0..2).map(|_| TcpListener::bind("127.0.0.1:0").unwrap()).collect();
    let peers: Vec<SocketAddr> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();
    let partition = Partition::uniform(range2d(0..8, 0..8), (2, 2), 2, 1).unwrap();

    let handles: Vec<_> = listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| {
            let peers = peers.clone();
            let partition = partition.clone();

            thread::spawn(move || {
                let options = TaskOptions {
                    communicate_upon_completion: true,
                    ..TaskOptions::default()
                };
                let mut graph = TaskGraph::build(
                    &partition,
                    &Periodicity::all(),
                    rank,
                    STEPS,
                    options,
                    |step: usize, patch: &mut Patch, valid: &IndexSpace| {
                        patch.map_region_mut(valid, |_, x| x[0] = (step + 1) as f64).unwrap()
                    },
                    |b| Patch::zeros(b.space.extend_all(1), 1)).unwrap();

                let comm = TcpCommunicator::from_listener(rank, listener, peers).unwrap();
                assert_eq!(comm.size(), 2);

                let config = RuntimeConfig {
                    stall_timeout: Some(Duration::from_secs(20)),
                    ..RuntimeConfig::default()
                };
                let report = Runtime::new(comm, config).unwrap().run(&mut graph).unwrap();
                let filled = graph
                    .iter()
                    .all(|task| task.data().data().iter().all(|&x| x == STEPS as f64));

                (report, filled)
            })
        })
        .collect();

    for handle in handles {
        let (report, filled) = handle.join().unwrap();
        assert!(filled);
        assert!(report.remote_messages > 0);
        assert_eq!(report.transitions, 2 * (STEPS + 2));
    }
}
