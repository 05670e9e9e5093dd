use clap::Parser;
use gridflow::message::{Communicator, TcpCommunicator};
use gridflow::{range2d, IndexSpace, Partition, Patch, Periodicity, Runtime, RuntimeConfig, TaskGraph, TaskOptions};
use std::net::SocketAddr;
use std::thread;

/// Run the guard-zone exchange between ranks that talk over TCP. With
/// `--rank`, this process runs just that rank and the others are expected
/// to be started separately with the same `--peers`. Without it, every rank
/// runs on its own thread in this process.
#[derive(Debug, Parser)]
#[clap(version = "1.0")]
struct Opts {
    #[clap(long)]
    rank: Option<usize>,

    #[clap(long, default_value = "127.0.0.1:8000,127.0.0.1:8001", value_delimiter = ',')]
    peers: Vec<SocketAddr>,

    #[clap(short = 'b', long, default_value = "4")]
    blocks_per_side: usize,

    #[clap(short = 'n', long, default_value = "16")]
    block_size: i64,

    #[clap(short = 's', long, default_value = "10")]
    num_steps: usize,
}

fn count(step: usize, patch: &mut Patch, valid: &IndexSpace) {
    patch.map_region_mut(valid, |_, x| x[0] = step as f64 + 1.0).unwrap()
}

fn run_rank(rank: usize, opts: &Opts) {
    let size = opts.blocks_per_side as i64 * opts.block_size;
    let partition = Partition::uniform(
        range2d(0..size, 0..size),
        (opts.blocks_per_side, opts.blocks_per_side),
        opts.peers.len(),
        1).unwrap();

    let options = TaskOptions {
        communicate_upon_completion: true,
        ..TaskOptions::default()
    };
    let mut graph = TaskGraph::build(
        &partition,
        &Periodicity::all(),
        rank,
        opts.num_steps,
        options,
        count,
        |b| Patch::zeros(b.space.extend_all(1), 1)).unwrap();

    let comm = TcpCommunicator::connect(rank, opts.peers.clone()).unwrap();
    let report = Runtime::new(comm, RuntimeConfig::default()).unwrap().run(&mut graph).unwrap();

    let expected = opts.num_steps as f64;
    let complete = graph.iter().all(|task| task.data().data().iter().all(|&x| x == expected));
    println!("rank {} finished {} transitions; guard zones complete: {}", report.rank, report.transitions, complete);
}




// ============================================================================
fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let opts = Opts::parse();

    match opts.rank {
        Some(rank) => run_rank(rank, &opts),
        None => {
            let opts = std::sync::Arc::new(opts);
            let procs: Vec<_> = (0..opts.peers.len())
                .map(|rank| {
                    let opts = opts.clone();
                    thread::spawn(move || run_rank(rank, &opts))
                })
                .collect();

            for process in procs {
                process.join().unwrap()
            }
        }
    }
}
