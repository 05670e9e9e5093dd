use clap::Parser;
use gridflow::message::{ChannelCommunicator, Communicator};
use gridflow::{range2d, Block, IndexSpace, Partition, Patch, Periodicity, Runtime, RuntimeConfig, Task, TaskGraph, TaskOptions};
use serde::Serialize;
use std::thread;

#[derive(Debug, Parser)]
#[clap(version = "1.0", about = "Smooth a periodic field on a block-decomposed grid")]
struct Opts {
    #[clap(short = 'r', long, default_value = "2")]
    num_ranks: usize,

    #[clap(short = 'b', long, default_value = "4")]
    blocks_per_side: usize,

    #[clap(short = 'n', long, default_value = "32")]
    block_size: i64,

    #[clap(short = 's', long, default_value = "100")]
    num_steps: usize,

    #[clap(short = 't', long, default_value = "1")]
    num_threads: usize,

    #[clap(short = 'o', long, default_value = "halo.cbor")]
    output: String,
}

#[derive(Serialize)]
struct State {
    steps: usize,
    patches: Vec<(Block, Patch)>,
}




// ============================================================================
fn smooth(_: usize, patch: &mut Patch, valid: &IndexSpace) {
    let old = patch.clone();
    let u = |i, j| old.get_slice((i, j))[0];

    patch
        .map_region_mut(valid, |(i, j), x| {
            x[0] = 0.5 * u(i, j) + 0.125 * (u(i - 1, j) + u(i + 1, j) + u(i, j - 1) + u(i, j + 1))
        })
        .unwrap()
}

fn initial_data(block: &Block, domain_size: i64) -> Patch {
    let k = 2.0 * std::f64::consts::PI / domain_size as f64;
    Patch::from_scalar_function(block.space.extend_all(1), |(i, j)| (k * i as f64).sin() * (k * j as f64).cos())
}




// ============================================================================
fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let opts = Opts::parse();
    println!("{:?}", opts);

    let size = opts.blocks_per_side as i64 * opts.block_size;
    let partition = Partition::uniform(
        range2d(0..size, 0..size),
        (opts.blocks_per_side, opts.blocks_per_side),
        opts.num_ranks,
        1).unwrap();

    let procs: Vec<_> = ChannelCommunicator::world(opts.num_ranks)
        .into_iter()
        .map(|comm| {
            let partition = partition.clone();
            let num_steps = opts.num_steps;
            let config = RuntimeConfig {
                num_threads: opts.num_threads,
                ..RuntimeConfig::default()
            };
            thread::spawn(move || {
                let rank = comm.rank();
                let mut graph = TaskGraph::build(
                    &partition,
                    &Periodicity::all(),
                    rank,
                    num_steps,
                    TaskOptions::default(),
                    smooth,
                    |b| initial_data(b, size)).unwrap();

                Runtime::new(comm, config).unwrap().run(&mut graph).unwrap();

                graph
                    .into_tasks()
                    .into_iter()
                    .map(|task| (partition.block(task.name()).unwrap().clone(), task.into_data()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut patches: Vec<_> = procs.into_iter().flat_map(|p| p.join().unwrap()).collect();
    patches.sort_by_key(|(block, _)| block.space.start());

    let state = State {
        steps: opts.num_steps,
        patches,
    };
    let file = std::fs::File::create(&opts.output).unwrap();
    let mut buffer = std::io::BufWriter::new(file);
    ciborium::ser::into_writer(&state, &mut buffer).unwrap();
    println!("wrote {}", opts.output);
}
