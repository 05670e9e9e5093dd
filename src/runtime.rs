//! The per-rank scheduling loop.
//!
//! A [`Runtime`] repeatedly drains the transport into its mailbox, fires
//! every task whose dependencies have arrived, and routes the messages those
//! tasks produce: to the local mailbox if the receiving block lives on this
//! rank, or over the [`Communicator`] otherwise. Once every local task has
//! terminated, the ranks agree that the whole computation is finished with
//! an all-reduce over their done flags.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::thread;
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::error::{Error, StalledTask};
use crate::graph::TaskGraph;
use crate::mailbox::{Envelope, Mailbox};
use crate::message::backoff::ExponentialBackoff;
use crate::message::{Communicator, Frame};
use crate::task::Task;




/**
 * Settings for the scheduling loop.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads used to execute ready tasks. With one
    /// thread, tasks run on the scheduling thread.
    pub num_threads: usize,

    /// Pin each worker thread to its own core.
    pub pin_threads: bool,

    /// Give up if no task fires and no message arrives for this long.
    pub stall_timeout: Option<Duration>,

    /// Shortest and longest sleep between polls when nothing is ready.
    pub idle_backoff_start: Duration,
    pub idle_backoff_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            pin_threads: false,
            stall_timeout: Some(Duration::from_secs(60)),
            idle_backoff_start: Duration::from_micros(50),
            idle_backoff_max: Duration::from_millis(10),
        }
    }
}




/// Counters collected over one call to [`Runtime::run`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub rank: usize,
    pub rounds: usize,
    pub transitions: usize,
    pub local_messages: usize,
    pub remote_messages: usize,
    pub frames_received: usize,
    pub elapsed: Duration,
}




/**
 * Drives the task graph of one rank to completion.
 */
pub struct Runtime<C> {
    comm: C,
    config: RuntimeConfig,
    pool: Option<rayon::ThreadPool>,
    mailbox: Mailbox,
    collective: VecDeque<Vec<u8>>,
}




// ============================================================================
impl<C: Communicator> Runtime<C> {

    pub fn new(comm: C, config: RuntimeConfig) -> Result<Self, Error> {
        let pool = if config.num_threads > 1 {
            Some(build_pool(&config)?)
        } else {
            None
        };
        Ok(Self {
            comm,
            config,
            pool,
            mailbox: Mailbox::new(),
            collective: VecDeque::new(),
        })
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn into_communicator(self) -> C {
        self.comm
    }

    /**
     * Execute every task in the graph until all of them have terminated on
     * every rank. Any error is fatal: the graph is left part way through its
     * steps, and peers blocked on this rank will stall.
     */
    pub fn run<T: Task>(&mut self, graph: &mut TaskGraph<T>) -> Result<RunReport, Error> {
        let start = Instant::now();
        let rank = self.comm.rank();
        let mut report = RunReport { rank, ..RunReport::default() };
        let mut idle = self.idle_backoff();
        let mut last_progress = Instant::now();

        while !graph.is_terminated() {
            let received = self.drain(&mut report)?;
            let ready = self.ready_tasks(graph);

            if ready.is_empty() && received == 0 {
                if let Some(timeout) = self.config.stall_timeout {
                    if last_progress.elapsed() > timeout {
                        return Err(self.stalled(graph))
                    }
                }
                thread::sleep(idle.next().unwrap_or(self.config.idle_backoff_max));
                continue;
            }

            idle.reset(self.config.idle_backoff_start);
            last_progress = Instant::now();

            if ready.is_empty() {
                continue;
            }

            debug!("rank {} round {}: {} ready tasks", rank, report.rounds, ready.len());

            let outgoing = self.execute(graph, &ready)?;
            report.rounds += 1;
            report.transitions += ready.len();
            self.route(outgoing, &mut report)?;
            graph.advance_cursor();
        }

        if self.comm.size() > 1 {
            self.await_peers(&mut report)?;
        }
        if !self.mailbox.is_empty() {
            warn!("rank {} finished with {} unconsumed messages", rank, self.mailbox.len());
        }

        report.elapsed = start.elapsed();

        info!(
            "rank {}: {} transitions in {} rounds, {} local / {} remote messages sent, {} frames received, {:.3}s",
            rank,
            report.transitions,
            report.rounds,
            report.local_messages,
            report.remote_messages,
            report.frames_received,
            report.elapsed.as_secs_f64());

        Ok(report)
    }

    fn idle_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.config.idle_backoff_start, self.config.idle_backoff_max, 2)
    }

    fn drain(&mut self, report: &mut RunReport) -> Result<usize, Error> {
        if self.comm.size() == 1 {
            return Ok(0)
        }
        let rank = self.comm.rank();
        let mut received = 0;

        while let Some(bytes) = self.comm.try_recv()? {
            match Frame::decode(&bytes)? {
                Frame::Halo(envelope) => deliver(&mut self.mailbox, rank, envelope)?,
                Frame::Collective(message) => self.collective.push_back(message),
            }
            received += 1;
        }
        report.frames_received += received;
        Ok(received)
    }

    fn ready_tasks<T: Task>(&self, graph: &TaskGraph<T>) -> Vec<usize> {
        let tasks: Vec<&T> = graph.iter().collect();
        let len = tasks.len();
        let cursor = graph.cursor();

        (0..len)
            .map(|k| (cursor + k) % len)
            .filter(|&n| !tasks[n].is_terminated() && tasks[n].is_satisfied(&self.mailbox))
            .collect()
    }

    fn execute<T: Task>(&mut self, graph: &mut TaskGraph<T>, ready: &[usize]) -> Result<Vec<Envelope>, Error> {
        let mut outgoing = Vec::new();

        match &self.pool {
            None => {
                let tasks = graph.tasks_mut();

                for &n in ready {
                    outgoing.extend(tasks[n].execute(&mut self.mailbox)?)
                }
            }
            Some(pool) => {
                let selected: HashSet<usize> = ready.iter().copied().collect();
                let mailbox = &mut self.mailbox;
                let jobs: Vec<(&mut T, Mailbox)> = graph
                    .tasks_mut()
                    .iter_mut()
                    .enumerate()
                    .filter(|(n, _)| selected.contains(n))
                    .map(|(_, task)| {
                        let inbox = mailbox.extract(&task.dependencies());
                        (task, inbox)
                    })
                    .collect();

                let results: Vec<Result<(Vec<Envelope>, Mailbox), Error>> = pool.install(|| {
                    jobs.into_par_iter()
                        .map(|(task, mut inbox)| task.execute(&mut inbox).map(|out| (out, inbox)))
                        .collect()
                });

                for result in results {
                    let (out, leftover) = result?;
                    mailbox.absorb(leftover)?;
                    outgoing.extend(out);
                }
            }
        }
        Ok(outgoing)
    }

    fn route(&mut self, outgoing: Vec<Envelope>, report: &mut RunReport) -> Result<(), Error> {
        let rank = self.comm.rank();

        for envelope in outgoing {
            let dest_rank = envelope.dest_rank;

            if dest_rank == rank {
                self.mailbox.insert(envelope)?;
                report.local_messages += 1;
            } else {
                self.comm.send(dest_rank, Frame::Halo(envelope).encode()?)?;
                report.remote_messages += 1;
            }
        }
        Ok(())
    }

    fn stalled<T: Task>(&self, graph: &TaskGraph<T>) -> Error {
        let rank = self.comm.rank();
        let tasks: Vec<_> = graph
            .iter()
            .filter(|task| !task.is_terminated())
            .map(|task| StalledTask {
                block: task.name(),
                state: task.state(),
                missing: task
                    .dependencies()
                    .into_iter()
                    .filter(|key| !self.mailbox.contains(key))
                    .collect(),
            })
            .collect();

        for task in &tasks {
            error!("rank {}: block {} stalled in {:?} waiting on {} messages", rank, task.block, task.state, task.missing.len());
        }
        Error::Stalled { rank, tasks }
    }

    fn await_peers(&mut self, report: &mut RunReport) -> Result<(), Error> {
        let plane = ControlPlane {
            comm: &self.comm,
            mailbox: RefCell::new(&mut self.mailbox),
            pending: RefCell::new(&mut self.collective),
            frames: Cell::new(0),
            deadline: self.config.stall_timeout.map(|timeout| Instant::now() + timeout),
            idle: RefCell::new(ExponentialBackoff::new(self.config.idle_backoff_start, self.config.idle_backoff_max, 2)),
        };
        let done = plane.all_reduce(|a, b| vec![a[0] & b[0]], vec![1])?;
        report.frames_received += plane.frames.get();

        if done != vec![1u8] {
            return Err(Error::Transport(format!("rank {} got a malformed completion flag {:?}", plane.rank(), done)))
        }
        debug!("rank {}: all peers finished", plane.rank());
        Ok(())
    }
}




/**
 * The communicator seen by the completion collective. Collective messages
 * travel as frames alongside guard-zone data; any guard-zone data that shows
 * up while the collective is in progress is put in the mailbox. Blocking
 * receives give up at the deadline.
 */
struct ControlPlane<'a, C> {
    comm: &'a C,
    mailbox: RefCell<&'a mut Mailbox>,
    pending: RefCell<&'a mut VecDeque<Vec<u8>>>,
    frames: Cell<usize>,
    deadline: Option<Instant>,
    idle: RefCell<ExponentialBackoff>,
}

impl<C: Communicator> Communicator for ControlPlane<'_, C> {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn size(&self) -> usize {
        self.comm.size()
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> Result<(), Error> {
        self.comm.send(rank, Frame::Collective(message).encode()?)
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>, Error> {
        if let Some(message) = self.pending.borrow_mut().pop_front() {
            return Ok(Some(message))
        }
        while let Some(bytes) = self.comm.try_recv()? {
            self.frames.set(self.frames.get() + 1);

            match Frame::decode(&bytes)? {
                Frame::Halo(envelope) => deliver(&mut self.mailbox.borrow_mut(), self.rank(), envelope)?,
                Frame::Collective(message) => return Ok(Some(message)),
            }
        }
        Ok(None)
    }

    fn recv(&self) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(message)
            }
            if let Some(deadline) = self.deadline {
                if Instant::now() > deadline {
                    return Err(Error::CompletionTimeout { rank: self.rank() })
                }
            }
            let delay = self.idle.borrow_mut().next().unwrap_or_default();
            thread::sleep(delay);
        }
    }
}




fn deliver(mailbox: &mut Mailbox, rank: usize, envelope: Envelope) -> Result<(), Error> {
    if envelope.dest_rank != rank {
        return Err(Error::Misrouted { key: envelope.key(), rank, expected: envelope.dest_rank })
    }
    mailbox.insert(envelope)
}

fn build_pool(config: &RuntimeConfig) -> Result<rayon::ThreadPool, Error> {
    let mut builder = rayon::ThreadPoolBuilder::new().num_threads(config.num_threads);

    if config.pin_threads {
        match core_affinity::get_core_ids() {
            Some(cores) if !cores.is_empty() => {
                builder = builder.start_handler(move |n| {
                    let core = cores[n % cores.len()];

                    if !pin_current_thread(core) {
                        warn!("could not pin worker thread {} to core {}", n, core.id)
                    }
                })
            }
            _ => warn!("could not list the cores to pin worker threads to"),
        }
    }
    builder.build().map_err(|e| Error::ThreadPool(e.to_string()))
}

/// Pin the calling thread to one core, and report whether its affinity mask
/// now names only that core.
fn pin_current_thread(core: core_affinity::CoreId) -> bool {
    core_affinity::set_for_current(core);

    match core_affinity::get_core_ids() {
        Some(ids) => ids.len() == 1 && ids[0].id == core.id,
        None => false,
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::thread;
    use std::time::Duration;
    use super::*;
    use crate::connection::SequenceTag;
    use crate::index_space::{range2d, IndexSpace};
    use crate::mailbox::Tag;
    use crate::message::{ChannelCommunicator, SingleProcess};
    use crate::partition::{Partition, Periodicity};
    use crate::patch::Patch;
    use crate::task::{BlockTask, TaskOptions};

    type TestKernel = fn(usize, &mut Patch, &IndexSpace);
    type TestGraph = TaskGraph<BlockTask<Patch, TestKernel>>;

    fn increment(_: usize, patch: &mut Patch, valid: &IndexSpace) {
        patch.map_region_mut(valid, |_, x| x[0] += 1.0).unwrap()
    }

    fn graph(partition: &Partition, periodicity: Periodicity, rank: usize, options: TaskOptions) -> TestGraph {
        TaskGraph::build(
            partition,
            &periodicity,
            rank,
            3,
            options,
            increment as TestKernel,
            |b| Patch::zeros(b.space.extend_all(1), 1)).unwrap()
    }

    fn quick_stall() -> RuntimeConfig {
        RuntimeConfig {
            stall_timeout: Some(Duration::from_millis(200)),
            ..RuntimeConfig::default()
        }
    }

    fn options() -> TaskOptions {
        TaskOptions {
            communicate_upon_completion: true,
            ..TaskOptions::default()
        }
    }

    #[test]
    fn single_rank_run_terminates_every_task() {
        let partition = Partition::uniform(range2d(0..8, 0..8), (2, 2), 1, 1).unwrap();
        let mut graph = graph(&partition, Periodicity::all(), 0, options());
        let report = Runtime::new(SingleProcess, RuntimeConfig::default()).unwrap().run(&mut graph).unwrap();

        assert!(graph.is_terminated());
        assert_eq!(report.transitions, 4 * 5);
        assert_eq!(report.local_messages, 4 * 8 * 4);
        assert_eq!(report.remote_messages, 0);
    }

    #[test]
    fn pool_execution_matches_serial_execution() {
        let partition = Partition::uniform(range2d(0..12, 0..12), (3, 3), 1, 1).unwrap();
        let mut serial = graph(&partition, Periodicity::all(), 0, options());
        let mut pooled = graph(&partition, Periodicity::all(), 0, options());
        let config = RuntimeConfig { num_threads: 3, ..RuntimeConfig::default() };

        Runtime::new(SingleProcess, RuntimeConfig::default()).unwrap().run(&mut serial).unwrap();
        Runtime::new(SingleProcess, config).unwrap().run(&mut pooled).unwrap();

        for (a, b) in serial.iter().zip(pooled.iter()) {
            assert_eq!(a.data(), b.data());
        }
    }

    #[test]
    fn two_ranks_over_channels_complete() {
        let partition = Partition::uniform(range2d(0..8, 0..8), (2, 2), 2, 1).unwrap();
        let handles: Vec<_> = ChannelCommunicator::world(2)
            .into_iter()
            .map(|comm| {
                let partition = partition.clone();
                thread::spawn(move || {
                    let mut graph = graph(&partition, Periodicity::all(), comm.rank(), options());
                    let report = Runtime::new(comm, quick_stall()).unwrap().run(&mut graph).unwrap();
                    (report, graph.into_tasks().into_iter().map(BlockTask::into_data).collect::<Vec<_>>())
                })
            })
            .collect();

        for handle in handles {
            let (report, patches) = handle.join().unwrap();
            assert!(report.remote_messages > 0);
            assert!(report.frames_received >= report.remote_messages);

            for patch in patches {
                assert!(patch.data().iter().all(|&x| x == 3.0));
            }
        }
    }

    #[test]
    fn missing_peer_is_reported_as_a_stall() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 2, 1).unwrap();
        let mut graph = graph(&partition, Periodicity::none(), 0, options());
        let mut world = ChannelCommunicator::world(2);
        let _peer = world.pop();
        let comm = world.pop().unwrap();

        match Runtime::new(comm, quick_stall()).unwrap().run(&mut graph) {
            Err(Error::Stalled { rank: 0, tasks }) => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].block, 0);
                assert_eq!(tasks[0].state, crate::task::TaskState::Running(0));
                assert_eq!(tasks[0].missing.len(), 1);
                assert_eq!(tasks[0].missing[0].source, 1);
            }
            other => panic!("expected a stall, got {:?}", other),
        }
    }

    #[test]
    fn peer_that_never_joins_completion_times_out() {
        let blocks = vec![
            crate::partition::Block { rank: 0, space: range2d(0..2, 0..4) },
            crate::partition::Block { rank: 1, space: range2d(6..8, 0..4) },
        ];
        let partition = Partition::new(range2d(0..8, 0..4), blocks, 1).unwrap();
        let mut graph = graph(&partition, Periodicity::none(), 0, options());
        let mut world = ChannelCommunicator::world(2);
        let _peer = world.pop();
        let comm = world.pop().unwrap();

        assert!(graph.iter().all(|task| task.remote_connections().is_empty()));

        match Runtime::new(comm, quick_stall()).unwrap().run(&mut graph) {
            Err(Error::CompletionTimeout { rank: 0 }) => assert!(graph.is_terminated()),
            other => panic!("expected the completion collective to time out, got {:?}", other),
        }
    }

    fn halo_frame(dest_rank: usize) -> Vec<u8> {
        Frame::Halo(Envelope {
            source: 1,
            dest: 0,
            dest_rank,
            tag: Tag::Remote(SequenceTag::new(1, 0, 0)),
            epoch: 99,
            data: vec![],
        }).encode().unwrap()
    }

    #[test]
    fn misrouted_frame_is_an_error() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 2, 1).unwrap();
        let mut graph = graph(&partition, Periodicity::none(), 0, options());
        let mut world = ChannelCommunicator::world(2);
        let peer = world.pop().unwrap();
        peer.send(0, halo_frame(1)).unwrap();

        let result = Runtime::new(world.pop().unwrap(), quick_stall()).unwrap().run(&mut graph);
        assert!(matches!(result, Err(Error::Misrouted { rank: 0, expected: 1, .. })));
    }

    #[test]
    fn duplicate_frame_is_an_error() {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 2, 1).unwrap();
        let mut graph = graph(&partition, Periodicity::none(), 0, options());
        let mut world = ChannelCommunicator::world(2);
        let peer = world.pop().unwrap();
        peer.send(0, halo_frame(0)).unwrap();
        peer.send(0, halo_frame(0)).unwrap();

        let result = Runtime::new(world.pop().unwrap(), quick_stall()).unwrap().run(&mut graph);
        assert!(matches!(result, Err(Error::DuplicateMessage(_))));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = RuntimeConfig { num_threads: 4, pin_threads: true, ..RuntimeConfig::default() };
        let bytes = rmp_serde::encode::to_vec(&config).unwrap();
        let back: RuntimeConfig = rmp_serde::decode::from_slice(&bytes).unwrap();
        assert_eq!(back, config);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn worker_thread_can_be_pinned_to_an_allowed_core() {
        let cores = core_affinity::get_core_ids().unwrap();
        let core = *cores.last().unwrap();
        assert!(thread::spawn(move || pin_current_thread(core)).join().unwrap());
    }
}
