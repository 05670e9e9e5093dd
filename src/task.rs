//! Block tasks and the step-by-step exchange protocol they follow.
//!
//! A task wraps one block's field data together with the transfers the block
//! takes part in. Each call to [`Task::execute`] performs one transition of
//! the task's state machine: pull the guard-zone data that arrived for the
//! current step, run the user kernel, and push the block's boundary data to
//! its neighbors for the next step. The scheduler decides when a task may
//! fire by asking it which messages it depends on.

use std::sync::Arc;
use log::trace;
use serde::{Deserialize, Serialize};
use crate::connection::{BlockConnections, LocalConnection, RemoteConnection};
use crate::error::Error;
use crate::index_space::IndexSpace;
use crate::mailbox::{Envelope, Mailbox, MessageKey, Tag};
use crate::partition::BlockId;
use crate::patch::FieldData;




/**
 * Where a task is in its sequence of steps.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Not yet started. Always ready to fire.
    Prologue,

    /// About to pull the data for the given step and compute it.
    Running(usize),

    /// All steps are computed; waiting on the neighbor data sent after each
    /// neighbor's final step.
    AwaitingFinalPull,

    /// Finished. Never fires again.
    Terminated,
}




/**
 * Switches that control when a task exchanges guard-zone data.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Exchange the initial data before the first step, so that step 0 sees
    /// filled guard zones.
    pub communicate_first: bool,

    /// Exchange once more after the final step, so that the guard zones of
    /// the final data are filled.
    pub communicate_upon_completion: bool,

    /// Reject messages whose payload length differs from the transfer's
    /// expected byte size.
    pub validate_message_size: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            communicate_first: true,
            communicate_upon_completion: false,
            validate_message_size: true,
        }
    }
}




/**
 * The numerical work done on one block for one step. The kernel receives
 * the step number, the block's data (with guard zones filled for that
 * step), and the block's valid region.
 */
pub trait Kernel<D>: Send + Sync {
    fn compute(&self, step: usize, data: &mut D, valid: &IndexSpace);
}

impl<D, F> Kernel<D> for F
where
    F: Fn(usize, &mut D, &IndexSpace) + Send + Sync
{
    fn compute(&self, step: usize, data: &mut D, valid: &IndexSpace) {
        self(step, data, valid)
    }
}




/**
 * A resumable unit of work the runtime can drive. A task is identified by
 * the block it operates on. It fires when every message it depends on is in
 * the mailbox, and each firing consumes those messages and returns the
 * messages it produced.
 */
pub trait Task: Send {

    /// The block this task operates on.
    fn name(&self) -> BlockId;

    fn state(&self) -> TaskState;

    fn local_connections(&self) -> &LocalConnection;

    fn remote_connections(&self) -> &RemoteConnection;

    /// Return the keys of the messages that must be in the mailbox before
    /// the task's next transition.
    fn dependencies(&self) -> Vec<MessageKey>;

    /// Determine whether the task may fire. Does not consume anything.
    fn is_satisfied(&self, mailbox: &Mailbox) -> bool {
        self.dependencies().iter().all(|key| mailbox.contains(key))
    }

    /// Perform one transition, taking its dependencies out of the mailbox.
    /// Returns the outgoing messages, for the runtime to route.
    fn execute(&mut self, mailbox: &mut Mailbox) -> Result<Vec<Envelope>, Error>;

    fn is_terminated(&self) -> bool {
        self.state() == TaskState::Terminated
    }
}




/**
 * The task for one block: its field data, its connections, and a kernel
 * shared with the other blocks of the graph.
 */
pub struct BlockTask<D, K> {
    block: BlockId,
    rank: usize,
    valid: IndexSpace,
    data: D,
    kernel: Arc<K>,
    local: LocalConnection,
    remote: RemoteConnection,
    state: TaskState,
    total_steps: usize,
    options: TaskOptions,
    transitions: usize,
}




// ============================================================================
impl<D, K> BlockTask<D, K>
where
    D: FieldData,
    K: Kernel<D>,
{

    /**
     * Create a task for a block owned by `rank`. The data must cover the
     * block's valid region plus the guard zones its connections write to.
     */
    pub fn new(
        block: BlockId,
        rank: usize,
        valid: IndexSpace,
        data: D,
        kernel: Arc<K>,
        connections: BlockConnections,
        total_steps: usize,
        options: TaskOptions) -> Result<Self, Error>
    {
        if total_steps == 0 {
            return Err(Error::InvalidStepBudget(total_steps))
        }
        Ok(Self {
            block,
            rank,
            valid,
            data,
            kernel,
            local: connections.local,
            remote: connections.remote,
            state: TaskState::Prologue,
            total_steps,
            options,
            transitions: 0,
        })
    }

    pub fn valid_space(&self) -> &IndexSpace {
        &self.valid
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Return the number of transitions performed so far.
    pub fn transitions(&self) -> usize {
        self.transitions
    }

    fn pulls_at(&self, step: usize) -> bool {
        step > 0 || self.options.communicate_first
    }

    fn inbound(&self, epoch: usize) -> impl Iterator<Item = (MessageKey, &IndexSpace, usize)> + '_ {
        let dest = self.block;
        let local = self.local.receives.iter().map(move |rcv| (MessageKey {
            source: rcv.source_block,
            dest,
            tag: Tag::Local(rcv.partner_index),
            epoch,
        }, &rcv.dest_box, rcv.byte_size));

        let remote = self.remote.receives.iter().map(move |rcv| (MessageKey {
            source: rcv.source_block,
            dest,
            tag: Tag::Remote(rcv.sequence_tag),
            epoch,
        }, &rcv.dest_box, rcv.byte_size));

        local.chain(remote)
    }

    fn push(&self, epoch: usize, outbox: &mut Vec<Envelope>) -> Result<(), Error> {
        let fields = 0..self.data.num_fields();

        for (i, snd) in self.local.sends.iter().enumerate() {
            let mut data = Vec::with_capacity(snd.byte_size);
            self.data.copy_region_to_buffer(&snd.source_box, fields.clone(), &mut data)?;
            outbox.push(Envelope {
                source: self.block,
                dest: snd.dest_block,
                dest_rank: self.rank,
                tag: Tag::Local(i),
                epoch,
                data,
            })
        }
        for snd in &self.remote.sends {
            let mut data = Vec::with_capacity(snd.byte_size);
            self.data.copy_region_to_buffer(&snd.source_box, fields.clone(), &mut data)?;
            outbox.push(Envelope {
                source: self.block,
                dest: snd.dest_block,
                dest_rank: snd.peer_rank,
                tag: Tag::Remote(snd.sequence_tag),
                epoch,
                data,
            })
        }
        Ok(())
    }

    fn pull(&mut self, epoch: usize, mailbox: &mut Mailbox) -> Result<(), Error> {
        let fields = 0..self.data.num_fields();
        let inbound: Vec<_> = self
            .inbound(epoch)
            .map(|(key, region, size)| (key, region.clone(), size))
            .collect();

        for (key, region, expected) in inbound {
            let envelope = mailbox.take(&key)?;

            if self.options.validate_message_size && envelope.data.len() != expected {
                return Err(Error::MessageSize { key, expected, actual: envelope.data.len() })
            }
            self.data.copy_buffer_to_region(&region, fields.clone(), &envelope.data)?;
        }
        Ok(())
    }

    fn run_step(&mut self, step: usize, mailbox: &mut Mailbox, outbox: &mut Vec<Envelope>) -> Result<TaskState, Error> {
        if self.pulls_at(step) {
            self.pull(step, mailbox)?;
        }
        self.kernel.compute(step, &mut self.data, &self.valid);

        let next = step + 1;

        if next < self.total_steps || self.options.communicate_upon_completion {
            self.push(next, outbox)?;
        }
        Ok(if next < self.total_steps {
            TaskState::Running(next)
        } else if self.options.communicate_upon_completion {
            TaskState::AwaitingFinalPull
        } else {
            TaskState::Terminated
        })
    }
}




// ============================================================================
impl<D, K> Task for BlockTask<D, K>
where
    D: FieldData + Send,
    K: Kernel<D>,
{
    fn name(&self) -> BlockId {
        self.block
    }

    fn state(&self) -> TaskState {
        self.state
    }

    fn local_connections(&self) -> &LocalConnection {
        &self.local
    }

    fn remote_connections(&self) -> &RemoteConnection {
        &self.remote
    }

    fn dependencies(&self) -> Vec<MessageKey> {
        let epoch = match self.state {
            TaskState::Running(step) if self.pulls_at(step) => step,
            TaskState::AwaitingFinalPull => self.total_steps,
            _ => return Vec::new(),
        };
        self.inbound(epoch).map(|(key, _, _)| key).collect()
    }

    fn execute(&mut self, mailbox: &mut Mailbox) -> Result<Vec<Envelope>, Error> {
        let mut outbox = Vec::new();

        let next = match self.state {
            TaskState::Prologue if self.options.communicate_first => {
                self.push(0, &mut outbox)?;
                TaskState::Running(0)
            }
            TaskState::Prologue => {
                self.run_step(0, mailbox, &mut outbox)?
            }
            TaskState::Running(step) => {
                self.run_step(step, mailbox, &mut outbox)?
            }
            TaskState::AwaitingFinalPull => {
                self.pull(self.total_steps, mailbox)?;
                TaskState::Terminated
            }
            TaskState::Terminated => {
                return Err(Error::TaskTerminated(self.block))
            }
        };

        trace!("block {}: {:?} -> {:?} ({} messages out)", self.block, self.state, next, outbox.len());

        self.state = next;
        self.transitions += 1;
        Ok(outbox)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::sync::Mutex;
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::index_space::range2d;
    use crate::partition::{ExchangeTags, Partition, Periodicity};
    use crate::patch::Patch;

    type TestKernel = fn(usize, &mut Patch, &IndexSpace);

    fn increment(_: usize, patch: &mut Patch, valid: &IndexSpace) {
        patch.map_region_mut(valid, |_, x| x[0] += 1.0).unwrap()
    }

    fn tasks_with<K: Kernel<Patch>>(kernel: K, total_steps: usize, options: TaskOptions) -> Vec<BlockTask<Patch, K>> {
        let partition = Partition::uniform(range2d(0..8, 0..4), (2, 1), 1, 1).unwrap();
        let tags = ExchangeTags::compute(&partition, &Periodicity::none(), 0);
        let mut connections = ConnectionBuilder::new(&partition, 0).with_field_layout(1, 8).build(&tags).unwrap();
        let kernel = Arc::new(kernel);

        partition
            .local_blocks(0)
            .map(|b| {
                let valid = partition.block(b).unwrap().space.clone();
                let data = Patch::zeros(partition.extended_space(b).unwrap(), 1);
                let con = connections.remove(&b).unwrap();
                BlockTask::new(b, 0, valid, data, kernel.clone(), con, total_steps, options).unwrap()
            })
            .collect()
    }

    fn tasks(total_steps: usize, options: TaskOptions) -> Vec<BlockTask<Patch, TestKernel>> {
        tasks_with(increment as TestKernel, total_steps, options)
    }

    fn drive<T: Task>(tasks: &mut [T]) -> Mailbox {
        let mut mailbox = Mailbox::new();

        for _ in 0..1000 {
            if tasks.iter().all(|t| t.is_terminated()) {
                return mailbox
            }
            for task in tasks.iter_mut() {
                if !task.is_terminated() && task.is_satisfied(&mailbox) {
                    for envelope in task.execute(&mut mailbox).unwrap() {
                        mailbox.insert(envelope).unwrap()
                    }
                }
            }
        }
        panic!("tasks did not terminate")
    }

    fn options(first: bool, completion: bool) -> TaskOptions {
        TaskOptions {
            communicate_first: first,
            communicate_upon_completion: completion,
            validate_message_size: true,
        }
    }

    #[test]
    fn transition_count_without_extra_exchanges_equals_steps() {
        let mut tasks = tasks(5, options(false, false));
        let mailbox = drive(&mut tasks);
        assert!(tasks.iter().all(|t| t.transitions() == 5));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn transition_count_with_first_exchange_is_one_more() {
        let mut tasks = tasks(5, options(true, false));
        drive(&mut tasks);
        assert!(tasks.iter().all(|t| t.transitions() == 6));
    }

    #[test]
    fn transition_count_with_both_exchanges_is_two_more() {
        let mut tasks = tasks(5, options(true, true));
        let mailbox = drive(&mut tasks);
        assert!(tasks.iter().all(|t| t.transitions() == 7));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn prologue_is_always_ready_and_running_waits_for_data() {
        let mut tasks = tasks(2, TaskOptions::default());
        let mut mailbox = Mailbox::new();

        assert!(tasks[0].is_satisfied(&mailbox));
        let out = tasks[0].execute(&mut mailbox).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(tasks[0].state(), TaskState::Running(0));
        assert!(!tasks[0].is_satisfied(&mailbox));

        for envelope in tasks[1].execute(&mut mailbox).unwrap() {
            mailbox.insert(envelope).unwrap()
        }
        assert!(tasks[0].is_satisfied(&mailbox));
        assert!(tasks[0].is_satisfied(&mailbox));
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn guard_zones_receive_neighbor_values() {
        let mut tasks = tasks(3, options(true, true));
        drive(&mut tasks);

        let left = tasks[0].data();
        let right = tasks[1].data();
        assert_eq!(left.get_slice((4, 2)), &[3.0]);
        assert_eq!(right.get_slice((3, 0)), &[3.0]);
        assert_eq!(left.get_slice((-1, 0)), &[0.0]);
    }

    #[test]
    fn kernel_sees_steps_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let kernel = move |step: usize, _: &mut Patch, _: &IndexSpace| record.lock().unwrap().push(step);
        let mut tasks = tasks_with(kernel, 4, TaskOptions::default());
        tasks.truncate(1);
        let mut mailbox = Mailbox::new();

        // Feed the lone task the messages its neighbor would have sent.
        while !tasks[0].is_terminated() {
            for key in tasks[0].dependencies() {
                mailbox.insert(Envelope {
                    source: key.source,
                    dest: key.dest,
                    dest_rank: 0,
                    tag: key.tag,
                    epoch: key.epoch,
                    data: vec![0; 32],
                }).unwrap()
            }
            tasks[0].execute(&mut mailbox).unwrap();
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn executing_a_terminated_task_is_an_error() {
        let mut tasks = tasks(1, options(false, false));
        let mut mailbox = Mailbox::new();
        tasks[0].execute(&mut mailbox).unwrap();
        assert!(tasks[0].is_terminated());
        assert!(matches!(tasks[0].execute(&mut mailbox), Err(Error::TaskTerminated(0))));
    }

    #[test]
    fn message_of_wrong_size_is_rejected() {
        let mut tasks = tasks(2, TaskOptions::default());
        let mut mailbox = Mailbox::new();
        tasks[0].execute(&mut mailbox).unwrap();

        let key = tasks[0].dependencies()[0];
        mailbox.insert(Envelope {
            source: key.source,
            dest: key.dest,
            dest_rank: 0,
            tag: key.tag,
            epoch: key.epoch,
            data: vec![0; 8],
        }).unwrap();

        match tasks[0].execute(&mut mailbox) {
            Err(Error::MessageSize { expected: 32, actual: 8, .. }) => {}
            other => panic!("expected a size error, got {:?}", other.map(|o| o.len())),
        }
    }

    #[test]
    fn zero_steps_is_rejected() {
        let result = BlockTask::new(
            0,
            0,
            range2d(0..4, 0..4),
            Patch::zeros(range2d(0..4, 0..4), 1),
            Arc::new(increment as TestKernel),
            BlockConnections::default(),
            0,
            TaskOptions::default());
        assert!(matches!(result, Err(Error::InvalidStepBudget(0))));
    }
}
