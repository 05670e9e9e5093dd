use std::collections::HashMap;
use std::sync::Arc;
use log::info;
use crate::connection::ConnectionBuilder;
use crate::error::Error;
use crate::partition::{Block, BlockId, ExchangeTags, Partition, Periodicity};
use crate::patch::FieldData;
use crate::task::{BlockTask, Kernel, Task, TaskOptions};




/**
 * The tasks of one rank, in ascending block order, with a lookup from block
 * id to task and a cursor naming the task to visit first in the next
 * scheduling round.
 */
pub struct TaskGraph<T> {
    tasks: Vec<T>,
    index: HashMap<BlockId, usize>,
    cursor: usize,
}




// ============================================================================
impl<D, K> TaskGraph<BlockTask<D, K>>
where
    D: FieldData + Send,
    K: Kernel<D>,
{

    /**
     * Build the task graph for the blocks of the given rank. The `init`
     * closure creates the field data for each owned block; it must cover the
     * block's guard-extended region, and all blocks must share the same
     * field layout.
     */
    pub fn build<F>(
        partition: &Partition,
        periodicity: &Periodicity,
        rank: usize,
        total_steps: usize,
        options: TaskOptions,
        kernel: K,
        mut init: F) -> Result<Self, Error>
    where
        F: FnMut(&Block) -> D
    {
        if total_steps == 0 {
            return Err(Error::InvalidStepBudget(total_steps))
        }

        let mut data = Vec::new();

        for id in partition.local_blocks(rank) {
            data.push((id, init(partition.block(id)?)))
        }

        let layout = data
            .first()
            .map(|(_, d)| (d.num_fields(), d.element_size()))
            .unwrap_or((1, 8));

        if layout.0 == 0 || layout.1 == 0 {
            return Err(Error::InvalidPartition(format!(
                "blocks on rank {} have an empty field layout ({} fields of {} bytes)",
                rank, layout.0, layout.1)))
        }

        if let Some((id, _)) = data.iter().find(|(_, d)| (d.num_fields(), d.element_size()) != layout) {
            return Err(Error::InvalidPartition(format!(
                "block {} has a field layout different from the other blocks on rank {}",
                id, rank)))
        }

        let tags = ExchangeTags::compute(partition, periodicity, rank);
        let mut connections = ConnectionBuilder::new(partition, rank)
            .with_field_layout(layout.0, layout.1)
            .build(&tags)?;

        let kernel = Arc::new(kernel);
        let mut tasks = Vec::with_capacity(data.len());

        for (id, d) in data {
            let valid = partition.block(id)?.space.clone();
            let con = connections.remove(&id).unwrap_or_default();
            tasks.push(BlockTask::new(id, rank, valid, d, kernel.clone(), con, total_steps, options)?)
        }

        info!(
            "rank {}: built {} tasks for {} steps ({} guard-zone transfers)",
            rank,
            tasks.len(),
            total_steps,
            tags.len());

        Self::from_tasks(tasks)
    }
}




// ============================================================================
impl<T: Task> TaskGraph<T> {

    /**
     * Create a graph from a list of tasks. Each block may have only one
     * task.
     */
    pub fn from_tasks(tasks: Vec<T>) -> Result<Self, Error> {
        let mut index = HashMap::with_capacity(tasks.len());

        for (n, task) in tasks.iter().enumerate() {
            if index.insert(task.name(), n).is_some() {
                return Err(Error::DuplicateTask(task.name()))
            }
        }
        Ok(Self { tasks, index, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.tasks.iter().map(Task::name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.tasks.iter()
    }

    pub fn get(&self, name: BlockId) -> Option<&T> {
        self.index.get(&name).map(|&n| &self.tasks[n])
    }

    pub fn get_mut(&mut self, name: BlockId) -> Option<&mut T> {
        match self.index.get(&name) {
            Some(&n) => Some(&mut self.tasks[n]),
            None => None,
        }
    }

    pub fn tasks_mut(&mut self) -> &mut [T] {
        &mut self.tasks
    }

    /// Return the position of the first task to visit in the next round.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Rotate the cursor by one task, so that successive rounds start their
    /// visitation at different tasks.
    pub fn advance_cursor(&mut self) {
        if !self.tasks.is_empty() {
            self.cursor = (self.cursor + 1) % self.tasks.len()
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.tasks.iter().all(Task::is_terminated)
    }

    pub fn into_tasks(self) -> Vec<T> {
        self.tasks
    }
}
