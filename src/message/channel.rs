use crossbeam_channel::{Receiver, Sender, TryRecvError};
use crate::error::Error;
use super::comm::Communicator;

/// A communicator connecting a group of ranks that live in the same process,
/// each one typically driven from its own thread. Messages travel over
/// unbounded crossbeam channels.
///
pub struct ChannelCommunicator {
    rank: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
}

impl ChannelCommunicator {
    /// Create a fully connected world of the given size. The communicator
    /// for rank `n` is at index `n` of the returned vector.
    ///
    pub fn world(size: usize) -> Vec<Self> {
        let (peers, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                peers: peers.clone(),
                inbox,
            })
            .collect()
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> Result<(), Error> {
        self.peers
            .get(rank)
            .ok_or_else(|| Error::Transport(format!("no rank {} in a world of size {}", rank, self.size())))?
            .send(message)
            .map_err(|_| Error::Transport(format!("rank {} has shut down", rank)))
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>, Error> {
        match self.inbox.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Transport("all peers have shut down".to_string())),
        }
    }

    fn recv(&self) -> Result<Vec<u8>, Error> {
        self.inbox
            .recv()
            .map_err(|_| Error::Transport("all peers have shut down".to_string()))
    }
}

/// The communicator of a program that runs on a single rank. There is no one
/// to talk to: receives never yield a message, and sends fail.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, rank: usize, _: Vec<u8>) -> Result<(), Error> {
        Err(Error::Transport(format!("cannot send to rank {} from a single-process run", rank)))
    }

    fn try_recv(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }

    fn recv(&self) -> Result<Vec<u8>, Error> {
        Err(Error::Transport("a single-process run has no peers to receive from".to_string()))
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn messages_reach_the_addressed_rank() {
        let world = ChannelCommunicator::world(3);
        world[0].send(2, vec![1, 2]).unwrap();
        assert_eq!(world[1].try_recv().unwrap(), None);
        assert_eq!(world[2].recv().unwrap(), vec![1, 2]);
    }

    #[test]
    fn sending_outside_the_world_is_an_error() {
        let world = ChannelCommunicator::world(2);
        assert!(world[0].send(2, vec![]).is_err());
    }

    #[test]
    fn single_process_has_no_peers() {
        let comm = SingleProcess;
        assert_eq!(comm.size(), 1);
        assert_eq!(comm.try_recv().unwrap(), None);
        assert!(comm.send(0, vec![]).is_err());
        assert_eq!(comm.all_reduce(|a, _| a, vec![1]).unwrap(), vec![1]);
    }
}
