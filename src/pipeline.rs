//! Block submission queue
//!
//! Producers (peer sync, RPC) hand blocks to a [`BlockQueue`]; one worker
//! thread drains it into [`BlockProcessor::process_block`] and sends each
//! result back on the channel returned by [`BlockQueue::submit`].

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{ConsensusError, Result};
use crate::processor::{BlockProcessor, ProcessBlockResult};
use crate::storage::ChainStore;
use crate::types::*;

struct Submission {
    block: Block,
    hint: Option<UtxoSet>,
    reply: Sender<Result<ProcessBlockResult>>,
}

pub struct BlockQueue {
    sender: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
}

impl BlockQueue {
    /// Start the worker; at most `capacity` submissions wait at a time
    pub fn start<S: ChainStore + 'static>(processor: Arc<BlockProcessor<S>>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<Submission>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("block-processor".to_string())
            .spawn(move || drain(processor, receiver))
            .map_err(|error| ConsensusError::ThreadPool(error.to_string()))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue a block; blocks while the queue is full
    pub fn submit(&self, block: Block, hint: Option<UtxoSet>) -> Result<Receiver<Result<ProcessBlockResult>>> {
        let (reply, result) = bounded(1);
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ConsensusError::ThreadPool("block queue is shut down".to_string()))?;
        sender
            .send(Submission { block, hint, reply })
            .map_err(|_| ConsensusError::ThreadPool("block processor thread has stopped".to_string()))?;
        Ok(result)
    }

    /// Queue a block and wait for its result
    pub fn process(&self, block: Block) -> Result<ProcessBlockResult> {
        self.submit(block, None)?
            .recv()
            .map_err(|_| ConsensusError::ThreadPool("block processor thread has stopped".to_string()))?
    }

    /// Process what is already queued, then stop the worker
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Block processor thread panicked");
            }
        }
    }
}

impl Drop for BlockQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain<S: ChainStore>(processor: Arc<BlockProcessor<S>>, receiver: Receiver<Submission>) {
    for submission in receiver {
        let hash = submission.block.hash();
        let result = processor.process_block(&submission.block, submission.hint.as_ref());
        if let Err(error) = &result {
            warn!("Transient failure processing {}: {}", hash_to_hex(&hash), error);
        }
        if submission.reply.send(result).is_err() {
            debug!("Result for {} was not awaited", hash_to_hex(&hash));
        }
    }
    debug!("Block queue closed");
}
