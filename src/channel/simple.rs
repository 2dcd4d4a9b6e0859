use bytes::Bytes;
use crate::channel::Channel;
use crate::util::bounded_queue::BoundedQueue;

/// The innermost layer of every channel stack: a queue in each direction, and nothing else
pub struct SimpleChannel {
    incoming: BoundedQueue<Bytes>,
    outgoing: BoundedQueue<Bytes>,
}

impl SimpleChannel {
    pub fn new(queue_capacity: usize) -> SimpleChannel {
        SimpleChannel {
            incoming: BoundedQueue::new(queue_capacity),
            outgoing: BoundedQueue::new(queue_capacity),
        }
    }
}

impl Channel for SimpleChannel {
    fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    fn receive(&self, payload: Bytes) -> anyhow::Result<()> {
        self.incoming.enqueue(payload)
    }

    fn pop_incoming(&self) -> Option<Bytes> {
        self.incoming.try_dequeue()
    }

    fn send(&self, prepared: Bytes) -> anyhow::Result<()> {
        self.outgoing.enqueue(prepared)
    }

    fn pop_outgoing(&self) -> Option<Bytes> {
        self.outgoing.try_dequeue()
    }

    fn prepare_to_send(&self, payload: Bytes) -> anyhow::Result<Bytes> {
        Ok(payload)
    }

    fn upkeep(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
