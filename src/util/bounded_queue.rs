use anyhow::bail;
use parking_lot::Mutex;

/// A fixed-capacity FIFO ring buffer. It is shared between the transport's worker task and the
///  application, so all operations go through a mutex.
///
/// The queue never grows: enqueueing into a full queue is an error. There is no back pressure in
///  this protocol, and a full queue means that the configured capacity is too small for the load,
///  which should surface immediately rather than silently dropping data.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
}

struct Ring<T> {
    slots: Vec<Option<T>>,
    /// next slot to dequeue from
    head: usize,
    /// next slot to enqueue into
    tail: usize,
    /// `head == tail` holds both for an empty and for a full ring, so 'full' is tracked explicitly
    is_full: bool,
}
impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        if self.is_full {
            self.capacity()
        }
        else {
            (self.tail + self.capacity() - self.head) % self.capacity()
        }
    }

    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        assert!(capacity > 0, "a bounded queue needs a capacity of at least 1");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        BoundedQueue {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                tail: 0,
                is_full: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full
    }

    pub fn enqueue(&self, item: T) -> anyhow::Result<()> {
        let mut ring = self.ring.lock();
        if ring.is_full {
            bail!("queue is full (capacity {})", ring.capacity());
        }

        let tail = ring.tail;
        ring.slots[tail] = Some(item);
        ring.tail = ring.advance(tail);
        if ring.tail == ring.head {
            ring.is_full = true;
        }
        Ok(())
    }

    pub fn dequeue(&self) -> anyhow::Result<T> {
        match self.try_dequeue() {
            Some(item) => Ok(item),
            None => bail!("queue is empty"),
        }
    }

    /// same as [BoundedQueue::dequeue], but returning `None` for an empty queue. This is the
    ///  convenient variant for draining loops.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        if ring.len() == 0 {
            return None;
        }

        let head = ring.head;
        let item = ring.slots[head].take();
        ring.head = ring.advance(head);
        ring.is_full = false;
        item
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.head = 0;
        ring.tail = 0;
        ring.is_full = false;
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// returns a copy of the head element without removing it
    pub fn peek(&self) -> Option<T> {
        let ring = self.ring.lock();
        if ring.len() == 0 {
            return None;
        }
        ring.slots[ring.head].clone()
    }
}
