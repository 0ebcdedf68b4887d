//! Single slot handoff between two execution contexts
//!
//! Producer and consumer may live on different cores or threads. The slot is a
//! [`heapless::spsc::Queue`] with room for one value; the sender only sees it free once the
//! receiver has taken the previous value.
use heapless::spsc::{Consumer, Producer, Queue};

/// Queue storage; `heapless` keeps one slot empty to tell full from empty
const SLOTS: usize = 2;

pub struct Mailbox<T> {
    queue: Queue<T, SLOTS>,
}

impl<T> Mailbox<T> {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
        }
    }

    /// Splits the mailbox into its two endpoints
    pub fn split(&mut self) -> (Sender<'_, T>, Receiver<'_, T>) {
        let (producer, consumer) = self.queue.split();
        (Sender { producer }, Receiver { consumer })
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Sender<'a, T> {
    producer: Producer<'a, T, SLOTS>,
}

impl<'a, T> Sender<'a, T> {
    /// Hands `value` over, or gives it back while the previous one is still unread
    pub fn try_send(&mut self, value: T) -> Result<(), T> {
        self.producer.enqueue(value)
    }

    /// Whether the previous value is still waiting for the receiver
    pub fn is_full(&self) -> bool {
        !self.producer.ready()
    }
}

pub struct Receiver<'a, T> {
    consumer: Consumer<'a, T, SLOTS>,
}

impl<'a, T> Receiver<'a, T> {
    pub fn try_recv(&mut self) -> Option<T> {
        self.consumer.dequeue()
    }

    pub fn is_full(&self) -> bool {
        self.consumer.ready()
    }
}
