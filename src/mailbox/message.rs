/// Unit carried through mailboxes: a record, optionally flagged as a barrier.
///
/// A barrier is a checkpoint record (for example a run boundary). Barrier
/// mailboxes make sure everything before it has left the consumer before it
/// is handed out, and nothing after it is handed out until it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<T> {
    Data(T),
    Barrier(T),
}

impl<T> Message<T> {
    #[inline]
    pub fn is_barrier(&self) -> bool {
        matches!(self, Message::Barrier(_))
    }

    #[inline]
    pub fn payload(&self) -> &T {
        match self {
            Message::Data(v) | Message::Barrier(v) => v,
        }
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut T {
        match self {
            Message::Data(v) | Message::Barrier(v) => v,
        }
    }

    #[inline]
    pub fn into_payload(self) -> T {
        match self {
            Message::Data(v) | Message::Barrier(v) => v,
        }
    }

    /// Keeps the barrier flag, replaces the payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        match self {
            Message::Data(v) => Message::Data(f(v)),
            Message::Barrier(v) => Message::Barrier(f(v)),
        }
    }
}

/// Result of a non-blocking pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Pop<T> {
    Item(Message<T>),
    /// Nothing available right now. More may arrive.
    Empty,
    /// Closed by the producer and fully drained.
    UpstreamFinished,
}

impl<T> Pop<T> {
    #[inline]
    pub fn is_item(&self) -> bool {
        matches!(self, Pop::Item(_))
    }

    pub fn into_item(self) -> Option<Message<T>> {
        match self {
            Pop::Item(m) => Some(m),
            _ => None,
        }
    }
}
