//! Closed set of the platform primitives.
//!
//! [`SyncObject`] lets code that knows its concrete primitives hold them in
//! one collection and dispatch statically. Heterogeneous sets that also
//! contain threads or channels go through `Arc<dyn WaitObject>` instead.

use crate::event::Event;
use crate::handle::{Handle, WaitObject, WaitResult};
use crate::mutex::Mutex;
use crate::pipe::Pipe;
use crate::semaphore::Semaphore;
use crate::timer::Timer;

/// One of the waitable primitives.
#[derive(Debug)]
pub enum SyncObject {
    /// Reentrant mutex.
    Mutex(Mutex),
    /// Counting semaphore.
    Semaphore(Semaphore),
    /// Manual or auto-reset event.
    Event(Event),
    /// Monotonic timer.
    Timer(Timer),
    /// Byte pipe.
    Pipe(Pipe),
}

impl SyncObject {
    /// Short name of the variant, used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Mutex(_) => "mutex",
            Self::Semaphore(_) => "semaphore",
            Self::Event(_) => "event",
            Self::Timer(_) => "timer",
            Self::Pipe(_) => "pipe",
        }
    }
}

impl WaitObject for SyncObject {
    fn handle(&self) -> Handle {
        match self {
            Self::Mutex(m) => m.handle(),
            Self::Semaphore(s) => s.handle(),
            Self::Event(e) => e.handle(),
            Self::Timer(t) => t.handle(),
            Self::Pipe(p) => p.handle(),
        }
    }

    fn pre_wait(&self) -> bool {
        match self {
            Self::Mutex(m) => m.pre_wait(),
            Self::Semaphore(s) => s.pre_wait(),
            Self::Event(e) => e.pre_wait(),
            Self::Timer(t) => t.pre_wait(),
            Self::Pipe(p) => p.pre_wait(),
        }
    }

    fn post_wait(&self, result: WaitResult) -> WaitResult {
        match self {
            Self::Mutex(m) => m.post_wait(result),
            Self::Semaphore(s) => s.post_wait(result),
            Self::Event(e) => e.post_wait(result),
            Self::Timer(t) => t.post_wait(result),
            Self::Pipe(p) => p.post_wait(result),
        }
    }
}

macro_rules! impl_from_primitive {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for SyncObject {
                fn from(object: $variant) -> Self {
                    Self::$variant(object)
                }
            }
        )*
    };
}

impl_from_primitive!(Mutex, Semaphore, Event, Timer, Pipe);
