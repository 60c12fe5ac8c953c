pub mod cond;
pub mod event;
pub mod mutex;
pub mod rwlock;
pub mod spinlock;

pub use cond::CondVar;
pub use event::AwaitEvent;
pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use spinlock::{RawLock, SpinLock, SpinLockGuard};
