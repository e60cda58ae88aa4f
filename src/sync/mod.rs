pub mod event_group;
pub mod event_queue;
pub mod mutex;
pub mod semaphore;
