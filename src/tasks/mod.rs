//! Background automation: a durable task queue with retry/backoff
//! (`queue`) and a cron-like scheduler that turns configured jobs into
//! queued tasks at the right slots (`scheduler`).

pub mod queue;
pub mod scheduler;
