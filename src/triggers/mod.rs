//! Trigger layer: what makes runs tick.
//!
//! The [`Ticker`] drives armed runs; the [`CronScheduler`] turns cron
//! expressions into automatic submissions.

mod cron;
mod ticker;

pub use cron::CronScheduler;
pub use ticker::Ticker;
