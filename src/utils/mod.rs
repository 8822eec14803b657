pub use clock::now_millis;
pub use periodic_task::PeriodicTask;

mod clock;
mod periodic_task;
