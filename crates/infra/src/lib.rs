//! Infrastructure layer: change tracking, unit of work, refresh token storage.

pub mod change_tracker;
pub mod refresh_tokens;
pub mod unit_of_work;


pub use unit_of_work::{UnitOfWork, UnitOfWorkError};
