//! Cooperative cancellation shared by the scheduler, the retry loop and
//! background tasks.

mod token;

pub use token::CancellationToken;
