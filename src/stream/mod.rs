//! Stream combinators for frame consumers.

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
