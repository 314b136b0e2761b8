pub mod clock;
mod nanos;
mod ntp;
mod repeater;

pub use nanos::Nanos;
pub use ntp::NtpTimestamp;
pub use repeater::{Backoff, Repeater};
