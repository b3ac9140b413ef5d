//! The read cache: opportunistic hot-object tracking
//! backed by `mlock`'d segments, with decay so cold objects naturally fall
//! back out.

pub mod decay;
pub mod pin;

pub use decay::{DecayHandle, DecaySweeper};
pub use pin::PinBudget;
