//! Parking primitives.
//!
//! Two layers live here. [`futex`] is the raw 32-bit compare-and-sleep word:
//! on Linux it is the kernel futex, elsewhere a hashed table of
//! mutex/condvar pairs with the same no-lost-wakeup contract. [`word`] is
//! the fiber-aware [`ParkingWord`](word::ParkingWord) the synchronization
//! primitives are built on: a waiting fiber is suspended and re-readied by
//! `wake`, while a waiting OS thread blocks on a private futex word.

pub mod futex;
pub mod word;

pub use futex::{wake, wait, WaitOutcome};
pub use word::ParkingWord;
