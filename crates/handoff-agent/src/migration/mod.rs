//! The migration state machines.
//!
//! [`source`] drives registration → inform → shadow ∥ dump → send → done on
//! the host the process leaves; [`destination`] mirrors state, prepares a
//! namespace, restores the image, and performs cut-over on the host the
//! process lands on.

pub mod destination;
pub mod source;
