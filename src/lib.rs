//! debugWIRE debugger core for AVR targets behind a LittleWire/Digispark
//! USB adapter.
//!
//! The adapter bit-bangs the single debugWIRE pin; this crate supplies
//! the transport ([`littlewire`]), the coalescing wire protocol
//! ([`dwire`]) and the session layer ([`target`]) a debugger front-end
//! drives.
#![deny(unused_must_use)]

pub mod devices;
pub mod dwire;
pub mod littlewire;
pub mod target;
