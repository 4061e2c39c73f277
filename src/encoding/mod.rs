//! Binary data encodings.
//!
//! - bincode: used for message payloads, config-change bodies, and the
//!   in-memory wire format of test transports. The on-disk log-frame and
//!   status-file formats are hand-framed in the store module and do not use
//!   bincode.

pub mod bincode;
