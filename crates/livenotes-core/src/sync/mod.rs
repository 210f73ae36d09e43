//! Wire format shared by every transport
//!
//! ## Overview
//!
//! All three peers (server, hub, satellite) speak the same JSON messages; the
//! transports differ only in how bytes are delimited:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  codec                                                          │
//! │  ├── Envelope  {notes?, projects?}   partial snapshot           │
//! │  └── Command   {request_state} | {new_note}                     │
//! │                                                                 │
//! │  framing (primary radio push path only)                         │
//! │  ├── PushFramer   truncate or chunk at the 512-byte ceiling     │
//! │  ├── Reassembler  rebuild chunked pushes on the satellite       │
//! │  └── read_at_offset  offset reads of the data channel           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Transport      | Delimiting                                    |
//! |----------------|-----------------------------------------------|
//! | server link    | one WebSocket text frame per message          |
//! | radio          | one notification / write per message (framed) |
//! | fallback       | newline-delimited JSON                        |

pub mod codec;
pub mod framing;

pub use codec::{decode, decode_command, encode, encode_command, DecodeError};
pub use framing::{PayloadMode, PushFramer, Reassembler, DEFAULT_PAYLOAD_CEILING};
