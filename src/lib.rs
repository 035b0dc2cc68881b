// A TFTP server compliant with RFC 1350.
//
// Transfers are stop-and-wait: every DATA block must be acknowledged before the next is sent, and
// whoever is waiting on a reply times out and retransmits the last packet it sent. An ERROR packet
// ends a transfer and is never acknowledged or retransmitted.
//
// Each transfer runs in its own task with its own UDP socket, see `server` for the dispatch loop,
// `connection` for the per-transfer socket handling and `session` for the protocol state machine.

pub mod config;
pub mod connection;
pub mod file_io;
pub mod netascii;
pub mod privileges;
pub mod server;
pub mod session;
pub mod tftp;
