//! Utilities for testing code that talks to a TGDB server through channels, most notably an
//!  in-process server that speaks the wire protocol.

pub mod mock_server;
