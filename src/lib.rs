//! Sudoku traffic obfuscation: codec, AEAD record layer, handshake,
//! multiplexing and the server/client runtime built on them.

// Style lints tolerated crate-wide; fix incrementally.
#![allow(
    clippy::len_without_is_empty,
    clippy::manual_range_contains,
    clippy::needless_range_loop,
    clippy::new_without_default,
    clippy::too_many_arguments,
    clippy::type_complexity,
    clippy::unnecessary_map_or
)]

pub mod app;
pub mod common;
pub mod config;
pub mod proxy;
