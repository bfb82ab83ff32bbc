//! Demo wiring for the `jobweave-server` binary.

pub mod demo;
