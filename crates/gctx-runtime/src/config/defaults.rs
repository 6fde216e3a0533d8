//! Compile-time defaults
//!
//! Generated by `build.rs`; override at build time with a file named by
//! `GCTX_CONFIG_RS` containing `pub const NAME: TYPE = VALUE;` lines.

include!(concat!(env!("OUT_DIR"), "/gctx_defaults.rs"));
