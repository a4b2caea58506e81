// vim: tw=80
//! Striped parallel storage
//!
//! A logical file is stored as a set of subfiles, striped round-robin.  A
//! subset of the ranks in a process group act as I/O concentrators (IOCs),
//! each serving some of the subfiles on behalf of every rank.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Error variants are spelled like errno values
#![allow(clippy::upper_case_acronyms)]

pub mod comm;
pub mod config;
pub mod context;
pub mod file;
pub mod ioc;
pub mod local_comm;
pub mod rpc;
pub mod stripe;
pub mod topology;
pub mod types;
pub mod util;

pub use crate::types::*;
pub use crate::util::*;
