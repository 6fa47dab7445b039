//! Container engine
//!
//! Layered leaf-first: fixed-size blocks in one file ([`store`]), a
//! copy-on-write B+ tree of fixed-width keys ([`catalog`]), the transactional
//! [`session`] around one open container, the path [`manifest`], and the
//! filesystem projection ([`vfs`]).

pub mod block;
pub mod buffer_pool;
pub mod catalog;
pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod key;
pub mod manifest;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod validation;
pub mod vfs;

pub use session::{BatchOp, CheckReport, CommitResult, ContainerSession, ContainerStats, Snapshot};
