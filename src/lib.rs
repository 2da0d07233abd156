//! Post-consensus core of the Directory Service committee of a sharded
//! proof-of-work chain.
//!
//! After the BFT layer reports a consensus round DONE, this crate commits
//! the agreed block to chain state and durable storage, rotates the DS
//! committee around the PoW winner, disseminates the block to lookup
//! nodes, the new leader, and the shards, and drives the epoch state
//! machine into its next phase. View-change blocks arriving mid-flow are
//! validated and applied by reordering the committee.
//!
//! The consensus primitive, PoW subsystem, transport, and account store
//! are injected behind the traits in [`interfaces`]; applications wire a
//! [`service::DirectoryService`] with [`service::DsDependencies`] and feed
//! it consensus messages through the dispatch entry points.

pub mod chain;
pub mod committee;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod dsblock;
pub mod errors;
pub mod finalblock;
pub mod interfaces;
pub mod messages;
pub mod multicast;
pub mod service;
pub mod storage;
pub mod types;
pub mod viewchange;

#[cfg(test)]
pub(crate) mod testutil;
