//! Two-phase commit crate.
//!
//! This crate provides the atomic commit protocol used by keygate when one
//! logical transaction spans several shards. Higher layers supply open
//! sub-transactions as `Participant`s plus a `ParticipantDirectory` that can
//! reach any participant (and its coordinator log) by id, then drive commits
//! through `Coordinator`.

pub mod twopc;
