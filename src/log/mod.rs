// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The append-only physical log: entry framing, individual segments, and the
//! `MetaLog` that chains them together.

pub mod entry;
pub mod metalog;
pub mod segment;

pub use entry::{BlockPresence, EntryBody, EntryHead, PointerDirection};
pub use metalog::MetaLog;
pub use segment::{LogSegment, SegmentMode};
