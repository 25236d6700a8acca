// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The paged, copy-on-write B-tree: fixed-size node format, shared
//! demand-paged cache, and the per-tree store built on top of both.

pub mod cache;
pub mod node;
pub mod store;

pub use node::{DiskBlock, FixedWidth, Node, TREE_BLOCK_SIZE, TREE_MAX_BLOCKS};
pub use store::Tree;
