//! Palisade is a block-level communication and coordination layer for
//! solvers on structured grid patches. The domain is tiled by blocks, each
//! owning ghost-padded field arrays over its subregion; blocks never share
//! storage, and everything that crosses them is either a packed face buffer
//! (ghost-zone refresh) or a globally reduced scalar. A scheduler drives one
//! method instance per block through run-to-completion handlers: a handler
//! that needs remote data registers a continuation and returns, and is
//! resumed when the exchange or reduction it awaited completes. The
//! conjugate-gradient Poisson solver in [`solver`] is written entirely in
//! this style.

pub mod adjacency;
pub mod block;
pub mod boundary;
pub mod error;
pub mod face;
pub mod field;
pub mod hierarchy;
pub mod matrix;
pub mod method;
pub mod reduction;
pub mod refresh;
pub mod scheduler;
pub mod solver;
pub mod wire;
