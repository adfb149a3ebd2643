use crate::block::BlockIndex;
use std::error;
use std::fmt;

#[derive(Debug)]

/**
 * Error to represent a failed or ill-formed distributed computation. All
 * variants except `MaxIterExceeded` indicate bugs or broken configurations
 * and are never retried; `MaxIterExceeded` is a terminal solver state that
 * the caller may choose to tolerate.
 */
pub enum Error {
    /// A broken setup: unregistered field, unsupported precision, a refresh
    /// requesting more ghost zones than a field carries, or accumulate over
    /// mixed refinement levels.
    Config(String),

    /// A violated protocol invariant: duplicate face delivery, delivery
    /// after epoch completion, double contribution to a reduction episode,
    /// mismatched episode metadata between contributors, or a stalled run.
    Protocol {
        block: Option<BlockIndex>,
        episode: u64,
        detail: String,
    },

    /// The iterative solver reached its iteration cap without meeting the
    /// residual tolerance.
    MaxIterExceeded {
        iter: u64,
        residual_ratio: f64,
    },

    /// A reduced scalar, or a scalar derived from one, came back NaN or
    /// infinite.
    NumericGuard {
        name: &'static str,
        value: f64,
    },
}

impl Error {
    pub(crate) fn protocol(block: BlockIndex, episode: u64, detail: String) -> Self {
        Error::Protocol {
            block: Some(block),
            episode,
            detail,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        use Error::*;

        match self {
            Config(detail) => {
                write!(fmt, "configuration error: {}", detail)
            }
            Protocol { block: Some(b), episode, detail } => {
                write!(fmt, "protocol violation on block {:?} (episode {}): {}", b, episode, detail)
            }
            Protocol { block: None, episode, detail } => {
                write!(fmt, "protocol violation (episode {}): {}", episode, detail)
            }
            MaxIterExceeded { iter, residual_ratio } => {
                write!(fmt, "no convergence after {} iterations (rr/rr0 = {:e})", iter, residual_ratio)
            }
            NumericGuard { name, value } => {
                write!(fmt, "numeric guard tripped: {} = {}", name, value)
            }
        }
    }
}

impl error::Error for Error {}

/// Reject NaN and infinite values in global scalars before they can steer
/// the computation.
pub fn check(value: f64, name: &'static str) -> Result<f64, Error> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NumericGuard { name, value })
    }
}
