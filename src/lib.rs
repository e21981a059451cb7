pub mod camera;
pub mod color;
pub mod gpu;
pub mod image;
pub mod material;
pub mod math;
pub mod object;
pub mod renderer;
pub mod sampling;
pub mod scene;
pub mod shader_nodes;
pub mod shared;

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, PartialEq, Eq)]
pub enum Error {
	/// A descriptor slot pool is full. The mutation that hit the limit has no effect.
	CapacityExhausted,
	/// Unknown parameter name, wrong value length, out-of-range enum member or
	/// a plug whose source type does not convert to the target type.
	InvalidArgument(String),
	/// A sampling distribution was built from weights with a zero or non-finite integral.
	InvalidDistribution,
	/// The referenced child or parent is not attached.
	NotFound,
	/// An API call that the renderer state machine does not allow in its current state.
	InvalidState(String),
	/// The GPU runtime, denoiser or texture layer reported an error. The context
	/// is left in an undefined state.
	FatalRuntime(String),
	/// A PTX asset could not be read at initialization.
	IoError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Debug for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Error::CapacityExhausted => write!(f, "slot pool capacity exhausted"),
			Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
			Error::InvalidDistribution => write!(f, "distribution has a zero or non-finite integral"),
			Error::NotFound => write!(f, "no such child or parent"),
			Error::InvalidState(what) => write!(f, "invalid state: {}", what),
			Error::FatalRuntime(what) => write!(f, "gpu runtime failure: {}", what),
			Error::IoError(what) => write!(f, "io error: {}", what),
		}
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

static NEXT_OBJECT_ID: AtomicU32 = AtomicU32::new(0);

/// Hands out process-wide object ids. Shared by every context in the process.
pub(crate) fn next_object_id() -> u32 {
	NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}
