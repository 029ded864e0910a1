
use rustfft::num_complex::Complex;

pub mod beacon;
pub mod carrier;
pub mod corx;
pub mod dsp;
pub mod io;
pub mod pipeline;

/// Wall-clock time of the first new (non-overlapping) sample in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockTimestamp {
	pub sec:u64,
	pub usec:u32,
}

/// A fixed-length block of IQ samples. The first `history_len` samples
/// overlap the previous block, so each block advances the stream by
/// `block_len - history_len` fresh samples.
#[derive(Debug, Clone)]
pub struct SampleBlock {
	pub idx:u64,
	pub timestamp:BlockTimestamp,
	pub samples:Vec<Complex<f32>>,
}

impl SampleBlock {

	pub fn new(block_len:usize) -> Self {
		Self{ idx: 0, timestamp: BlockTimestamp::default(), samples: vec![Complex{ re: 0.0, im: 0.0 }; block_len] }
	}

}

#[derive(Debug)]
pub enum ReceiverError {
	Source(String, i32),
	Config(String),
	Io(std::io::Error),
}

impl From<std::io::Error> for ReceiverError {
	fn from(e:std::io::Error) -> Self { ReceiverError::Io(e) }
}
