
use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt};
use rustfft::num_complex::Complex;

use crate::{BlockTimestamp, ReceiverError, SampleBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
	U8,
	I16,
}

impl SampleFormat {

	pub fn from_str(s:&str) -> Result<Self, ReceiverError> {
		match s {
			"u8"  => Ok(SampleFormat::U8),
			"i16" => Ok(SampleFormat::I16),
			other => Err(ReceiverError::Config(format!("unknown sample format '{}'", other))),
		}
	}

	fn bytes_per_sample(self) -> usize {
		match self {
			SampleFormat::U8  => 2,
			SampleFormat::I16 => 4,
		}
	}

}

/// A source of overlapping sample blocks. `next_block` returns Ok(false)
/// once the stream is exhausted or cancelled; the bias-tee probe reports
/// whether the hardware supports it (the default does not, and the call
/// is a no-op).
pub trait SampleSource {
	fn next_block(&mut self, block:&mut SampleBlock) -> Result<bool, ReceiverError>;
	fn set_bias_tee(&mut self, _on:bool) -> bool { false }
}

/// Reads raw interleaved IQ samples from any byte stream and assembles
/// them into blocks of `block_len` samples, the first `history_len` of
/// which repeat the tail of the previous block. The history region of the
/// very first block is zero-filled.
pub struct RawIqSource<R: Read> {
	reader:R,
	format:SampleFormat,
	block_len:usize,
	history_len:usize,
	running:Arc<AtomicBool>,
	buffer:Vec<Complex<f32>>,
	byte_buf:Vec<u8>,
	blocks_read:u64,
}

impl<R: Read> RawIqSource<R> {

	pub fn new(reader:R, format:SampleFormat, block_len:usize, history_len:usize,
	           running:Arc<AtomicBool>) -> Result<Self, ReceiverError> {
		if history_len >= block_len {
			return Err(ReceiverError::Config(format!(
				"history_len ({}) must be less than block_len ({})", history_len, block_len)));
		}
		let new_samples = block_len - history_len;
		Ok(Self{
			reader, format, block_len, history_len, running,
			buffer: vec![Complex{ re: 0.0, im: 0.0 }; block_len],
			byte_buf: vec![0u8; new_samples * format.bytes_per_sample()],
			blocks_read: 0,
		})
	}

	fn decode_new_samples(&mut self) {
		let new_samples = self.block_len - self.history_len;
		let dst = &mut self.buffer[self.history_len..];
		match self.format {
			SampleFormat::U8 => {
				for i in 0..new_samples {
					dst[i] = Complex{
						re: (self.byte_buf[2*i]     as f32 - 127.4) / 128.0,
						im: (self.byte_buf[2*i + 1] as f32 - 127.4) / 128.0,
					};
				}
			},
			SampleFormat::I16 => {
				let mut cursor = io::Cursor::new(&self.byte_buf);
				for i in 0..new_samples {
					let re = cursor.read_i16::<LittleEndian>().unwrap();
					let im = cursor.read_i16::<LittleEndian>().unwrap();
					dst[i] = Complex{ re: re as f32 / 32768.0, im: im as f32 / 32768.0 };
				}
			},
		}
	}

}

impl<R: Read> SampleSource for RawIqSource<R> {

	fn next_block(&mut self, block:&mut SampleBlock) -> Result<bool, ReceiverError> {
		if !self.running.load(Ordering::SeqCst) {
			return Ok(false);
		}

		// Slide the overlap region to the front of the buffer
		let stride = self.block_len - self.history_len;
		self.buffer.copy_within(stride.., 0);

		match self.reader.read_exact(&mut self.byte_buf) {
			Ok(()) => (),
			Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
			Err(e) => return Err(ReceiverError::Source(format!("sample read failed: {}", e), 1)),
		}
		self.decode_new_samples();

		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
		block.idx = self.blocks_read;
		block.timestamp = BlockTimestamp{ sec: now.as_secs(), usec: now.subsec_micros() };
		block.samples.copy_from_slice(&self.buffer);

		self.blocks_read += 1;
		Ok(true)
	}

}

/// Open a raw IQ source from a path, with `-` selecting stdin.
pub fn open_source(path:&str, format:SampleFormat, block_len:usize, history_len:usize,
                   running:Arc<AtomicBool>) -> Result<RawIqSource<Box<dyn Read>>, ReceiverError> {
	let reader:Box<dyn Read> = if path == "-" {
		Box::new(io::stdin())
	} else {
		Box::new(File::open(path).map_err(|e| {
			ReceiverError::Source(format!("unable to open '{}': {}", path, e), 1)
		})?)
	};
	RawIqSource::new(reader, format, block_len, history_len, running)
}
