
use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use rustfft::num_complex::Complex;

pub const CORX_VERSION:u8 = 0x01;

/// Reserved phase-error value marking the end of a cycle run.
pub const CYCLE_STOP:i8 = -128;

#[derive(Debug, Clone, Copy)]
pub struct CorxFileHeader {
	pub slice_start:u16,
	pub slice_size:u16,
}

#[derive(Debug, Clone, Copy)]
pub struct CorxBeaconHeader {
	pub soa:f64,
	pub timestamp_sec:u64,
	pub timestamp_msec:u16,
	pub beacon_amplitude:u32,
	pub beacon_noise:u32,
	pub clock_error:f32,
	pub carrier_pos:f32,
	pub carrier_amplitude:u32,
	pub preamp_on:bool,
}

/// Frames CORX records into a byte stream: little-endian, IEEE-754,
/// packed field by field (no struct transmutes). A writer without a sink
/// is "void": every write is a no-op, which lets the pipeline run for its
/// log output alone.
pub struct CorxWriter<W: Write> {
	out:Option<W>,
	slice_size:u16,
}

impl<W: Write> CorxWriter<W> {

	pub fn new(out:Option<W>) -> Self { Self{ out, slice_size: 0 } }

	pub fn is_void(&self) -> bool { self.out.is_none() }

	pub fn into_inner(self) -> Option<W> { self.out }

	pub fn write_file_header(&mut self, header:&CorxFileHeader) -> io::Result<()> {
		let out = match self.out.as_mut() { Some(o) => o, None => return Ok(()) };
		out.write_all(b"CORX")?;
		out.write_u8(CORX_VERSION)?;
		out.write_u16::<LittleEndian>(header.slice_start)?;
		out.write_u16::<LittleEndian>(header.slice_size)?;
		self.slice_size = header.slice_size;
		Ok(())
	}

	pub fn write_cycle_start(&mut self, header:&CorxBeaconHeader) -> io::Result<()> {
		let out = match self.out.as_mut() { Some(o) => o, None => return Ok(()) };
		out.write_f64::<LittleEndian>(header.soa)?;
		out.write_u64::<LittleEndian>(header.timestamp_sec)?;
		out.write_u16::<LittleEndian>(header.timestamp_msec)?;
		out.write_u32::<LittleEndian>(header.beacon_amplitude)?;
		out.write_u32::<LittleEndian>(header.beacon_noise)?;
		out.write_f32::<LittleEndian>(header.clock_error)?;
		out.write_f32::<LittleEndian>(header.carrier_pos)?;
		out.write_u32::<LittleEndian>(header.carrier_amplitude)?;
		out.write_u8(header.preamp_on as u8)?;
		Ok(())
	}

	pub fn write_cycle_block(&mut self, phase_error:i8, data:&[Complex<f32>]) -> io::Result<()> {
		if self.out.is_none() { return Ok(()); }
		assert_eq!(data.len(), self.slice_size as usize);
		assert!(phase_error != CYCLE_STOP);
		self.write_block_internal(phase_error, data)
	}

	pub fn write_cycle_stop(&mut self) -> io::Result<()> {
		if self.out.is_none() { return Ok(()); }
		self.write_block_internal(CYCLE_STOP, &[])
	}

	pub fn flush(&mut self) -> io::Result<()> {
		match self.out.as_mut() {
			Some(out) => out.flush(),
			None => Ok(()),
		}
	}

	fn write_block_internal(&mut self, phase_error:i8, data:&[Complex<f32>]) -> io::Result<()> {
		let out = self.out.as_mut().unwrap();
		out.write_i8(phase_error)?;
		for c in data {
			out.write_f32::<LittleEndian>(c.re)?;
			out.write_f32::<LittleEndian>(c.im)?;
		}
		Ok(())
	}

}
