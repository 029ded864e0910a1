
use std::io::{self, Write};
use std::sync::Arc;

use rustfft::{FFT, FFTplanner};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::beacon::BeaconState;
use crate::carrier::CarrierState;
use crate::corx::CorxWriter;
use crate::dsp::{self, DeciAngle};

use super::ReceiverConfig;

/// Slices the synced signal between beacons into fixed-size cycles,
/// corrects each cycle FFT for residual time and phase offset, and writes
/// the configured frequency slice of every cycle.
pub struct CycleExtractor {
	block_len:usize,
	history_len:usize,
	corr_size:usize,
	skip_beacon_padding:usize,
	num_cycles:i32,
	slice_start:usize,
	slice_len:usize,
	fft:Arc<dyn FFT<f32>>,
	fft_in:Vec<Complex<f32>>,
	cycle_fft:Vec<Complex<f32>>,
}

impl CycleExtractor {

	pub fn new(cfg:&ReceiverConfig) -> Result<Self, String> {
		let corr_size = cfg.corr_size;
		let num_cycles = ((cfg.sample_rate - 2.0 * cfg.skip_beacon_padding as f64)
			/ corr_size as f64).floor() as i32;
		if num_cycles < 1 {
			return Err(format!("no room for correlation cycles: sample_rate {} with padding {}",
				cfg.sample_rate, cfg.skip_beacon_padding));
		}

		let slice_start = cfg.output_window_start.max(0) as usize;
		let slice_len = if cfg.output_window_len <= 0 {
			corr_size
		} else {
			corr_size.min(cfg.output_window_len as usize)
		};
		if slice_start + slice_len > corr_size {
			return Err(format!("output window [{}, {}) does not fit in a {}-sample cycle",
				slice_start, slice_start + slice_len, corr_size));
		}

		let mut planner = FFTplanner::new(false);
		let fft = planner.plan_fft(corr_size);

		Ok(Self{
			block_len: cfg.block_len,
			history_len: cfg.history_len,
			corr_size,
			skip_beacon_padding: cfg.skip_beacon_padding,
			num_cycles,
			slice_start,
			slice_len,
			fft,
			fft_in: vec![Complex::zero(); corr_size],
			cycle_fft: vec![Complex::zero(); corr_size],
		})
	}

	pub fn num_cycles(&self) -> i32 { self.num_cycles }
	pub fn slice_start(&self) -> usize { self.slice_start }
	pub fn slice_len(&self) -> usize { self.slice_len }

	/// Extract as many cycles as fit in this block. Returns the number of
	/// cycle blocks written; when the last cycle of the beacon interval
	/// has been emitted, closes the run (`cycle := -1`, cycle-stop).
	pub fn extract<W: Write>(&mut self, synced:&[Complex<f32>], beacon:&mut BeaconState,
	                         carrier:&CarrierState, block_idx:u64,
	                         writer:&mut CorxWriter<W>) -> io::Result<u32> {
		let stride = (self.block_len - self.history_len) as f64;
		let mut written = 0u32;
		debug_assert!(beacon.cycle >= 0);

		while beacon.cycle < self.num_cycles {
			// Position of the first sample of this cycle within the block,
			// on the reference transmitter's timeline.
			let start = beacon.soa
				+ ((self.skip_beacon_padding + beacon.cycle as usize * self.corr_size) as f64)
					* (1.0 - beacon.clock_error as f64)
				- (block_idx as f64) * stride;
			let start_idx = start.round() as i64;

			if start_idx < 0 || (start_idx as usize) + self.corr_size > self.block_len {
				// Cycle straddles the block boundary; resume next block
				return Ok(written);
			}
			let start_idx = start_idx as usize;

			self.fft_in.copy_from_slice(&synced[start_idx..start_idx + self.corr_size]);
			self.fft.process(&mut self.fft_in, &mut self.cycle_fft);

			// Correct for the sub-sample time offset and the carrier phase
			let shift_bins = (start - start_idx as f64) as f32;
			let carrier_offset = -(carrier.pos_bins * self.corr_size as f32
				/ self.block_len as f32).round() as i32;
			dsp::fft_shift(&mut self.cycle_fft, shift_bins, -carrier.avg_dc_angle, carrier_offset);

			let error:DeciAngle = self.cycle_fft[0].arg() / (2.0 * std::f32::consts::PI);
			if error.abs() > 0.2 {
				beacon.num_phase_errors += 1;
			}
			let error_code = (error * 254.0).round().max(-127.0).min(127.0) as i8;

			writer.write_cycle_block(error_code,
				&self.cycle_fft[self.slice_start..self.slice_start + self.slice_len])?;
			written += 1;
			beacon.cycle += 1;
		}

		beacon.cycle = -1;
		writer.write_cycle_stop()?;
		if beacon.num_phase_errors > 0 {
			eprintln!("beacon #{}: {} / {} cycles have a large phase error",
				beacon.index, beacon.num_phase_errors, self.num_cycles);
		}
		Ok(written)
	}

}
