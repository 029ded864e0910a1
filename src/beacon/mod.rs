
use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use rustfft::{FFT, FFTplanner};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::dsp;
use crate::ReceiverError;

pub const BEACON_INTERVAL_SEC:f64 = 1.0;

/// Load a beacon template: "CTPL" magic, u32 LE sample count, f32 LE
/// samples.
pub fn load_template(path:&str) -> Result<Vec<f32>, ReceiverError> {
	let mut f = BufReader::new(File::open(path).map_err(|e| {
		ReceiverError::Config(format!("unable to open template '{}': {}", path, e))
	})?);
	let mut magic = [0u8; 4];
	f.read_exact(&mut magic)?;
	if &magic != b"CTPL" {
		return Err(ReceiverError::Config(format!("'{}' is not a template file", path)));
	}
	let len = f.read_u32::<LittleEndian>()? as usize;
	let mut samples = vec![0.0f32; len];
	f.read_f32_into::<LittleEndian>(&mut samples)?;
	Ok(samples)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CorrDetection {
	pub detected:bool,
	pub peak_idx:usize,
	/// Sub-sample refinement of the peak position, in (-0.5, 0.5).
	pub peak_offset:f32,
	pub peak_power:f32,
	pub noise_power:f32,
}

/// Correlates the FFT of a synced block against a known pulse template.
/// The template is zero-padded to the block length, transformed once and
/// conjugated; detection is then a multiply, an inverse FFT and a peak
/// search over the positions where a whole pulse fits in the fresh part
/// of the block.
pub struct CorrDetector {
	corr_len:usize,
	threshold_const:f32,
	threshold_snr:f32,
	template_fft_conj:Vec<Complex<f32>>,
	ifft:Arc<dyn FFT<f32>>,
	ifft_in:Vec<Complex<f32>>,
	corr:Vec<Complex<f32>>,
	corr_power:Vec<f32>,
}

impl CorrDetector {

	pub fn new(template:Vec<f32>, block_len:usize, history_len:usize,
	           threshold_const:f32, threshold_snr:f32) -> Result<Self, &'static str> {
		let corr_len = block_len - history_len + 1;
		if template.len() != corr_len {
			return Err("template length does not match block geometry");
		}

		let mut template_time:Vec<Complex<f32>> = template.into_iter()
			.map(|x| Complex{ re: x, im: 0.0 })
			.chain(std::iter::repeat(Complex::zero()))
			.take(block_len)
			.collect();
		let mut template_fft = vec![Complex::zero(); block_len];
		let mut planner = FFTplanner::new(false);
		let fft = planner.plan_fft(block_len);
		fft.process(&mut template_time, &mut template_fft);
		let template_fft_conj:Vec<Complex<f32>> = template_fft.iter().map(|c| c.conj()).collect();

		let mut inv_planner = FFTplanner::new(true);
		let ifft = inv_planner.plan_fft(block_len);

		Ok(Self{
			corr_len,
			threshold_const,
			threshold_snr,
			template_fft_conj,
			ifft,
			ifft_in: vec![Complex::zero(); block_len],
			corr: vec![Complex::zero(); block_len],
			corr_power: vec![0.0; block_len],
		})
	}

	/// Correlation detection on the FFT of a synced block. The
	/// `signal_energy` argument is accepted for threshold shaping but the
	/// noise estimate is taken from the correlation floor itself, so a
	/// caller passing 0 gets a usable threshold.
	pub fn detect(&mut self, synced_fft:&[Complex<f32>], _signal_energy:f32) -> CorrDetection {
		let block_len = self.template_fft_conj.len();
		for i in 0..block_len {
			self.ifft_in[i] = synced_fft[i] * self.template_fft_conj[i];
		}
		self.ifft.process(&mut self.ifft_in, &mut self.corr);
		let scale = 1.0 / (block_len as f32);
		for i in 0..block_len {
			self.corr[i] = self.corr[i] * scale;
			self.corr_power[i] = self.corr[i].norm_sqr();
		}

		let mut peak_idx = 0usize;
		let mut peak_power = 0.0f32;
		let mut total_power = 0.0f32;
		for (i, p) in self.corr_power[..self.corr_len].iter().enumerate() {
			total_power += p;
			if *p > peak_power {
				peak_power = *p;
				peak_idx = i;
			}
		}
		let noise_power = if self.corr_len > 1 {
			(total_power - peak_power) / (self.corr_len - 1) as f32
		} else { 0.0 };

		let detected = peak_power > self.threshold_const + self.threshold_snr * noise_power;

		let peak_offset = if peak_idx > 0 && peak_idx + 1 < self.corr_len {
			dsp::interpolate_parabolic(
				self.corr_power[peak_idx - 1],
				self.corr_power[peak_idx],
				self.corr_power[peak_idx + 1])
		} else { 0.0 };

		CorrDetection{ detected, peak_idx, peak_offset, peak_power, noise_power }
	}

}

#[derive(Debug, Clone)]
pub struct BeaconState {
	/// Number of the last beacon pulse received; -1 before the first.
	pub index:i32,
	/// Sample-of-arrival: global sample index of the beacon peak,
	/// referenced to the first new sample of block 0.
	pub soa:f64,
	pub prev_soa:f64,
	pub clock_error:f32,
	/// Correlation cycle within the current beacon interval; -1 when not
	/// emitting cycles.
	pub cycle:i32,
	pub num_phase_errors:u32,
}

impl Default for BeaconState {
	fn default() -> Self {
		Self{ index: -1, soa: 0.0, prev_soa: 0.0, clock_error: 0.0, cycle: -1, num_phase_errors: 0 }
	}
}

/// Beacon detection on synced blocks: owns the block-length FFT, the
/// correlator and the arrival bookkeeping.
pub struct BeaconDetector {
	corr:CorrDetector,
	fft:Arc<dyn FFT<f32>>,
	fft_in:Vec<Complex<f32>>,
	fft_out:Vec<Complex<f32>>,
	stride:usize,
	sample_rate:f64,
	pub state:BeaconState,
}

impl BeaconDetector {

	pub fn new(template:Vec<f32>, block_len:usize, history_len:usize,
	           threshold:(f32, f32), sample_rate:f64) -> Result<Self, &'static str> {
		let corr = CorrDetector::new(template, block_len, history_len, threshold.0, threshold.1)?;
		let mut planner = FFTplanner::new(false);
		let fft = planner.plan_fft(block_len);
		Ok(Self{
			corr,
			fft,
			fft_in: vec![Complex::zero(); block_len],
			fft_out: vec![Complex::zero(); block_len],
			stride: block_len - history_len,
			sample_rate,
			state: BeaconState::default(),
		})
	}

	/// Correlate one synced block against the template. On detection,
	/// updates the sample-of-arrival and the beacon index (jumping ahead
	/// when pulses were missed).
	pub fn find_beacon(&mut self, synced:&[Complex<f32>], block_idx:u64) -> CorrDetection {
		self.fft_in.copy_from_slice(synced);
		self.fft.process(&mut self.fft_in, &mut self.fft_out);

		// The signal energy input of the correlator is not populated by
		// this pipeline; the detector derives its noise floor internally.
		let det = self.corr.detect(&self.fft_out, 0.0);

		if det.detected {
			self.state.prev_soa = self.state.soa;
			self.state.soa = (self.stride as f64) * (block_idx as f64)
				+ det.peak_idx as f64 + det.peak_offset as f64;
			let time_step = (self.state.soa - self.state.prev_soa) / self.sample_rate;

			if self.state.index > 0 && time_step > 1.5 * BEACON_INTERVAL_SEC {
				// Missed one or more pulses; recover the index from the
				// sample timeline.
				eprintln!("beacon: large time step ({:.1} s)", time_step);
				self.state.index += time_step.round() as i32;
			} else {
				self.state.index += 1;
			}

			eprintln!("beacon #{}: soa = {:.3}; timestep = {:.3}",
				self.state.index, self.state.soa, time_step);
		}

		det
	}

}
