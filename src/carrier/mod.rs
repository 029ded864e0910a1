
use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::{FFT, FFTplanner};
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::dsp::{self, DeciAngle};

pub const MAX_TRACKING_ANGLE_DIFF:f32 = 50.0;
pub const TRACKING_ANGLE_DIFF_FACTOR:f32 = 0.2;
pub const AVG_ANGLE_WEIGHT:f32 = 0.1;
pub const AVG_DCAMPL_WEIGHT:f32 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct CarrierDetection {
	pub detected:bool,
	pub argmax:usize,
	pub max_power:f32,
	pub noise_power:f32,
}

/// Coarse carrier detection on a raw block: power FFT, peak search over
/// the configured window of signed bins, and a constant-plus-SNR
/// threshold test.
pub struct CarrierDetector {
	block_len:usize,
	threshold_const:f32,
	threshold_snr:f32,
	window:Option<(i32, i32)>,
	fft:Arc<dyn FFT<f32>>,
	fft_in:Vec<Complex<f32>>,
	fft_out:Vec<Complex<f32>>,
	fft_power:Vec<f32>,
}

impl CarrierDetector {

	pub fn new(block_len:usize, threshold:(f32, f32), window:Option<(i32, i32)>) -> Self {
		let mut planner = FFTplanner::new(false);
		let fft = planner.plan_fft(block_len);
		Self{
			block_len,
			threshold_const: threshold.0,
			threshold_snr: threshold.1,
			window,
			fft,
			fft_in: vec![Complex::zero(); block_len],
			fft_out: vec![Complex::zero(); block_len],
			fft_power: vec![0.0; block_len],
		}
	}

	pub fn fft_power(&self) -> &[f32] { &self.fft_power }

	/// Power at argmax-1, argmax, argmax+1 with wrap-around, for sub-bin
	/// refinement.
	pub fn power_around(&self, argmax:usize) -> (f32, f32, f32) {
		let n = self.block_len;
		(self.fft_power[(argmax + n - 1) % n],
		 self.fft_power[argmax],
		 self.fft_power[(argmax + 1) % n])
	}

	pub fn process(&mut self, samples:&[Complex<f32>]) -> CarrierDetection {
		self.fft_in.copy_from_slice(samples);
		self.fft.process(&mut self.fft_in, &mut self.fft_out);
		for (p, c) in self.fft_power.iter_mut().zip(self.fft_out.iter()) {
			*p = c.norm_sqr();
		}

		let n = self.block_len as i32;
		let (lo, hi) = match self.window {
			Some((lo, hi)) => (lo.max(-n/2), hi.min(n/2 - 1)),
			None => (-n/2, n/2 - 1),
		};

		let mut argmax = 0usize;
		let mut max_power = 0.0f32;
		let mut total_power = 0.0f32;
		let mut count = 0usize;
		for bin in lo..=hi {
			let idx = if bin < 0 { (n + bin) as usize } else { bin as usize };
			let p = self.fft_power[idx];
			total_power += p;
			count += 1;
			if p > max_power {
				max_power = p;
				argmax = idx;
			}
		}

		let noise_power = if count > 1 { (total_power - max_power) / (count - 1) as f32 } else { 0.0 };
		let detected = max_power > self.threshold_const + self.threshold_snr * noise_power;

		CarrierDetection{ detected, argmax, max_power, noise_power }
	}

}

#[derive(Debug, Clone, Default)]
pub struct CarrierState {
	pub acquired:bool,
	/// Signed position of the carrier in FFT bins, in (-block_len/2, block_len/2].
	pub pos_bins:f32,
	/// Phase of the first sample of the current block; keeps the NCO
	/// phase-continuous across block boundaries.
	pub sample_phase:DeciAngle,
	pub dc_angle:DeciAngle,
	pub prev_dc_angle:DeciAngle,
	pub dc_ampl:f32,
	pub avg_dc_angle:f32,
	pub avg_dc_ampl:f32,
	pub tracking_losses:u32,
}

/// Carrier acquisition and tracking. Once acquired, each block is shifted
/// to baseband with the running frequency/phase estimate and the residual
/// DC phase drives a first-order correction of `pos_bins`.
pub struct CarrierTracker {
	block_len:usize,
	history_len:usize,
	detector:CarrierDetector,
	pub state:CarrierState,
}

impl CarrierTracker {

	pub fn new(block_len:usize, history_len:usize, threshold:(f32, f32),
	           window:Option<(i32, i32)>) -> Self {
		Self{
			block_len,
			history_len,
			detector: CarrierDetector::new(block_len, threshold, window),
			state: CarrierState::default(),
		}
	}

	pub fn is_acquired(&self) -> bool { self.state.acquired }

	fn sync(&mut self, raw:&[Complex<f32>], synced:&mut [Complex<f32>]) {
		synced.copy_from_slice(raw);
		dsp::freq_shift(synced, -self.state.pos_bins, self.state.sample_phase);
		let dc = dsp::calculate_dc(synced);
		self.state.dc_ampl = dc.norm();
		self.state.dc_angle = dsp::normalize_deciangle(dc.arg() / (2.0 * PI));
	}

	/// Track (or acquire) the carrier on one raw block. On success,
	/// `synced` holds the baseband-corrected block and the tracker state
	/// has been advanced; returns false if no carrier is available.
	pub fn feed(&mut self, raw:&[Complex<f32>], synced:&mut [Complex<f32>], block_idx:u64) -> bool {
		let mut produced = false;

		if self.state.acquired {
			self.state.prev_dc_angle = self.state.dc_angle;
			self.sync(raw, synced);

			let angle_diff = dsp::normalize_deciangle(self.state.dc_angle - self.state.prev_dc_angle);
			if angle_diff.abs() * 360.0 > MAX_TRACKING_ANGLE_DIFF {
				self.state.acquired = false;
				self.state.tracking_losses += 1;
				eprintln!("block #{}: tracking loop failed", block_idx);
			} else {
				self.state.pos_bins += angle_diff * TRACKING_ANGLE_DIFF_FACTOR;
				produced = true;
			}
		}

		if !self.state.acquired {
			let det = self.detector.process(raw);
			if det.detected {
				let (y_m1, y0, y_p1) = self.detector.power_around(det.argmax);
				let carrier_offset = dsp::interpolate_parabolic(y_m1, y0, y_p1);
				let mut pos = det.argmax as f32 + carrier_offset;
				if pos > (self.block_len / 2) as f32 {
					pos -= self.block_len as f32;
				}
				self.state.pos_bins = pos;
				self.state.acquired = true;
				eprintln!("block #{}: detected carrier @ {:.3}; power {:.1} / noise {:.1}",
					block_idx, pos, det.max_power, det.noise_power);

				self.sync(raw, synced);
				produced = true;
			} else {
				eprintln!("block #{}: no carrier detected", block_idx);
			}
		}

		if produced {
			let overlap = 1.0 - (self.history_len as f32) / (self.block_len as f32);
			self.state.sample_phase = dsp::normalize_deciangle(
				self.state.sample_phase - self.state.pos_bins * overlap);
			self.state.avg_dc_angle = self.state.dc_angle * AVG_ANGLE_WEIGHT
				+ self.state.avg_dc_angle * (1.0 - AVG_ANGLE_WEIGHT);
			self.state.avg_dc_ampl = self.state.dc_ampl * AVG_DCAMPL_WEIGHT
				+ self.state.avg_dc_ampl * (1.0 - AVG_DCAMPL_WEIGHT);
		}

		produced
	}

}

/// Clock error relative to the reference transmitter, from the carrier's
/// position in the spectrum. Assumes the downconverter and the ADC share
/// a coherent local oscillator.
pub fn estimate_clock_error(pos_bins:f32, sample_rate:f64, block_len:usize,
                            carrier_ref:f32, sdr_freq:f64) -> f32 {
	((pos_bins as f64 * sample_rate / block_len as f64 - carrier_ref as f64) / sdr_freq) as f32
}
