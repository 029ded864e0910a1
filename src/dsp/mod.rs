
use std::f32::consts::PI;

use rustfft::num_complex::Complex;

/// An angle expressed in turns, normalised to the half-open interval
/// [-0.5, 0.5). Storing angles this way means small deltas can be added
/// without ever leaving the natural range.
pub type DeciAngle = f32;

pub fn normalize_deciangle(angle:DeciAngle) -> DeciAngle {
	// round() breaks ties away from zero, which would map exact negative
	// halves to +0.5; fold those back so the range stays half-open.
	let wrapped = angle - angle.round();
	if wrapped >= 0.5 { wrapped - 1.0 } else { wrapped }
}

// The incremental phasor accumulates rounding error as it is multiplied
// up; renormalising at this interval keeps the amplitude error below 1e-4
// even on runs of tens of millions of samples.
const NCO_RENORM_INTERVAL:u32 = 16384;

/// Numerically controlled oscillator: an incrementally updated complex
/// phasor, advanced by one multiplication per sample. The phasor runs at
/// double precision so per-step rounding cannot walk the phase off within
/// a block.
pub struct Nco {
	phasor:Complex<f64>,
	step:Complex<f64>,
	since_renorm:u32,
}

impl Nco {

	pub fn new(phase_rad:f32, step_rad:f32) -> Self {
		Self{
			phasor: Complex{ re: (phase_rad as f64).cos(), im: (phase_rad as f64).sin() },
			step:   Complex{ re: (step_rad as f64).cos(),  im: (step_rad as f64).sin()  },
			since_renorm: 0,
		}
	}

	pub fn adjust_phase(&mut self, delta_rad:f32) {
		self.phasor = self.phasor * Complex{ re: (delta_rad as f64).cos(), im: (delta_rad as f64).sin() };
	}

	/// Multiply each sample by the oscillator, advancing one step per sample.
	pub fn mix(&mut self, signal:&mut [Complex<f32>]) {
		for s in signal.iter_mut() {
			let p = Complex{ re: self.phasor.re as f32, im: self.phasor.im as f32 };
			*s = *s * p;
			self.phasor = self.phasor * self.step;
			self.since_renorm += 1;
			if self.since_renorm >= NCO_RENORM_INTERVAL {
				self.phasor = self.phasor / self.phasor.norm();
				self.since_renorm = 0;
			}
		}
	}

}

/// Apply a frequency and phase shift to the given signal, in place.
/// `shift_bins` is expressed in FFT bins of `signal.len()`.
pub fn freq_shift(signal:&mut [Complex<f32>], shift_bins:f32, phase:DeciAngle) {
	let len = signal.len() as f32;
	let mut nco = Nco::new(2.0 * PI * phase, 2.0 * PI * shift_bins / len);
	nco.mix(signal);
}

/// Like freq_shift, but for an FFT-domain buffer: accounts for the
/// discontinuity between the positive-frequency half (starting at index 0)
/// and the negative-frequency half by rewinding the oscillator one full
/// cycle of `shift_bins` at the split.
pub fn fft_shift(signal:&mut [Complex<f32>], shift_bins:f32, phase:DeciAngle, carrier_offset:i32) {
	let len = signal.len();
	let pos_len_signed = ((len + 1) / 2) as i64 + carrier_offset as i64;
	let pos_len = pos_len_signed.max(0).min(len as i64) as usize;

	let mut nco = Nco::new(2.0 * PI * phase, 2.0 * PI * shift_bins / (len as f32));
	nco.mix(&mut signal[..pos_len]);
	nco.adjust_phase(-2.0 * PI * shift_bins);
	nco.mix(&mut signal[pos_len..]);
}

/// Unnormalised DC component (complex sum) of a signal. For a
/// baseband-corrected block its magnitude and argument track the carrier
/// amplitude and phase.
pub fn calculate_dc(signal:&[Complex<f32>]) -> Complex<f32> {
	signal.iter().fold(Complex{ re: 0.0, im: 0.0 }, |acc, s| acc + s)
}

/// Sub-sample refinement of a peak location from the three power values
/// around it. Returns the vertex offset of the fitted parabola, in
/// (-0.5, 0.5] for a true local maximum at y0.
pub fn interpolate_parabolic(y_m1:f32, y0:f32, y_p1:f32) -> f32 {
	let denom = y_m1 - 2.0*y0 + y_p1;
	if denom == 0.0 { 0.0 } else { 0.5 * (y_m1 - y_p1) / denom }
}

#[cfg(test)]
mod tests {

	use super::*;

	fn tone(len:usize, freq_bins:f32) -> Vec<Complex<f32>> {
		(0..len).map(|i| {
			let phase = 2.0 * PI * freq_bins * (i as f32) / (len as f32);
			Complex{ re: phase.cos(), im: phase.sin() }
		}).collect()
	}

	#[test]
	fn normalize_is_idempotent() {
		for x in &[-1.75f32, -0.5, -0.25, 0.0, 0.25, 0.49, 0.5, 3.2] {
			let once = normalize_deciangle(*x);
			assert!(once >= -0.5 && once < 0.5, "normalize({}) = {} out of range", x, once);
			assert_eq!(normalize_deciangle(once), once);
		}
	}

	#[test]
	fn freq_shift_round_trip() {
		let original = tone(256, 3.7);
		let mut signal = original.clone();
		freq_shift(&mut signal, 12.3, 0.17);
		freq_shift(&mut signal, -12.3, -0.17);
		for (a, b) in original.iter().zip(signal.iter()) {
			assert!((a - b).norm() < 1e-5, "round trip error {} vs {}", a, b);
		}
	}

	#[test]
	fn freq_shift_matches_direct_evaluation() {
		let original = tone(512, -7.25);
		let mut signal = original.clone();
		freq_shift(&mut signal, 4.5, -0.3);
		for (i, (src, dst)) in original.iter().zip(signal.iter()).enumerate() {
			let phase = 2.0 * PI * (4.5 * (i as f32) / 512.0 - 0.3);
			let expected = src * Complex{ re: phase.cos(), im: phase.sin() };
			assert!((dst - expected).norm() < 1e-4);
		}
	}

	#[test]
	fn fft_shift_zero_is_identity() {
		let original = tone(255, 9.0);
		let mut signal = original.clone();
		fft_shift(&mut signal, 0.0, 0.0, 0);
		for (a, b) in original.iter().zip(signal.iter()) {
			assert!((a - b).norm() < 1e-6);
		}
	}

	#[test]
	fn fft_shift_splits_at_pos_len() {
		// With carrier_offset = 0 the split sits at (len+1)/2 for both
		// parities: the first negative-frequency sample picks up the
		// rewound oscillator phase.
		for &len in &[8usize, 9] {
			let original = vec![Complex{ re: 1.0, im: 0.0 }; len];
			let mut signal = original.clone();
			let shift = 1.5f32;
			fft_shift(&mut signal, shift, 0.0, 0);
			let pos_len = (len + 1) / 2;
			for i in 0..len {
				let mut phase = 2.0 * PI * shift * (i as f32) / (len as f32);
				if i >= pos_len { phase -= 2.0 * PI * shift; }
				let expected = Complex{ re: phase.cos(), im: phase.sin() };
				assert!((signal[i] - expected).norm() < 1e-4,
					"len {} idx {}: {} vs {}", len, i, signal[i], expected);
			}
		}
	}

	#[test]
	fn dc_of_constant_signal() {
		let signal = vec![Complex{ re: 0.5, im: -0.25 }; 64];
		let dc = calculate_dc(&signal);
		assert!((dc.re - 32.0).abs() < 1e-4);
		assert!((dc.im + 16.0).abs() < 1e-4);
	}

	#[test]
	fn parabolic_recovers_vertex() {
		// Parabola y = 1 - (x - 0.3)^2 sampled at -1, 0, +1.
		let y = |x:f32| 1.0 - (x - 0.3)*(x - 0.3);
		let offset = interpolate_parabolic(y(-1.0), y(0.0), y(1.0));
		assert!((offset - 0.3).abs() < 1e-6);
		assert_eq!(interpolate_parabolic(1.0, 1.0, 1.0), 0.0);
	}

	#[test]
	fn nco_amplitude_stays_bounded() {
		let mut nco = Nco::new(0.0, 0.01);
		let mut signal = vec![Complex{ re: 1.0, im: 0.0 }; 1000];
		for _ in 0..100 {
			for s in signal.iter_mut() { *s = Complex{ re: 1.0, im: 0.0 }; }
			nco.mix(&mut signal);
		}
		for s in signal.iter() {
			assert!((s.norm() - 1.0).abs() < 1e-4);
		}
	}

}
