
use std::io::Write;

use colored::*;
use serde::Serialize;

use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;

use crate::beacon::BeaconDetector;
use crate::carrier::{self, CarrierTracker};
use crate::corx::{CorxBeaconHeader, CorxFileHeader, CorxWriter};
use crate::dsp;
use crate::io::SampleSource;
use crate::{ReceiverError, SampleBlock};

pub mod extract;

use self::extract::CycleExtractor;

/// A beacon pulse transiently suppresses the running carrier amplitude;
/// the correlator is only invoked when the DC amplitude dips below this
/// fraction of its running average.
pub const BEACON_CARRIER_TRIGGER_FACTOR:f32 = 0.8;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
	pub block_len:usize,
	pub history_len:usize,
	pub sample_rate:f64,
	pub sdr_freq:f64,
	/// Expected frequency offset of the reference carrier in Hz, used as
	/// the reference for the clock-error estimate.
	pub carrier_ref:f32,
	/// Number of blocks to discard before searching for the carrier.
	pub skip:u32,
	pub carrier_threshold:(f32, f32),
	pub carrier_window:Option<(i32, i32)>,
	pub corr_threshold:(f32, f32),
	pub corr_size:usize,
	/// Samples to skip between a beacon pulse and the first cycle.
	pub skip_beacon_padding:usize,
	pub output_window_start:i32,
	/// Non-positive means "full corr_size".
	pub output_window_len:i32,
	/// Seconds of capture after the first beacon detection.
	pub max_capture_time:f64,
	/// Seconds of additional capture with the preamp switched off.
	pub preamp_off_time:f64,
	/// Seconds of data to discard right after the preamp switches off.
	pub preamp_off_skip:f64,
	pub rxid:i32,
}

impl Default for ReceiverConfig {
	fn default() -> Self {
		Self{
			block_len: 16384,
			history_len: 5250,
			sample_rate: 2.4e6,
			sdr_freq: 433.83e6,
			carrier_ref: -277800.0,
			skip: 1,
			carrier_threshold: (100.0, 2.0),
			carrier_window: None,
			corr_threshold: (0.0, 15.0),
			corr_size: 1024,
			skip_beacon_padding: 6000,
			output_window_start: 0,
			output_window_len: -1,
			max_capture_time: 10.1,
			preamp_off_time: 2.0,
			preamp_off_skip: 0.2,
			rxid: -1,
		}
	}
}

/// Parse a detection threshold of the form `<constant>c<snr>s`, where
/// either part may be omitted (e.g. "15s", "4c", "4c7.5s").
pub fn parse_threshold(s:&str) -> Result<(f32, f32), ReceiverError> {
	let bad = || ReceiverError::Config(format!("invalid threshold '{}'", s));
	let mut constant = 0.0f32;
	let mut snr = 0.0f32;
	let mut rest = s;
	if let Some(pos) = rest.find('c') {
		constant = rest[..pos].parse().map_err(|_| bad())?;
		rest = &rest[pos+1..];
	}
	if !rest.is_empty() {
		if !rest.ends_with('s') { return Err(bad()); }
		snr = rest[..rest.len()-1].parse().map_err(|_| bad())?;
	}
	Ok((constant, snr))
}

/// Parse a carrier search window of the form `<lo>:<hi>` in signed bins.
pub fn parse_window(s:&str) -> Result<(i32, i32), ReceiverError> {
	let bad = || ReceiverError::Config(format!("invalid carrier window '{}'", s));
	let mut parts = s.splitn(2, ':');
	let lo:i32 = parts.next().ok_or_else(&bad)?.parse().map_err(|_| bad())?;
	let hi:i32 = parts.next().ok_or_else(&bad)?.parse().map_err(|_| bad())?;
	if lo > hi { return Err(bad()); }
	Ok((lo, hi))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resume {
	Search,
	CaptureOff,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PipelineState {
	Skip{ remaining:u32, then:Resume },
	Search,
	CaptureOn,
	CaptureOff,
	Stop,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineStats {
	pub rxid:i32,
	pub blocks:u64,
	pub beacons:u32,
	pub cycle_runs:u32,
	pub cycles:u64,
	pub tracking_losses:u32,
}

/// The per-receiver online pipeline: pulls blocks from the source and
/// drives carrier tracking, beacon correlation, cycle extraction and the
/// CORX writer through the capture state machine.
pub struct Pipeline<S: SampleSource, W: Write> {
	cfg:ReceiverConfig,
	source:S,
	tracker:CarrierTracker,
	beacon:BeaconDetector,
	extractor:CycleExtractor,
	writer:CorxWriter<W>,
	state:PipelineState,
	block:SampleBlock,
	synced:Vec<Complex<f32>>,
	block_idx:u64,
	last_block:Option<u64>,
	preamp_off_block:Option<u64>,
	stats:PipelineStats,
}

impl<S: SampleSource, W: Write> Pipeline<S, W> {

	pub fn new(cfg:ReceiverConfig, template:Vec<f32>, source:S,
	           writer:CorxWriter<W>) -> Result<Self, ReceiverError> {
		let tracker = CarrierTracker::new(cfg.block_len, cfg.history_len,
			cfg.carrier_threshold, cfg.carrier_window);
		let beacon = BeaconDetector::new(template, cfg.block_len, cfg.history_len,
			cfg.corr_threshold, cfg.sample_rate)
			.map_err(|e| ReceiverError::Config(e.to_string()))?;
		let extractor = CycleExtractor::new(&cfg).map_err(ReceiverError::Config)?;

		let state = if cfg.skip > 0 {
			PipelineState::Skip{ remaining: cfg.skip, then: Resume::Search }
		} else {
			PipelineState::Search
		};

		let block = SampleBlock::new(cfg.block_len);
		let synced = vec![Complex::zero(); cfg.block_len];
		let stats = PipelineStats{ rxid: cfg.rxid, ..PipelineStats::default() };

		Ok(Self{
			cfg, source, tracker, beacon, extractor, writer,
			state, block, synced,
			block_idx: 0, last_block: None, preamp_off_block: None,
			stats,
		})
	}

	pub fn stats(&self) -> &PipelineStats { &self.stats }

	fn stride(&self) -> f64 { (self.cfg.block_len - self.cfg.history_len) as f64 }

	fn seconds_to_blocks(&self, seconds:f64) -> u64 {
		(seconds * self.cfg.sample_rate / self.stride()) as u64
	}

	/// Run the pipeline until the capture window closes or the source is
	/// exhausted or cancelled. Always terminates the file with a
	/// cycle-stop if a cycle run is open, even on error.
	pub fn run(&mut self) -> Result<(), ReceiverError> {
		self.writer.write_file_header(&CorxFileHeader{
			slice_start: self.extractor.slice_start() as u16,
			slice_size: self.extractor.slice_len() as u16,
		})?;

		if self.source.set_bias_tee(true) {
			eprintln!("enabled bias tee");
		}

		loop {
			match self.next() {
				Ok(true) => (),
				Ok(false) => return Ok(()),
				Err(e) => {
					let _ = self.finish();
					return Err(e);
				},
			}
		}
	}

	/// Process one block. Returns Ok(false) once the pipeline has stopped.
	fn next(&mut self) -> Result<bool, ReceiverError> {
		if self.state == PipelineState::Stop {
			return Ok(false);
		}

		if self.preamp_off_block == Some(self.block_idx) {
			eprintln!("{}", format!("block #{}: switching off preamp", self.block_idx).yellow());
			self.close_cycle_run()?;
			if self.source.set_bias_tee(false) {
				eprintln!("disabled bias tee");
			}
			let skip = self.seconds_to_blocks(self.cfg.preamp_off_skip) as u32;
			eprintln!("skipping {} blocks", skip);
			self.state = if skip > 0 {
				PipelineState::Skip{ remaining: skip, then: Resume::CaptureOff }
			} else {
				PipelineState::CaptureOff
			};
		}

		if self.last_block == Some(self.block_idx) {
			self.finish()?;
			return Ok(false);
		}

		if !self.source.next_block(&mut self.block)? {
			self.finish()?;
			return Ok(false);
		}
		self.block_idx += 1;
		self.stats.blocks += 1;

		match self.state {
			PipelineState::Skip{ remaining, then } => {
				if remaining <= 1 {
					self.state = match then {
						Resume::Search => PipelineState::Search,
						Resume::CaptureOff => PipelineState::CaptureOff,
					};
				} else {
					self.state = PipelineState::Skip{ remaining: remaining - 1, then };
				}
			},
			PipelineState::Search | PipelineState::CaptureOn => self.process_tracked()?,
			PipelineState::CaptureOff => self.process_noise()?,
			PipelineState::Stop => unreachable!(),
		}

		Ok(true)
	}

	fn process_tracked(&mut self) -> Result<(), ReceiverError> {
		let produced = self.tracker.feed(&self.block.samples, &mut self.synced, self.block_idx);
		if !produced {
			return Ok(());
		}

		if self.beacon.state.cycle == -1
			&& self.tracker.state.dc_ampl
				< self.tracker.state.avg_dc_ampl * BEACON_CARRIER_TRIGGER_FACTOR {

			let det = self.beacon.find_beacon(&self.synced, self.block_idx);
			if det.detected {
				self.stats.beacons += 1;
				self.beacon.state.clock_error = carrier::estimate_clock_error(
					self.tracker.state.pos_bins, self.cfg.sample_rate,
					self.cfg.block_len, self.cfg.carrier_ref, self.cfg.sdr_freq);
				eprintln!("beacon #{}: ppm={:.3}",
					self.beacon.state.index, self.beacon.state.clock_error * 1e6);

				self.beacon.state.cycle = 0;
				self.beacon.state.num_phase_errors = 0;

				if self.beacon.state.index == 0 {
					let horizon = self.cfg.max_capture_time + self.cfg.preamp_off_time;
					self.last_block = Some(self.block_idx + self.seconds_to_blocks(horizon));
					self.preamp_off_block = Some(self.block_idx
						+ self.seconds_to_blocks(self.cfg.max_capture_time));
					eprintln!("{}", format!(
						"block #{}: found first beacon; stopping after {:.1} s (block #{})",
						self.block_idx, horizon, self.last_block.unwrap()).green());
					self.state = PipelineState::CaptureOn;
				}

				let header = CorxBeaconHeader{
					soa: self.beacon.state.soa,
					timestamp_sec: self.block.timestamp.sec,
					timestamp_msec: (self.block.timestamp.usec / 1000) as u16,
					beacon_amplitude: det.peak_power.sqrt() as u32,
					beacon_noise: det.noise_power.sqrt() as u32,
					clock_error: self.beacon.state.clock_error,
					carrier_pos: self.tracker.state.pos_bins,
					carrier_amplitude: self.tracker.state.dc_ampl as u32,
					preamp_on: true,
				};
				self.writer.write_cycle_start(&header)?;
				self.stats.cycle_runs += 1;
			}
		}

		if self.beacon.state.cycle >= 0 {
			let written = self.extractor.extract(&self.synced, &mut self.beacon.state,
				&self.tracker.state, self.block_idx, &mut self.writer)?;
			self.stats.cycles += written as u64;
		}

		Ok(())
	}

	/// Capture with the preamp off: keep shifting with the last known
	/// carrier estimate, no re-acquisition and no beacon search, and emit
	/// noise cycle runs against a synthetic sample-of-arrival.
	fn process_noise(&mut self) -> Result<(), ReceiverError> {
		self.synced.copy_from_slice(&self.block.samples);
		dsp::freq_shift(&mut self.synced, -self.tracker.state.pos_bins,
			self.tracker.state.sample_phase);

		if self.beacon.state.cycle == -1 {
			eprintln!("block #{}: capturing noise: next cycle", self.block_idx);
			self.beacon.state.soa = self.stride() * self.block_idx as f64;
			self.beacon.state.cycle = 0;
			self.beacon.state.num_phase_errors = 0;

			let header = CorxBeaconHeader{
				soa: self.beacon.state.soa,
				timestamp_sec: self.block.timestamp.sec,
				timestamp_msec: (self.block.timestamp.usec / 1000) as u16,
				beacon_amplitude: 0,
				beacon_noise: 0,
				clock_error: self.beacon.state.clock_error,
				carrier_pos: self.tracker.state.pos_bins,
				carrier_amplitude: 0,
				preamp_on: false,
			};
			self.writer.write_cycle_start(&header)?;
			self.stats.cycle_runs += 1;
		}

		let written = self.extractor.extract(&self.synced, &mut self.beacon.state,
			&self.tracker.state, self.block_idx, &mut self.writer)?;
		self.stats.cycles += written as u64;

		Ok(())
	}

	fn close_cycle_run(&mut self) -> Result<(), ReceiverError> {
		if self.beacon.state.cycle >= 0 {
			self.beacon.state.cycle = -1;
			self.writer.write_cycle_stop()?;
		}
		Ok(())
	}

	fn finish(&mut self) -> Result<(), ReceiverError> {
		self.close_cycle_run()?;
		self.writer.flush()?;
		self.stats.tracking_losses = self.tracker.state.tracking_losses;
		self.state = PipelineState::Stop;
		eprintln!("{}", format!("block #{}: capture finished", self.block_idx).red());
		Ok(())
	}

	/// Consume the pipeline and hand back the writer (for sinks that need
	/// to be recovered, e.g. in-memory buffers).
	pub fn into_writer(self) -> CorxWriter<W> { self.writer }

}

#[cfg(test)]
mod tests {

	use super::*;
	use crate::BlockTimestamp;

	const BLOCK_LEN:usize = 1024;
	const HISTORY_LEN:usize = 768;
	const STRIDE:usize = BLOCK_LEN - HISTORY_LEN;
	const SAMPLE_RATE:f64 = 2048.0;
	const CORR_SIZE:usize = 64;
	const FREQ_BINS:f32 = 42.25;

	fn test_config() -> ReceiverConfig {
		ReceiverConfig{
			block_len: BLOCK_LEN,
			history_len: HISTORY_LEN,
			sample_rate: SAMPLE_RATE,
			sdr_freq: 433.83e6,
			// The synthetic tone sits exactly at the nominal offset, so
			// the estimated clock error is ~0 and cycle spacing is exact.
			carrier_ref: (FREQ_BINS as f64 * SAMPLE_RATE / BLOCK_LEN as f64) as f32,
			skip: 1,
			carrier_threshold: (1.0, 10.0),
			carrier_window: None,
			corr_threshold: (0.0, 15.0),
			corr_size: CORR_SIZE,
			skip_beacon_padding: 512,
			output_window_start: 0,
			output_window_len: -1,
			max_capture_time: 2.0,
			preamp_off_time: 1.0,
			preamp_off_skip: 0.25,
			rxid: 7,
		}
	}

	// Balanced +/-1 pseudo-random pulse template
	fn test_template() -> Vec<f32> {
		let len = BLOCK_LEN - HISTORY_LEN + 1;
		let mut seed = 0x2545f491u32;
		let mut template:Vec<f32> = (0..len).map(|_| {
			seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
			if seed & 0x10000 != 0 { 1.0 } else { -1.0 }
		}).collect();
		while template.iter().sum::<f32>() > 1.0 {
			let idx = template.iter().position(|x| *x > 0.0).unwrap();
			template[idx] = -1.0;
		}
		while template.iter().sum::<f32>() < -1.0 {
			let idx = template.iter().position(|x| *x < 0.0).unwrap();
			template[idx] = 1.0;
		}
		template
	}

	// A carrier tone, interrupted once per second: the transmitter keys
	// off the carrier for a short window and sends the template pulse
	// (modulated onto the carrier) in the middle of it, which is what
	// makes the DC amplitude dip below the beacon-search gate. Beacons
	// start a few seconds in so the running DC average has settled.
	fn synthetic_blocks(n_blocks:usize, with_beacons:bool) -> Vec<Vec<Complex<f32>>> {
		let template = test_template();
		let total = n_blocks * STRIDE + STRIDE;
		let carrier = |g:usize| {
			let phase = 2.0 * std::f32::consts::PI * FREQ_BINS * (g as f32) / (BLOCK_LEN as f32);
			Complex{ re: phase.cos(), im: phase.sin() }
		};
		let mut signal:Vec<Complex<f32>> = (0..total).map(carrier).collect();

		if with_beacons {
			let interval = SAMPLE_RATE as usize;
			let mut start = 4 * interval + 500;
			while start + 428 <= total {
				for g in (start - 172)..(start + 428) {
					signal[g] = Complex::zero();
				}
				for (m, t) in template.iter().enumerate() {
					signal[start + m] = carrier(start + m) * (2.0 * t);
				}
				start += interval;
			}
		}

		(0..n_blocks).map(|b| {
			(0..BLOCK_LEN).map(|i| {
				let g = (b * STRIDE + i) as i64 - HISTORY_LEN as i64;
				if g < 0 { Complex::zero() } else { signal[g as usize] }
			}).collect()
		}).collect()
	}

	struct SyntheticSource {
		blocks:Vec<Vec<Complex<f32>>>,
		pos:usize,
		bias_calls:Vec<bool>,
	}

	impl SyntheticSource {
		fn new(blocks:Vec<Vec<Complex<f32>>>) -> Self {
			Self{ blocks, pos: 0, bias_calls: vec![] }
		}
	}

	impl SampleSource for SyntheticSource {
		fn next_block(&mut self, block:&mut SampleBlock) -> Result<bool, ReceiverError> {
			if self.pos >= self.blocks.len() {
				return Ok(false);
			}
			block.idx = self.pos as u64;
			block.timestamp = BlockTimestamp{ sec: 1_600_000_000 + self.pos as u64, usec: 500_000 };
			block.samples.copy_from_slice(&self.blocks[self.pos]);
			self.pos += 1;
			Ok(true)
		}

		fn set_bias_tee(&mut self, on:bool) -> bool {
			self.bias_calls.push(on);
			true
		}
	}

	#[derive(Debug)]
	struct ParsedRun {
		preamp_on:bool,
		beacon_amplitude:u32,
		blocks:usize,
	}

	fn parse_corx(bytes:&[u8], slice_size:usize) -> Vec<ParsedRun> {
		assert!(bytes.len() >= 9);
		assert_eq!(&bytes[..4], b"CORX");
		assert_eq!(bytes[4], 0x01);
		assert_eq!(u16::from_le_bytes([bytes[7], bytes[8]]) as usize, slice_size);

		let mut runs = vec![];
		let mut pos = 9;
		while pos < bytes.len() {
			assert!(pos + 39 <= bytes.len(), "truncated beacon header");
			let beacon_amplitude = u32::from_le_bytes(
				[bytes[pos+18], bytes[pos+19], bytes[pos+20], bytes[pos+21]]);
			let preamp_on = bytes[pos+38] != 0;
			pos += 39;

			let mut blocks = 0;
			loop {
				assert!(pos < bytes.len(), "run not terminated by a cycle-stop");
				let code = bytes[pos] as i8;
				pos += 1;
				if code == crate::corx::CYCLE_STOP {
					break;
				}
				pos += slice_size * 8;
				blocks += 1;
			}
			runs.push(ParsedRun{ preamp_on, beacon_amplitude, blocks });
		}
		runs
	}

	#[test]
	fn tone_without_beacon_writes_header_only() {
		let source = SyntheticSource::new(synthetic_blocks(20, false));
		let writer = CorxWriter::new(Some(Vec::new()));
		let mut pipeline = Pipeline::new(test_config(), test_template(), source, writer).unwrap();
		pipeline.run().unwrap();

		assert_eq!(pipeline.stats().beacons, 0);
		assert_eq!(pipeline.stats().cycle_runs, 0);
		let bytes = pipeline.into_writer().into_inner().unwrap();
		assert_eq!(bytes.len(), 9);
		assert_eq!(&bytes[..4], b"CORX");
	}

	#[test]
	fn beacon_capture_produces_cycle_runs() {
		let source = SyntheticSource::new(synthetic_blocks(70, true));
		let writer = CorxWriter::new(Some(Vec::new()));
		let mut pipeline = Pipeline::new(test_config(), test_template(), source, writer).unwrap();
		pipeline.run().unwrap();

		let num_cycles = ((SAMPLE_RATE - 2.0 * 512.0) / CORR_SIZE as f64).floor() as usize;
		assert_eq!(num_cycles, 16);

		let stats = pipeline.stats().clone();
		assert!(stats.beacons >= 2, "beacons = {}", stats.beacons);
		assert!(stats.cycle_runs > stats.beacons);

		let bytes = pipeline.into_writer().into_inner().unwrap();
		let runs = parse_corx(&bytes, CORR_SIZE);

		assert_eq!(runs.len(), stats.cycle_runs as usize);
		assert!(runs.len() >= 4);

		// Beacon runs come first, complete and attributed to the pulse
		assert!(runs[0].preamp_on);
		assert!(runs[0].beacon_amplitude > 0);
		assert_eq!(runs[0].blocks, num_cycles);
		assert!(runs[1].preamp_on);
		assert_eq!(runs[1].blocks, num_cycles);

		// The capture ends with synthetic noise runs, preamp off
		assert!(!runs.last().unwrap().preamp_on);
		assert_eq!(runs.last().unwrap().beacon_amplitude, 0);
		assert!(runs.iter().any(|r| !r.preamp_on && r.blocks == num_cycles));

		let total_cycles:usize = runs.iter().map(|r| r.blocks).sum();
		assert_eq!(total_cycles as u64, stats.cycles);
	}

	#[test]
	fn bias_tee_toggles_around_preamp_switch() {
		let source = SyntheticSource::new(synthetic_blocks(70, true));
		let writer = CorxWriter::new(Some(Vec::new()));
		let mut pipeline = Pipeline::new(test_config(), test_template(), source, writer).unwrap();
		pipeline.run().unwrap();

		let calls = &pipeline.source.bias_calls;
		assert_eq!(calls.first(), Some(&true));
		assert_eq!(calls.last(), Some(&false));
		assert_eq!(calls.len(), 2);
	}

	#[test]
	fn void_sink_runs_identically() {
		let source = SyntheticSource::new(synthetic_blocks(70, true));
		let writer = CorxWriter::new(Some(Vec::new()));
		let mut with_sink = Pipeline::new(test_config(), test_template(), source, writer).unwrap();
		with_sink.run().unwrap();

		let source = SyntheticSource::new(synthetic_blocks(70, true));
		let void:CorxWriter<Vec<u8>> = CorxWriter::new(None);
		let mut without = Pipeline::new(test_config(), test_template(), source, void).unwrap();
		without.run().unwrap();

		assert_eq!(with_sink.stats().beacons, without.stats().beacons);
		assert_eq!(with_sink.stats().cycle_runs, without.stats().cycle_runs);
		assert_eq!(with_sink.stats().cycles, without.stats().cycles);
		assert!(without.into_writer().into_inner().is_none());
	}

	#[test]
	fn narrow_output_window_is_respected() {
		let mut cfg = test_config();
		cfg.output_window_start = 10;
		cfg.output_window_len = 20;

		let source = SyntheticSource::new(synthetic_blocks(70, true));
		let writer = CorxWriter::new(Some(Vec::new()));
		let mut pipeline = Pipeline::new(cfg, test_template(), source, writer).unwrap();
		pipeline.run().unwrap();

		let bytes = pipeline.into_writer().into_inner().unwrap();
		assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 10);
		assert_eq!(u16::from_le_bytes([bytes[7], bytes[8]]), 20);
		let runs = parse_corx(&bytes, 20);
		assert!(!runs.is_empty());
	}

	#[test]
	fn threshold_strings_parse() {
		assert_eq!(parse_threshold("15s").unwrap(), (0.0, 15.0));
		assert_eq!(parse_threshold("4c").unwrap(), (4.0, 0.0));
		assert_eq!(parse_threshold("4c7.5s").unwrap(), (4.0, 7.5));
		assert_eq!(parse_threshold("").unwrap(), (0.0, 0.0));
		assert!(parse_threshold("4x").is_err());
		assert!(parse_threshold("c5s").is_err());
	}

	#[test]
	fn window_strings_parse() {
		assert_eq!(parse_window("-2000:2000").unwrap(), (-2000, 2000));
		assert_eq!(parse_window("5:10").unwrap(), (5, 10));
		assert!(parse_window("10:5").is_err());
		assert!(parse_window("10").is_err());
	}

}
