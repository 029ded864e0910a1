
extern crate clap;
extern crate colored;
extern crate corx_radio;
extern crate ctrlc;
extern crate serde_json;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Arg, App};
use colored::*;

use corx_radio::ReceiverError;
use corx_radio::beacon::load_template;
use corx_radio::corx::CorxWriter;
use corx_radio::io::{open_source, SampleFormat};
use corx_radio::pipeline::{parse_threshold, parse_window, Pipeline, ReceiverConfig};

fn main() {
	let code = match run() {
		Ok(()) => 0,
		Err(ReceiverError::Config(msg)) => {
			eprintln!("{}", format!("configuration error: {}", msg).red());
			1
		},
		Err(ReceiverError::Source(msg, code)) => {
			eprintln!("{}", format!("source error: {}", msg).red());
			code
		},
		Err(ReceiverError::Io(e)) => {
			eprintln!("{}", format!("I/O error: {}", e).red());
			-1
		},
	};
	std::process::exit(code);
}

fn run() -> Result<(), ReceiverError> {

	let matches = App::new("CORX receiver")
		.version("0.1.0")
		.about("Tracks a reference carrier and beacon in raw IQ samples and \
		        writes phase- and time-corrected correlation slices to a CORX file")
		.arg(Arg::with_name("input")
			.short("i").long("input")
			.help("Raw IQ input ('-' for stdin)")
			.required(true).takes_value(true))
		.arg(Arg::with_name("format")
			.long("format")
			.help("Raw IQ sample format")
			.possible_value("u8").possible_value("i16")
			.default_value("u8"))
		.arg(Arg::with_name("output")
			.short("o").long("output")
			.help("CORX output file ('-' for stdout) [default: no output]")
			.takes_value(true))
		.arg(Arg::with_name("sample_rate")
			.short("s").long("sample-rate")
			.help("Sample rate in samples per second")
			.takes_value(true).default_value("2.4e6"))
		.arg(Arg::with_name("frequency")
			.short("f").long("frequency")
			.help("Tuner centre frequency in Hz")
			.takes_value(true).default_value("433.83e6"))
		.arg(Arg::with_name("block_len")
			.short("b").long("block-len")
			.takes_value(true).default_value("16384"))
		.arg(Arg::with_name("history_len")
			.short("y").long("history-len")
			.takes_value(true).default_value("5250"))
		.arg(Arg::with_name("carrier_threshold")
			.short("t").long("carrier-threshold")
			.help("Carrier detection threshold as <constant>c<snr>s")
			.takes_value(true).default_value("100c2s"))
		.arg(Arg::with_name("carrier_window")
			.short("w").long("carrier-window")
			.help("Carrier search window in signed FFT bins, as <lo>:<hi>")
			.takes_value(true))
		.arg(Arg::with_name("corr_threshold")
			.short("u").long("corr-threshold")
			.help("Correlation detection threshold as <constant>c<snr>s")
			.takes_value(true).default_value("15s"))
		.arg(Arg::with_name("template")
			.short("z").long("template")
			.help("Beacon template file")
			.takes_value(true).default_value("template.tpl"))
		.arg(Arg::with_name("skip")
			.short("k").long("skip")
			.help("Number of blocks to discard before searching")
			.takes_value(true).default_value("1"))
		.arg(Arg::with_name("carrier_ref")
			.long("carrier-ref")
			.help("Nominal carrier offset in Hz used for the clock-error estimate")
			.takes_value(true).default_value("-277800"))
		.arg(Arg::with_name("window_start")
			.long("window-start")
			.help("First FFT bin of the output slice")
			.takes_value(true).default_value("0"))
		.arg(Arg::with_name("window_len")
			.long("window-len")
			.help("Length of the output slice (<= 0 for the full cycle)")
			.takes_value(true).default_value("-1"))
		.arg(Arg::with_name("rxid")
			.short("r").long("rxid")
			.help("This receiver's unique identifier")
			.takes_value(true).default_value("-1"))
		.get_matches();

	let bad_num = |name:&str| ReceiverError::Config(format!("invalid value for {}", name));

	let mut cfg = ReceiverConfig::default();
	cfg.sample_rate = matches.value_of("sample_rate").unwrap().parse()
		.map_err(|_| bad_num("sample-rate"))?;
	cfg.sdr_freq = matches.value_of("frequency").unwrap().parse()
		.map_err(|_| bad_num("frequency"))?;
	cfg.block_len = matches.value_of("block_len").unwrap().parse()
		.map_err(|_| bad_num("block-len"))?;
	cfg.history_len = matches.value_of("history_len").unwrap().parse()
		.map_err(|_| bad_num("history-len"))?;
	cfg.skip = matches.value_of("skip").unwrap().parse()
		.map_err(|_| bad_num("skip"))?;
	cfg.carrier_ref = matches.value_of("carrier_ref").unwrap().parse()
		.map_err(|_| bad_num("carrier-ref"))?;
	cfg.output_window_start = matches.value_of("window_start").unwrap().parse()
		.map_err(|_| bad_num("window-start"))?;
	cfg.output_window_len = matches.value_of("window_len").unwrap().parse()
		.map_err(|_| bad_num("window-len"))?;
	cfg.rxid = matches.value_of("rxid").unwrap().parse()
		.map_err(|_| bad_num("rxid"))?;
	cfg.carrier_threshold = parse_threshold(matches.value_of("carrier_threshold").unwrap())?;
	cfg.corr_threshold = parse_threshold(matches.value_of("corr_threshold").unwrap())?;
	cfg.carrier_window = match matches.value_of("carrier_window") {
		Some(s) => Some(parse_window(s)?),
		None => None,
	};

	let format = SampleFormat::from_str(matches.value_of("format").unwrap())?;
	let template = load_template(matches.value_of("template").unwrap())?;

	let running = Arc::new(AtomicBool::new(true));
	let r = running.clone();
	ctrlc::set_handler(move || {
		r.store(false, Ordering::SeqCst);
	}).map_err(|_| ReceiverError::Config("unable to set signal handler".to_string()))?;

	let source = open_source(matches.value_of("input").unwrap(), format,
		cfg.block_len, cfg.history_len, running)?;

	let sink:Option<Box<dyn Write>> = match matches.value_of("output") {
		Some("-") => Some(Box::new(io::stdout())),
		Some(path) => Some(Box::new(File::create(path)?)),
		None => None,
	};
	let writer = CorxWriter::new(sink.map(BufWriter::new));

	eprintln!("rx #{}: reading {} in blocks of {} samples ({} new) at {} Sa/s",
		cfg.rxid,
		matches.value_of("input").unwrap(),
		cfg.block_len,
		cfg.block_len - cfg.history_len,
		cfg.sample_rate);

	let mut pipeline = Pipeline::new(cfg, template, source, writer)?;
	let result = pipeline.run();

	// Stats go to stderr so they never mix with a '-o -' stream
	match serde_json::to_string(pipeline.stats()) {
		Ok(json) => eprintln!("{}", json),
		Err(_) => eprintln!("{:?}", pipeline.stats()),
	}

	result
}
