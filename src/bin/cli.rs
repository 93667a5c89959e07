use anyhow::{bail, Context};
use screenrec::platform::software::{SoftwareHost, SyntheticAuthorization, DEFAULT_METRICS};
use screenrec::types::DisplayMetrics;
use screenrec::{AudioMode, OutputDisposition, ScreenRecConfig, SessionController};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    screenrec::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "record" => cmd_record(&args),
        "config" => cmd_config(),
        "version" => cmd_version(&args),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("Usage: screenrec-cli <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  record [--seconds N] [--output DIR] [--width W] [--height H]");
    eprintln!("         [--audio MODE] [--config PATH] [--json]");
    eprintln!("  config     print the default configuration as TOML");
    eprintln!("  version [--json]");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> anyhow::Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(|s| s.as_str())
        .with_context(|| format!("{} needs a value", flag))
}

fn cmd_record(args: &[String]) -> anyhow::Result<()> {
    let mut seconds: Option<u64> = None;
    let mut output: Option<String> = None;
    let mut width = DEFAULT_METRICS.width;
    let mut height = DEFAULT_METRICS.height;
    let mut config_path = None;
    let mut mode = AudioMode::None;
    let mut json = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--seconds" => seconds = Some(next_value(args, &mut i, "--seconds")?.parse()?),
            "--output" => output = Some(next_value(args, &mut i, "--output")?.to_string()),
            "--width" => width = next_value(args, &mut i, "--width")?.parse()?,
            "--height" => height = next_value(args, &mut i, "--height")?.parse()?,
            "--config" => config_path = Some(next_value(args, &mut i, "--config")?.to_string()),
            "--audio" => mode = next_value(args, &mut i, "--audio")?.parse()?,
            "--json" => json = true,
            other => bail!("Unknown option: {}", other),
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => ScreenRecConfig::load_from_file(&path)
            .with_context(|| format!("loading {}", path))?,
        None => ScreenRecConfig::load_or_default(),
    };
    if let Some(dir) = output {
        config.storage.output_directory = dir;
    }

    let host = SoftwareHost::new(&config).with_metrics(DisplayMetrics::new(width, height, DEFAULT_METRICS.density_dpi));
    let frame_rate = config.video.frame_rate;
    let controller = SessionController::new(Arc::new(host), config)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;

    let session_id = controller
        .start(Box::new(SyntheticAuthorization::new(frame_rate)), mode)
        .with_context(|| format!("starting {} recording", mode))?;
    if !json {
        println!("Recording session {} ({}), Ctrl-C to stop", session_id, mode);
    }

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    while controller.is_recording() && !interrupted.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }

    let report = match controller.stop() {
        Some(report) => report,
        // Ended on its own (revocation or worker failure)
        None => controller
            .last_report()
            .context("session ended without a report")?,
    };

    if json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        match &report.disposition {
            OutputDisposition::Finalized(path) => println!("Saved {}", path),
            other => println!("Output {:?}", other),
        }
        if let Some(stats) = &report.stats {
            println!(
                "Video samples: {}, audio samples: {}, duration: {} ms",
                stats.video.samples, stats.audio.samples, report.duration_ms
            );
        }
        for failure in &report.failures {
            println!("Teardown step '{}' failed: {}", failure.step, failure.message);
        }
    }

    if !report.is_finalized() {
        bail!("recording stopped: {:?}", report.reason);
    }
    Ok(())
}

fn cmd_config() -> anyhow::Result<()> {
    print!("{}", ScreenRecConfig::default().to_toml()?);
    Ok(())
}

fn cmd_version(args: &[String]) -> anyhow::Result<()> {
    let info = screenrec::get_info();
    if args.contains(&"--json".to_string()) {
        println!("{}", serde_json::to_string(&info)?);
    } else {
        println!("{} {}", info.name, info.version);
        println!("{}", info.description);
        println!("microphone input: {}", info.microphone_input);
    }
    Ok(())
}
