// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::OsString;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::Local;
use log::{error, info, warn};
use pico_args::Arguments;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use interval_elements::astro_util::SolarEphemeris;
use interval_elements::clock_trait::SystemClock;

use crate::cloud_monitor::FileCloudMonitor;
use crate::config::SessionConfig;
use crate::gphoto2_backend::Gphoto2Backend;
use crate::image_files::ImageFiles;
use crate::serial_controller::SerialController;
use crate::session::{Collaborators, NightSession, SessionOutcome, night_data_path};

const DEFAULT_CONFIG: &str = "/opt/dfn-software/dfnstation.toml";
const DEFAULT_TEST_TIME: u64 = 180;

#[derive(Debug, PartialEq)]
struct AppArgs {
    config: PathBuf,
    // Night length when running in test mode.
    test_time: Option<Duration>,
    unused: Vec<OsString>,
}

fn parse_args(mut pargs: Arguments) -> Result<AppArgs, pico_args::Error> {
    let test = pargs.contains("--test");
    let config = pargs.opt_value_from_str("--config")?
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let test_seconds: Option<u64> = pargs.opt_value_from_str("--test_time")?;
    let test_time = if test || test_seconds.is_some() {
        Some(Duration::from_secs(test_seconds.unwrap_or(DEFAULT_TEST_TIME)))
    } else {
        None
    };
    Ok(AppArgs{config, test_time, unused: pargs.finish()})
}

// Status for an outcome that does not hand off. A night that ended through
// the fault shutdown still left the station safe and exits 0; only a
// session that could not be started at all exits 1.
fn exit_code(outcome: &Result<SessionOutcome, CanonicalError>) -> i32 {
    match outcome {
        Ok(SessionOutcome::Aborted(reason)) => {
            error!("session_aborted, {}", reason);
            0
        },
        Ok(_) => 0,
        Err(e) => {
            error!("session_failed, {:?}", e);
            1
        },
    }
}

// Runs one night with the station's real collaborators. Replaces the
// process with the event detection supervisor when a handoff is due and
// exits otherwise.
pub fn interval_main() {
    const HELP: &str = "\
    FLAGS:
      -h, --help                     Prints help information
      --test                         Short test night starting in 30 seconds

    OPTIONS:
      --config <path>                /opt/dfn-software/dfnstation.toml
      --test_time SECONDS            180
    ";

    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        std::process::exit(0);
    }
    let args = match parse_args(pargs) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n{}", e, HELP);
            std::process::exit(1);
        },
    };
    let config = match SessionConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Could not load {:?}: {:?}", args.config, e);
            std::process::exit(1);
        },
    };
    let now = Local::now();
    let data_path = night_data_path(&config, now);
    if let Err(e) = fs::create_dir_all(&data_path) {
        eprintln!("Could not create {:?}: {:?}", data_path, e);
        std::process::exit(1);
    }

    // Set up logging.
    let log_file = format!("{}_interval.txt", now.format("%Y-%m-%d"));
    let file_appender = tracing_appender::rolling::never(&data_path, log_file);
    let (non_blocking_file, file_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, stdout_guard) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    let default_level = if args.test_time.is_some() { "debug" } else { "info" };
    registry()
        .with(EnvFilter::try_from_default_env()
              .unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();
    if !args.unused.is_empty() {
        warn!("unused_arguments, {:?}", args.unused);
    }
    info!("config, {}", args.config.display());

    let got_signal = Arc::new(AtomicBool::new(false));
    let got_signal2 = got_signal.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("got_control_c");
        got_signal2.store(true, AtomicOrdering::Relaxed);
    }) {
        warn!("signal_handler_failed, {:?}", e);
    }

    let outcome = async_main(config, got_signal, args.test_time);
    if let Ok(SessionOutcome::Handoff{supervisor, data_path, reboot_epoch, day_mask})
        = &outcome
    {
        info!("exec_supervisor, {}", supervisor.display());
        // Flush the log files before the process image is replaced.
        drop(file_guard);
        drop(stdout_guard);
        let err = Command::new(supervisor)
            .arg(data_path)
            .arg(reboot_epoch.to_string())
            .arg(day_mask)
            .exec();
        eprintln!("Could not exec {:?}: {:?}", supervisor, err);
        std::process::exit(1);
    }
    let code = exit_code(&outcome);
    drop(file_guard);
    drop(stdout_guard);
    std::process::exit(code);
}

#[tokio::main]
async fn async_main(config: SessionConfig, got_signal: Arc<AtomicBool>,
                    test_time: Option<Duration>)
                    -> Result<SessionOutcome, CanonicalError> {
    let hardware = SerialController::open(&config.internal.serial_device)?;
    let clouds = FileCloudMonitor::new(
        &config.internal.cloud_status_file,
        Duration::from_secs(config.clouds.status_max_age),
        config.internal.video_command.clone());
    let images = ImageFiles::new(&config.station.name,
                                 config.internal.disk_full_threshold);
    let collaborators = Collaborators{
        hardware: Box::new(hardware),
        capture: Box::new(Gphoto2Backend::new()),
        clouds: Box::new(clouds),
        images: Box::new(images),
        ephemeris: Box::new(SolarEphemeris),
    };
    let mut session = NightSession::new(config, collaborators, Arc::new(SystemClock),
                                        got_signal, test_time);
    Ok(session.run().await)
}

// mod tests.
