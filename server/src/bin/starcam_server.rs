// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use pico_args::Arguments;
use tokio::net::UdpSocket;
use tracing_appender::non_blocking::NonBlockingBuilder;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry, EnvFilter};

use starcam_elements::camera_trait::AbstractCamera;
use starcam_elements::params::{PhaseCell, SharedState};

use starcam_server::command_listener::{
    run_command_listener, run_trigger_listener, CommandContext};
use starcam_server::config::ServerConfig;
use starcam_server::focus_engine::FocusAlgorithm;
use starcam_server::image_camera::ImageCamera;
use starcam_server::lens_controller::{
    LensController, SimulatedLensTransport};
use starcam_server::pipeline::Pipeline;
use starcam_server::solve_engine::UnconfiguredSolver;
use starcam_server::telemetry_sender::{
    run_astrometry_sender, run_parameter_sender, solution_channel};

const HELP: &str = "\
FLAGS:
  -h, --help                     Prints help information
  --loopback                     Also accept commands on 127.0.0.1
  --legacy_focus                 Use the quadratic-regression auto-focus

OPTIONS:
  --test_image <path>            Image file standing in for the camera
  --lens_tty <path>              Lens controller serial device
  --data_dir <path>              .
  --static_hp <path>             <data_dir>/static_hp_mask.txt
  --fc1_addr <ip>                192.168.1.3
  --fc2_addr <ip>                192.168.1.4
  --latitude <deg>               32.233315
  --longitude <deg>              -110.948556
  --height <m>                   753.8
  --log_dir <path>               .
  --log_file <file>              starcam_log.txt
";

struct AppArgs {
    test_image: Option<PathBuf>,
    lens_tty: Option<String>,
    data_dir: PathBuf,
    static_hp: Option<PathBuf>,
    fc1_addr: String,
    fc2_addr: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    height: Option<f64>,
    loopback: bool,
    legacy_focus: bool,
    log_dir: String,
    log_file: String,
}

fn parse_args() -> AppArgs {
    let mut pargs = Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        println!("{}", HELP);
        std::process::exit(0);
    }
    let args = AppArgs {
        test_image: pargs.opt_value_from_str("--test_image").unwrap(),
        lens_tty: pargs.opt_value_from_str("--lens_tty").unwrap(),
        data_dir: pargs.value_from_str("--data_dir")
            .unwrap_or(PathBuf::from(".")),
        static_hp: pargs.opt_value_from_str("--static_hp").unwrap(),
        fc1_addr: pargs.value_from_str("--fc1_addr")
            .unwrap_or("192.168.1.3".to_string()),
        fc2_addr: pargs.value_from_str("--fc2_addr")
            .unwrap_or("192.168.1.4".to_string()),
        latitude: pargs.opt_value_from_str("--latitude").unwrap(),
        longitude: pargs.opt_value_from_str("--longitude").unwrap(),
        height: pargs.opt_value_from_str("--height").unwrap(),
        loopback: pargs.contains("--loopback"),
        legacy_focus: pargs.contains("--legacy_focus"),
        log_dir: pargs.value_from_str("--log_dir")
            .unwrap_or(".".to_string()),
        log_file: pargs.value_from_str("--log_file")
            .unwrap_or("starcam_log.txt".to_string()),
    };
    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Unrecognized arguments: {:?}", remaining);
        std::process::exit(1);
    }
    args
}

fn main() {
    let args = parse_args();

    // Log to stdout and to a daily-rolling file.
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&args.log_file)
        .max_log_files(10)
        .build(&args.log_dir).unwrap();
    let (non_blocking_file, _guard1) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(file_appender);
    let (non_blocking_stdout, _guard2) = NonBlockingBuilder::default()
        .lossy(false)
        .finish(std::io::stdout());
    registry()
        .with(EnvFilter::try_from_default_env()
              .unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking_stdout))
        .with(fmt::layer().with_ansi(false).with_writer(non_blocking_file))
        .init();

    let shutting_down = Arc::new(AtomicBool::new(false));
    let ctrlc_flag = shutting_down.clone();
    ctrlc::set_handler(move || {
        info!("Got control-c; shutting down");
        ctrlc_flag.store(true, Ordering::Relaxed);
    }).unwrap();

    if let Err(e) = run_server(args, shutting_down) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run_server(args: AppArgs, shutting_down: Arc<AtomicBool>)
              -> Result<(), String> {
    // The camera SDK is only present on the flight machine; without it a
    // test image stands in for the sensor.
    let camera = match &args.test_image {
        Some(path) => ImageCamera::from_file("test_image", path)
            .map_err(|e| format!("{:?}", e))?,
        None => {
            return Err("No camera interface available in this build; \
                        supply --test_image".to_string());
        }
    };
    let (width, height) = camera.dimensions();

    let mut config = ServerConfig {
        width: width as usize,
        height: height as usize,
        data_dir: args.data_dir.clone(),
        lens_tty: args.lens_tty.clone(),
        listen_loopback: args.loopback,
        ..Default::default()
    };
    config.static_hp_path = args.static_hp.clone()
        .unwrap_or_else(|| args.data_dir.join("static_hp_mask.txt"));
    config.peers[0].address = args.fc1_addr.clone();
    config.peers[1].address = args.fc2_addr.clone();

    let mut initial_state = SharedState::default();
    if let Some(latitude) = args.latitude {
        initial_state.astro.latitude = latitude;
    }
    if let Some(longitude) = args.longitude {
        initial_state.astro.longitude = longitude;
    }
    if let Some(height) = args.height {
        initial_state.astro.hm = height;
    }

    // Bring up the lens and learn its focus range before anything else
    // consults the focus readbacks.
    let mut lens = match &config.lens_tty {
        Some(tty) => LensController::open_serial(tty)
            .map_err(|e| format!("{:?}", e))?,
        None => {
            warn!("No --lens_tty given; using a simulated lens");
            LensController::new(Box::new(SimulatedLensTransport::new()))
        }
    };
    lens.init(&mut initial_state.camera)
        .map_err(|e| format!("Lens initialization failed: {:?}", e))?;

    let algorithm = if args.legacy_focus {
        FocusAlgorithm::QuadraticRegression
    } else {
        FocusAlgorithm::ContrastDetect
    };

    let state = Arc::new(Mutex::new(initial_state));
    let lens = Arc::new(Mutex::new(lens));
    let camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>> =
        Arc::new(tokio::sync::Mutex::new(Box::new(camera)));
    let phase = Arc::new(PhaseCell::new());
    let display = Arc::new(Mutex::new(Vec::new()));
    let (solution_tx, solution_rx) = solution_channel();

    let taking_image = Arc::new(AtomicBool::new(false));

    let pipeline = Pipeline::new(
        config.clone(), algorithm, Box::new(UnconfiguredSolver::new()),
        camera.clone(), lens.clone(), state.clone(), phase, display,
        taking_image.clone(), shutting_down.clone(),
        solution_tx).map_err(|e| format!("Pipeline setup failed: {:?}", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build().unwrap();
    runtime.block_on(async {
        for peer in &config.peers {
            let context = CommandContext {
                state: state.clone(),
                lens: lens.clone(),
                camera: camera.clone(),
                taking_image: taking_image.clone(),
                shutting_down: shutting_down.clone(),
            };
            match UdpSocket::bind(("0.0.0.0", peer.command_port)).await {
                Ok(socket) => {
                    tokio::spawn(run_command_listener(
                        peer.name.clone(), socket, context));
                }
                Err(e) => warn!("Could not bind {} command port {}: {:?}",
                                peer.name, peer.command_port, e),
            }
            match UdpSocket::bind(("0.0.0.0", peer.trigger_port)).await {
                Ok(socket) => {
                    tokio::spawn(run_trigger_listener(
                        peer.name.clone(), socket, state.clone(),
                        shutting_down.clone()));
                }
                Err(e) => warn!("Could not bind {} trigger port {}: {:?}",
                                peer.name, peer.trigger_port, e),
            }
            tokio::spawn(run_astrometry_sender(
                peer.name.clone(),
                format!("{}:{}", peer.address, peer.astrometry_port),
                solution_rx.clone(), shutting_down.clone()));
            tokio::spawn(run_parameter_sender(
                peer.name.clone(),
                format!("{}:{}", peer.address, peer.parameter_port),
                state.clone(), shutting_down.clone()));
        }
        if config.listen_loopback {
            let context = CommandContext {
                state: state.clone(),
                lens: lens.clone(),
                camera: camera.clone(),
                taking_image: taking_image.clone(),
                shutting_down: shutting_down.clone(),
            };
            let port = config.loopback_command_port;
            match UdpSocket::bind(("127.0.0.1", port)).await {
                Ok(socket) => {
                    tokio::spawn(run_command_listener(
                        "loopback".to_string(), socket, context));
                }
                Err(e) => warn!("Could not bind loopback command port {}: \
                                 {:?}", port, e),
            }
        }

        let pipeline_handle = pipeline.spawn();
        // Wait for shutdown or a fatal pipeline exit.
        loop {
            if pipeline_handle.is_finished() {
                break;
            }
            if shutting_down.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        shutting_down.store(true, Ordering::Relaxed);
        match pipeline_handle.join() {
            Ok(Ok(())) => info!("Pipeline stopped"),
            Ok(Err(e)) => error!("Pipeline failed: {:?}", e),
            Err(_) => error!("Pipeline thread panicked"),
        }
    });
    Ok(())
}
