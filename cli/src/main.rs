//! Stranger wall command line driver
//!
//! Loads the wall configuration, listens to the message feed and spells every
//! message on the strip until interrupted.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use stranger_wall::{
    CancellationToken, Config, Delay, Duration, Error, Presenter, RequestQueue,
};

use crate::{
    output::{LogSink, OpcSink, Output},
    transport::Source,
};

mod output;
mod transport;

/// Maximum number of LEDs on a strand
const MAX_LEDS: usize = 512;

/// Pending message capacity
const REQUEST_QUEUE_SIZE: usize = 16;

/// How often the idle presenter looks for new messages
const IDLE_POLL: Duration = Duration::from_millis(50);

const DEFAULT_CONFIG_PATH: &str = "stranger_wall_config_pub.json";

static REQUESTS: RequestQueue<REQUEST_QUEUE_SIZE> = RequestQueue::new();
static CANCEL: CancellationToken = CancellationToken::new();

/// Stranger wall
///
/// Spells incoming messages one letter at a time on an addressable LED strip.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run mode
    #[arg(value_enum, ignore_case = true, default_value_t = Mode::Normal)]
    mode: Mode,
    /// Wall configuration file
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Send frames to an Open Pixel Control server instead of the log
    #[arg(long, value_name = "ADDR")]
    opc: Option<SocketAddr>,
    /// Open Pixel Control channel, 0 addresses every channel
    #[arg(long, value_name = "CHANNEL", default_value_t = 0)]
    opc_channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Show messages from the feed
    Normal,
    /// Show messages from the feed with verbose logging
    Debug,
    /// Spell the alphabet once and exit
    Test,
}

impl Mode {
    fn default_filter(self) -> &'static str {
        match self {
            Self::Normal => "warn,stranger_wall_cli=info",
            Self::Debug | Self::Test => "debug",
        }
    }
}

/// Thread sleeping delay
struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(std::time::Duration::from_micros(duration.as_micros()));
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.mode.default_filter()))
        .init();

    let raw = std::fs::read(&cli.config)
        .with_context(|| format!("unable to read configuration file {}", cli.config.display()))?;
    let config = Config::from_json(&raw)
        .with_context(|| format!("invalid configuration file {}", cli.config.display()))?;
    log::debug!("configuration file loaded");
    log::debug!("your strand has {} LEDs", config.led_count);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("unable to start the async runtime")?;

    runtime.spawn(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::debug!("interrupt received, stopping"),
            Err(err) => log::error!("unable to listen for ctrl-c: {err}"),
        }
        CANCEL.cancel();
    });

    if cli.mode != Mode::Test {
        let source: Source = config
            .endpoint
            .as_deref()
            .unwrap_or("stdin")
            .parse()
            .context("invalid message feed endpoint")?;
        log::debug!("initializing the message feed connection to {source}");

        let since = transport::now_millis();
        runtime.spawn(async move {
            // a clean end closes the queue and the presenter drains it
            if let Err(err) = transport::run(source, since, REQUESTS.sender()).await {
                log::error!("{err:#}");
                CANCEL.cancel();
            }
        });
    }

    log::info!("Press <ctrl>+C to exit.");

    let output = match cli.opc {
        Some(address) => Output::Opc(OpcSink::new(address).with_channel(cli.opc_channel)),
        None => Output::Log(LogSink::default()),
    };
    let mut presenter = Presenter::<_, _, MAX_LEDS>::new(output, StdDelay, &CANCEL, &config)
        .context("unable to initialize the strip")?;

    let outcome = if cli.mode == Mode::Test {
        presenter.self_test().map(|_| ())
    } else {
        presenter.serve(REQUESTS.receiver(), IDLE_POLL)
    };

    let dropped = REQUESTS.clear();
    if dropped > 0 {
        log::debug!("dropping {dropped} pending messages");
    }
    presenter.shutdown().context("unable to release the strip")?;
    runtime.shutdown_background();

    match outcome {
        Ok(()) | Err(Error::Cancelled) => Ok(()),
        Err(err) => Err(err).context("animation failed"),
    }
}
