use std::time::Duration;

use bon::Builder;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::cli::listen::ListenArgs;
use crate::cli::scan::ScanArgs;
use crate::error::{ConfigError, FixtureError};
use crate::hw::{
    FakeAdapterConfig, FakeConnectBehaviour, NotificationPayloads, RadioState, ScanFixture,
};

/// Command-line options for the BLE peripheral tool.
#[derive(Debug, Parser)]
#[command(
    name = "periph",
    about = "Discover BLE peripherals, connect to one, and stream its notifications."
)]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format. Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Uses the fake BLE backend with fixture-driven discovery and payloads.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `device_id|local_name|rssi[|service,service];...`.
    #[arg(long, global = true, requires = "fake")]
    fake_scan: Option<ScanFixture>,
    /// Fake notification payloads as comma-separated hexadecimal payloads.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Initial fake radio state.
    #[arg(long, global = true, requires = "fake")]
    fake_radio: Option<RadioState>,
    /// How the fake adapter answers connection requests.
    #[arg(long, global = true, requires = "fake")]
    fake_connect: Option<FakeConnectBehaviour>,
    /// Artificial fake scan delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use periph::{Args, Command, ScanArgs};
    ///
    /// let args = Args::new(Command::Scan(ScanArgs::default()));
    /// assert_eq!(None, args.log_level());
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output: None,
            fake: false,
            fake_scan: None,
            fake_notifications: None,
            fake_radio: None,
            fake_connect: None,
            fake_discovery_delay: None,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            notifications,
            radio_state,
            connect_behaviour,
            discovery_delay,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_notifications = notifications;
        self.fake_radio = Some(radio_state);
        self.fake_connect = Some(connect_behaviour);
        self.fake_discovery_delay = Some(discovery_delay);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Splits parsed CLI arguments into command and optional fake-backend settings.
    ///
    /// # Errors
    ///
    /// Returns an error if fake mode is enabled without a scan fixture.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_notifications,
            fake_radio,
            fake_connect,
            fake_discovery_delay,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(ConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                notifications: fake_notifications,
                radio_state: fake_radio.unwrap_or(RadioState::PoweredOn),
                connect_behaviour: fake_connect.unwrap_or_default(),
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
///
/// ```
/// let fake = periph::FakeArgs::builder()
///     .scan_fixture("AA:BB|Thermo|-50")?
///     .notifications("0102,0304")?
///     .build();
/// let _ = fake;
/// # Ok::<(), periph::FixtureError>(())
/// ```
#[derive(Debug, Builder)]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    #[builder(default = RadioState::PoweredOn)]
    radio_state: RadioState,
    #[builder(default)]
    connect_behaviour: FakeConnectBehaviour,
    #[builder(default)]
    discovery_delay: Duration,
}

impl FakeArgs {
    pub(crate) fn into_adapter_config(self) -> FakeAdapterConfig {
        let Self {
            scan_fixture,
            notifications,
            radio_state,
            connect_behaviour,
            discovery_delay,
        } = self;

        FakeAdapterConfig::builder()
            .scan_fixture(scan_fixture)
            .maybe_notifications(notifications)
            .radio_state(radio_state)
            .connect_behaviour(connect_behaviour)
            .discovery_delay(discovery_delay)
            .build()
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for one window and print every peripheral seen.
    Scan(ScanArgs),
    /// Find a peripheral, connect, and print its notifications as they arrive.
    Listen(ListenArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_args) => "scan",
            Self::Listen(_args) => "listen",
        }
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::OFF,
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// How command results are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Tables and coloured lines for people.
    Pretty,
    /// One JSON document per line.
    Json,
}

pub(crate) fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}
