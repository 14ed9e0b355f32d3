use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::Value;

const SENSORS: &str = "AA:BB|Heart Strap|-48|0000180d-0000-1000-8000-00805f9b34fb;CC:DD|-|-";

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl periph::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(
    args: periph::Args,
    output_format: periph::OutputFormat,
) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let log_level = args.log_level();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let backend = match maybe_fake_args {
        Some(fake_args) => periph::fake_backend(fake_args),
        None => periph::real_backend(),
    };
    periph::run_with_clients_and_log_level(
        command,
        &mut output,
        &FakeTerminalClient,
        backend,
        log_level,
        output_format,
    )
    .await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(argv: [&str; N]) -> anyhow::Result<String> {
    let parsed_args = periph::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args, periph::OutputFormat::Pretty).await
}

fn json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line is a JSON document"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn scan_command_lists_fixture_devices() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "scan",
        "--duration",
        "2s",
    ])
    .await?;

    assert_eq!(
        Some("Scan finished: 2 peripheral(s)"),
        stdout.lines().next()
    );
    assert!(stdout.contains("Heart Strap"));
    assert!(stdout.contains("-48 dBm"));
    assert!(stdout.contains("180d"));
    assert!(stdout.contains("CC:DD"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_writes_one_json_document_per_device() -> anyhow::Result<()> {
    let args = periph::Args::try_parse_from([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "scan",
        "--duration",
        "2s",
    ])?;

    let stdout = run_with_parsed_args(args, periph::OutputFormat::Json).await?;

    let documents = json_lines(&stdout);
    assert_eq!(2, documents.len());
    assert_eq!("AA:BB", documents[0]["id"]);
    assert_eq!("Heart Strap", documents[0]["name"]);
    assert_eq!(-48, documents[0]["rssi"]);
    assert_eq!(Value::Null, documents[1]["name"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_filters_by_service() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "scan",
        "--duration",
        "2s",
        "--service",
        "0000180d-0000-1000-8000-00805f9b34fb",
    ])
    .await?;

    assert_eq!(
        Some("Scan finished: 1 peripheral(s)"),
        stdout.lines().next()
    );
    assert!(!stdout.contains("CC:DD"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_applies_fake_discovery_delay() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "--fake-discovery-delay",
        "3s",
        "scan",
        "--duration",
        "1s",
    ])
    .await?;

    assert_eq!(
        "Scan finished: 0 peripheral(s)\nNo peripherals found.",
        stdout.trim_end()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn scan_command_fails_when_the_radio_is_off() {
    let result = run_with_argv([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "--fake-radio",
        "powered-off",
        "scan",
    ])
    .await;

    let error = result.expect_err("a powered-off radio cannot scan");
    assert!(matches!(
        error.downcast_ref::<periph::ScanError>(),
        Some(periph::ScanError::AdapterNotReady {
            state: periph::RadioState::PoweredOff
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn listen_command_streams_until_the_limit() -> anyhow::Result<()> {
    let fake = periph::FakeArgs::builder()
        .scan_fixture(SENSORS)?
        .notifications("0648,0649,064A")?
        .build();
    let args = periph::Args::new(periph::Command::Listen(periph::ListenArgs::new(
        "Heart",
        Some(2),
    )))
    .with_fake(fake);

    let stdout = run_with_parsed_args(args, periph::OutputFormat::Pretty).await?;

    assert!(stdout.starts_with("Connected peripheral:"));
    assert!(stdout.contains("2 characteristic(s)"));
    let notification_lines: Vec<&str> = stdout
        .lines()
        .filter(|line| line.starts_with('['))
        .collect();
    assert_eq!(2, notification_lines.len());
    assert!(notification_lines[0].starts_with("[0001]"));
    assert!(notification_lines[0].ends_with("2a37 06 48"));
    assert!(notification_lines[1].ends_with("2a37 06 49"));
    assert_eq!(
        Some("Stopped: reached max notifications (2) - received 2 notification(s)"),
        stdout.lines().last()
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn listen_command_writes_json_notifications_and_summary() -> anyhow::Result<()> {
    let args = periph::Args::try_parse_from([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "--fake-notifications",
        "0648,0649",
        "listen",
        "--device",
        "AA:BB",
        "--max-notifications",
        "2",
    ])?;

    let stdout = run_with_parsed_args(args, periph::OutputFormat::Json).await?;

    let documents = json_lines(&stdout);
    assert_eq!(3, documents.len());
    assert_eq!("0648", documents[0]["value"]);
    assert_eq!(
        "00002a37-0000-1000-8000-00805f9b34fb",
        documents[0]["characteristic_uuid"]
    );
    assert_eq!(2, documents[2]["received_notifications"]);
    assert_eq!(
        "reached max notifications (2)",
        documents[2]["stop_reason"]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn listen_command_fails_when_no_device_matches() {
    let result = run_with_argv([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "listen",
        "--device",
        "Thermometer",
        "--scan-duration",
        "1s",
    ])
    .await;

    let error = result.expect_err("nothing matches the selector");
    assert_eq!(
        "no peripheral matching `Thermometer` was found",
        error.to_string()
    );
}

#[tokio::test(start_paused = true)]
async fn listen_command_reports_a_failed_connection() {
    let result = run_with_argv([
        "periph",
        "--fake",
        "--fake-scan",
        SENSORS,
        "--fake-connect",
        "fail-disconnected",
        "listen",
        "--device",
        "Heart",
    ])
    .await;

    let error = result.expect_err("the fake refuses to connect");
    assert!(matches!(
        error.downcast_ref::<periph::ConnectError>(),
        Some(periph::ConnectError::DeviceDisconnectedDuringSetup)
    ));
}

#[test]
fn fake_args_reject_an_invalid_fixture() {
    let result = periph::FakeArgs::builder().scan_fixture("invalid-record");

    assert!(matches!(
        result,
        Err(periph::FixtureError::InvalidRecordFieldCount)
    ));
}

#[test]
fn listen_requires_a_device_selector() {
    let result = periph::Args::try_parse_from(["periph", "listen"]);

    let error = result.expect_err("--device is required");
    assert_eq!(
        clap::error::ErrorKind::MissingRequiredArgument,
        error.kind()
    );
}
