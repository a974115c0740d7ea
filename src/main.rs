use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use skylight::cli;
use skylight::{ActuatorMode, ConnectionState, Session, SessionView, SettingValue};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("hyper=error".parse()?)
                    .add_directive("reqwest=warn".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let args = cli::parse();
    let session = Session::connect(&args.endpoint_root, &args.device_id, args.session_config())?;
    info!("connected; type 'help' for commands");

    let mut view_rx = session.subscribe();
    tokio::spawn(async move {
        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow_and_update().clone();
            render(&view);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch(&session, line.trim()) {
                        break;
                    }
                }
                None => break, // stdin closed
            },
        }
    }

    session.disconnect().await;
    Ok(())
}

/// Handles one line of user input. Returns false when the user quits.
fn dispatch(session: &Session, line: &str) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        [] => {}
        ["quit"] | ["exit"] => return false,
        ["refresh"] => session.refresh_now(),
        ["set", actuator, "state", value @ ("on" | "off")] => {
            session.set_actuator_state(actuator, *value == "on");
        }
        ["set", actuator, "mode", mode] => match mode.parse::<ActuatorMode>() {
            Ok(mode) => session.set_actuator_mode(actuator, mode),
            Err(e) => warn!("{e}"),
        },
        ["setting", key, value] => match parse_setting(value) {
            Ok(value) => session.set_setting(key, value),
            Err(e) => warn!("{e}"),
        },
        ["help"] => {
            println!("commands:");
            println!("  refresh");
            println!("  set <actuator> state on|off");
            println!("  set <actuator> mode manual|auto");
            println!("  setting <key> <number|on|off>");
            println!("  quit");
        }
        _ => warn!("unrecognized command (try 'help')"),
    }
    true
}

fn parse_setting(raw: &str) -> Result<SettingValue, String> {
    match raw {
        "on" | "true" => Ok(true.into()),
        "off" | "false" => Ok(false.into()),
        _ => raw
            .parse::<f64>()
            .map(Into::into)
            .map_err(|_| format!("'{raw}' is not a number or on/off")),
    }
}

fn render(view: &SessionView) {
    if view.connection == ConnectionState::Disconnected {
        println!("-- disconnected --");
        return;
    }
    let Some(device) = &view.device else {
        println!("-- waiting for device record --");
        return;
    };
    println!("== {} [{}]", device.name, device.status);
    for (key, sensor) in &device.sensors {
        match sensor.value {
            Some(value) => println!("  {key}: {value:.1} {}", sensor.unit),
            None => println!("  {key}: -- {}", sensor.unit),
        }
    }
    for (key, actuator) in &device.actuators {
        let state = if actuator.state { "on" } else { "off" };
        println!("  {key}: {state} ({})", actuator.mode);
    }
    for (key, value) in &device.settings {
        println!("  {key} = {value}");
    }
    if let Some(error) = &view.last_error {
        println!("  ! {error}");
    }
}
