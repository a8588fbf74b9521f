use std::io::{Read, Write};
use std::process::ExitCode;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use feitian_sk_agent::dispatch;
use feitian_sk_agent::framing::{read_frame, write_frame, FrameError};
use feitian_sk_agent::registry::DeviceRegistry;

fn main() -> ExitCode {
    // Logs go to stderr only; stdout belongs to the wire protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        "{} {} starting",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Both transport backends are acquired for the life of the process; a
    // machine without them cannot serve any request.
    let mut registry = match DeviceRegistry::new() {
        Ok(r) => r,
        Err(e) => {
            error!("transport subsystem unavailable: {e}");
            return ExitCode::from(2);
        }
    };

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let code = run(&mut registry, &mut stdin.lock(), &mut stdout.lock());

    registry.shutdown();
    info!("shutting down");
    ExitCode::from(code)
}

/// The serial dispatch loop: one request in, one response out, in order.
/// The next read does not start until the previous response is flushed.
fn run(registry: &mut DeviceRegistry, input: &mut impl Read, output: &mut impl Write) -> u8 {
    loop {
        let raw = match read_frame(input) {
            Ok(r) => r,
            Err(FrameError::Eof) => {
                info!("stdin closed by the bridge");
                return 0;
            }
            Err(e) => {
                // Oversized, empty, truncated, or non-UTF-8 frames mean the
                // stream is out of sync; there is no way to resynchronize.
                error!("fatal framing error: {e}");
                return 1;
            }
        };
        debug!("frame: {raw}");

        let response = dispatch::process(registry, &raw);
        let json = match serde_json::to_string(&response) {
            Ok(j) => j,
            Err(e) => {
                error!("failed to serialize response: {e}");
                continue;
            }
        };
        debug!("response: {json}");

        if let Err(e) = write_frame(output, &json) {
            error!("failed to write response: {e}");
            return 1;
        }
    }
}
