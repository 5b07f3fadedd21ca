//! xmlsocket - line-oriented XMLSocket client.
//!
//! Connects to an XMLSocket peer, prints every received message on its own
//! line, and sends each line read from stdin as one message.
//!
//! ```text
//! xmlsocket <host:port> [--config PATH]
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xmlsocket::{default_config_path, ClientConfig, Endpoint, XmlSocketClient, XmlSocketError};

/// Completion events forwarded from client callbacks to the main loop.
enum Event {
    Connected,
    ConnectFailed(XmlSocketError),
    Sent,
    Received(String),
    ReceiveFailed(XmlSocketError),
    SendFailed(XmlSocketError),
}

/// Parsed command line.
struct Args {
    endpoint: Option<Endpoint>,
    config_path: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut endpoint = None;
    let mut config_path = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or_else(|| anyhow!("--config requires a path"))?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("Usage: xmlsocket <host:port> [--config PATH]");
                std::process::exit(0);
            }
            _ if endpoint.is_none() => {
                endpoint = Some(arg.parse::<Endpoint>()?);
            }
            _ => bail!("Unexpected argument: {}", arg),
        }
    }

    Ok(Args {
        endpoint,
        config_path: config_path.unwrap_or_else(default_config_path),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only received messages
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "xmlsocket=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = parse_args()?;
    let config = ClientConfig::load_or_default(&args.config_path)?;
    let endpoint = args
        .endpoint
        .or_else(|| config.endpoint.clone())
        .ok_or_else(|| anyhow!("No endpoint given and none configured"))?;

    tracing::info!("Starting xmlsocket v{}", env!("CARGO_PKG_VERSION"));

    let client = XmlSocketClient::with_config(config);
    let (event_tx, mut events) = mpsc::unbounded_channel::<Event>();

    let connected_tx = event_tx.clone();
    let failed_tx = event_tx.clone();
    client.connect(
        endpoint.clone(),
        move || {
            let _ = connected_tx.send(Event::Connected);
        },
        move |err| {
            let _ = failed_tx.send(Event::ConnectFailed(err));
        },
    )?;

    match events.recv().await {
        Some(Event::Connected) => {}
        Some(Event::ConnectFailed(err)) => {
            return Err(err).with_context(|| format!("Could not connect to {}", endpoint));
        }
        _ => bail!("Connection attempt ended without a result"),
    }

    let received_tx = event_tx.clone();
    let receive_failed_tx = event_tx.clone();
    client.receive(
        move |message| {
            let _ = received_tx.send(Event::Received(message));
        },
        move |err| {
            let _ = receive_failed_tx.send(Event::ReceiveFailed(err));
        },
    )?;

    let stdin = BufReader::new(tokio::io::stdin());
    let result = run(&client, stdin, &event_tx, &mut events).await;

    client.disconnect()?;
    tracing::info!("xmlsocket exited cleanly");
    result
}

/// Pump input lines out and received messages to stdout until either side ends.
///
/// After input EOF the loop keeps running until every queued send has
/// completed, so disconnecting afterwards does not abandon queued frames.
async fn run<R>(
    client: &XmlSocketClient,
    input: R,
    event_tx: &mpsc::UnboundedSender<Event>,
    events: &mut mpsc::UnboundedReceiver<Event>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;
    let mut in_flight: usize = 0;

    loop {
        if !input_open && in_flight == 0 {
            return Ok(());
        }

        tokio::select! {
            line = lines.next_line(), if input_open => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    tracing::debug!("Input closed with {} send(s) in flight", in_flight);
                    input_open = false;
                    continue;
                };
                let sent_tx = event_tx.clone();
                let send_failed_tx = event_tx.clone();
                client.send(
                    &line,
                    move || {
                        let _ = sent_tx.send(Event::Sent);
                    },
                    move |err| {
                        let _ = send_failed_tx.send(Event::SendFailed(err));
                    },
                )?;
                in_flight += 1;
            }
            event = events.recv() => match event {
                Some(Event::Received(message)) => println!("{}", message),
                Some(Event::Sent) => in_flight = in_flight.saturating_sub(1),
                Some(Event::SendFailed(err)) => {
                    in_flight = in_flight.saturating_sub(1);
                    tracing::warn!("Send failed: {}", err);
                }
                Some(Event::ReceiveFailed(err)) => {
                    return Err(err).context("Receive loop stopped");
                }
                Some(Event::Connected) | Some(Event::ConnectFailed(_)) | None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_run_flushes_queued_sends_before_returning() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("listener address");

        let client = XmlSocketClient::new();
        let (event_tx, mut events) = mpsc::unbounded_channel::<Event>();
        let connected_tx = event_tx.clone();
        client
            .connect(
                addr,
                move || {
                    let _ = connected_tx.send(Event::Connected);
                },
                |err| panic!("connect failed: {}", err),
            )
            .expect("connect should be accepted");
        let (mut peer, _) = listener.accept().await.expect("accept failed");
        assert!(matches!(events.recv().await, Some(Event::Connected)));

        let input: String = (0..20).map(|i| format!("<line n=\"{}\"/>\n", i)).collect();
        timeout(
            TEST_TIMEOUT,
            run(&client, input.as_bytes(), &event_tx, &mut events),
        )
        .await
        .expect("Test timed out")
        .expect("run failed");

        // Every line has been written by the time run returns
        client.disconnect().expect("disconnect failed");

        let mut raw = Vec::new();
        timeout(TEST_TIMEOUT, peer.read_to_end(&mut raw))
            .await
            .expect("Test timed out")
            .expect("peer read failed");

        let frames: Vec<String> = raw
            .split(|&b| b == 0)
            .filter(|frame| !frame.is_empty())
            .map(|frame| String::from_utf8(frame.to_vec()).expect("ASCII frame"))
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("<line n=\"{}\"/>", i)).collect();
        pretty_assertions::assert_eq!(frames, expected);
    }
}
