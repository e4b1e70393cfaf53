use anyhow::{Context, Result, bail};
use popdroidcam::{
    CandidateEndpoint, DiscoveryEvents, PairingSecret, PopClient, PopConfig, QualityTier,
    Rotation, StartOptions,
};
use std::{env, process, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: cli [--config <path>] <command>

Commands:
  pair                                   pair a phone via QR code
  connect <ip> <port>                    connect to a paired phone
  disconnect                             disconnect wireless devices
  devices                                list attached devices
  cameras [serial]                       list cameras of a device
  status                                 show the capture session
  start <camera> <WxH> <fps> [quality] [rotation] [--mirror] [--serial <s>]
  quick-start                            first camera of the first device
  stop                                   stop the capture session";

/// Prints pairing progress as it happens.
struct ConsoleEvents;

impl DiscoveryEvents for ConsoleEvents {
    fn on_browser_unavailable(&self, reason: &str) {
        println!("[CLIENT] Service browser unavailable ({}), using direct mDNS...", reason);
    }

    fn on_candidate(&self, endpoint: &CandidateEndpoint) {
        println!("[CLIENT] Device found: {}. Pairing...", endpoint);
    }

    fn on_pairing_result(&self, endpoint: &CandidateEndpoint, paired: bool, output: &str) {
        if paired {
            println!("[CLIENT] ==> Paired with {}", endpoint);
        } else {
            println!("[CLIENT] Pairing with {} failed: {}", endpoint, output.trim());
        }
    }
}

fn parse_start(args: &[String]) -> Result<StartOptions> {
    let [camera, resolution, fps, rest @ ..] = args else {
        bail!("start needs <camera> <WxH> <fps>");
    };
    let mut options = StartOptions::new(camera.as_str(), resolution.as_str(), fps.as_str());
    let mut positional = 0;
    let mut rest = rest.iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--mirror" => options.mirror = true,
            "--serial" => {
                options.serial = Some(rest.next().context("--serial needs a value")?.clone());
            }
            value if positional == 0 => {
                options.quality = value.parse::<QualityTier>()?;
                positional += 1;
            }
            value if positional == 1 => {
                options.rotation = value.parse::<Rotation>()?;
                positional += 1;
            }
            other => bail!("unexpected argument {:?}", other),
        }
    }
    Ok(options)
}

async fn pair(client: &PopClient) -> Result<i32> {
    let secret = PairingSecret::generate();
    println!("Scan this QR code payload with your phone:\n");
    println!("  {}\n", client.pairing_descriptor(&secret));
    println!("  Phone -> Settings -> Developer Options -> Wireless debugging");
    println!("  -> Pair device with QR code\n");
    println!("Waiting for device... (Ctrl+C to cancel)");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = client.pair(&secret, cancel).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome.endpoint_address {
        Some(address) if outcome.paired => {
            println!("\nPairing complete! Now connect with:");
            println!("  cli connect {} <port>", address);
            println!("(Get the port from the Wireless debugging screen on the phone)");
            Ok(0)
        }
        _ => {
            println!("\nNo device paired. Make sure to:");
            println!("  1. Enable Wireless debugging on your phone");
            println!("  2. Tap 'Pair device with QR code'");
            println!("  3. Scan the QR code payload above");
            Ok(1)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("popdroidcam=info")),
        )
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let config = if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
        let path = args[1].clone();
        args.drain(..2);
        PopConfig::load(&path)?
    } else {
        PopConfig::default()
    };

    let Some((command, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        process::exit(2);
    };

    let client = PopClient::new(config).with_events(Arc::new(ConsoleEvents));
    let code = match command.as_str() {
        "pair" => pair(&client).await?,
        "connect" => {
            let [ip, port] = rest else {
                bail!("connect needs <ip> <port>");
            };
            let port: u16 = port.parse().context("port must be a number")?;
            let ok = client.connect(ip, port).await;
            println!("{}", serde_json::json!({ "success": ok }));
            if ok { 0 } else { 1 }
        }
        "disconnect" => {
            client.disconnect().await;
            0
        }
        "devices" => {
            println!("{}", serde_json::to_string_pretty(&client.devices().await)?);
            0
        }
        "cameras" => {
            let cameras = client.cameras(rest.first().map(String::as_str)).await;
            println!("{}", serde_json::to_string_pretty(&cameras)?);
            0
        }
        "status" => {
            println!("{}", serde_json::to_string_pretty(&client.status())?);
            0
        }
        "start" => {
            let outcome = client.start(&parse_start(rest)?);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.success { 0 } else { 1 }
        }
        "quick-start" => {
            let outcome = client.quick_start().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if outcome.success { 0 } else { 1 }
        }
        "stop" => {
            let stopped = client.stop();
            println!("{}", serde_json::json!({ "success": stopped }));
            if stopped { 0 } else { 1 }
        }
        other => {
            eprintln!("Unknown command {:?}\n\n{}", other, USAGE);
            2
        }
    };
    process::exit(code);
}
