use std::env;
use std::io::Read;

use anyhow::Context;
use rtc_sdp_bridge::{sdp, server, util, BridgeConfig};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "serve" => {
                util::init_log();
                if let Err(e) = serve(args.get(2)) {
                    eprintln!("Server error:\n{e:#}");
                    std::process::exit(1);
                }
            }
            "rewrite" if args.len() == 4 => {
                if let Err(e) = rewrite(&args[2], &args[3]) {
                    eprintln!("Rewrite error:\n{e:#}");
                    std::process::exit(1);
                }
            }
            _ => {
                print_usage();
            }
        }
    } else {
        print_usage();
    }
}

fn serve(config_path: Option<&String>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => BridgeConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => BridgeConfig::default(),
    };
    let config = config.with_env()?;
    server::main(config)
}

fn rewrite(audio_port: &str, video_port: &str) -> anyhow::Result<()> {
    let audio: u16 = audio_port.parse().context("audio port")?;
    let video: u16 = video_port.parse().context("video port")?;

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading sdp from stdin")?;

    println!("{}", sdp::rewrite(&input, audio, video)?);
    Ok(())
}

fn print_usage() {
    println!("RTC SDP Bridge");
    println!("Usage:");
    println!("  rtc-sdp-bridge serve [config.json]            - Start the HTTP signaling front");
    println!("  rtc-sdp-bridge rewrite <audio_port> <video_port> - Rewrite an SDP read from stdin");
}
