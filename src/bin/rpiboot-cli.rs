//! Minimal demo program: runs the scanner against the real USB bus and
//! prints lifecycle events to stdout until interrupted. Not part of the
//! library's contract -- a thin wrapper for manual operation.

use clap::Parser;
use rpiboot_core::{
    CallbackSink, Config, ConfigBuilder, FilesystemBlobProvider, Scanner, SessionInfo,
};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rpiboot-cli", about = "Boot Raspberry Pi CM3/CM4 devices over USB")]
struct Args {
    /// Override the blob root directory (falls back to config file / RPIBOOT_BLOB_ROOT).
    #[arg(long)]
    blob_root: Option<String>,

    /// Path to an optional TOML config file.
    #[arg(long)]
    config: Option<String>,

    /// Emit lifecycle events as JSON lines instead of plain text.
    #[arg(long)]
    json: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let blobs = Arc::new(FilesystemBlobProvider::new(config.blob_root.clone()));
    let json = args.json;
    let sink = Arc::new(CallbackSink {
        attach: move |session: &SessionInfo| {
            if json {
                print_json("attach", session);
            } else {
                println!("attach  {} family={:?}", session.port_id, session.family);
            }
        },
        detach: move |session: &SessionInfo| {
            if json {
                print_json("detach", session);
            } else {
                println!("detach  {} progress={}%", session.port_id, session.progress());
            }
        },
        progress: move |session: &SessionInfo| {
            if json {
                print_json("progress", session);
            } else {
                println!("progress {} {}%", session.port_id, session.progress());
            }
        },
        error: move |message: &str| {
            if json {
                println!(r#"{{"event":"error","message":{:?}}}"#, message);
            } else {
                eprintln!("error   {message}");
            }
        },
        ready: move || {
            if json {
                println!(r#"{{"event":"ready"}}"#);
            } else {
                println!("ready");
            }
        },
    });

    let scanner = match Scanner::new(config, blobs, sink) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open USB context: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = scanner.start() {
        eprintln!("failed to start scanner: {e}");
        std::process::exit(1);
    }

    println!("watching for Raspberry Pi devices in USB-boot mode, press Ctrl-C to stop");
    // No signal-handling dependency in this ambient stack: the process
    // relies on the OS default SIGINT handler to terminate it; `stop()`
    // below is reachable only if that default is ever replaced.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

/// Serializes a session event as a single JSON line, tagging it with the
/// event kind since `SessionInfo` itself carries no event-type field.
fn print_json(event: &str, session: &SessionInfo) {
    #[derive(serde::Serialize)]
    struct Tagged<'a> {
        event: &'a str,
        #[serde(flatten)]
        session: &'a SessionInfo,
        progress: u32,
    }
    let tagged = Tagged {
        event,
        session,
        progress: session.progress(),
    };
    match serde_json::to_string(&tagged) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("error   failed to serialize event: {e}"),
    }
}

fn build_config(args: &Args) -> Result<Config, rpiboot_core::ProtocolError> {
    let mut builder = ConfigBuilder::new();
    if let Some(path) = &args.config {
        builder = builder.config_path(path);
    }
    if let Some(root) = &args.blob_root {
        builder = builder.blob_root(root);
    }
    builder.build()
}
