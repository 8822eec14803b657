use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use stonenet::{
    setup_local_tracing, AppResult, Client, HeartbeatService, LineCodec, Listener,
    NetConfig, ReconnectService, Server, Session,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// echo every received line back to its sender
    Server,
    /// send stdin lines to the server and print the replies
    Client,
    /// print the loaded configuration and exit
    PrintConfig,
}

struct EchoListener;

impl Listener<String> for EchoListener {
    fn on_session_registered(&self, session: &Arc<Session<String>>) -> AppResult<()> {
        info!("session {} from {:?}", session.id(), session.remote_addr());
        Ok(())
    }

    fn on_message_received(&self, message: String, session: &Arc<Session<String>>) -> AppResult<()> {
        session.send(&message)
    }

    fn on_after_session_closed(&self, session: &Arc<Session<String>>) -> AppResult<()> {
        info!("session {} closed", session.id());
        Ok(())
    }
}

struct PrintListener;

impl Listener<String> for PrintListener {
    fn on_message_received(&self, message: String, _: &Arc<Session<String>>) -> AppResult<()> {
        println!("{}", message);
        Ok(())
    }
}

fn run_server(config: NetConfig) -> AppResult<()> {
    let server = Server::new(config.server, LineCodec::new(), EchoListener)?;
    server.start()?;
    info!("type `quit` or close stdin to stop");
    for line in io::stdin().lock().lines() {
        if line?.trim() == "quit" {
            break;
        }
    }
    server.close();
    Ok(())
}

fn run_client(config: NetConfig) -> AppResult<()> {
    let heartbeat = HeartbeatService::from_config(&config.client);
    let reconnect = ReconnectService::from_config(&config.client);
    let client = Client::new(config.client, LineCodec::new(), PrintListener)?;
    client.add_service(reconnect)?;
    client.add_service(heartbeat)?;
    if let Err(e) = client.connect() {
        warn!("connect failed: {}, retrying in the background", e);
    }
    for line in io::stdin().lock().lines() {
        let line = line?;
        if let Err(e) = client.send(&line) {
            warn!("send failed: {}", e);
        }
    }
    client.close();
    Ok(())
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }
    setup_local_tracing()?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("conf");
            path.push("net.toml");
            path
        },
        PathBuf::from,
    );
    let config = NetConfig::set_up_config(config_path)?;

    match commandline.command {
        Command::Server => run_server(config),
        Command::Client => run_client(config),
        Command::PrintConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}
