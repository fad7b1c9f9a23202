//! Serverless peer-to-peer chat in a terminal.
//!
//! One side runs `/offer` and sends the printed offer to the other side by any
//! means (chat, e-mail, a sticky note). The other side pastes it and sends the
//! printed answer back. Once the answer is pasted, lines typed on either side
//! go over a direct data channel.
//!
//!   pastewire --stun stun:stun.l.google.com:19302
//!   RUST_LOG=pastewire=debug pastewire --config pastewire.toml

mod cli;
mod repl;

use clap::Parser;
use pastewire_core::{EventStream, PeerConnectionAdapter, SignalingStateMachine};
use pastewire_webrtc::WebRtcAdapter;
use repl::{Command, Input};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(cli.log_directive().parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = cli.signaling_config()?;
    let adapter = WebRtcAdapter::new(tokio::runtime::Handle::current())?;
    let machine = SignalingStateMachine::new(adapter, config);
    let printer = tokio::spawn(print_events(machine.events(), cli.json));

    println!("{}", repl::HELP);
    let result = read_input(&machine).await;

    machine.destroy();
    printer.abort();
    tracing::info!("bye");
    result
}

async fn read_input<A: PeerConnectionAdapter>(
    machine: &SignalingStateMachine<A>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        match repl::parse(&line) {
            Input::Empty => {}
            Input::Command(Command::Quit) => return Ok(()),
            Input::Command(command) => run(machine, command),
            Input::Unknown(command) => println!("unknown command {command}, try /help"),
            Input::Text(text) => machine.submit(text),
        }
    }
}

fn run<A: PeerConnectionAdapter>(machine: &SignalingStateMachine<A>, command: Command) {
    match command {
        Command::Offer => machine.make_offer(),
        Command::Wait => machine.wait_for_offer(),
        Command::State => println!("{}", machine.state()),
        Command::Destroy => machine.destroy(),
        Command::Help => println!("{}", repl::HELP),
        Command::Quit => {}
    }
}

async fn print_events(mut events: EventStream, json: bool) {
    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!("cannot encode event: {}", err),
            }
        } else {
            println!("{event}");
        }
    }
    if events.dropped() > 0 {
        tracing::debug!("{} events dropped", events.dropped());
    }
}
