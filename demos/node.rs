//! Interactive node: `cargo run --example node -- <port> [bootstrap-port]`
//!
//! Commands:
//!   /ping <addr>    ping a node, e.g. `/ping 127.0.0.1:4001`
//!   /put <text>     store text on the network
//!   /get <id>       find a value by its hex id
//!   /save <text>    store text locally only
//!   /load <id>      read a value from the local store
//!   /send <text>    send a Store to every connected node
//!   /table          dump the routing table
//!   /quit           exit
//! Anything else is sent as a text message to every connected node.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::str::FromStr;
use std::thread;

use clap::Parser;
use kadht::{Bytes, Dht, Id};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    port: u16,
    /// Port of a node on this machine to bootstrap from
    bootstrap: Option<u16>,
    /// Show every frame sent and received
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::TRACE
        } else {
            Level::INFO
        })
        .init();

    let bootstrap: Vec<String> = cli
        .bootstrap
        .map(|port| format!("127.0.0.1:{port}"))
        .into_iter()
        .collect();

    let dht = Dht::builder()
        .port(cli.port)
        .bootstrap(&bootstrap)
        .build()
        .expect("Failed to start node");

    println!("Node {} listening on {}", dht.id(), dht.local_addr());

    let interrupted = dht.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("Received Ctrl+C! Shutting down...");
        interrupted.shutdown();
        std::process::exit(0);
    })
    .expect("Error setting Ctrl-C handler");

    let messages = dht.messages().expect("node stopped");
    thread::spawn(move || {
        for (from, text) in messages.iter() {
            println!("{} ({}): {}", from.id(), from.address(), text);
        }
    });

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();

        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));

        match command {
            "/quit" => break,
            "/ping" => match SocketAddr::from_str(argument) {
                Ok(address) => match dht.ping(address) {
                    Ok(contact) => println!("Pong from {}", contact.id()),
                    Err(error) => println!("Ping failed: {error}"),
                },
                Err(_) => println!("Usage: /ping <ip:port>"),
            },
            "/put" => match dht.put(Bytes::from(argument.to_string())) {
                Ok(id) => println!("Stored as {id}"),
                Err(error) => println!("Put failed: {error}"),
            },
            "/get" => match Id::from_str(argument) {
                Ok(id) => match dht.get(id) {
                    Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
                    Ok(None) => println!("Not found"),
                    Err(error) => println!("{error}"),
                },
                Err(error) => println!("{error}"),
            },
            "/save" => match dht.save_local(Bytes::from(argument.to_string())) {
                Ok(id) => println!("Saved as {id}"),
                Err(error) => println!("Save failed: {error}"),
            },
            "/load" => match Id::from_str(argument) {
                Ok(id) => match dht.load_local(id) {
                    Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
                    Ok(None) => println!("Not found"),
                    Err(error) => println!("{error}"),
                },
                Err(error) => println!("{error}"),
            },
            "/send" => match dht.send_store(Bytes::from(argument.to_string())) {
                Ok(id) => println!("Sent as {id}"),
                Err(error) => println!("Send failed: {error}"),
            },
            "/table" => match dht.routing_table() {
                Ok(table) => print!("{table}"),
                Err(error) => println!("{error}"),
            },
            "" => {}
            _ => match dht.say(line) {
                Ok(count) => println!("Sent to {count} nodes"),
                Err(error) => println!("{error}"),
            },
        }
    }

    dht.shutdown();
}
