use anyhow::{Context, Result};
use clap::Parser;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "poke client: sends GETs on one connection and prints the replies")]
struct Cli {
    /// host:port of the server
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// request paths, sent back-to-back on the same connection
    #[arg(default_value = "/")]
    paths: Vec<String>,

    /// ask the server to keep the connection open between requests
    #[arg(short, long)]
    keep_alive: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut stream =
        TcpStream::connect(&cli.addr).with_context(|| format!("connect {}", cli.addr))?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    for (i, path) in cli.paths.iter().enumerate() {
        let last = i + 1 == cli.paths.len();
        let connection = if cli.keep_alive && !last {
            "keep-alive"
        } else {
            "close"
        };
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: {connection}\r\n\r\n", cli.addr);
        stream.write_all(request.as_bytes())?;
    }

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&chunk[..n]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(err) => return Err(err).context("read response"),
        }
    }

    print!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
