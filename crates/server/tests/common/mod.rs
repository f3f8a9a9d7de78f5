#![allow(dead_code)] // each test binary uses its own slice of these helpers

use server::{Config, Server, ServerHandle};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;
use transport::Session;

pub fn free_port() -> u16 {
    let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap().port()
}

pub fn config(trig_mode: u8, timeout_ms: i64) -> Config {
    Config::new(free_port() as u32, trig_mode, timeout_ms, false, 4).unwrap()
}

pub struct Running {
    pub handle: ServerHandle,
    pub port: u16,
    thread: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    pub fn try_connect(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect((Ipv4Addr::LOCALHOST, self.port))
    }

    pub fn stop(self) {
        self.handle.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

/// Bind on a fresh port and run the dispatcher on its own thread. Retries a
/// few times in case another test grabbed the probed port first.
pub fn launch<S, F>(mut cfg: Config, factory: F) -> Running
where
    S: Session + 'static,
    F: Fn(TcpStream, SocketAddr) -> S + Clone + Send + 'static,
{
    for _ in 0..16 {
        match Server::bind(cfg.clone(), factory.clone()) {
            Ok(server) => {
                let port = cfg.port;
                let handle = server.handle();
                let thread = std::thread::spawn(move || server.run());
                return Running {
                    handle,
                    port,
                    thread,
                };
            }
            Err(_) => cfg.port = free_port(),
        }
    }
    panic!("could not bind a test port");
}
