//! Black-box integration tests: spawn the compiled proxy binary against
//! a plain blocking `std::net` echo server and drive it as a real
//! client would. No test harness beyond `std` — matching the rest of
//! the crate, this has no async runtime to pull in for tests either.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

/// Bind to an ephemeral port, read it back, and drop the listener.
/// There's a small window before the real owner binds it; the proxy
/// retries its own bind internally on none of this, so callers must
/// retry their *connect* instead.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A trivial echo server: every byte read is written straight back,
/// one thread per connection, until the client closes its write side.
fn spawn_echo_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => continue,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

struct ProxyProcess(Child);

impl Drop for ProxyProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_proxy(listen_port: u16, upstream_port: u16) -> ProxyProcess {
    let child = Command::new(env!("CARGO_BIN_EXE_tcp-splice-proxy"))
        .arg(format!("127.0.0.1:{listen_port}"))
        .arg(format!("127.0.0.1:{upstream_port}"))
        .arg("--nproc")
        .arg("1")
        .arg("--minconn")
        .arg("4")
        .arg("--maxconn")
        .arg("16")
        .arg("--log-level")
        .arg("error")
        .spawn()
        .expect("failed to spawn tcp-splice-proxy binary");
    ProxyProcess(child)
}

/// Connect with a short retry loop: the proxy needs a moment after
/// `spawn()` to bind its listener.
fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(s) => return s,
            Err(_) if std::time::Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("could not connect to proxy on port {port}: {e}"),
        }
    }
}

#[test]
fn relays_bytes_round_trip_through_splice() {
    let upstream_port = free_port();
    spawn_echo_server(upstream_port);

    let listen_port = free_port();
    let _proxy = spawn_proxy(listen_port, upstream_port);

    let mut client = connect_with_retry(listen_port);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let payload = b"the quick brown fox jumps over the lazy dog";
    client.write_all(payload).unwrap();

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, payload);
}

#[test]
fn survives_abrupt_client_disconnect_and_keeps_serving() {
    let upstream_port = free_port();
    spawn_echo_server(upstream_port);

    let listen_port = free_port();
    let _proxy = spawn_proxy(listen_port, upstream_port);

    // Connect and drop immediately without sending anything: exercises
    // the teardown path for a connection that never leaves `Connecting`.
    {
        let _dropped = connect_with_retry(listen_port);
    }

    // The worker must still be alive and accepting new connections.
    let mut client = connect_with_retry(listen_port);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let payload = b"still alive";
    client.write_all(payload).unwrap();

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, payload);
}

#[test]
fn relays_many_small_writes_over_one_connection() {
    let upstream_port = free_port();
    spawn_echo_server(upstream_port);

    let listen_port = free_port();
    let _proxy = spawn_proxy(listen_port, upstream_port);

    let mut client = connect_with_retry(listen_port);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    for i in 0..50u32 {
        let msg = format!("message-{i}\n");
        client.write_all(msg.as_bytes()).unwrap();
        let mut buf = vec![0u8; msg.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg.as_bytes());
    }
}
