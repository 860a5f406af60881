use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::coordinator::Coordinator;
use crate::protocol::{self, Handshake, ProtocolError};

/// Pause between sending a session its new cap and reading its next
/// sample.
pub const TICK_SPACING: Duration = Duration::from_millis(250);
/// Grace period for the three handshake lines; after the handshake the
/// only read bound is TCP keepalive.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] LinesCodecError),
    #[error("endpoint evicted mid-round")]
    Evicted,
}

/// Accept connections until shutdown, one session task per job.
pub async fn serve(coord: Arc<Coordinator>, listener: TcpListener) {
    let mut shutdown = coord.shutdown_signal();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let coord = Arc::clone(&coord);
                    tokio::spawn(async move {
                        run(coord, stream, peer.to_string()).await;
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
    }
}

/// Drive one connection through its lifecycle: handshake, register, then
/// the sample/barrier/cap loop until the peer goes away. Whatever ends the
/// session, the endpoint is deregistered on the way out.
pub async fn run(coord: Arc<Coordinator>, stream: TcpStream, peer: String) {
    let mut framed = Framed::new(stream, LinesCodec::new());
    let handshake = match timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut framed)).await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            warn!("{}: handshake failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("{}: {}", peer, ProtocolError::HandshakeTimeout);
            return;
        }
    };
    info!(
        "new endpoint {}: {} hosts, {} W ({})",
        peer,
        handshake.host_count,
        handshake.initial_power,
        handshake.profile.trim()
    );
    let initial_cap = coord.register_endpoint(&peer, handshake.host_count, &handshake.profile);
    if let Err(e) = framed.send(initial_cap.to_string()).await {
        warn!("{}: initial cap write failed: {}", peer, e);
        coord.remove_endpoint(&peer);
        return;
    }

    match sample_loop(&coord, &mut framed, &peer).await {
        Ok(()) => info!("endpoint {} closed", peer),
        Err(e) => warn!("endpoint {} dropped: {}", peer, e),
    }
    coord.remove_endpoint(&peer);
}

async fn read_handshake(
    framed: &mut Framed<TcpStream, LinesCodec>,
) -> Result<Handshake, SessionError> {
    let mut lines = [String::new(), String::new(), String::new()];
    for slot in lines.iter_mut() {
        *slot = match framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProtocolError::TruncatedHandshake.into()),
        };
    }
    Ok(Handshake::from_lines(&lines[0], &lines[1], &lines[2])?)
}

async fn sample_loop(
    coord: &Coordinator,
    framed: &mut Framed<TcpStream, LinesCodec>,
    peer: &str,
) -> Result<(), SessionError> {
    let mut shutdown = coord.shutdown_signal();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            item = framed.next() => match item {
                // EOF between records is how a job says goodbye.
                None => return Ok(()),
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(e.into()),
            },
        };
        let sample = protocol::parse_sample(&line)?;
        let generation = coord
            .sample_arrived(peer, &sample)
            .ok_or(SessionError::Evicted)?;
        if !coord.wait_release(generation).await {
            return Ok(());
        }
        let cap = coord.current_cap(peer).ok_or(SessionError::Evicted)?;
        framed.send(cap.to_string()).await?;
        tokio::time::sleep(TICK_SPACING).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use powermodel::{ModelBook, POWER_MAX, POWER_MIN};
    use std::net::SocketAddr;
    use tempdir::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    fn config(dir: &TempDir, total_nodes: u32, cross_job_sharing: bool, target: f64) -> Config {
        Config {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            total_nodes,
            cross_job_sharing,
            average_power_target: Some(target),
            reserve: Some(0.0),
            power_trace: None,
            book: ModelBook::disabled(),
            scheduler: None,
            trace_path: dir.path().join("trace.csv"),
        }
    }

    async fn start(config: Config) -> (Arc<Coordinator>, SocketAddr) {
        let coord = Arc::new(Coordinator::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(Arc::clone(&coord), listener));
        (coord, addr)
    }

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            Self {
                reader: BufReader::new(read),
                writer,
            }
        }

        async fn handshake(&mut self, hosts: u32, power: f64, profile: &str) -> f64 {
            self.writer
                .write_all(format!("{}\n{}\n{}\n", hosts, power, profile).as_bytes())
                .await
                .unwrap();
            self.read_cap().await
        }

        async fn send_sample(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn read_cap(&mut self) -> f64 {
            let mut line = String::new();
            let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a cap")
                .unwrap();
            assert!(read > 0, "connection closed while expecting a cap");
            line.trim().parse().unwrap()
        }

        async fn expect_eof(&mut self) {
            let mut line = String::new();
            let read = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for close")
                .unwrap();
            assert_eq!(read, 0, "expected the server to close, got {:?}", line);
        }
    }

    #[tokio::test]
    async fn single_client_gets_the_idle_adjusted_split() {
        let dir = TempDir::new("gridwatt-session").unwrap();
        let (coord, addr) = start(config(&dir, 2, false, 400.0)).await;
        let mut client = TestClient::connect(addr).await;
        let initial = client.handshake(2, 100.0, "profile=test").await;
        assert_eq!(initial, POWER_MAX);
        client
            .send_sample("100,nan,nan,nan,nan,nan,nan")
            .await;
        let cap = client.read_cap().await;
        assert_eq!(cap, 200.0);

        coord.flush_trace();
        let text = std::fs::read_to_string(dir.path().join("trace.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,target,cap,measured");
        assert!(lines[1].ends_with(",400,400,200"), "unexpected {:?}", lines[1]);
    }

    #[tokio::test]
    async fn two_clients_split_the_budget_evenly() {
        let dir = TempDir::new("gridwatt-session").unwrap();
        let (_coord, addr) = start(config(&dir, 4, true, 800.0)).await;
        let mut a = TestClient::connect(addr).await;
        let mut b = TestClient::connect(addr).await;
        assert_eq!(a.handshake(2, 90.0, "profile=a").await, POWER_MAX);
        assert_eq!(b.handshake(2, 95.0, "profile=b").await, POWER_MAX);
        a.send_sample("90,nan,nan,nan,nan,nan,nan").await;
        b.send_sample("95,nan,nan,nan,nan,nan,nan").await;
        let cap_a = a.read_cap().await;
        let cap_b = b.read_cap().await;
        assert!((cap_a - 200.0).abs() <= 1.0, "cap_a = {}", cap_a);
        assert!((cap_b - 200.0).abs() <= 1.0, "cap_b = {}", cap_b);
    }

    #[tokio::test]
    async fn hot_disconnect_releases_the_waiters() {
        let dir = TempDir::new("gridwatt-session").unwrap();
        let (coord, addr) = start(config(&dir, 6, true, 1200.0)).await;
        let mut first = TestClient::connect(addr).await;
        let mut second = TestClient::connect(addr).await;
        let mut third = TestClient::connect(addr).await;
        first.handshake(2, 90.0, "profile=1").await;
        second.handshake(2, 90.0, "profile=2").await;
        third.handshake(2, 90.0, "profile=3").await;

        first.send_sample("90,nan,nan,nan,nan,nan,nan").await;
        third.send_sample("90,nan,nan,nan,nan,nan,nan").await;
        // Both waiters must be parked before the disconnect to exercise the
        // teardown-fires-the-round path.
        for _ in 0..500 {
            if coord.arrivals() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(coord.arrivals(), 2);

        drop(second);
        let cap_first = first.read_cap().await;
        let cap_third = third.read_cap().await;
        assert!(cap_first >= POWER_MIN && cap_first <= POWER_MAX);
        assert!(cap_third >= POWER_MIN && cap_third <= POWER_MAX);
        assert_eq!(coord.endpoint_count(), 2);
    }

    #[tokio::test]
    async fn malformed_sample_terminates_only_that_session() {
        let dir = TempDir::new("gridwatt-session").unwrap();
        let (coord, addr) = start(config(&dir, 4, true, 800.0)).await;
        let mut good = TestClient::connect(addr).await;
        let mut bad = TestClient::connect(addr).await;
        good.handshake(2, 90.0, "profile=good").await;
        bad.handshake(2, 90.0, "profile=bad").await;

        good.send_sample("90,nan,nan,nan,nan,nan,nan").await;
        bad.send_sample("not,a,sample").await;
        bad.expect_eof().await;
        // The bad session's teardown completed the round for the survivor.
        let cap = good.read_cap().await;
        assert!(cap >= POWER_MIN && cap <= POWER_MAX);
        assert_eq!(coord.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn handshake_must_lead_with_a_host_count() {
        let dir = TempDir::new("gridwatt-session").unwrap();
        let (coord, addr) = start(config(&dir, 4, true, 800.0)).await;
        let mut client = TestClient::connect(addr).await;
        client
            .writer
            .write_all(b"zero\n100.0\nprofile=x\n")
            .await
            .unwrap();
        client.expect_eof().await;
        assert_eq!(coord.endpoint_count(), 0);
    }
}
