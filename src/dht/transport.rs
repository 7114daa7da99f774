//! The UDP socket boundary: a background thread reads datagrams off the wire and hands them to
//! callers through a channel, so the RPC engine never blocks on `recv_from` directly.

use crate::common::*;
use std::net::UdpSocket;

/// Datagrams larger than this are refused on send rather than silently fragmented by the OS;
/// BEP-5 traffic never needs anything close to this size.
pub const MAX_DATAGRAM_LEN: usize = 1500;

#[derive(Debug)]
pub struct Datagram {
  pub bytes: Vec<u8>,
  pub from: SocketAddrV4,
}

/// A UDP socket bound once at startup, with a dedicated reader thread feeding received
/// datagrams into an `mpsc` channel.
pub struct UdpTransport {
  socket: UdpSocket,
  inbox: Mutex<mpsc::Receiver<Datagram>>,
}

impl UdpTransport {
  pub fn bind(addr: SocketAddrV4) -> Result<Arc<Self>> {
    let socket = UdpSocket::bind(addr).context(error::Transport)?;
    let reader_socket = socket.try_clone().context(error::Transport)?;

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || Self::read_loop(reader_socket, tx));

    Ok(Arc::new(UdpTransport {
      socket,
      inbox: Mutex::new(rx),
    }))
  }

  fn read_loop(socket: UdpSocket, tx: mpsc::Sender<Datagram>) {
    // One byte larger than the cap so a datagram exactly at the cap doesn't look truncated and
    // one a single byte over is still detectably oversized rather than silently clipped.
    let mut buf = [0u8; MAX_DATAGRAM_LEN + 1];
    loop {
      match socket.recv_from(&mut buf) {
        Ok((len, std::net::SocketAddr::V4(from))) if len > MAX_DATAGRAM_LEN => {
          warn!("dropping oversized datagram from {} ({} bytes)", from, len);
        }
        Ok((len, std::net::SocketAddr::V4(from))) => {
          let datagram = Datagram {
            bytes: buf[..len].to_vec(),
            from,
          };
          if tx.send(datagram).is_err() {
            return;
          }
        }
        Ok((_, std::net::SocketAddr::V6(_))) => {
          // This node only speaks the IPv4 Mainline DHT; drop anything that arrived over v6.
          continue;
        }
        Err(err) => {
          warn!("udp read failed: {}", err);
        }
      }
    }
  }

  pub fn local_addr(&self) -> Result<SocketAddrV4> {
    match self.socket.local_addr().context(error::Transport)? {
      std::net::SocketAddr::V4(addr) => Ok(addr),
      std::net::SocketAddr::V6(_) => unreachable!("bound with an IPv4 address"),
    }
  }

  pub fn send_to(&self, bytes: &[u8], addr: SocketAddrV4) -> Result<()> {
    if bytes.len() > MAX_DATAGRAM_LEN {
      return error::DatagramTooLarge {
        len: bytes.len(),
        cap: MAX_DATAGRAM_LEN,
      }
      .fail();
    }
    self
      .socket
      .send_to(bytes, addr)
      .context(error::Transport)?;
    Ok(())
  }

  /// Blocks until a datagram arrives or `timeout` elapses.
  pub fn recv_timeout(&self, timeout: Duration) -> Option<Datagram> {
    self.inbox.lock().unwrap().recv_timeout(timeout).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
  }

  #[test]
  fn send_and_receive_a_datagram() {
    let a = UdpTransport::bind(loopback(0)).unwrap();
    let b = UdpTransport::bind(loopback(0)).unwrap();
    let b_addr = b.local_addr().unwrap();

    a.send_to(b"hello", b_addr).unwrap();
    let datagram = b.recv_timeout(Duration::from_secs(5)).expect("datagram arrives");
    assert_eq!(datagram.bytes, b"hello");
  }

  #[test]
  fn oversized_datagram_is_rejected_before_sending() {
    let a = UdpTransport::bind(loopback(0)).unwrap();
    let b_addr = loopback(1);
    let too_big = vec![0u8; MAX_DATAGRAM_LEN + 1];
    assert!(a.send_to(&too_big, b_addr).is_err());
  }
}
