use std::{
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    time::Duration,
};

use crate::{
    config::ServerEndpoint,
    constants::{SERVER_LINK_TIMEOUT, TCP_MAX_LINES_PER_CYCLE, TCP_MAX_LINE_BYTES},
    inbox::Inbox,
    types::Channel,
};

/// Unread input beyond this stays in the socket buffer.
const PENDING_LIMIT: usize = TCP_MAX_LINE_BYTES * TCP_MAX_LINES_PER_CYCLE;
const READ_CHUNK: usize = 256;

pub const BANNER: [&str; 2] = [
    "ESP32 Configuration Server",
    "Type 'help' for available commands",
];

struct ClientConn {
    stream: TcpStream,
    peer: SocketAddr,
    pending: Vec<u8>,
}

/// Plaintext line server with a single live client.
pub struct ControlServer {
    listener: Option<TcpListener>,
    client: Option<ClientConn>,
}

impl Default for ControlServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlServer {
    pub fn new() -> Self {
        Self {
            listener: None,
            client: None,
        }
    }

    pub fn start(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        log::info!("tcp control server listening on {local}");
        self.listener = Some(listener);
        Ok(local)
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Accepts (evicting any previous client), then reads at most a few
    /// complete lines into the TCP slot.
    pub fn update(&mut self, advertised: Option<Ipv4Addr>, inbox: &Inbox) {
        self.accept_pending(advertised);
        self.read_lines(inbox);
    }

    fn accept_pending(&mut self, advertised: Option<Ipv4Addr>) {
        let Some(listener) = &self.listener else {
            return;
        };

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) => {
                log::warn!("tcp accept failed: {err}");
                return;
            }
        };

        if let Some(previous) = self.client.take() {
            log::info!("evicting tcp client {} for {peer}", previous.peer);
            let _ = previous.stream.shutdown(Shutdown::Both);
        }

        if let Err(err) = stream.set_nonblocking(true) {
            log::warn!("tcp client {peer} rejected: {err}");
            return;
        }

        log::info!("tcp client connected from {peer}");
        let mut client = ClientConn {
            stream,
            peer,
            pending: Vec::new(),
        };

        let address = advertised.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
        let greeting = format!("{}\n{}\nIP: {address}\n", BANNER[0], BANNER[1]);
        if let Err(err) = client.stream.write_all(greeting.as_bytes()) {
            log::warn!("tcp greeting to {peer} failed: {err}");
            return;
        }
        self.client = Some(client);
    }

    fn read_lines(&mut self, inbox: &Inbox) {
        let Some(client) = self.client.as_mut() else {
            return;
        };

        let mut buffer = [0_u8; READ_CHUNK];
        let closed = loop {
            if client.pending.len() >= PENDING_LIMIT {
                break false;
            }
            match client.stream.read(&mut buffer) {
                Ok(0) => break true,
                Ok(read) => client.pending.extend_from_slice(&buffer[..read]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break false,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("tcp read from {} failed: {err}", client.peer);
                    break true;
                }
            }
        };

        for line in drain_lines(&mut client.pending, TCP_MAX_LINES_PER_CYCLE) {
            inbox.deliver(Channel::Tcp, &line);
            let echo = format!("Received: {line}\n");
            if let Err(err) = client.stream.write_all(echo.as_bytes()) {
                log::warn!("tcp echo to {} failed: {err}", client.peer);
            }
        }

        if client.pending.len() > TCP_MAX_LINE_BYTES && !client.pending.contains(&b'\n') {
            log::warn!("discarding oversized line from {}", client.peer);
            client.pending.clear();
        }

        if closed {
            log::info!("tcp client {} disconnected", client.peer);
            self.client = None;
        }
    }

    pub fn client_peer(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|client| client.peer)
    }

    pub fn send_response(&mut self, message: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        let mut line = String::with_capacity(message.len() + 1);
        line.push_str(message);
        line.push('\n');
        match client.stream.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("tcp response to {} failed: {err}", client.peer);
                false
            }
        }
    }
}

/// Removes up to `max` complete lines from `pending`, trimmed, skipping
/// blank ones.
fn drain_lines(pending: &mut Vec<u8>, max: usize) -> Vec<String> {
    let mut lines = Vec::new();
    while lines.len() < max {
        let Some(end) = pending.iter().position(|byte| *byte == b'\n') else {
            break;
        };
        let raw: Vec<u8> = pending.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Single outbound connection to a configured sound or light server.
#[derive(Default)]
pub struct ServerLink {
    stream: Option<TcpStream>,
}

impl ServerLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, endpoint: &ServerEndpoint, station_connected: bool) -> bool {
        if !station_connected {
            log::warn!("cannot reach server {}: wifi not connected", endpoint.ip);
            return false;
        }

        let ip: IpAddr = match endpoint.ip.trim().parse() {
            Ok(ip) => ip,
            Err(_) => {
                log::warn!("server address `{}` is not an ip address", endpoint.ip);
                return false;
            }
        };

        self.disconnect();
        let addr = SocketAddr::new(ip, endpoint.port);
        match TcpStream::connect_timeout(&addr, SERVER_LINK_TIMEOUT) {
            Ok(stream) => {
                if let Err(err) = stream.set_read_timeout(Some(Duration::from_millis(50))) {
                    log::warn!("server link read timeout not applied: {err}");
                }
                log::info!("connected to server {addr}");
                self.stream = Some(stream);
                true
            }
            Err(err) => {
                log::warn!("connection to server {addr} failed: {err}");
                false
            }
        }
    }

    pub fn is_server_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn send_data(&mut self, data: &str) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            log::warn!("not connected to a server; data dropped");
            return false;
        };
        match stream.write_all(data.as_bytes()) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("server send failed: {err}");
                self.stream = None;
                false
            }
        }
    }

    /// Returns whatever is already buffered, or an empty string.
    pub fn receive_data(&mut self) -> String {
        let Some(stream) = self.stream.as_mut() else {
            return String::new();
        };
        let mut buffer = [0_u8; 256];
        match stream.read(&mut buffer) {
            Ok(0) => {
                log::info!("server closed the connection");
                self.stream = None;
                String::new()
            }
            Ok(read) => String::from_utf8_lossy(&buffer[..read]).into_owned(),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                String::new()
            }
            Err(err) => {
                log::warn!("server receive failed: {err}");
                self.stream = None;
                String::new()
            }
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader},
        thread,
        time::Instant,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn started() -> (ControlServer, SocketAddr) {
        let mut server = ControlServer::new();
        let addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();
        (server, addr)
    }

    fn pump_until(
        server: &mut ControlServer,
        inbox: &Inbox,
        mut done: impl FnMut(&ControlServer, &Inbox) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            server.update(Some(Ipv4Addr::new(192, 168, 4, 1)), inbox);
            if done(server, inbox) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached within 2s");
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line.trim_end().to_string()
    }

    #[test]
    fn greets_with_banner_and_address() {
        let (mut server, addr) = started();
        let inbox = Inbox::new();
        let client = TcpStream::connect(addr).unwrap();
        pump_until(&mut server, &inbox, |server, _| server.has_client());
        let mut reader = BufReader::new(client);

        assert_eq!(read_line(&mut reader), BANNER[0]);
        assert_eq!(read_line(&mut reader), BANNER[1]);
        assert_eq!(read_line(&mut reader), "IP: 192.168.4.1");
    }

    #[test]
    fn stores_latest_line_and_echoes() {
        let (mut server, addr) = started();
        let inbox = Inbox::new();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"  status  \r\n").unwrap();

        pump_until(&mut server, &inbox, |_, inbox| inbox.has_new(Channel::Tcp));

        assert_eq!(inbox.take(Channel::Tcp), Some("status".to_string()));
        let mut reader = BufReader::new(client);
        for _ in 0..3 {
            read_line(&mut reader);
        }
        assert_eq!(read_line(&mut reader), "Received: status");
    }

    #[test]
    fn drains_bounded_number_of_lines() {
        let mut pending = b"a\n\nb\r\nc\nd\npartial".to_vec();

        assert_eq!(drain_lines(&mut pending, 3), vec!["a", "b", "c"]);
        assert_eq!(pending, b"d\npartial".to_vec());
        assert_eq!(drain_lines(&mut pending, 3), vec!["d"]);
        assert_eq!(pending, b"partial".to_vec());
    }

    #[test]
    fn burst_of_short_lines_stays_in_socket_buffer() {
        let (mut server, addr) = started();
        let inbox = Inbox::new();
        let mut client = TcpStream::connect(addr).unwrap();
        pump_until(&mut server, &inbox, |server, _| server.has_client());
        client.write_all(&b"a\n".repeat(20_000)).unwrap();

        let mut delivered = 0;
        for _ in 0..200 {
            server.update(None, &inbox);
            if inbox.take(Channel::Tcp).is_some() {
                delivered += 1;
            }
            let pending = server.client.as_ref().map_or(0, |client| client.pending.len());
            assert!(pending < PENDING_LIMIT + READ_CHUNK, "pending grew to {pending}");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(delivered > 0);
    }

    #[test]
    fn new_client_evicts_previous_one() {
        let (mut server, addr) = started();
        let inbox = Inbox::new();

        let mut first = TcpStream::connect(addr).unwrap();
        pump_until(&mut server, &inbox, |server, _| server.has_client());

        let mut second = TcpStream::connect(addr).unwrap();
        let second_addr = second.local_addr().unwrap();
        pump_until(&mut server, &inbox, |server, _| {
            server.client_peer() == Some(second_addr)
        });

        let _ = first.write_all(b"from-first\n");
        second.write_all(b"from-second\n").unwrap();
        pump_until(&mut server, &inbox, |_, inbox| inbox.has_new(Channel::Tcp));
        assert_eq!(inbox.take(Channel::Tcp), Some("from-second".to_string()));

        for _ in 0..20 {
            server.update(None, &inbox);
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(inbox.take(Channel::Tcp), None);
    }

    #[test]
    fn server_link_requires_station() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = ServerEndpoint {
            ip: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        let mut link = ServerLink::new();

        assert!(!link.connect(&endpoint, false));
        assert!(link.connect(&endpoint, true));
        assert!(link.is_server_connected());

        let (mut peer, _) = listener.accept().unwrap();
        assert!(link.send_data("volume:5"));
        let mut received = [0_u8; 8];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"volume:5");

        peer.write_all(b"ok").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut reply = String::new();
        while reply.is_empty() && Instant::now() < deadline {
            reply = link.receive_data();
        }
        assert_eq!(reply, "ok");

        link.disconnect();
        assert!(!link.is_server_connected());
    }
}
