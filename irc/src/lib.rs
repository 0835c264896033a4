//! The chat application sitting above the TCP engine: a global registry of
//! nicknames and channel membership, plus the `\r\n`-delimited line
//! protocol parsed in `commands`. A single owned registry with no locks,
//! since everything here runs on one cooperative executor.

mod commands;

use core::net::{IpAddr, Ipv4Addr};
use std::collections::{HashMap, HashSet};
use std::os::unix::net::UnixStream;

use collections::bytes::Slice;
use log::info;
use net::tcp::Connection;
use stakker::{actor, call, fwd_to, ret_shutdown, ActorOwn, CX};

/// A connection's identity as seen by the registry: its remote IPv4/port,
/// since the server has exactly one listening local port.
pub(crate) type Peer = (IpAddr, u16);

struct Client {
	conn: Connection,
	nick: String,
	channels: HashSet<String>,
	residue: Vec<u8>,
}

/// Owns the link/IPv4/TCP engines and the chat state layered on top of
/// them. The unique root of the actor tree for this program.
pub struct Server {
	net: ActorOwn<net::Interface>,

	clients: HashMap<Peer, Client>,
	/// Lowercased nickname -> owning connection.
	nicks: HashMap<String, Peer>,
	/// Lowercased channel name -> member connections.
	channels: HashMap<String, HashSet<Peer>>,
}

impl Server {
	/// Bring up the link and IPv4/TCP engines and start listening for chat
	/// connections on `port`. `lines` pairs each peer's IPv4 address with
	/// the serial line that reaches it.
	pub fn init(cx: CX![], lines: Vec<(Ipv4Addr, UnixStream)>, my_addr: Ipv4Addr, routes: &[(Ipv4Addr, u8, Ipv4Addr)], port: u16) -> Option<Self> {
		let up = fwd_to!([cx], on_frame() as (Slice));
		let link = actor!(cx, link::Interface::init(lines, up), ret_shutdown!(cx));

		let net = actor!(cx, net::Interface::init(link, my_addr, routes), ret_shutdown!(cx));

		let accept = fwd_to!([cx], accept() as (Connection));
		call!([net], listen(port, accept));

		info!("Listening for chat connections on TCP port {port}");

		Some(Self { net, clients: HashMap::new(), nicks: HashMap::new(), channels: HashMap::new() })
	}

	fn on_frame(&mut self, _: CX![], buf: Slice) {
		call!([self.net], recv(buf));
	}

	fn accept(&mut self, cx: CX![], conn: Connection) {
		let (addr, port) = conn.remote();
		info!("New connection from {addr}:{port}");

		conn.register_receiver(fwd_to!([cx], data(addr, port) as (Slice)));
		self.clients.insert((addr, port), Client { conn, nick: "*".into(), channels: HashSet::new(), residue: Vec::new() });
	}

	fn data(&mut self, _: CX![], addr: IpAddr, port: u16, bytes: Slice) {
		let peer = (addr, port);

		if bytes.is_empty() {
			return self.quit(peer);
		}

		let Some(client) = self.clients.get_mut(&peer) else { return };
		client.residue.extend_from_slice(&bytes);

		let mut lines = Vec::new();
		while let Some(pos) = client.residue.windows(2).position(|w| w == b"\r\n") {
			lines.push(client.residue.drain(..pos + 2).collect::<Vec<u8>>());
		}

		for mut line in lines {
			info!("Message received from {addr}:{port}: {:?}", String::from_utf8_lossy(&line));
			line.truncate(line.len() - 2);
			commands::dispatch(self, peer, &line);
		}
	}

	fn quit(&mut self, peer: Peer) {
		let Some(client) = self.clients.remove(&peer) else { return };
		info!("Connection closed with {}:{}", peer.0, peer.1);

		let mut peers = HashSet::new();
		for channel in &client.channels {
			if let Some(members) = self.channels.get_mut(channel) {
				members.remove(&peer);
				if members.is_empty() {
					self.channels.remove(channel);
				} else {
					peers.extend(members.iter().copied());
				}
			}
		}

		if client.nick != "*" {
			self.nicks.remove(&client.nick.to_ascii_lowercase());
		}

		let line = format!(":{} QUIT :Connection closed\r\n", client.nick).into_bytes();
		for member in peers {
			self.send_to(member, &line);
		}

		client.conn.close();
	}

	fn send_to(&self, peer: Peer, line: &[u8]) {
		let Some(client) = self.clients.get(&peer) else { return };

		let mut buf = Slice::new(line.len());
		buf.copy_from_slice(line);
		client.conn.send(buf);
	}

	fn nick_of(&self, peer: Peer) -> String {
		self.clients.get(&peer).map_or_else(|| "*".into(), |c| c.nick.clone())
	}

	fn registered(&self, peer: Peer) -> bool {
		self.nick_of(peer) != "*"
	}

	fn peer_by_nick(&self, nick: &str) -> Option<Peer> {
		self.nicks.get(&nick.to_ascii_lowercase()).copied()
	}

	/// Attempt to rename `peer` to `requested`. `Ok(previous)` on success
	/// (`previous` may be `"*"` for a first-time registration); `Err(current)`
	/// if `requested` collides with another connection's nickname.
	fn try_rename(&mut self, peer: Peer, requested: &str) -> Result<String, String> {
		let current = self.nick_of(peer);
		let key = requested.to_ascii_lowercase();

		if self.nicks.contains_key(&key) {
			return Err(current);
		}

		if current != "*" {
			self.nicks.remove(&current.to_ascii_lowercase());
		}

		self.nicks.insert(key, peer);

		if let Some(client) = self.clients.get_mut(&peer) {
			client.nick = requested.to_string();
		}

		Ok(current)
	}

	fn channel_members(&self, channel: &str) -> Vec<Peer> {
		self.channels.get(channel).map(|m| m.iter().copied().collect()).unwrap_or_default()
	}

	fn is_member(&self, peer: Peer, channel: &str) -> bool {
		self.clients.get(&peer).is_some_and(|c| c.channels.contains(channel))
	}

	fn join_channel(&mut self, peer: Peer, channel: &str) -> Vec<Peer> {
		let members = self.channels.entry(channel.to_string()).or_default();
		members.insert(peer);
		let result: Vec<Peer> = members.iter().copied().collect();

		if let Some(client) = self.clients.get_mut(&peer) {
			client.channels.insert(channel.to_string());
		}

		result
	}

	/// Remove `peer` from `channel`, returning the remaining members (empty
	/// if the channel is now gone).
	fn part_channel(&mut self, peer: Peer, channel: &str) -> Vec<Peer> {
		let remaining = match self.channels.get_mut(channel) {
			Some(members) => {
				members.remove(&peer);

				if members.is_empty() {
					self.channels.remove(channel);
					Vec::new()
				} else {
					members.iter().copied().collect()
				}
			}
			None => Vec::new(),
		};

		if let Some(client) = self.clients.get_mut(&peer) {
			client.channels.remove(channel);
		}

		remaining
	}
}
