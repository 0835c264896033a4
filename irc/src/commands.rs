//! The line protocol: parses one already-delimited message and dispatches
//! it to the matching handler. Grounded on the reference's verb table —
//! PING, NICK, PRIVMSG, JOIN, PART are the only recognised verbs.

use log::info;

use crate::{Peer, Server};

const NAMES_LINE_LIMIT: usize = 510;

/// `^[A-Za-z][A-Za-z0-9_-]*$`, hand-rolled since no regex crate is in the
/// dependency graph.
pub(crate) fn valid_name(name: &[u8]) -> bool {
	let mut bytes = name.iter();

	match bytes.next() {
		Some(b) if b.is_ascii_alphabetic() => {}
		_ => return false,
	}

	bytes.all(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
}

fn trim(line: &[u8]) -> &[u8] {
	let is_space = |b: &u8| matches!(b, b' ' | b'\r' | b'\n');
	let start = line.iter().position(|b| !is_space(b)).unwrap_or(line.len());
	let end = line.iter().rposition(|b| !is_space(b)).map_or(start, |i| i + 1);
	&line[start..end]
}

fn join(fields: &[&[u8]]) -> Vec<u8> {
	fields.join(&b' ')
}

pub(crate) fn dispatch(server: &mut Server, peer: Peer, line: &[u8]) {
	let trimmed = trim(line);
	let fields: Vec<&[u8]> = trimmed.split(|&b| b == b' ').collect();

	if fields.len() < 2 {
		return;
	}

	let verb = fields[0].to_ascii_uppercase();
	let rest = &fields[1..];

	match verb.as_slice() {
		b"PING" => ping(server, peer, &join(rest)),
		b"NICK" => nick(server, peer, rest[0]),
		b"PRIVMSG" if rest.len() >= 2 => {
			let target = rest[0];
			let content = join(&rest[1..]);

			if target.first() == Some(&b'#') {
				privmsg_channel(server, peer, target, &content);
			} else {
				privmsg_personal(server, peer, target, &content);
			}
		}
		b"JOIN" if server.registered(peer) => join_channel(server, peer, rest[0]),
		b"PART" => part(server, peer, rest[0]),
		_ => {}
	}
}

fn ping(server: &mut Server, peer: Peer, payload: &[u8]) {
	let mut line = b":server PONG server :".to_vec();
	line.extend_from_slice(payload);
	line.extend_from_slice(b"\r\n");

	server.send_to(peer, &line);
}

fn nick(server: &mut Server, peer: Peer, requested: &[u8]) {
	if !valid_name(requested) {
		let current = server.nick_of(peer);
		let mut line = format!(":server 432 {current} ").into_bytes();
		line.extend_from_slice(requested);
		line.extend_from_slice(b" :Erroneous nickname\r\n");
		server.send_to(peer, &line);
		return;
	}

	let Ok(requested) = std::str::from_utf8(requested) else { return };

	match server.try_rename(peer, requested) {
		Ok(previous) if previous == "*" => {
			server.send_to(peer, format!(":server 001 {requested} :Welcome\r\n").as_bytes());
			server.send_to(peer, format!(":server 422 {requested} :MOTD File is missing\r\n").as_bytes());
			info!("{peer:?} registered as {requested}");
		}
		Ok(previous) => {
			server.send_to(peer, format!(":{previous} NICK {requested}\r\n").as_bytes());
		}
		Err(current) => {
			server.send_to(peer, format!(":server 433 {current} {requested} :Nickname is already in use\r\n").as_bytes());
		}
	}
}

fn privmsg_personal(server: &mut Server, peer: Peer, target: &[u8], content: &[u8]) {
	if !server.registered(peer) || content.len() < 2 || content[0] != b':' {
		return;
	}

	let Ok(target) = std::str::from_utf8(target) else { return };
	let Some(dest) = server.peer_by_nick(target) else { return };
	let sender = server.nick_of(peer);
	let dest_nick = server.nick_of(dest);

	let mut line = format!(":{sender} PRIVMSG {dest_nick} ").into_bytes();
	line.extend_from_slice(content);
	line.extend_from_slice(b"\r\n");

	server.send_to(dest, &line);
}

fn privmsg_channel(server: &mut Server, peer: Peer, channel: &[u8], content: &[u8]) {
	if !server.registered(peer) || content.len() < 2 || content[0] != b':' {
		return;
	}

	let Ok(channel) = std::str::from_utf8(channel) else { return };
	let channel = channel.to_ascii_lowercase();
	let sender = server.nick_of(peer);

	let mut line = format!(":{sender} PRIVMSG {channel} ").into_bytes();
	line.extend_from_slice(content);
	line.extend_from_slice(b"\r\n");

	for member in server.channel_members(&channel) {
		if member != peer {
			server.send_to(member, &line);
		}
	}
}

fn join_channel(server: &mut Server, peer: Peer, channel: &[u8]) {
	if channel.first() != Some(&b'#') || !valid_name(&channel[1..]) {
		let mut line = b":server 403 ".to_vec();
		line.extend_from_slice(channel);
		line.extend_from_slice(b" :No such channel\r\n");
		server.send_to(peer, &line);
		return;
	}

	let Ok(channel) = std::str::from_utf8(channel) else { return };
	let channel = channel.to_ascii_lowercase();
	let sender = server.nick_of(peer);

	let members = server.join_channel(peer, &channel);

	let announce = format!(":{sender} JOIN :{channel}\r\n").into_bytes();
	for member in &members {
		if *member != peer {
			server.send_to(*member, &announce);
		}
	}
	server.send_to(peer, &announce);

	let mut names: Vec<String> = members.iter().map(|p| server.nick_of(*p).to_ascii_lowercase()).collect();
	names.sort();

	let mut buf = format!(":server 353 {sender} = {channel} :").into_bytes();
	for name in names {
		if buf.len() + name.len() < NAMES_LINE_LIMIT {
			buf.extend_from_slice(name.as_bytes());
			buf.push(b' ');
		} else {
			buf.pop();
			buf.extend_from_slice(b"\r\n");
			server.send_to(peer, &buf);

			buf = format!(":server 353 {sender} = {channel} :{name} ").into_bytes();
		}
	}
	buf.pop();
	buf.extend_from_slice(b"\r\n");
	server.send_to(peer, &buf);

	server.send_to(peer, format!(":server 366 {sender} {channel} :End of /NAMES list.\r\n").as_bytes());
}

fn part(server: &mut Server, peer: Peer, channel: &[u8]) {
	let Ok(channel) = std::str::from_utf8(channel) else { return };
	let channel = channel.to_ascii_lowercase();

	if !server.is_member(peer, &channel) {
		return;
	}

	let sender = server.nick_of(peer);
	let remaining = server.part_channel(peer, &channel);

	let line = format!(":{sender} PART {channel}\r\n").into_bytes();
	for member in &remaining {
		server.send_to(*member, &line);
	}
	server.send_to(peer, &line);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn valid_name_requires_leading_letter() {
		assert!(valid_name(b"alice"));
		assert!(valid_name(b"a1_2-3"));
		assert!(!valid_name(b"1alice"));
		assert!(!valid_name(b"_alice"));
		assert!(!valid_name(b""));
	}

	#[test]
	fn valid_name_rejects_punctuation() {
		assert!(!valid_name(b"al ice"));
		assert!(!valid_name(b"alice!"));
		assert!(!valid_name(b"ali#ce"));
	}

	#[test]
	fn trim_strips_leading_and_trailing_whitespace_and_crlf() {
		assert_eq!(trim(b"  NICK alice\r\n"), b"NICK alice");
		assert_eq!(trim(b"NICK alice"), b"NICK alice");
		assert_eq!(trim(b"   "), b"");
	}

	#[test]
	fn join_rejoins_fields_with_single_spaces() {
		let fields: Vec<&[u8]> = vec![b"hello", b"there", b"world"];
		assert_eq!(join(&fields), b"hello there world");
	}
}
