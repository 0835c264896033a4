//! The link layer: one SLIP-framed serial line per configured peer, muxed
//! behind a single actor so the IP layer can address a `next_hop` without
//! caring which physical line actually reaches it.

mod framer;

use core::net::Ipv4Addr;
use std::os::unix::net::UnixStream;

use collections::bytes::{Cursor, Slice};
use collections::map::{Entry, Map};
use log::{error, warn};
use runtime::Io;
use stakker::{fwd_to, Fwd, CX};

use framer::Framer;

const CAPACITY: usize = 16;

struct Line {
	peer: Ipv4Addr,
	io: Io<UnixStream>,
	framer: Framer,
}

impl collections::map::Key for Line {
	type Type = Ipv4Addr;

	fn key(&self) -> &Ipv4Addr {
		&self.peer
	}
}

pub struct Interface {
	lines: Map<Line, CAPACITY>,
	up: Fwd<Slice>,
}

impl Interface {
	/// `lines` pairs each peer's IPv4 address with the serial line that
	/// reaches it — in practice one end of a PTY pair or a Unix domain
	/// socket standing in for a real serial cable. `up` receives every
	/// fully reassembled datagram, regardless of which line it arrived on.
	pub fn init(cx: CX![], lines: Vec<(Ipv4Addr, UnixStream)>, up: Fwd<Slice>) -> Option<Self> {
		let mut table = Map::<Line, CAPACITY>::default();

		for (peer, stream) in lines {
			if let Err(err) = stream.set_nonblocking(true) {
				error!("Failed to make serial line to {peer} non-blocking: {err}");
				return None;
			}

			let read_fwd = fwd_to!([cx], read(peer) as (Slice));
			let io = Io::new(stream, read_fwd);

			table.insert_unique(&peer).insert(Line { peer, io, framer: Framer::default() });
		}

		Some(Self { lines: table, up })
	}

	/// Originate a datagram towards `next_hop`. `f` writes the datagram's
	/// bytes into the cursor it's given. Failing to find a line for
	/// `next_hop` means the IP layer routed somewhere this link has no
	/// cable for, which is a programming error, not a runtime condition.
	pub fn write(&mut self, _: CX![], next_hop: Ipv4Addr, f: impl FnOnce(Cursor) + 'static) {
		let Entry::Filled(entry) = self.lines.find_entry(&next_hop) else {
			panic!("no serial line configured for next hop {next_hop}");
		};

		let idx = entry.index();

		let mut raw = vec![0; 1500];
		Cursor::vec(&mut raw, f);

		let frame = framer::encode(&raw);
		let line = &mut self.lines[idx];

		if line.io.write(|mut cursor| { cursor.push(&*frame); }).is_err() {
			warn!("Failed to write frame to line towards {next_hop}");
		}
	}

	fn read(&mut self, _: CX![], peer: Ipv4Addr, buf: Slice) {
		let Self { lines, up } = self;

		let Entry::Filled(entry) = lines.find_entry(&peer) else {
			return warn!("Received bytes from an unconfigured line for {peer}, dropping");
		};

		let line = &mut lines[entry.index()];
		line.framer.feed(&buf, |datagram| up.fwd(datagram));
	}
}
