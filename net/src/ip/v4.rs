use core::mem::size_of;
use core::net::Ipv4Addr;

use bilge::prelude::*;
use collections::bytes::{Cursor, Slice};
use log::{debug, warn};
use utils::bytes::{self, Cast};
use utils::endian::{b, u16be};
use utils::error::*;

use crate::ip::route::Table;
use crate::ip::Version::V4;
use crate::ip::{icmp, Checksum, DiffServ, Protocol, ToS, ECN};

const DEFAULT_TTL: u8 = 64;

fn pseudo_csum(header: &Header) -> Checksum {
	let mut csum = Checksum::with(bytes::cast(&header.src));
	csum.push_chunk(bytes::cast(&header.dst));
	csum.push_chunk(&[0, 0, 0, header.proto.0]);
	csum
}

/// What a received IPv4 datagram resolved to. The caller (`crate::Interface`)
/// is responsible for actually dispatching these through the link layer or
/// the TCP engine, since that requires the stakker execution context this
/// module deliberately doesn't depend on.
pub enum Recv {
	/// Addressed to us; hand the payload to the TCP engine.
	Deliver { src: Ipv4Addr, csum: Checksum, payload: Slice },
	/// A fully rebuilt datagram (TTL decremented, checksum fixed), ready to
	/// be written verbatim to the line towards `next_hop`.
	Forward { next_hop: Ipv4Addr, datagram: Slice },
	/// TTL expired; `payload` is a complete ICMP Time Exceeded message that
	/// still needs an IPv4 header wrapped around it, addressed to `dst` and
	/// routed towards `next_hop`.
	TimeExceeded { next_hop: Ipv4Addr, dst: Ipv4Addr, payload: Slice },
}

pub struct Interface {
	/// This host's own IPv4 address. Datagrams addressed elsewhere are forwarded.
	addr: Ipv4Addr,
	/// Wraps modulo 2^16; incremented once per locally originated datagram.
	identification: u16,
	routes: Table,
}

impl Interface {
	pub fn recv(&mut self, mut buf: Slice) -> Result<Recv> {
		let header: &Header = buf.split();

		let frag = header.frg.get();

		if frag.more() || frag.ofst().value() != 0 {
			debug!("Fragmented IPv4 packet received, discarding (fragmentation is unsupported)");
			return Err(());
		}

		let header_len = 4 * header.ver.ihl().value() as usize;
		let _options: &[u8] = buf.split_n(header_len - size_of::<Header>());

		if header.csm != [0, 0] && Checksum::of(bytes::as_slice(header)).end() != [0, 0] {
			warn!("IPv4 packet has invalid header checksum, dropping");
			return Err(());
		}

		buf.truncate(header.len.get() as usize - header_len);

		if header.dst == self.addr {
			return self.deliver(header, buf);
		}

		self.forward(header, buf)
	}

	fn deliver(&mut self, header: &Header, payload: Slice) -> Result<Recv> {
		if header.proto.get() != Protocol::Tcp {
			debug!("Dropping non-TCP datagram addressed to this host");
			return Err(());
		}

		Ok(Recv::Deliver { src: header.src, csum: pseudo_csum(header), payload })
	}

	fn forward(&mut self, header: &Header, buf: Slice) -> Result<Recv> {
		let new_ttl = header.ttl.wrapping_sub(1);

		if header.ttl == 0 || new_ttl == 0 {
			return self.time_exceeded(header, buf);
		}

		let Some(next_hop) = self.routes.lookup(header.dst) else {
			warn!("No route to {}, dropping forwarded datagram", header.dst);
			return Err(());
		};

		let mut datagram = Slice::new(size_of::<Header>() + buf.len());
		datagram[..size_of::<Header>()].copy_from_slice(bytes::as_slice(header));
		datagram[size_of::<Header>()..].copy_from_slice(&buf);

		let out_header: &mut Header = bytes::cast_mut(&mut *datagram);
		out_header.ttl = new_ttl;
		out_header.csm = [0, 0];
		out_header.csm = Checksum::of(bytes::as_slice(out_header)).end();

		Ok(Recv::Forward { next_hop, datagram })
	}

	/// Emit an ICMP Time Exceeded reply for a datagram whose TTL has expired.
	fn time_exceeded(&mut self, header: &Header, buf: Slice) -> Result<Recv> {
		let mut original = Vec::with_capacity(size_of::<Header>() + buf.len().min(8));
		original.extend_from_slice(bytes::as_slice(header));
		original.extend_from_slice(&buf[..buf.len().min(8)]);

		let payload = icmp::time_exceeded(&original);

		let Some(next_hop) = self.routes.lookup(header.src) else {
			warn!("No route back to {} for ICMP Time Exceeded", header.src);
			return Err(());
		};

		Ok(Recv::TimeExceeded { next_hop, dst: header.src, payload })
	}

	fn next_identification(&mut self) -> u16 {
		let id = self.identification;
		self.identification = self.identification.wrapping_add(1);
		id
	}

	pub fn lookup(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
		self.routes.lookup(addr)
	}

	/// The TCP pseudo-header checksum seed for a segment bound for `addr`.
	pub fn pseudo_checksum(&self, addr: Ipv4Addr) -> Checksum {
		let header = Header {
			ver: Meta::new(u4::new(5), V4),
			tos: ToS::new(ECN::NotECT, DiffServ::Default),
			len: 0u16.into(),
			ident: 0u16.into(),
			frg: Fragment::new(u13::new(0), false, true, 0).into(),
			ttl: 0,
			proto: Protocol::Tcp.into(),
			csm: [0, 0],
			src: self.addr,
			dst: addr,
		};

		pseudo_csum(&header)
	}

	pub fn set_routes(&mut self, entries: &[(Ipv4Addr, u8, Ipv4Addr)]) {
		self.routes.set(entries);
	}

	pub fn addr(&self) -> Ipv4Addr {
		self.addr
	}

	/// Allocate an identification value and hand back everything needed to
	/// build a locally-originated TCP segment's IPv4 header.
	pub fn next_segment(&mut self, dst: Ipv4Addr) -> (u16, Checksum) {
		(self.next_identification(), self.pseudo_checksum(dst))
	}
}

impl From<Ipv4Addr> for Interface {
	fn from(addr: Ipv4Addr) -> Self {
		Self {
			addr,
			identification: rand::random(),
			routes: Table::default(),
		}
	}
}

/// Build a locally-originated datagram: IPv4 header wrapping whatever `f`
/// writes as payload, with length/checksum fixed up afterwards.
pub fn write_segment(cursor: Cursor, src: Ipv4Addr, dst: Ipv4Addr, ident: u16, csum: Checksum, f: impl FnOnce(Cursor, Checksum)) {
	let (header, mut buf): (&mut Header, _) = cursor.split();

	header.ver = Meta::new(u4::new(5), V4);
	header.tos = ToS::new(ECN::NotECT, DiffServ::Default);
	header.ttl = DEFAULT_TTL;
	header.proto = Protocol::Tcp.into();
	header.src = src;
	header.dst = dst;
	header.ident = ident.into();
	header.csm = [0, 0];

	f(buf.fork(), csum);

	header.len = ((size_of::<Header>() + buf.pivot()) as u16).into();
	header.frg = Fragment::new(u13::new(0), false, true, 0).into();
	header.csm = Checksum::of(bytes::as_slice(header)).end();
}

/// Wrap an already-built ICMP message with a fresh IPv4 header.
pub fn write_icmp(cursor: Cursor, src: Ipv4Addr, dst: Ipv4Addr, ident: u16, payload: &[u8]) {
	let (header, buf): (&mut Header, _) = cursor.split();

	header.ver = Meta::new(u4::new(5), V4);
	header.tos = ToS::new(ECN::NotECT, DiffServ::Default);
	header.ident = ident.into();
	header.frg = Fragment::new(u13::new(0), false, true, 0).into();
	header.ttl = DEFAULT_TTL;
	header.proto = Protocol::Icmp.into();
	header.src = src;
	header.dst = dst;
	header.csm = [0, 0];
	header.len = ((size_of::<Header>() + payload.len()) as u16).into();

	buf.push(payload);

	header.csm = Checksum::of(bytes::as_slice(header)).end();
}

#[bitsize(8)]
#[derive(FromBits, Cast)]
#[repr(C)]
struct Meta {
	ihl: u4,
	ver: super::Version,
}

#[bitsize(32)]
#[derive(FromBits)]
struct Fragment {
	ofst: u13,
	more: bool,
	dont: bool,
	reserved: bool,
	idnt: u16,
}

#[derive(Cast)]
#[repr(C)]
struct Header {
	ver: Meta,
	tos: ToS,
	len: u16be,
	ident: u16be,
	frg: b<Fragment>,
	ttl: u8,
	proto: b<Protocol>,
	csm: [u8; 2],
	src: Ipv4Addr,
	dst: Ipv4Addr,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn checksum_folds_to_zero() {
		let mut header = Header {
			ver: Meta::new(u4::new(5), V4),
			tos: ToS::new(ECN::NotECT, DiffServ::Default),
			len: 20u16.into(),
			ident: 1234u16.into(),
			frg: Fragment::new(u13::new(0), false, true, 0).into(),
			ttl: 64,
			proto: Protocol::Tcp.into(),
			csm: [0, 0],
			src: "10.0.0.1".parse().unwrap(),
			dst: "10.0.0.2".parse().unwrap(),
		};

		header.csm = Checksum::of(bytes::as_slice(&header)).end();

		assert_eq!(Checksum::of(bytes::as_slice(&header)).end(), [0, 0]);
	}

	#[test]
	fn identification_counter_wraps() {
		let mut iface = Interface::from("192.168.200.4".parse::<Ipv4Addr>().unwrap());
		iface.identification = u16::MAX;

		assert_eq!(iface.next_identification(), u16::MAX);
		assert_eq!(iface.next_identification(), 0);
	}

	#[test]
	fn ttl_one_yields_no_forward() {
		let mut iface = Interface::from("10.0.0.1".parse::<Ipv4Addr>().unwrap());
		iface.set_routes(&[("0.0.0.0".parse().unwrap(), 0, "10.0.0.254".parse().unwrap())]);

		let header = Header {
			ver: Meta::new(u4::new(5), V4),
			tos: ToS::new(ECN::NotECT, DiffServ::Default),
			len: 20u16.into(),
			ident: 1u16.into(),
			frg: Fragment::new(u13::new(0), false, true, 0).into(),
			ttl: 1,
			proto: Protocol::Tcp.into(),
			csm: [0, 0],
			src: "10.1.5.5".parse().unwrap(),
			dst: "10.2.0.1".parse().unwrap(),
		};

		match iface.forward(&header, Slice::new(0)).unwrap() {
			Recv::TimeExceeded { dst, .. } => assert_eq!(dst, "10.1.5.5".parse::<Ipv4Addr>().unwrap()),
			_ => panic!("expected a TimeExceeded outcome"),
		}
	}
}
