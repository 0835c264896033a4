use core::net::{IpAddr, Ipv4Addr};

use bilge::prelude::*;
use collections::bytes::Cursor;
use log::warn;
use stakker::{call, CX};
use utils::bytes::{self, Cast};

use crate::Interface;

mod checksum;
pub mod icmp;
pub mod route;
pub mod v4;

pub use checksum::Checksum;

impl Interface {
	/// A frame arrived off the wire from some peer. Dispatch on IP version,
	/// then route the decoded outcome to either the link layer (forward /
	/// ICMP reply) or the TCP engine (local delivery).
	pub fn recv(&mut self, cx: CX![], buf: collections::bytes::Slice) {
		#[cfg(feature = "pcap")]
		let _ = self.pcap.log(cx, &buf);

		let ver = bytes::cast::<Prefix, _>(&*buf).ver();

		if !matches!(ver, Version::V4) {
			return match ver {
				Version::V6 => warn!("IPv6 datagram received, dropping (IPv6 is not implemented)"),
				_ => warn!("Invalid IP packet version, dropping"),
			};
		}

		let Ok(outcome) = self.v4.recv(buf) else { return };

		match outcome {
			v4::Recv::Deliver { src, csum, payload } => {
				let _ = crate::tcp::Interface::recv(self, cx, IpAddr::V4(src), csum, payload);
			}
			v4::Recv::Forward { next_hop, datagram } => {
				call!([self.link], write(next_hop, move |mut cursor: Cursor| {
					cursor.push(&datagram);
				}));
			}
			v4::Recv::TimeExceeded { next_hop, dst, payload } => {
				let (ident, _) = self.v4.next_segment(dst);
				let src = self.v4.addr();

				call!([self.link], write(next_hop, move |cursor: Cursor| {
					v4::write_icmp(cursor, src, dst, ident, &payload);
				}));
			}
		}
	}

	/// Originate a new TCP segment bound for `addr`. Called synchronously by
	/// the TCP engine, which lives inside this same `Interface`; only the
	/// hop into `link` (a separate stakker actor) goes through `call!`.
	pub(crate) fn write(&mut self, addr: Ipv4Addr, f: impl FnOnce(Cursor, Checksum) + 'static) {
		let Some(next_hop) = self.v4.lookup(addr) else {
			panic!("no route to {addr}: routing table has no matching entry");
		};

		let (ident, csum) = self.v4.next_segment(addr);
		let src = self.v4.addr();

		call!([self.link], write(next_hop, move |cursor: Cursor| {
			v4::write_segment(cursor, src, addr, ident, csum, f);
		}));
	}
}

#[bitsize(4)]
#[derive(FromBits)]
pub enum Version {
	V4 = 4,
	V6 = 6,
	#[fallback]
	Unknown,
}

#[bitsize(8)]
#[derive(FromBits, Cast)]
#[repr(C)]
pub struct Prefix {
	__0: u4,
	ver: Version,
}

#[bitsize(8)]
#[derive(Clone, Copy, FromBits, Cast)]
#[repr(C)]
pub struct ToS {
	ecn: ECN,
	ds: DiffServ,
}

#[bitsize(6)]
#[derive(FromBits)]
pub enum DiffServ {
	Default = 0,
	#[fallback]
	Unknown,
}

#[bitsize(2)]
#[derive(FromBits)]
pub enum ECN {
	NotECT = 0b00,
	ECT1 = 0b01,
	ECT0 = 0b10,
	CE = 0b11,
}

#[repr(u8)]
#[bitsize(8)]
#[derive(Clone, Copy, FromBits)]
pub enum Protocol {
	Icmp = 1,
	Tcp = 6,
	#[fallback]
	Unknown(u8),
}
