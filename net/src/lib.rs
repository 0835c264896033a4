#![feature(slice_as_chunks, write_all_vectored, trivial_bounds)]

use core::net::Ipv4Addr;

use link::Interface as Link;
use stakker::ActorOwn;

extern crate alloc;

pub mod ip;
#[cfg(feature = "pcap")]
pub mod pcap;
pub mod tcp;

pub struct Interface {
	link: ActorOwn<Link>,

	#[cfg(feature = "pcap")]
	pcap: pcap::Writer,

	v4: ip::v4::Interface,
	tcp: tcp::Interface,
}

impl Interface {
	/// Build the IPv4/TCP engine over an already-running link multiplexer.
	/// `routes` is the initial forwarding table; it can be replaced later
	/// with [`Interface::set_routes`].
	pub fn init(_: stakker::CX![], link: ActorOwn<Link>, my_addr: Ipv4Addr, routes: &[(Ipv4Addr, u8, Ipv4Addr)]) -> Option<Self> {
		let mut v4 = ip::v4::Interface::from(my_addr);
		v4.set_routes(routes);

		Some(Self {
			link,

			#[cfg(feature = "pcap")]
			pcap: pcap::Writer::new("./log.pcap").unwrap(),

			v4,
			tcp: tcp::Interface::default(),
		})
	}

	pub fn set_routes(&mut self, routes: &[(Ipv4Addr, u8, Ipv4Addr)]) {
		self.v4.set_routes(routes);
	}

	pub fn addr(&self) -> Ipv4Addr {
		self.v4.addr()
	}

	/// Start listening on `port`; `accept` is invoked once per inbound SYN.
	pub fn listen(&mut self, _: stakker::CX![], port: u16, accept: stakker::Fwd<tcp::Connection>) {
		tcp::Interface::listen(self, port, accept);
	}
}
