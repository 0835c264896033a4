//! Bundled demo: brings up a two-node point-to-point link over a
//! `UnixStream` pair and starts the chat server listening on TCP.
//! Host/peer addressing mirrors the reference's own demo setup.

use core::net::Ipv4Addr;
use std::os::unix::net::UnixStream;

use stakker::{actor, ret_shutdown};

const HOST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 200, 4);
const PEER_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 200, 3);
const TCP_PORT: u16 = 7000;

fn main() {
	log::set_logger(&runtime::logger::Logger).expect("logger installed once");
	log::set_max_level(log::LevelFilter::Info);

	let (here, _there) = UnixStream::pair().expect("unix socket pair");

	let mut stakker = runtime::init();
	let s = &mut stakker;

	let lines = vec![(PEER_ADDR, here)];
	let routes = [(Ipv4Addr::UNSPECIFIED, 0, PEER_ADDR)];

	let server = actor!(s, irc::Server::init(lines, HOST_ADDR, &routes, TCP_PORT), ret_shutdown!(s));

	runtime::exec(s, move || drop(server)).expect("runtime exited cleanly");
}
