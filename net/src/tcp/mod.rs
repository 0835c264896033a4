//! A deliberately simplified TCP: passive open only, cumulative ACK, no
//! advertised-window flow control, no options, no TIME_WAIT.

use core::mem::size_of;
use core::net::IpAddr;
use core::time::Duration;
use std::collections::VecDeque;
use std::time::Instant;

use bilge::prelude::*;
use collections::bytes::{Cursor, Slice};
use collections::map::{self, Index, Map};
use log::{debug, warn};
use stakker::{Actor, Fwd, FixedTimerKey, CX};
use utils::bytes::{self, Cast};
use utils::endian::{b, u16be, u32be};
use utils::error::*;

use crate::ip::Checksum;

/// Maximum TCP payload per segment. A compile-time constant, per spec.
pub const MSS: usize = 1460;

const CAPACITY: usize = 1024;

const INITIAL_RTO: Duration = Duration::from_millis(3000);

/// An advertised window. Flow control via the window is a non-goal; this is
/// fixed and never consulted on receive.
const WINDOW: u16 = 65535;

/// Returns whether `a` precedes `b` in TCP's wraparound 32-bit sequence space.
fn before(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) < 0
}

#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
struct Control {
	fin: bool,
	syn: bool,
	rst: bool,
	psh: bool,
	ack: bool,
	urg: bool,
	ece: bool,
	cwr: bool,
	reserved: u4,
	off: u4,
}

#[derive(Cast)]
#[repr(C)]
struct Header {
	src: u16be,
	dst: u16be,
	seq: u32be,
	ack: u32be,
	ctl: b<Control>,
	win: u16be,
	csm: [u8; 2],
	urg: u16be,
}

/// The identifying 4-tuple of a connection, minus the local half (there is
/// only ever one listening address:port, fixed for the server's lifetime).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct FourTuple {
	addr: IpAddr,
	port: u16,
}

#[derive(Clone, Copy)]
struct Flags {
	syn: bool,
	fin: bool,
}

/// A segment handed to IP and awaiting acknowledgment.
struct Unacked {
	seq: u32,
	payload: Slice,
	flags: Flags,
	send_time: Instant,
	retransmitted: bool,
}

/// A segment carved out of an application `send()` that hasn't been placed
/// on the wire yet because the congestion window doesn't admit it.
struct Pending {
	seq: u32,
	payload: Slice,
	flags: Flags,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum State {
	SynRcvd,
	Established,
	CloseWait,
	LastAck,
}

struct Conn {
	key: FourTuple,
	local_port: u16,

	state: State,

	snd_una: u32,
	snd_nxt: u32,
	rcv_nxt: u32,

	/// Congestion window, in units of MSS.
	cwnd: u32,

	unacked: VecDeque<Unacked>,
	send_queue: VecDeque<Pending>,

	srtt: Option<f64>,
	rttvar: Option<f64>,

	rto_timer: FixedTimerKey,
	closing: bool,
	handshake_done: bool,

	receiver: Option<Fwd<Slice>>,
}

impl map::Key for Conn {
	type Type = FourTuple;

	fn key(&self) -> &FourTuple {
		&self.key
	}
}

impl Conn {
	fn rto(&self) -> Duration {
		match (self.srtt, self.rttvar) {
			(Some(srtt), Some(rttvar)) => Duration::from_secs_f64(srtt + 4.0 * rttvar),
			_ => INITIAL_RTO,
		}
	}

	fn sample_rtt(&mut self, sample: Duration) {
		let s = sample.as_secs_f64();

		match (self.srtt, self.rttvar) {
			(Some(srtt), Some(rttvar)) => {
				self.srtt = Some(0.875 * srtt + 0.125 * s);
				self.rttvar = Some(0.75 * rttvar + 0.25 * (s - srtt).abs());
			}
			_ => {
				self.srtt = Some(s);
				self.rttvar = Some(s / 2.0);
			}
		}
	}

	/// A new SYN arrived for `key`. Replaces any existing connection at the
	/// same 4-tuple (last-SYN-wins, per the reference behaviour).
	fn open(this: &mut crate::Interface, cx: CX![crate::Interface], key: FourTuple, local_port: u16, peer_isn: u32) {
		if let Some(filled) = this.tcp.table.find_entry(&key).filled() {
			let idx = filled.index();
			drop(filled);
			Self::cancel_rto(this, cx, idx);
			this.tcp.table.find_entry(&key).remove();
		}

		let iss: u32 = rand::random::<u16>() as u32;
		let rcv_nxt = peer_isn.wrapping_add(1);

		let empty = this.tcp.table.insert_unique(&key);
		let idx = empty.index();

		empty.insert(Conn {
			key,
			local_port,
			state: State::SynRcvd,
			snd_una: iss,
			snd_nxt: iss.wrapping_add(1),
			rcv_nxt,
			cwnd: 1,
			unacked: VecDeque::new(),
			send_queue: VecDeque::new(),
			srtt: None,
			rttvar: None,
			rto_timer: FixedTimerKey::default(),
			closing: false,
			handshake_done: false,
			receiver: None,
		});

		this.tcp.table[idx].unacked.push_back(Unacked {
			seq: iss,
			payload: Slice::new(0),
			flags: Flags { syn: true, fin: false },
			send_time: cx.now(),
			retransmitted: false,
		});

		Self::transmit(this, key, local_port, rcv_nxt, iss, Flags { syn: true, fin: false }, Slice::new(0));
		Self::arm_rto(this, cx, idx);

		if let Some(accept) = &this.tcp.accept {
			accept.fwd(Connection { key, interface: cx.access_actor().clone() });
		}
	}

	/// Dispatch a non-SYN segment to the connection at `idx`.
	fn recv(this: &mut crate::Interface, cx: CX![crate::Interface], idx: Index<CAPACITY>, ctl: Control, seq: u32, ack: u32, payload: Slice) {
		if ctl.fin() {
			{
				let conn = &mut this.tcp.table[idx];
				conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
				conn.state = State::CloseWait;
			}

			Self::send_ack(this, idx);

			let receiver = this.tcp.table[idx].receiver.clone();
			if let Some(cb) = receiver {
				cb.fwd(Slice::new(0));
			}

			return;
		}

		if ctl.ack() {
			let advanced = before(this.tcp.table[idx].snd_una, ack);

			if advanced {
				Self::cancel_rto(this, cx, idx);

				{
					let conn = &mut this.tcp.table[idx];
					conn.snd_una = ack;

					if conn.handshake_done {
						conn.cwnd += 1;
					}
				}

				let mut last_sample = None;

				loop {
					let conn = &mut this.tcp.table[idx];

					let Some(front) = conn.unacked.front() else { break };
					if !before(front.seq, conn.snd_una) {
						break;
					}

					let popped = conn.unacked.pop_front().unwrap();

					if popped.flags.syn {
						conn.handshake_done = true;
						conn.state = State::Established;
						last_sample = None;
					} else if !popped.retransmitted {
						last_sample = Some(popped.send_time);
					} else {
						last_sample = None;
					}
				}

				if let Some(t) = last_sample {
					let sample = cx.now().duration_since(t);
					this.tcp.table[idx].sample_rtt(sample);
				}

				if !this.tcp.table[idx].unacked.is_empty() {
					Self::arm_rto(this, cx, idx);
				}

				Self::drain(this, cx, idx);
			}

			if this.tcp.table[idx].closing {
				Self::cancel_rto(this, cx, idx);
				let key = this.tcp.table[idx].key;
				this.tcp.table.find_entry(&key).remove();
				return;
			}

			if payload.is_empty() {
				return;
			}
		}

		let conn = &mut this.tcp.table[idx];

		if seq == conn.rcv_nxt {
			conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload.len() as u32);

			let receiver = conn.receiver.clone();
			if let Some(cb) = receiver {
				cb.fwd(payload);
			}
		} else {
			debug!("out-of-order TCP segment from {:?}, dropping", conn.key);
		}

		Self::send_ack(this, idx);
	}

	/// Carve `bytes` into MSS-sized records and append them to the send
	/// queue, then try to push as much of it onto the wire as `cwnd` allows.
	fn enqueue(this: &mut crate::Interface, cx: CX![crate::Interface], key: FourTuple, bytes: Slice) {
		let Some(mut filled) = this.tcp.table.find_entry(&key).filled() else { return };
		let idx = filled.index();

		let mut offset = 0;
		while offset < bytes.len() {
			let n = (bytes.len() - offset).min(MSS);

			let seq = filled.snd_nxt;
			filled.snd_nxt = filled.snd_nxt.wrapping_add(n as u32);

			let mut chunk = Slice::new(n);
			chunk.copy_from_slice(&bytes[offset..offset + n]);

			filled.send_queue.push_back(Pending { seq, payload: chunk, flags: Flags { syn: false, fin: false } });

			offset += n;
		}

		drop(filled);
		Self::drain(this, cx, idx);
	}

	/// Initiate local teardown: send a FIN carrying the next unused sequence
	/// number and move to LAST_ACK.
	fn close(this: &mut crate::Interface, cx: CX![crate::Interface], key: FourTuple) {
		let Some(mut filled) = this.tcp.table.find_entry(&key).filled() else { return };

		if filled.closing {
			return;
		}

		filled.closing = true;
		filled.state = State::LastAck;

		let seq = filled.snd_nxt;
		filled.snd_nxt = filled.snd_nxt.wrapping_add(1);

		filled.unacked.push_back(Unacked {
			seq,
			payload: Slice::new(0),
			flags: Flags { syn: false, fin: true },
			send_time: cx.now(),
			retransmitted: false,
		});

		let idx = filled.index();
		let had_timer = filled.rto_timer != FixedTimerKey::default();
		let (local_port, rcv_nxt) = (filled.local_port, filled.rcv_nxt);

		drop(filled);

		Self::transmit(this, key, local_port, rcv_nxt, seq, Flags { syn: false, fin: true }, Slice::new(0));

		if !had_timer {
			Self::arm_rto(this, cx, idx);
		}
	}

	/// Push as many send-queue entries onto the wire as the congestion
	/// window admits.
	fn drain(this: &mut crate::Interface, cx: CX![crate::Interface], idx: Index<CAPACITY>) {
		loop {
			let (fits, had_timer) = {
				let conn = &this.tcp.table[idx];

				let in_flight = match conn.unacked.back() {
					Some(last) => last.seq.wrapping_add(last.payload.len() as u32).wrapping_sub(conn.snd_una) as usize,
					None => 0,
				};

				let Some(head) = conn.send_queue.front() else { break };

				(in_flight + head.payload.len() <= conn.cwnd as usize * MSS, conn.rto_timer != FixedTimerKey::default())
			};

			if !fits {
				break;
			}

			let conn = &mut this.tcp.table[idx];
			let pending = conn.send_queue.pop_front().unwrap();
			let send_time = cx.now();

			conn.unacked.push_back(Unacked {
				seq: pending.seq,
				payload: pending.payload.clone(),
				flags: pending.flags,
				send_time,
				retransmitted: false,
			});

			let (key, local_port, rcv_nxt) = (conn.key, conn.local_port, conn.rcv_nxt);

			Self::transmit(this, key, local_port, rcv_nxt, pending.seq, pending.flags, pending.payload);

			if !had_timer {
				Self::arm_rto(this, cx, idx);
			}
		}
	}

	fn send_ack(this: &mut crate::Interface, idx: Index<CAPACITY>) {
		let conn = &this.tcp.table[idx];
		let (key, local_port, rcv_nxt, snd_nxt) = (conn.key, conn.local_port, conn.rcv_nxt, conn.snd_nxt);

		Self::transmit(this, key, local_port, rcv_nxt, snd_nxt, Flags { syn: false, fin: false }, Slice::new(0));
	}

	fn transmit(this: &mut crate::Interface, key: FourTuple, local_port: u16, rcv_nxt: u32, seq: u32, flags: Flags, payload: Slice) {
		let IpAddr::V4(addr) = key.addr else {
			return warn!("TCP over IPv6 is not supported");
		};

		this.write(addr, move |cursor, mut csum| {
			let (header, mut buf): (&mut Header, _) = cursor.split();

			header.src = local_port.into();
			header.dst = key.port.into();
			header.seq = seq.into();
			header.ack = rcv_nxt.into();
			header.ctl = Control::new(flags.fin, flags.syn, false, false, true, false, false, false, u4::new(0), u4::new(5)).into();
			header.win = WINDOW.into();
			header.csm = [0, 0];
			header.urg = 0u16.into();

			buf = buf.push(&*payload);

			let len = (size_of::<Header>() + payload.len()) as u16;
			csum.push(&len.to_be_bytes());
			csum.push(bytes::as_slice(header));
			csum.push(&payload);

			header.csm = csum.end();

			let _ = buf;
		});
	}

	fn arm_rto(this: &mut crate::Interface, cx: CX![crate::Interface], idx: Index<CAPACITY>) {
		let rto = this.tcp.table[idx].rto();
		let actor = cx.access_actor().clone();

		this.tcp.table[idx].rto_timer = cx.after(rto, move |s| actor.apply(s, move |this, cx| Self::on_rto(this, cx, idx)));
	}

	fn cancel_rto(this: &mut crate::Interface, cx: CX![crate::Interface], idx: Index<CAPACITY>) {
		let timer = this.tcp.table[idx].rto_timer;
		cx.timer_del(timer);
		this.tcp.table[idx].rto_timer = FixedTimerKey::default();
	}

	fn on_rto(this: &mut crate::Interface, cx: CX![crate::Interface], idx: Index<CAPACITY>) {
		this.tcp.table[idx].rto_timer = FixedTimerKey::default();

		let retransmit = {
			let conn = &mut this.tcp.table[idx];

			conn.cwnd = (conn.cwnd / 2).max(1);

			conn.unacked.front_mut().map(|oldest| {
				oldest.retransmitted = true;
				(oldest.seq, oldest.flags, oldest.payload.clone())
			})
		};

		if let Some((seq, flags, payload)) = retransmit {
			let conn = &this.tcp.table[idx];
			debug!("TCP RTO for {:?}, retransmitting seq {seq} (cwnd now {})", conn.key, conn.cwnd);
			let (key, local_port, rcv_nxt) = (conn.key, conn.local_port, conn.rcv_nxt);

			Self::transmit(this, key, local_port, rcv_nxt, seq, flags, payload);
		}

		Self::arm_rto(this, cx, idx);
	}
}

#[derive(Default)]
pub(crate) struct Interface {
	listen_port: Option<u16>,
	accept: Option<Fwd<Connection>>,
	table: Map<Conn, CAPACITY>,
}

impl Interface {
	/// Listen on `port`, invoking `accept` once per inbound SYN.
	pub fn listen(this: &mut crate::Interface, port: u16, accept: Fwd<Connection>) {
		this.tcp.listen_port = Some(port);
		this.tcp.accept = Some(accept);
	}

	/// A TCP segment addressed to us arrived from `addr`. `csum` is the
	/// pseudo-header checksum seed for `addr`, supplied by the IP layer.
	pub fn recv(this: &mut crate::Interface, cx: CX![crate::Interface], addr: IpAddr, pseudo: Checksum, mut buf: Slice) -> Result {
		if buf.len() < size_of::<Header>() {
			warn!("TCP segment too short ({} bytes)", buf.len());
			return Err(());
		}

		let header: &Header = buf.split();
		let ctl = header.ctl.get();
		let data_offset = 4 * ctl.off().value() as usize;

		if data_offset < size_of::<Header>() {
			warn!("Invalid TCP data offset");
			return Err(());
		}

		let _options = buf.split_bytes((data_offset - size_of::<Header>()).min(buf.len()));

		let mut csum = pseudo;
		csum.push(&((size_of::<Header>() + buf.len()) as u16).to_be_bytes());
		csum.push(bytes::as_slice(header));
		csum.push(&buf);

		if csum.end() != [0, 0] {
			warn!("TCP segment has invalid checksum, dropping");
			return Err(());
		}

		let Some(listen_port) = this.tcp.listen_port else { return Err(()) };

		if header.dst.get() != listen_port {
			debug!("TCP segment for unbound port {}", header.dst.get());
			return Err(());
		}

		let key = FourTuple { addr, port: header.src.get() };
		let seq = header.seq.get();
		let ack = header.ack.get();

		if ctl.syn() {
			Conn::open(this, cx, key, listen_port, seq);
			return Ok(());
		}

		let Some(filled) = this.tcp.table.find_entry(&key).filled() else {
			debug!("TCP segment for unknown connection from {addr}:{}", key.port);
			return Err(());
		};

		let idx = filled.index();
		drop(filled);

		Conn::recv(this, cx, idx, ctl, seq, ack, buf);
		Ok(())
	}
}

/// A non-owning handle to a connection, held by the application.
#[derive(Clone)]
pub struct Connection {
	key: FourTuple,
	interface: Actor<crate::Interface>,
}

impl Connection {
	/// Register the callback invoked with in-order payload, and with an
	/// empty payload once on peer FIN.
	pub fn register_receiver(&self, cb: Fwd<Slice>) {
		let key = self.key;
		let actor = self.interface.clone();

		self.interface.defer(move |s| {
			actor.apply(s, move |this, _| {
				if let Some(mut conn) = this.tcp.table.find_entry(&key).filled() {
					conn.receiver = Some(cb);
				}
			})
		});
	}

	/// Enqueue `bytes` for delivery.
	pub fn send(&self, bytes: Slice) {
		let key = self.key;
		let actor = self.interface.clone();

		self.interface.defer(move |s| actor.apply(s, move |this, cx| Conn::enqueue(this, cx, key, bytes)));
	}

	/// Initiate local teardown by sending a FIN.
	pub fn close(&self) {
		let key = self.key;
		let actor = self.interface.clone();

		self.interface.defer(move |s| actor.apply(s, move |this, cx| Conn::close(this, cx, key)));
	}

	/// The remote half of this connection's 4-tuple.
	pub fn remote(&self) -> (IpAddr, u16) {
		(self.key.addr, self.key.port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sequence_wraparound_ordering() {
		assert!(before(u32::MAX, 0));
		assert!(before(0, 1));
		assert!(!before(1, 0));
	}

	#[test]
	fn rtt_estimator_converges() {
		let mut conn = Conn {
			key: FourTuple { addr: "10.0.0.1".parse().unwrap(), port: 1 },
			local_port: 6667,
			state: State::Established,
			snd_una: 0,
			snd_nxt: 0,
			rcv_nxt: 0,
			cwnd: 1,
			unacked: VecDeque::new(),
			send_queue: VecDeque::new(),
			srtt: None,
			rttvar: None,
			rto_timer: FixedTimerKey::default(),
			closing: false,
			handshake_done: true,
			receiver: None,
		};

		for _ in 0..50 {
			conn.sample_rtt(Duration::from_millis(100));
		}

		assert!((conn.srtt.unwrap() - 0.1).abs() < 1e-6);
		assert!(conn.rttvar.unwrap() < 1e-6);
	}

	#[test]
	fn cwnd_never_drops_below_one_mss() {
		let mut cwnd: u32 = 1;
		for _ in 0..10 {
			cwnd = (cwnd / 2).max(1);
		}
		assert_eq!(cwnd, 1);
	}
}
