//! RFC 1055 SLIP framing: a byte-stuffing scheme for delimiting datagrams
//! over a serial line that has no framing of its own.

use std::panic::{catch_unwind, AssertUnwindSafe};

use collections::bytes::Slice;
use log::error;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

#[derive(Default, Clone, Copy, PartialEq, Eq)]
enum State {
	#[default]
	Idle,
	Reading,
	Escape,
}

/// Per-line decoder state. One of these lives per serial line; a malformed
/// or interrupted frame never corrupts a sibling line's framing.
#[derive(Default)]
pub struct Framer {
	state: State,
	buf: Vec<u8>,
}

impl Framer {
	/// Feed freshly received bytes through the decoder, calling `deliver`
	/// once per complete, non-empty frame. `deliver` is run behind a
	/// `catch_unwind`: a panicking upper layer must not leave this line's
	/// framing state (or the bytes after it) corrupted.
	pub fn feed(&mut self, bytes: &[u8], mut deliver: impl FnMut(Slice)) {
		for &byte in bytes {
			match (self.state, byte) {
				(State::Idle, ESC) => self.state = State::Escape,
				(State::Idle, END) => self.state = State::Reading,
				(State::Idle, b) => {
					self.buf.push(b);
					self.state = State::Reading;
				}

				(State::Reading, END) => {
					if !self.buf.is_empty() {
						let mut frame = Slice::new(self.buf.len());
						frame.copy_from_slice(&self.buf);

						if catch_unwind(AssertUnwindSafe(|| deliver(frame))).is_err() {
							error!("Upper layer panicked while handling a decoded frame");
						}
					}

					self.buf.clear();
					self.state = State::Idle;
				}
				(State::Reading, ESC) => self.state = State::Escape,
				(State::Reading, b) => self.buf.push(b),

				(State::Escape, ESC_END) => {
					self.buf.push(END);
					self.state = State::Reading;
				}
				(State::Escape, ESC_ESC) => {
					self.buf.push(ESC);
					self.state = State::Reading;
				}
				// Anything else after an escape byte is malformed; resync by
				// dropping it and resuming as if it were ordinary data.
				(State::Escape, _) => self.state = State::Reading,
			}
		}
	}
}

/// SLIP-encode `datagram` into a complete, delimited frame.
pub fn encode(datagram: &[u8]) -> Vec<u8> {
	let mut frame = Vec::with_capacity(datagram.len() + 2);
	frame.push(END);

	for &byte in datagram {
		match byte {
			END => frame.extend_from_slice(&[ESC, ESC_END]),
			ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
			b => frame.push(b),
		}
	}

	frame.push(END);
	frame
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_plain_bytes() {
		let datagram = [1, 2, 3, 4, 5];
		let frame = encode(&datagram);

		let mut framer = Framer::default();
		let mut got = None;
		framer.feed(&frame, |slice| got = Some(slice.to_vec()));

		assert_eq!(got.unwrap(), datagram);
	}

	#[test]
	fn escapes_end_and_esc_bytes() {
		let datagram = [END, ESC, 0x42];
		let frame = encode(&datagram);

		assert_eq!(frame, vec![END, ESC, ESC_END, ESC, ESC_ESC, 0x42, END]);

		let mut framer = Framer::default();
		let mut got = None;
		framer.feed(&frame, |slice| got = Some(slice.to_vec()));

		assert_eq!(got.unwrap(), datagram);
	}

	#[test]
	fn empty_frames_are_dropped() {
		let mut framer = Framer::default();
		let mut calls = 0;
		framer.feed(&[END, END, END], |_| calls += 1);

		assert_eq!(calls, 0);
	}

	#[test]
	fn frame_boundaries_can_split_across_reads() {
		let datagram = [10, 20, 30];
		let frame = encode(&datagram);

		let mut framer = Framer::default();
		let mut got = None;

		for chunk in frame.chunks(2) {
			framer.feed(chunk, |slice| got = Some(slice.to_vec()));
		}

		assert_eq!(got.unwrap(), datagram);
	}

	#[test]
	fn panicking_receiver_does_not_corrupt_following_frame() {
		let mut framer = Framer::default();
		let bad = encode(&[1, 2]);
		let good = encode(&[3, 4]);

		framer.feed(&bad, |_| panic!("boom"));

		let mut got = None;
		framer.feed(&good, |slice| got = Some(slice.to_vec()));

		assert_eq!(got.unwrap(), vec![3, 4]);
	}
}
