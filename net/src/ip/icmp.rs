//! The small slice of ICMP needed to emit Time Exceeded replies.

use collections::bytes::Slice;
use utils::bytes::{self, Cast};

use crate::ip::Checksum;

pub const TIME_EXCEEDED: u8 = 11;
pub const CODE_TTL_EXCEEDED: u8 = 0;

#[derive(Cast)]
#[repr(C)]
struct Header {
	ty: u8,
	code: u8,
	csum: [u8; 2],
	unused: u32,
}

/// Build a Time Exceeded message: the ICMP header followed by the
/// original IP header and the first 8 bytes of its payload, per spec.
pub fn time_exceeded(original: &[u8]) -> Slice {
	let embedded = &original[..original.len().min(28)];

	let mut buf = Slice::new(core::mem::size_of::<Header>() + embedded.len());

	{
		let header: &mut Header = bytes::cast_mut(&mut *buf);
		header.ty = TIME_EXCEEDED;
		header.code = CODE_TTL_EXCEEDED;
		header.csum = [0, 0];
		header.unused = 0;
	}

	buf[core::mem::size_of::<Header>()..].copy_from_slice(embedded);

	let csum = Checksum::of(&buf).end();
	bytes::cast_mut::<Header, _>(&mut *buf).csum = csum;

	buf
}
