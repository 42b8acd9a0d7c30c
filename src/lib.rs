// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod dispatcher;
pub mod error;
mod latch;
pub mod metainfo;
mod metrics;
mod observer;
mod peer_entry;
mod piece_request_manager;
pub mod storage;
pub mod storage_info;
mod telemetry;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use observer::Observer;
pub use storage_info::FileInfo;
pub use telemetry::{Event, Telemetry};

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer or of the local
/// torrent.
///
/// It is a compact bool vector of most significant bits to least significant
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that we have pieces 0, 1, and 7). A truthy boolean value of a
/// piece's position in this vector means that the peer has the piece, while a
/// falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<u8, Msb0>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_bit_order_is_msb_first() {
        let mut bf = Bitfield::repeat(false, 8);
        bf.set(0, true);
        bf.set(7, true);
        assert_eq!(bf.as_raw_slice(), &[0b1000_0001]);
    }
}
