//! The two wire codecs used by a peer session: the one-shot handshake
//! codec, and the length-prefixed message codec used for everything after.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{Error, Result},
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

/// The literal protocol string every BitTorrent v1 handshake begins with.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Fixed size of the reserved bytes in the handshake, used to advertise
/// extensions. All zero here since no extension is supported.
const RESERVED_LEN: usize = 8;

/// The very first message exchanged on a new peer connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    /// Always [`PROTOCOL_STRING`], as bytes.
    pub prot: Vec<u8>,
    /// Reserved bytes for extension flags, all zero.
    pub reserved: [u8; RESERVED_LEN],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            prot: PROTOCOL_STRING.as_bytes().to_vec(),
            reserved: [0; RESERVED_LEN],
            info_hash,
            peer_id,
        }
    }
}

/// (De)serializes the fixed 68 byte handshake.
pub(crate) struct HandshakeCodec;

impl Encoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(1 + prot.len() + RESERVED_LEN + 20 + 20);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        let total_len = 1 + prot_len + RESERVED_LEN + 20 + 20;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(1);
        let prot = buf.split_to(prot_len).to_vec();
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocol);
        }

        let mut reserved = [0; RESERVED_LEN];
        reserved.copy_from_slice(&buf.split_to(RESERVED_LEN));

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&buf.split_to(20));

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&buf.split_to(20));

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte that precedes a message's payload on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            9 => Self::Port,
            _ => return Err(Error::UnknownMessageId(b)),
        })
    }
}

/// A BitTorrent peer wire protocol message, after the handshake.
#[derive(Clone, Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// The DHT `port` message. This client doesn't implement the DHT, so
    /// the announced port is simply discarded by the caller.
    Port(u16),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::KeepAlive => {
                // keep-alive has no id on the wire; this is only used for
                // logging, so pick the closest meaningful stand-in
                MessageId::Choke
            }
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Block { .. } => MessageId::Block,
            Self::Cancel(_) => MessageId::Cancel,
            Self::Port(_) => MessageId::Port,
        }
    }
}

/// (De)serializes the length-prefixed peer messages exchanged after the
/// handshake.
pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0; 4];
        len_bytes.copy_from_slice(&buf[0..4]);
        let msg_len = u32::from_be_bytes(len_bytes) as usize;

        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let msg_id = MessageId::from_u8(buf[0])?;
        buf.advance(1);
        let payload_len = msg_len - 1;
        let payload = buf.split_to(payload_len);

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(Error::InvalidPieceIndex);
                }
                let piece_index = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }
            MessageId::Request => {
                Message::Request(decode_block_info(&payload)?)
            }
            MessageId::Cancel => {
                Message::Cancel(decode_block_info(&payload)?)
            }
            MessageId::Block => {
                if payload.len() < 8 {
                    return Err(Error::InvalidPieceIndex);
                }
                let piece_index = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) as PieceIndex;
                let offset = u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ]);
                let data = payload[8..].to_vec();
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Port => {
                if payload.len() != 2 {
                    return Err(Error::InvalidPieceIndex);
                }
                let port = u16::from_be_bytes([payload[0], payload[1]]);
                Message::Port(port)
            }
        };

        Ok(Some(msg))
    }
}

fn decode_block_info(payload: &[u8]) -> Result<BlockInfo> {
    if payload.len() != 12 {
        return Err(Error::InvalidPieceIndex);
    }
    let piece_index =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            as PieceIndex;
    let offset =
        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let len = u32::from_be_bytes([
        payload[8],
        payload[9],
        payload[10],
        payload[11],
    ]);
    Ok(BlockInfo {
        piece_index,
        offset,
        len,
    })
}

impl Encoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => put_simple(buf, MessageId::Choke),
            Message::Unchoke => put_simple(buf, MessageId::Unchoke),
            Message::Interested => put_simple(buf, MessageId::Interested),
            Message::NotInterested => {
                put_simple(buf, MessageId::NotInterested)
            }
            Message::Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                put_block_info(buf, MessageId::Request, &block)
            }
            Message::Cancel(block) => {
                put_block_info(buf, MessageId::Cancel, &block)
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 4 + 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Message::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

fn put_simple(buf: &mut BytesMut, id: MessageId) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

fn put_block_info(buf: &mut BytesMut, id: MessageId, block: &BlockInfo) {
    buf.put_u32(1 + 12);
    buf.put_u8(id as u8);
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_handshake() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
        assert_eq!(decoded.prot, PROTOCOL_STRING.as_bytes());
    }

    #[test]
    fn handshake_waits_for_more_bytes() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(10);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_slice(b"heya");
        buf.put_slice(&[0; RESERVED_LEN]);
        buf.put_slice(&[0; 20]);
        buf.put_slice(&[0; 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn roundtrips_keep_alive() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::KeepAlive));
    }

    #[test]
    fn roundtrips_request() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Request(decoded) => assert_eq!(decoded, block),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn roundtrips_bitfield() {
        let mut bitfield = Bitfield::repeat(false, 16);
        *bitfield.get_mut(0).unwrap() = true;
        *bitfield.get_mut(15).unwrap() = true;
        let mut buf = BytesMut::new();
        PeerCodec
            .encode(Message::Bitfield(bitfield.clone()), &mut buf)
            .unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        match msg {
            Message::Bitfield(decoded) => assert_eq!(decoded, bitfield),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn tolerates_port_message() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Port(6881), &mut buf).unwrap();
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::Port(6881)));
    }

    #[test]
    fn rejects_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn waits_for_full_frame() {
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16384,
        };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let mut partial = buf.split_to(5);
        assert!(PeerCodec.decode(&mut partial).unwrap().is_none());
    }
}
