//! The HTTP tracker announce client.
//!
//! This is an external collaborator of the download engine, specified here
//! only to the depth needed to obtain a peer list from a real tracker: the
//! announce request/response codec itself is not part of the core design.

use std::net::{Ipv4Addr, SocketAddrV4};

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// `info_hash` and `peer_id` are raw 20 byte strings that must be percent
/// encoded byte-for-byte (unlike a regular query parameter, which would
/// mangle non-UTF8 bytes), so every byte outside of the unreserved set is
/// escaped.
const RAW_BYTES: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// A peer descriptor as returned by the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub addr: SocketAddrV4,
    pub peer_id: Option<PeerId>,
}

/// The decoded tracker announce response.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<PeerDescriptor>,
}

/// Performs an HTTP GET announce request against `announce_url` and
/// returns the peer list it contains.
///
/// The request carries exactly the query parameters named in the design:
/// `info_hash`, `peer_id`, `port`, `uploaded`, `downloaded`, `left`.
pub async fn announce(
    announce_url: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
) -> Result<AnnounceResponse> {
    let url = format!(
        "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}",
        announce_url,
        percent_encode(&info_hash, RAW_BYTES),
        percent_encode(&peer_id, RAW_BYTES),
        port,
        left,
    );

    log::info!("Announcing to tracker {}", announce_url);
    let resp = reqwest::get(&url).await?;
    let body = resp.bytes().await?;
    decode_response(&body)
}

fn decode_response(body: &[u8]) -> Result<AnnounceResponse> {
    if let Ok(failure) = serde_bencode::from_bytes::<FailureResponse>(body) {
        return Err(Error::TrackerFailure(failure.failure_reason));
    }

    let raw: RawAnnounceResponse =
        serde_bencode::from_bytes(body).map_err(|_| Error::InvalidTrackerResponse)?;

    let peers = match raw.peers {
        RawPeers::Compact(bytes) => decode_compact_peers(bytes.as_slice())?,
        RawPeers::Dict(dicts) => decode_dict_peers(&dicts)?,
    };

    Ok(AnnounceResponse {
        interval: raw.interval,
        complete: raw.complete,
        incomplete: raw.incomplete,
        peers,
    })
}

fn decode_compact_peers(bytes: &[u8]) -> Result<Vec<PeerDescriptor>> {
    if bytes.len() % 6 != 0 {
        return Err(Error::InvalidTrackerResponse);
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            PeerDescriptor {
                addr: SocketAddrV4::new(ip, port),
                peer_id: None,
            }
        })
        .collect())
}

fn decode_dict_peers(dicts: &[RawPeerDict]) -> Result<Vec<PeerDescriptor>> {
    dicts
        .iter()
        .filter(|d| d.port > 0)
        .map(|d| {
            let ip: Ipv4Addr = d
                .ip
                .parse()
                .map_err(|_| Error::InvalidTrackerResponse)?;
            let peer_id = d.peer_id.as_ref().and_then(|id| {
                if id.len() == 20 {
                    let mut buf = [0; 20];
                    buf.copy_from_slice(id);
                    Some(buf)
                } else {
                    None
                }
            });
            Ok(PeerDescriptor {
                addr: SocketAddrV4::new(ip, d.port),
                peer_id,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct FailureResponse {
    #[serde(rename = "failure reason")]
    failure_reason: String,
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    interval: u64,
    complete: Option<u64>,
    incomplete: Option<u64>,
    peers: RawPeers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(ByteBuf),
    Dict(Vec<RawPeerDict>),
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
    #[serde(rename = "peer id")]
    #[serde(with = "serde_bytes")]
    peer_id: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peers() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);
        body.extend_from_slice(b"e");

        let resp = decode_response(&body).unwrap();
        assert_eq!(resp.interval, 1800);
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(
            resp.peers[0].addr,
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881)
        );
        assert_eq!(
            resp.peers[1].addr,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 6882)
        );
    }

    #[test]
    fn decodes_dict_peers() {
        let body = b"d8:intervali1800e5:peersld2:ip9:127.0.0.17:porti6881eeee";
        let resp = decode_response(body).unwrap();
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].addr.port(), 6881);
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason13:no such torrente";
        let err = decode_response(body).unwrap_err();
        match err {
            Error::TrackerFailure(reason) => assert_eq!(reason, "no such torrent"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_compact_field() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers5:");
        body.extend_from_slice(&[1, 2, 3, 4, 5]);
        body.extend_from_slice(b"e");
        assert!(decode_response(&body).is_err());
    }

    #[tokio::test]
    async fn announce_sends_query_params_and_parses_real_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(b"e");

        let _mock = mockito::mock("GET", mockito::Matcher::Regex(
            r"^/announce\?info_hash=.*&peer_id=.*&port=6881&uploaded=0&downloaded=0&left=42$"
                .to_string(),
        ))
        .with_status(200)
        .with_body(body)
        .create();

        let url = format!("{}/announce", mockito::server_url());
        let resp = announce(&url, [1; 20], [2; 20], 6881, 42).await.unwrap();
        pretty_assertions::assert_eq!(resp.interval, 1800);
        pretty_assertions::assert_eq!(resp.peers.len(), 1);
    }
}
