use libp2p_identity::{Keypair, PeerId, PublicKey};
use serde::{Deserialize, Serialize};

pub const BLOCK_PROTOCOL: &str = "/peerfs/block/1.0.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub name: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBlockRequest {
    pub hash: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBlockResponse {
    pub found: bool,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockCommand {
    Ping(PingRequest),
    Read(ReadBlockRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockReply {
    Ping(PingResponse),
    Read(ReadBlockResponse),
    Error(ErrorReply),
}

impl ReadBlockResponse {
    pub fn proof_payload(hash: &str, offset: u64, len: usize, timestamp_ms: u64) -> Vec<u8> {
        format!("read:{hash}:{offset}:{len}:{timestamp_ms}").into_bytes()
    }

    /// Builds a signed reply for `data` served at `offset` of `hash`.
    pub fn signed(
        keypair: &Keypair,
        hash: &str,
        offset: u64,
        data: Vec<u8>,
        timestamp_ms: u64,
    ) -> Self {
        let payload = Self::proof_payload(hash, offset, data.len(), timestamp_ms);
        let signature = keypair.sign(&payload).unwrap_or_default();
        Self {
            found: true,
            data,
            timestamp_ms,
            signature,
            public_key: keypair.public().encode_protobuf(),
        }
    }

    pub fn verify_proof(&self, hash: &str, offset: u64) -> bool {
        if !self.found {
            return false;
        }
        let Ok(public_key) = PublicKey::try_decode_protobuf(&self.public_key) else {
            return false;
        };
        public_key.verify(
            &Self::proof_payload(hash, offset, self.data.len(), self.timestamp_ms),
            &self.signature,
        )
    }

    /// Peer whose key signed this reply, if the embedded key decodes.
    pub fn signer(&self) -> Option<PeerId> {
        PublicKey::try_decode_protobuf(&self.public_key)
            .ok()
            .map(|key| key.to_peer_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_reply_verifies_for_matching_request() {
        let keypair = Keypair::generate_ed25519();
        let reply = ReadBlockResponse::signed(&keypair, "abc", 4096, vec![1, 2, 3], 42);

        assert!(reply.verify_proof("abc", 4096));
        assert_eq!(reply.signer(), Some(keypair.public().to_peer_id()));
    }

    #[test]
    fn proof_rejects_other_offset_or_tampered_data() {
        let keypair = Keypair::generate_ed25519();
        let mut reply = ReadBlockResponse::signed(&keypair, "abc", 0, vec![9; 16], 7);

        assert!(!reply.verify_proof("abc", 4096));
        reply.data.push(0);
        assert!(!reply.verify_proof("abc", 0));
    }

    #[test]
    fn not_found_reply_never_verifies() {
        let keypair = Keypair::generate_ed25519();
        let mut reply = ReadBlockResponse::signed(&keypair, "abc", 0, Vec::new(), 1);
        reply.found = false;
        assert!(!reply.verify_proof("abc", 0));
    }

    #[test]
    fn commands_survive_bincode() {
        let cmd = BlockCommand::Read(ReadBlockRequest {
            hash: "deadbeef".to_string(),
            offset: 65536,
            size: 65536,
        });
        let bytes = bincode::serialize(&cmd).expect("serialize");
        match bincode::deserialize::<BlockCommand>(&bytes).expect("deserialize") {
            BlockCommand::Read(req) => {
                assert_eq!(req.hash, "deadbeef");
                assert_eq!(req.offset, 65536);
                assert_eq!(req.size, 65536);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
